//! # Server Manager
//!
//! Core orchestrator of the gateway: owns the uplink message lifecycles,
//! the connector pool and the protocol engine, and bridges the NodeManager
//! (radio side) with the Network Server (IP side).
//!
//! Three cooperating tasks:
//! - the **main task** serializes commands and processes
//!   [`ServerMessageEvent`]s in FIFO order; it owns every `ServerUpMessage`
//!   state transition and polls the heartbeat scheduler on idle ticks;
//! - the **NodeManager-facing task** takes uplink envelopes, acquires
//!   message slots and answers accepted/rejected immediately so the radio
//!   side can keep up with small bursts;
//! - the **connector-facing task** drains the connector event queue,
//!   decoding downlinks and forwarding send outcomes to the main task so
//!   all slot mutations stay on one task.

pub mod message;

use crate::connector::{
    Connector, ConnectorDescriptor, ConnectorEvent, ConnectorInitParams, SendOutcome, SendParams,
};
use crate::constants::{
    COMMAND_TIMEOUT, DOWNLINK_ACK_MESSAGE_ID, DOWNLINK_PACKET_POOL_SIZE, EVENT_QUEUE_DEPTH,
    HEARTBEAT_MESSAGE_ID, INITIALIZE_TIMEOUT, QUEUE_WAIT,
};
use crate::error::GatewayError;
use crate::node::{LoraSessionPacket, SessionEvent, SessionEventKind, SessionHandle};
use crate::protocol::{
    BuildUplinkParams, DownlinkPacket, ProtocolEngine, ProtocolMessageId, SemtechProtocolEngine,
    ServerMessageOutcome, SessionEvent as TransactionEvent, SessionState,
};
use crate::settings::{LoraServerSettings, ProtocolVariant};
use crate::util::{AutomatonState, MessagePool, PoolHandle, StateCell};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub use message::{ServerMessageEvent, ServerUpMessage, UpMessageState};

/// Sender half of the NodeManager boundary, handed over at attach time.
#[derive(Clone)]
pub struct NodeInterface {
    pub session_events: mpsc::Sender<SessionEvent>,
    pub downlinks: mpsc::Sender<PoolHandle<DownlinkPacket>>,
}

enum Command {
    Initialize {
        settings: Box<LoraServerSettings>,
        node: Option<NodeInterface>,
    },
    Attach {
        node: NodeInterface,
    },
    Start {
        force: bool,
    },
    Stop {
        force: bool,
    },
}

struct CommandEnvelope {
    command: Command,
    done: oneshot::Sender<Result<(), GatewayError>>,
}

enum MainEvent {
    Command(CommandEnvelope),
    Message(ServerMessageEvent),
}

struct ServerShared {
    state: StateCell,
    connectors: Mutex<Vec<ConnectorDescriptor>>,
    engine: Mutex<Option<Arc<dyn ProtocolEngine>>>,
    up_pool: Mutex<Option<Arc<MessagePool<ServerUpMessage>>>>,
    downlink_pool: Arc<MessagePool<DownlinkPacket>>,
    /// Uplink slots accounted to live message lifecycles. Compared with
    /// the pool occupancy to tell ordinary saturation from a slot leak.
    pending_uplinks: AtomicUsize,
    node: Mutex<Option<NodeInterface>>,
    event_tx: mpsc::Sender<MainEvent>,
    connector_event_tx: mpsc::Sender<ConnectorEvent>,
}

impl ServerShared {
    fn engine(&self) -> Option<Arc<dyn ProtocolEngine>> {
        self.engine.lock().expect("engine mutex").clone()
    }

    fn up_pool(&self) -> Option<Arc<MessagePool<ServerUpMessage>>> {
        self.up_pool.lock().expect("pool mutex").clone()
    }

    fn node(&self) -> Option<NodeInterface> {
        self.node.lock().expect("node mutex").clone()
    }

    fn connector_at(&self, index: usize) -> Option<Arc<dyn Connector>> {
        let connectors = self.connectors.lock().expect("connectors mutex");
        connectors.get(index).map(|d| Arc::clone(&d.connector))
    }

    fn active_connector(&self) -> Option<(usize, Arc<dyn Connector>)> {
        let connectors = self.connectors.lock().expect("connectors mutex");
        connectors
            .iter()
            .enumerate()
            .find(|(_, d)| d.active)
            .map(|(i, d)| (i, Arc::clone(&d.connector)))
    }

    fn set_active(&self, index: Option<usize>) {
        let mut connectors = self.connectors.lock().expect("connectors mutex");
        for (i, descriptor) in connectors.iter_mut().enumerate() {
            descriptor.active = Some(i) == index;
        }
    }

    /// Post an event to the main task. Fire-and-forget: a full queue drops
    /// the event with a warning.
    fn post(&self, event: ServerMessageEvent) {
        if self.event_tx.try_send(MainEvent::Message(event)).is_err() {
            warn!("ServerManager event queue full, event dropped");
        }
    }

    fn node_session_event(&self, kind: SessionEventKind, session: SessionHandle, session_id: u32) {
        let Some(node) = self.node() else {
            debug!("no NodeManager attached, {kind:?} not delivered");
            return;
        };
        let event = SessionEvent {
            kind,
            session,
            session_id,
        };
        if node.session_events.try_send(event).is_err() {
            warn!("NodeManager session event queue full, {kind:?} dropped");
        }
    }
}

/// State local to the main task.
struct MainCtx {
    /// The embedded heartbeat message, reused for every keepalive.
    heartbeat: ServerUpMessage,
    /// Downlink acknowledges in flight on the active connector, oldest
    /// first (connector completions arrive in send order).
    pending_acks: VecDeque<ProtocolMessageId>,
}

/// Core orchestrator; see the module docs.
pub struct ServerManager {
    shared: Arc<ServerShared>,
    command_lock: tokio::sync::Mutex<()>,
    event_tx: mpsc::Sender<MainEvent>,
    intake_tx: mpsc::Sender<LoraSessionPacket>,
    connector_event_tx: mpsc::Sender<ConnectorEvent>,
}

impl ServerManager {
    /// Create the manager around its connector collection. The worker
    /// tasks start immediately and wait for initialization.
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (intake_tx, intake_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (connector_event_tx, connector_event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let shared = Arc::new(ServerShared {
            state: StateCell::new(AutomatonState::Created),
            connectors: Mutex::new(connectors.into_iter().map(ConnectorDescriptor::new).collect()),
            engine: Mutex::new(None),
            up_pool: Mutex::new(None),
            downlink_pool: Arc::new(MessagePool::new(
                "downlink packets",
                DOWNLINK_PACKET_POOL_SIZE,
            )),
            pending_uplinks: AtomicUsize::new(0),
            node: Mutex::new(None),
            event_tx: event_tx.clone(),
            connector_event_tx: connector_event_tx.clone(),
        });

        tokio::spawn(Self::main_task(Arc::clone(&shared), event_rx));
        tokio::spawn(Self::intake_task(Arc::clone(&shared), intake_rx));
        tokio::spawn(Self::connector_task(Arc::clone(&shared), connector_event_rx));

        ServerManager {
            shared,
            command_lock: tokio::sync::Mutex::new(()),
            event_tx,
            intake_tx,
            connector_event_tx,
        }
    }

    // -----------------------------------------------------------------
    // Public command surface
    // -----------------------------------------------------------------

    /// Apply settings, initialize the connectors in order and perform the
    /// Network Server handshake through the first one that succeeds.
    pub async fn initialize(
        &self,
        settings: LoraServerSettings,
        node: Option<NodeInterface>,
    ) -> Result<(), GatewayError> {
        self.run_command(
            Command::Initialize {
                settings: Box::new(settings),
                node,
            },
            INITIALIZE_TIMEOUT,
        )
        .await
    }

    /// Bind the NodeManager boundary.
    pub async fn attach(&self, node: NodeInterface) -> Result<(), GatewayError> {
        self.run_command(Command::Attach { node }, COMMAND_TIMEOUT).await
    }

    pub async fn start(&self, force: bool) -> Result<(), GatewayError> {
        self.run_command(Command::Start { force }, COMMAND_TIMEOUT).await
    }

    pub async fn stop(&self, force: bool) -> Result<(), GatewayError> {
        self.run_command(Command::Stop { force }, COMMAND_TIMEOUT).await
    }

    /// Uplink intake sender; the NodeManager delivers
    /// [`LoraSessionPacket`]s here.
    pub fn session_packet_sender(&self) -> mpsc::Sender<LoraSessionPacket> {
        self.intake_tx.clone()
    }

    /// Connector event queue sender (used by connectors and tests).
    pub fn connector_event_sender(&self) -> mpsc::Sender<ConnectorEvent> {
        self.connector_event_tx.clone()
    }

    /// Event ingress for already-routed server message events.
    pub fn server_message_event(&self, event: ServerMessageEvent) -> Result<(), GatewayError> {
        self.event_tx
            .try_send(MainEvent::Message(event))
            .map_err(|_| GatewayError::QueueFull)
    }

    pub fn state(&self) -> AutomatonState {
        self.shared.state.get()
    }

    /// Index of the connector all traffic flows through, if any.
    pub fn active_connector(&self) -> Option<usize> {
        self.shared.active_connector().map(|(index, _)| index)
    }

    /// Activation flags of the connector collection, in configuration
    /// order.
    pub fn connector_active_flags(&self) -> Vec<bool> {
        let connectors = self.shared.connectors.lock().expect("connectors mutex");
        connectors.iter().map(|d| d.active).collect()
    }

    /// The uplink message pool, exposed for observability and tests.
    pub fn uplink_pool(&self) -> Option<Arc<MessagePool<ServerUpMessage>>> {
        self.shared.up_pool()
    }

    async fn run_command(
        &self,
        command: Command,
        wait: std::time::Duration,
    ) -> Result<(), GatewayError> {
        // Reentry while a prior command is pending is rejected.
        let _guard = self
            .command_lock
            .try_lock()
            .map_err(|_| GatewayError::CommandPending)?;
        let (done, done_rx) = oneshot::channel();
        self.event_tx
            .send(MainEvent::Command(CommandEnvelope { command, done }))
            .await
            .map_err(|_| GatewayError::QueueFull)?;
        match timeout(wait, done_rx).await {
            Err(_) => Err(GatewayError::CommandTimeout),
            Ok(Err(_)) => Err(GatewayError::CommandTimeout),
            Ok(Ok(result)) => result,
        }
    }

    // -----------------------------------------------------------------
    // Main task
    // -----------------------------------------------------------------

    async fn main_task(shared: Arc<ServerShared>, mut event_rx: mpsc::Receiver<MainEvent>) {
        let mut ctx = MainCtx {
            heartbeat: ServerUpMessage::heartbeat(),
            pending_acks: VecDeque::new(),
        };
        loop {
            match timeout(QUEUE_WAIT, event_rx.recv()).await {
                Ok(None) => break,
                Ok(Some(MainEvent::Command(envelope))) => {
                    let result = Self::process_command(&shared, envelope.command).await;
                    let _ = envelope.done.send(result);
                }
                Ok(Some(MainEvent::Message(event))) => {
                    Self::process_message(&shared, &mut ctx, event).await;
                }
                Err(_) => {
                    // No pending event for a while: ask the engine whether
                    // protocol-driven traffic (heartbeat) is due.
                    if shared.state.get() == AutomatonState::Running {
                        Self::poll_heartbeat(&shared, &mut ctx).await;
                    }
                    if shared.state.get() == AutomatonState::Terminated {
                        break;
                    }
                }
            }
        }
        debug!("ServerManager main task terminated");
    }

    async fn process_command(
        shared: &Arc<ServerShared>,
        command: Command,
    ) -> Result<(), GatewayError> {
        match command {
            Command::Initialize { settings, node } => {
                Self::process_initialize(shared, *settings, node).await
            }
            Command::Attach { node } => {
                let state = shared.state.get();
                if state != AutomatonState::Created && state != AutomatonState::Initialized {
                    return Err(GatewayError::InvalidState(state));
                }
                *shared.node.lock().expect("node mutex") = Some(node);
                if state == AutomatonState::Initialized {
                    shared.state.set(AutomatonState::Idle);
                }
                Ok(())
            }
            Command::Start { force } => {
                let state = shared.state.get();
                if state == AutomatonState::Running && force {
                    return Ok(());
                }
                if state != AutomatonState::Idle {
                    return Err(GatewayError::InvalidState(state));
                }
                let (index, connector) = shared
                    .active_connector()
                    .ok_or(GatewayError::NotInitialized)?;
                connector.start().await?;
                shared.state.set(AutomatonState::Running);
                info!("ServerManager running (connector #{index})");
                Ok(())
            }
            Command::Stop { force } => {
                let state = shared.state.get();
                if state != AutomatonState::Running {
                    return if force {
                        Ok(())
                    } else {
                        Err(GatewayError::InvalidState(state))
                    };
                }
                shared.state.set(AutomatonState::Stopping);
                if let Some((_, connector)) = shared.active_connector() {
                    if let Err(e) = connector.stop().await {
                        warn!("connector stop rejected: {e}");
                    }
                }
                shared.state.set(AutomatonState::Idle);
                Ok(())
            }
        }
    }

    async fn process_initialize(
        shared: &Arc<ServerShared>,
        settings: LoraServerSettings,
        node: Option<NodeInterface>,
    ) -> Result<(), GatewayError> {
        let state = shared.state.get();
        if state != AutomatonState::Created && state != AutomatonState::Error {
            return Err(GatewayError::InvalidState(state));
        }
        settings.validate()?;

        let connectors: Vec<Arc<dyn Connector>> = {
            let descriptors = shared.connectors.lock().expect("connectors mutex");
            descriptors.iter().map(|d| Arc::clone(&d.connector)).collect()
        };
        if connectors.is_empty() {
            return Err(GatewayError::Settings("no connectors installed".into()));
        }
        if settings.connectors.len() < connectors.len() {
            return Err(GatewayError::Settings(format!(
                "{} connectors installed but only {} configured",
                connectors.len(),
                settings.connectors.len()
            )));
        }

        let engine: Arc<dyn ProtocolEngine> = match settings.protocol {
            ProtocolVariant::Semtech => Arc::new(SemtechProtocolEngine::new(
                settings.gateway_eui()?,
                settings.heartbeat_period(),
            )),
        };
        *shared.engine.lock().expect("engine mutex") = Some(Arc::clone(&engine));
        *shared.up_pool.lock().expect("pool mutex") = Some(Arc::new(MessagePool::new(
            "uplink messages",
            settings.uplink_pool_size,
        )));
        shared.pending_uplinks.store(0, Ordering::SeqCst);

        // First-successful selection: a connector must both reach its
        // network and complete the Network Server session handshake; any
        // failure moves on to the next one.
        let mut active = None;
        for (index, connector) in connectors.iter().enumerate() {
            let connector_settings = settings.connectors[index].clone();
            let probe_timeout = connector_settings.server_timeout();
            if let Err(e) = connector
                .initialize(ConnectorInitParams {
                    settings: connector_settings,
                    connector_index: index,
                    event_queue: shared.connector_event_tx.clone(),
                })
                .await
            {
                info!(
                    "connector #{index} ({}) failed to initialize: {e}, trying next",
                    connector.name()
                );
                continue;
            }
            match Self::handshake(engine.as_ref(), connector.as_ref(), probe_timeout).await {
                Ok(()) => {
                    info!("Network Server session opened via connector #{index}");
                    active = Some(index);
                    break;
                }
                Err(e) => {
                    warn!(
                        "connector #{index} ({}) handshake failed: {e}, trying next",
                        connector.name()
                    );
                }
            }
        }
        let Some(active) = active else {
            error!("no connector could reach the Network Server");
            return Err(GatewayError::HandshakeFailed);
        };
        shared.set_active(Some(active));

        if node.is_some() {
            *shared.node.lock().expect("node mutex") = node;
        }
        let attached = shared.node.lock().expect("node mutex").is_some();
        shared.state.set(if attached {
            AutomatonState::Idle
        } else {
            AutomatonState::Initialized
        });
        info!("ServerManager initialized for Network Server access");
        Ok(())
    }

    /// Probe exchange opening the Network Server session on a connector.
    async fn handshake(
        engine: &dyn ProtocolEngine,
        connector: &dyn Connector,
        wait: std::time::Duration,
    ) -> Result<(), GatewayError> {
        let mut buf = BytesMut::new();
        let id = engine
            .build_uplink_message(BuildUplinkParams::heartbeat(true), &mut buf)?
            .ok_or(GatewayError::HandshakeFailed)?;

        let reply = match connector.send_receive(&buf, wait).await {
            Ok(reply) => reply,
            Err(e) => {
                engine.process_session_event(TransactionEvent::Canceled, id);
                return Err(e);
            }
        };
        if engine.process_session_event(TransactionEvent::Sent, id) != SessionState::Progressing {
            engine.process_session_event(TransactionEvent::Canceled, id);
            return Err(GatewayError::HandshakeFailed);
        }
        match engine.process_server_message(&reply) {
            ServerMessageOutcome::UplinkTerminated(ack) if ack == id => {
                engine.process_session_event(TransactionEvent::Released, id);
                Ok(())
            }
            outcome => {
                debug!("handshake reply not accepted: {outcome:?}");
                engine.process_session_event(TransactionEvent::Canceled, id);
                Err(GatewayError::HandshakeFailed)
            }
        }
    }

    // -----------------------------------------------------------------
    // Main task event handlers
    // -----------------------------------------------------------------

    async fn process_message(
        shared: &Arc<ServerShared>,
        ctx: &mut MainCtx,
        event: ServerMessageEvent,
    ) {
        match event {
            ServerMessageEvent::UplinkReceived { message_id } => {
                Self::handle_uplink_received(shared, ctx, message_id).await;
            }
            ServerMessageEvent::UplinkPrepared { message_id } => {
                Self::handle_uplink_prepared(shared, ctx, message_id).await;
            }
            ServerMessageEvent::UplinkSent { message_id } => {
                Self::handle_uplink_sent(shared, ctx, message_id).await;
            }
            ServerMessageEvent::UplinkSendFailed { message_id } => {
                Self::handle_uplink_send_failed(shared, ctx, message_id).await;
            }
            ServerMessageEvent::UplinkTerminated { id, failed } => {
                // A stale terminal event (the transaction already closed on
                // this task) must not touch a recycled slot.
                if Self::protocol_id_of(shared, ctx, id.message_id()) == Some(id) {
                    Self::terminate_uplink(shared, ctx, id.message_id(), failed);
                } else {
                    debug!("terminal event for released transaction {id} ignored");
                }
            }
            ServerMessageEvent::DownlinkAck { id } => {
                Self::handle_downlink_ack(shared, ctx, id).await;
            }
        }
    }

    /// Encode the uplink LoRa packet, hand the packet buffer back to the
    /// radio side and queue the send.
    async fn handle_uplink_received(shared: &Arc<ServerShared>, ctx: &mut MainCtx, message_id: u8) {
        let (Some(pool), Some(engine)) = (shared.up_pool(), shared.engine()) else {
            return;
        };
        let refs = pool.with_slot(message_id, |m| (m.packet.clone(), m.info.clone()));
        let Some((Some(packet), Some(info))) = refs else {
            warn!("uplink message {message_id} lost its packet references");
            Self::fail_uplink(shared, ctx, message_id);
            return;
        };

        let mut buf = BytesMut::new();
        match engine.build_uplink_message(
            BuildUplinkParams::lora_data(message_id, &packet, &info),
            &mut buf,
        ) {
            Ok(Some(id)) => {
                let session = pool.with_slot(message_id, |m| {
                    m.state = UpMessageState::Prepared;
                    m.protocol_message_id = Some(id);
                    m.data.clear();
                    m.data.extend_from_slice(&buf);
                    // The radio buffer is released once the stream exists.
                    m.packet = None;
                    m.info = None;
                    (m.session, m.session_id)
                });
                if let Some((Some(session), session_id)) = session {
                    shared.node_session_event(
                        SessionEventKind::UplinkProgressing,
                        session,
                        session_id,
                    );
                }
                shared.post(ServerMessageEvent::UplinkPrepared { message_id });
            }
            Ok(None) => {
                warn!("engine produced no stream for uplink {message_id}");
                Self::fail_uplink(shared, ctx, message_id);
            }
            Err(e) => {
                warn!("failed to encode uplink {message_id}: {e}");
                Self::fail_uplink(shared, ctx, message_id);
            }
        }
    }

    /// Hand the encoded stream to the active connector.
    async fn handle_uplink_prepared(shared: &Arc<ServerShared>, ctx: &mut MainCtx, message_id: u8) {
        let data = if message_id == HEARTBEAT_MESSAGE_ID {
            Some(Bytes::copy_from_slice(&ctx.heartbeat.data))
        } else {
            shared
                .up_pool()
                .and_then(|pool| pool.with_slot(message_id, |m| Bytes::copy_from_slice(&m.data)))
        };
        let Some(data) = data else {
            warn!("uplink {message_id} vanished before send");
            return;
        };

        let Some((index, connector)) = shared.active_connector() else {
            warn!("no connector available, uplink {message_id} failed");
            Self::fail_uplink(shared, ctx, message_id);
            return;
        };

        if message_id == HEARTBEAT_MESSAGE_ID {
            ctx.heartbeat.state = UpMessageState::Sending;
            ctx.heartbeat.last_connector = Some(index);
        } else if let Some(pool) = shared.up_pool() {
            pool.with_slot(message_id, |m| {
                m.state = UpMessageState::Sending;
                m.last_connector = Some(index);
            });
        }

        if let Err(e) = connector.send(SendParams { data, message_id }).await {
            warn!("connector #{index} rejected send of uplink {message_id}: {e}");
            Self::fail_uplink(shared, ctx, message_id);
        }
    }

    /// The connector reports the datagram on the wire; let the engine
    /// decide whether the transaction waits for a server reply.
    async fn handle_uplink_sent(shared: &Arc<ServerShared>, ctx: &mut MainCtx, message_id: u8) {
        let Some(engine) = shared.engine() else { return };

        if message_id == DOWNLINK_ACK_MESSAGE_ID {
            if let Some(id) = ctx.pending_acks.pop_front() {
                if engine.process_session_event(TransactionEvent::Sent, id)
                    == SessionState::Terminated
                {
                    engine.process_session_event(TransactionEvent::Released, id);
                }
            }
            return;
        }

        let Some(id) = Self::protocol_id_of(shared, ctx, message_id) else {
            warn!("send completion for unknown uplink {message_id}");
            return;
        };
        match engine.process_session_event(TransactionEvent::Sent, id) {
            SessionState::Progressing => {
                if message_id == HEARTBEAT_MESSAGE_ID {
                    ctx.heartbeat.state = UpMessageState::Sent;
                } else if let Some(pool) = shared.up_pool() {
                    pool.with_slot(message_id, |m| m.state = UpMessageState::Sent);
                }
            }
            SessionState::Terminated => {
                Self::terminate_uplink(shared, ctx, message_id, false);
            }
            SessionState::Failed => {
                // Transaction expired before the send completed; the server
                // most likely still received the datagram.
                Self::terminate_uplink(shared, ctx, message_id, false);
            }
            SessionState::UnknownTransaction => {
                warn!("engine does not know transaction {id} anymore");
            }
        }
    }

    async fn handle_uplink_send_failed(
        shared: &Arc<ServerShared>,
        ctx: &mut MainCtx,
        message_id: u8,
    ) {
        if message_id == DOWNLINK_ACK_MESSAGE_ID {
            if let (Some(engine), Some(id)) = (shared.engine(), ctx.pending_acks.pop_front()) {
                engine.process_session_event(TransactionEvent::Canceled, id);
            }
            return;
        }
        // No alternative connector in the current policy: the message
        // fails terminally and the connector stays active.
        Self::fail_uplink(shared, ctx, message_id);
    }

    /// Terminal failure path for an uplink message.
    fn fail_uplink(shared: &Arc<ServerShared>, ctx: &mut MainCtx, message_id: u8) {
        if let (Some(engine), Some(id)) = (
            shared.engine(),
            Self::protocol_id_of(shared, ctx, message_id),
        ) {
            engine.process_session_event(TransactionEvent::SendFailed, id);
        }
        Self::terminate_uplink(shared, ctx, message_id, true);
    }

    /// Terminal path: notify the radio side, release the slot, release the
    /// engine transaction.
    fn terminate_uplink(
        shared: &Arc<ServerShared>,
        ctx: &mut MainCtx,
        message_id: u8,
        failed: bool,
    ) {
        let protocol_id = if message_id == HEARTBEAT_MESSAGE_ID {
            ctx.heartbeat.state = if failed {
                UpMessageState::Failed
            } else {
                UpMessageState::Terminated
            };
            ctx.heartbeat.protocol_message_id.take()
        } else if message_id == DOWNLINK_ACK_MESSAGE_ID {
            None
        } else {
            let Some(pool) = shared.up_pool() else { return };
            let slot = pool.with_slot(message_id, |m| {
                m.state = if failed {
                    UpMessageState::Failed
                } else {
                    UpMessageState::Terminated
                };
                (m.protocol_message_id, m.session, m.session_id)
            });
            let Some((protocol_id, session, session_id)) = slot else {
                warn!("terminal event for unknown uplink {message_id}");
                return;
            };
            if let Some(session) = session {
                shared.node_session_event(
                    if failed {
                        SessionEventKind::UplinkFailed
                    } else {
                        SessionEventKind::UplinkSent
                    },
                    session,
                    session_id,
                );
            }
            pool.release(message_id);
            shared.pending_uplinks.fetch_sub(1, Ordering::SeqCst);
            protocol_id
        };

        if let (Some(engine), Some(id)) = (shared.engine(), protocol_id) {
            engine.process_session_event(TransactionEvent::Released, id);
        }
    }

    /// Send the acknowledge datagram for a decoded downlink.
    async fn handle_downlink_ack(
        shared: &Arc<ServerShared>,
        ctx: &mut MainCtx,
        id: ProtocolMessageId,
    ) {
        let Some(engine) = shared.engine() else { return };
        let mut buf = BytesMut::new();
        if let Err(e) = engine.build_downlink_ack(id, &mut buf) {
            debug!("no acknowledge built for downlink {id}: {e}");
            return;
        }
        let Some((_, connector)) = shared.active_connector() else {
            engine.process_session_event(TransactionEvent::Canceled, id);
            return;
        };
        ctx.pending_acks.push_back(id);
        if connector
            .send(SendParams {
                data: buf.freeze(),
                message_id: DOWNLINK_ACK_MESSAGE_ID,
            })
            .await
            .is_err()
        {
            ctx.pending_acks.pop_back();
            engine.process_session_event(TransactionEvent::Canceled, id);
        }
    }

    fn protocol_id_of(
        shared: &Arc<ServerShared>,
        ctx: &MainCtx,
        message_id: u8,
    ) -> Option<ProtocolMessageId> {
        if message_id == HEARTBEAT_MESSAGE_ID {
            ctx.heartbeat.protocol_message_id
        } else {
            shared
                .up_pool()
                .and_then(|pool| pool.with_slot(message_id, |m| m.protocol_message_id))
                .flatten()
        }
    }

    /// Idle-tick heartbeat poll: the engine returns a built stream when the
    /// keepalive period has elapsed.
    async fn poll_heartbeat(shared: &Arc<ServerShared>, ctx: &mut MainCtx) {
        let Some(engine) = shared.engine() else { return };
        let mut buf = BytesMut::new();
        match engine.build_uplink_message(BuildUplinkParams::heartbeat(false), &mut buf) {
            Ok(Some(id)) => {
                ctx.heartbeat.protocol_message_id = Some(id);
                ctx.heartbeat.state = UpMessageState::Prepared;
                ctx.heartbeat.data = buf;
                Self::handle_uplink_prepared(shared, ctx, HEARTBEAT_MESSAGE_ID).await;
            }
            Ok(None) => {}
            Err(e) => warn!("heartbeat build failed: {e}"),
        }
    }

    // -----------------------------------------------------------------
    // NodeManager-facing task
    // -----------------------------------------------------------------

    /// Accepts uplink envelopes from the NodeManager. Kept apart from the
    /// main task so a fresh packet can be admitted while the previous one
    /// is still being encoded.
    async fn intake_task(shared: Arc<ServerShared>, mut intake_rx: mpsc::Receiver<LoraSessionPacket>) {
        loop {
            let envelope = match timeout(QUEUE_WAIT, intake_rx.recv()).await {
                Err(_) => {
                    if shared.state.get() == AutomatonState::Terminated {
                        break;
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(envelope)) => envelope,
            };
            let reject = |reason: &str| {
                debug!("uplink session {} rejected: {reason}", envelope.session_id);
                shared.node_session_event(
                    SessionEventKind::UplinkRejected,
                    envelope.session,
                    envelope.session_id,
                );
            };

            if shared.state.get() != AutomatonState::Running {
                reject("automaton not running");
                continue;
            }
            let Some(pool) = shared.up_pool() else {
                reject("not initialized");
                continue;
            };

            let index = match pool.acquire() {
                Ok(index) => index,
                Err(_) => {
                    let pending = shared.pending_uplinks.load(Ordering::SeqCst);
                    if pending < pool.capacity() {
                        // Slots are busy that no live lifecycle accounts
                        // for: an internal fault, not mere saturation.
                        error!(
                            "uplink pool exhausted with only {pending} live messages, entering error state"
                        );
                        shared.state.set(AutomatonState::Error);
                    }
                    reject("uplink pool exhausted");
                    continue;
                }
            };
            shared.pending_uplinks.fetch_add(1, Ordering::SeqCst);
            pool.with_slot(index, |m| {
                m.message_id = index;
                m.state = UpMessageState::Created;
                m.packet = Some(Arc::clone(&envelope.packet));
                m.info = Some(Arc::clone(&envelope.info));
                m.session = Some(envelope.session);
                m.session_id = envelope.session_id;
            });
            pool.mark_ready(index);

            shared.node_session_event(
                SessionEventKind::UplinkAccepted,
                envelope.session,
                envelope.session_id,
            );

            // Encoding happens on the main task; losing this event would
            // leak the slot, so wait for queue room instead of dropping.
            let posted = timeout(
                QUEUE_WAIT,
                shared.event_tx.send(MainEvent::Message(ServerMessageEvent::UplinkReceived {
                    message_id: index,
                })),
            )
            .await;
            if !matches!(posted, Ok(Ok(()))) {
                warn!("main queue unavailable, uplink {} dropped", envelope.session_id);
                pool.release(index);
                shared.pending_uplinks.fetch_sub(1, Ordering::SeqCst);
                shared.node_session_event(
                    SessionEventKind::UplinkFailed,
                    envelope.session,
                    envelope.session_id,
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // Connector-facing task
    // -----------------------------------------------------------------

    /// Drains the connector event queue: decodes downlinks and forwards
    /// send outcomes, so that every `ServerUpMessage` mutation stays on
    /// the main task.
    async fn connector_task(
        shared: Arc<ServerShared>,
        mut connector_event_rx: mpsc::Receiver<ConnectorEvent>,
    ) {
        while let Some(event) = connector_event_rx.recv().await {
            match event {
                ConnectorEvent::ServerMsgEvent {
                    message_id,
                    outcome,
                } => {
                    shared.post(match outcome {
                        SendOutcome::Sent => ServerMessageEvent::UplinkSent { message_id },
                        SendOutcome::SendFailed => {
                            ServerMessageEvent::UplinkSendFailed { message_id }
                        }
                    });
                }
                ConnectorEvent::DownlinkReceived(message) => {
                    Self::handle_downlink_received(&shared, message).await;
                }
            }
        }
    }

    async fn handle_downlink_received(
        shared: &Arc<ServerShared>,
        message: crate::connector::ServerDownlinkMessage,
    ) {
        let Some(engine) = shared.engine() else {
            if let Some(connector) = shared.connector_at(message.connector_index) {
                let _ = connector.downlink_received(message.message_id).await;
            }
            return;
        };

        let outcome = engine.process_server_message(&message.data);

        // Give the datagram buffer back to the connector before any further
        // routing; the engine has copied what it needs.
        if let Some(connector) = shared.connector_at(message.connector_index) {
            if let Err(e) = connector.downlink_received(message.message_id).await {
                warn!("connector slot release failed: {e}");
            }
        }

        match outcome {
            ServerMessageOutcome::UplinkProgressing(_) => {}
            ServerMessageOutcome::UplinkTerminated(id) | ServerMessageOutcome::UplinkFailed(id) => {
                let failed = matches!(outcome, ServerMessageOutcome::UplinkFailed(_));
                if Self::uplink_consistent(shared, id) {
                    shared.post(ServerMessageEvent::UplinkTerminated { id, failed });
                } else {
                    error!("no uplink message matches transaction {id}, reply ignored");
                }
            }
            ServerMessageOutcome::DownlinkPrepared { id, downlink } => {
                Self::forward_downlink(shared, id, downlink);
            }
            ServerMessageOutcome::MalformedMessage => {
                debug!("malformed server message dropped ({} bytes)", message.data.len());
            }
            ServerMessageOutcome::UnknownTransaction => {
                debug!("server reply for unknown transaction dropped");
            }
        }
    }

    /// A terminal reply must still match the protocol id recorded in the
    /// uplink slot it claims to resolve.
    fn uplink_consistent(shared: &Arc<ServerShared>, id: ProtocolMessageId) -> bool {
        if id.is_heartbeat() {
            return true;
        }
        shared
            .up_pool()
            .and_then(|pool| {
                pool.with_slot(id.message_id(), |m| m.protocol_message_id == Some(id))
            })
            .unwrap_or(false)
    }

    /// Park the decoded packet in the downlink pool and hand it to the
    /// NodeManager for scheduled transmission.
    fn forward_downlink(shared: &Arc<ServerShared>, id: ProtocolMessageId, downlink: DownlinkPacket) {
        let handle = match PoolHandle::acquire(&shared.downlink_pool) {
            Ok(handle) => handle,
            Err(_) => {
                warn!("downlink packet pool exhausted, PULL_RESP dropped");
                return;
            }
        };
        handle.with(|slot| *slot = downlink);
        handle.mark_ready();

        let Some(node) = shared.node() else {
            warn!("no NodeManager attached, downlink dropped");
            return;
        };
        if node.downlinks.try_send(handle).is_err() {
            warn!("NodeManager downlink queue full, packet dropped");
            return;
        }
        // Only acknowledged when actually deliverable to the radio side.
        shared.post(ServerMessageEvent::DownlinkAck { id });
    }
}
