//! # Node Manager
//!
//! Boundary between the radio transceiver side of the gateway and the
//! ServerManager. Uplink packets received from the radio driver are wrapped
//! in sessions and delivered to the ServerManager's intake task; the
//! ServerManager answers with session events that this module correlates
//! back to the radio side. Downlink packets decoded from the Network Server
//! come back through here for scheduled RF transmission.
//!
//! Ownership contract: the `LoraPacket` handed to the ServerManager stays
//! alive until `UplinkProgressing` is observed (the radio buffer can then
//! be reused); the session itself lives until `UplinkSent` or
//! `UplinkFailed`.

use crate::constants::{EVENT_QUEUE_DEPTH, QUEUE_WAIT};
use crate::error::GatewayError;
use crate::lora::{LoraPacket, LoraPacketInfo};
use crate::protocol::DownlinkPacket;
use crate::util::{monotonic_ms, AutomatonState, MessagePool, PoolHandle, StateCell};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Opaque reference to a NodeManager session slot. Only meaningful to the
/// NodeManager that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(pub(crate) u8);

/// Replies from the ServerManager about an uplink session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The uplink was taken over; the radio may deliver the next packet.
    UplinkAccepted,
    /// The uplink cannot be handled (wrong state or saturation).
    UplinkRejected,
    /// The packet was encoded; its buffer may be reclaimed.
    UplinkProgressing,
    /// The Network Server acknowledged the uplink.
    UplinkSent,
    /// The uplink could not be delivered.
    UplinkFailed,
}

/// Session event sent by the ServerManager to the NodeManager.
#[derive(Debug, Clone, Copy)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: SessionHandle,
    pub session_id: u32,
}

/// Uplink delivery envelope handed to the ServerManager's intake task.
///
/// The envelope itself is transient; the referenced packet and session
/// follow the ownership contract described in the module docs.
#[derive(Debug, Clone)]
pub struct LoraSessionPacket {
    pub packet: Arc<LoraPacket>,
    pub info: Arc<LoraPacketInfo>,
    pub session: SessionHandle,
    pub session_id: u32,
}

/// An uplink capture as delivered by the radio driver.
#[derive(Debug, Clone)]
pub struct RadioUplink {
    pub packet: Arc<LoraPacket>,
    pub info: Arc<LoraPacketInfo>,
}

/// Notifications surfaced to the radio side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    UplinkAccepted { session_id: u32 },
    UplinkRejected { session_id: u32 },
    UplinkProgressing { session_id: u32 },
    UplinkSent { session_id: u32 },
    UplinkFailed { session_id: u32 },
    DownlinkScheduled { timestamp_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeSessionState {
    Delivering,
    Accepted,
    Progressing,
}

struct NodeSession {
    session_id: u32,
    state: NodeSessionState,
    packet: Option<Arc<LoraPacket>>,
    info: Option<Arc<LoraPacketInfo>>,
}

impl Default for NodeSession {
    fn default() -> Self {
        NodeSession {
            session_id: 0,
            state: NodeSessionState::Delivering,
            packet: None,
            info: None,
        }
    }
}

/// Parameters for [`NodeManager::initialize`].
pub struct NodeManagerInitParams {
    /// Where scheduled downlink packets are handed for RF transmission.
    pub radio_downlink: mpsc::Sender<DownlinkPacket>,
    /// Session progress notifications toward the radio driver.
    pub node_events: mpsc::Sender<NodeEvent>,
}

struct NodeShared {
    state: StateCell,
    sessions: MessagePool<NodeSession>,
    next_session_id: AtomicU32,
    // Set at initialize / attach, read by the worker tasks.
    radio_downlink: Mutex<Option<mpsc::Sender<DownlinkPacket>>>,
    node_events: Mutex<Option<mpsc::Sender<NodeEvent>>>,
    server_intake: Mutex<Option<mpsc::Sender<LoraSessionPacket>>>,
}

impl NodeShared {
    fn emit(&self, event: NodeEvent) {
        let sender = self.node_events.lock().expect("node events mutex").clone();
        if let Some(sender) = sender {
            if sender.try_send(event).is_err() {
                warn!("node event queue full, {event:?} dropped");
            }
        }
    }
}

/// Manages uplink sessions from the radio and downlink scheduling toward
/// it.
pub struct NodeManager {
    shared: Arc<NodeShared>,
    uplink_tx: mpsc::Sender<RadioUplink>,
    session_event_tx: mpsc::Sender<SessionEvent>,
    downlink_tx: mpsc::Sender<PoolHandle<DownlinkPacket>>,
}

impl NodeManager {
    pub fn new(session_capacity: usize) -> Self {
        let shared = Arc::new(NodeShared {
            state: StateCell::new(AutomatonState::Created),
            sessions: MessagePool::new("node sessions", session_capacity),
            next_session_id: AtomicU32::new(1),
            radio_downlink: Mutex::new(None),
            node_events: Mutex::new(None),
            server_intake: Mutex::new(None),
        });

        let (uplink_tx, uplink_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (session_event_tx, session_event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (downlink_tx, downlink_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        tokio::spawn(Self::uplink_task(Arc::clone(&shared), uplink_rx));
        tokio::spawn(Self::session_event_task(Arc::clone(&shared), session_event_rx));
        tokio::spawn(Self::downlink_task(Arc::clone(&shared), downlink_rx));

        NodeManager {
            shared,
            uplink_tx,
            session_event_tx,
            downlink_tx,
        }
    }

    /// Sender for the radio driver to deliver uplink captures.
    pub fn uplink_sender(&self) -> mpsc::Sender<RadioUplink> {
        self.uplink_tx.clone()
    }

    /// Session event ingress, handed to the ServerManager.
    pub fn session_event_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.session_event_tx.clone()
    }

    /// Downlink ingress, handed to the ServerManager.
    pub fn downlink_sender(&self) -> mpsc::Sender<PoolHandle<DownlinkPacket>> {
        self.downlink_tx.clone()
    }

    pub fn state(&self) -> AutomatonState {
        self.shared.state.get()
    }

    pub fn initialize(&self, params: NodeManagerInitParams) -> Result<(), GatewayError> {
        if self.shared.state.get() != AutomatonState::Created {
            return Err(GatewayError::InvalidState(self.shared.state.get()));
        }
        *self.shared.radio_downlink.lock().expect("downlink mutex") = Some(params.radio_downlink);
        *self.shared.node_events.lock().expect("node events mutex") = Some(params.node_events);
        self.shared.state.set(AutomatonState::Initialized);
        Ok(())
    }

    /// Bind the ServerManager's uplink intake. Completes initialization.
    pub fn attach(&self, server_intake: mpsc::Sender<LoraSessionPacket>) -> Result<(), GatewayError> {
        let state = self.shared.state.get();
        if state != AutomatonState::Initialized {
            return Err(GatewayError::InvalidState(state));
        }
        *self.shared.server_intake.lock().expect("server intake mutex") = Some(server_intake);
        self.shared.state.set(AutomatonState::Idle);
        Ok(())
    }

    pub fn start(&self) -> Result<(), GatewayError> {
        if !self
            .shared
            .state
            .transition(AutomatonState::Idle, AutomatonState::Running)
        {
            return Err(GatewayError::InvalidState(self.shared.state.get()));
        }
        info!("NodeManager running");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), GatewayError> {
        if !self
            .shared
            .state
            .transition(AutomatonState::Running, AutomatonState::Idle)
        {
            return Err(GatewayError::InvalidState(self.shared.state.get()));
        }
        Ok(())
    }

    /// Uplink intake: wraps radio captures into sessions and delivers them
    /// to the ServerManager.
    async fn uplink_task(shared: Arc<NodeShared>, mut uplink_rx: mpsc::Receiver<RadioUplink>) {
        loop {
            let uplink = match timeout(QUEUE_WAIT, uplink_rx.recv()).await {
                Err(_) => {
                    if shared.state.get() == AutomatonState::Terminated {
                        break;
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(uplink)) => uplink,
            };

            if shared.state.get() != AutomatonState::Running {
                warn!("uplink received while NodeManager not running, dropped");
                continue;
            }

            let session_id = shared.next_session_id.fetch_add(1, Ordering::SeqCst);
            let index = match shared.sessions.acquire() {
                Ok(index) => index,
                Err(_) => {
                    warn!("session pool exhausted, uplink {session_id} rejected");
                    shared.emit(NodeEvent::UplinkRejected { session_id });
                    continue;
                }
            };
            shared.sessions.with_slot(index, |session| {
                session.session_id = session_id;
                session.state = NodeSessionState::Delivering;
                session.packet = Some(Arc::clone(&uplink.packet));
                session.info = Some(Arc::clone(&uplink.info));
            });
            shared.sessions.mark_ready(index);

            let intake = shared
                .server_intake
                .lock()
                .expect("server intake mutex")
                .clone();
            let Some(intake) = intake else {
                shared.sessions.release(index);
                shared.emit(NodeEvent::UplinkRejected { session_id });
                continue;
            };
            let envelope = LoraSessionPacket {
                packet: uplink.packet,
                info: uplink.info,
                session: SessionHandle(index),
                session_id,
            };
            if timeout(QUEUE_WAIT, intake.send(envelope)).await.is_err() {
                warn!("ServerManager intake unavailable, uplink {session_id} rejected");
                shared.sessions.release(index);
                shared.emit(NodeEvent::UplinkRejected { session_id });
            }
        }
    }

    /// Applies ServerManager session events to the session table and
    /// forwards them to the radio side.
    async fn session_event_task(
        shared: Arc<NodeShared>,
        mut session_event_rx: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = session_event_rx.recv().await {
            let index = event.session.0;
            let known = shared
                .sessions
                .with_slot(index, |session| session.session_id == event.session_id)
                .unwrap_or(false);
            if !known {
                warn!(
                    "session event {:?} for unknown session {} (slot {index})",
                    event.kind, event.session_id
                );
                continue;
            }

            match event.kind {
                SessionEventKind::UplinkAccepted => {
                    shared.sessions.with_slot(index, |session| {
                        session.state = NodeSessionState::Accepted;
                    });
                    shared.emit(NodeEvent::UplinkAccepted {
                        session_id: event.session_id,
                    });
                }
                SessionEventKind::UplinkRejected => {
                    shared.sessions.release(index);
                    shared.emit(NodeEvent::UplinkRejected {
                        session_id: event.session_id,
                    });
                }
                SessionEventKind::UplinkProgressing => {
                    // The encoded stream is on its way; the packet buffer
                    // is no longer referenced by the server side.
                    shared.sessions.with_slot(index, |session| {
                        session.state = NodeSessionState::Progressing;
                        session.packet.take();
                        session.info.take();
                    });
                    shared.emit(NodeEvent::UplinkProgressing {
                        session_id: event.session_id,
                    });
                }
                SessionEventKind::UplinkSent => {
                    shared.sessions.release(index);
                    shared.emit(NodeEvent::UplinkSent {
                        session_id: event.session_id,
                    });
                }
                SessionEventKind::UplinkFailed => {
                    shared.sessions.release(index);
                    shared.emit(NodeEvent::UplinkFailed {
                        session_id: event.session_id,
                    });
                }
            }
        }
    }

    /// Downlink scheduling: takes decoded packets from the ServerManager,
    /// waits for their transmit time and hands them to the radio driver.
    async fn downlink_task(
        shared: Arc<NodeShared>,
        mut downlink_rx: mpsc::Receiver<PoolHandle<DownlinkPacket>>,
    ) {
        while let Some(handle) = downlink_rx.recv().await {
            let Some(downlink) = handle.take() else {
                continue;
            };
            drop(handle);

            let radio = shared
                .radio_downlink
                .lock()
                .expect("downlink mutex")
                .clone();
            let Some(radio) = radio else {
                warn!("downlink received before initialization, dropped");
                continue;
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let target_ms = downlink.packet.timestamp_ms;
                if !downlink.immediate && target_ms > 0 {
                    let now = monotonic_ms();
                    if target_ms > now {
                        tokio::time::sleep(Duration::from_millis(target_ms - now)).await;
                    } else {
                        debug!("downlink transmit time {target_ms} already past");
                    }
                }
                shared.emit(NodeEvent::DownlinkScheduled {
                    timestamp_ms: downlink.packet.timestamp_ms,
                });
                if radio.send(downlink).await.is_err() {
                    warn!("radio downlink channel closed, packet lost");
                }
            });
        }
    }
}
