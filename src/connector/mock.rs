//! # Mock Server Connector
//!
//! An in-memory connector used by the integration tests: it records every
//! datagram handed to `send`, can acknowledge them automatically the way a
//! Network Server would, and lets a test inject arbitrary downlink
//! datagrams through the regular pool + event path.

use crate::connector::{
    new_downlink_pool, ConnectionState, Connector, ConnectorEvent, ConnectorInitParams,
    DownlinkSlot, SendOutcome, SendParams, ServerDownlinkMessage,
};
use crate::constants::{GWMP_PULL_ACK, GWMP_PULL_DATA, GWMP_PUSH_ACK};
use crate::error::GatewayError;
use crate::util::{monotonic_ms, AutomatonState, MessagePool, StateCell};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct MockBehavior {
    fail_initialize: bool,
    fail_send_receive: bool,
    fail_send: bool,
    auto_ack: bool,
}

struct MockShared {
    connector_index: usize,
    event_queue: Option<mpsc::Sender<ConnectorEvent>>,
    sent: Vec<Bytes>,
    probes: Vec<Bytes>,
}

/// Scriptable connector for tests.
pub struct MockConnector {
    name: String,
    state: Arc<StateCell>,
    connection: Mutex<ConnectionState>,
    behavior: Mutex<MockBehavior>,
    shared: Arc<Mutex<MockShared>>,
    pool: Arc<MessagePool<DownlinkSlot>>,
}

impl MockConnector {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let connector = MockConnector {
            name: name.into(),
            state: Arc::new(StateCell::new(AutomatonState::Created)),
            connection: Mutex::new(ConnectionState::Disconnected),
            behavior: Mutex::new(MockBehavior {
                fail_initialize: false,
                fail_send_receive: false,
                fail_send: false,
                auto_ack: false,
            }),
            shared: Arc::new(Mutex::new(MockShared {
                connector_index: 0,
                event_queue: None,
                sent: Vec::new(),
                probes: Vec::new(),
            })),
            pool: new_downlink_pool(),
        };
        Arc::new(connector)
    }

    /// Refuse `initialize` (network join failure).
    pub fn fail_initialize(self: Arc<Self>) -> Arc<Self> {
        self.behavior.lock().expect("behavior mutex").fail_initialize = true;
        self
    }

    /// Refuse the synchronous handshake probe.
    pub fn fail_send_receive(self: Arc<Self>) -> Arc<Self> {
        self.behavior.lock().expect("behavior mutex").fail_send_receive = true;
        self
    }

    /// Report `SendFailed` for every queued datagram.
    pub fn fail_send(&self, fail: bool) {
        self.behavior.lock().expect("behavior mutex").fail_send = fail;
    }

    /// Acknowledge every sent datagram with the matching GWMP ack, the way
    /// a live Network Server would.
    pub fn auto_ack(self: Arc<Self>) -> Arc<Self> {
        self.behavior.lock().expect("behavior mutex").auto_ack = true;
        self
    }

    /// Datagrams handed to `send`, in order.
    pub fn sent_datagrams(&self) -> Vec<Bytes> {
        self.shared.lock().expect("shared mutex").sent.clone()
    }

    /// Datagrams handed to `send_receive`.
    pub fn probe_datagrams(&self) -> Vec<Bytes> {
        self.shared.lock().expect("shared mutex").probes.clone()
    }

    pub fn downlink_pool_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Push a downlink datagram through the regular pool + event path.
    /// Returns `false` when the pool or the event queue is saturated (the
    /// datagram is dropped, as on the wire).
    pub fn inject_downlink(&self, data: &[u8]) -> bool {
        let (connector_index, queue) = {
            let shared = self.shared.lock().expect("shared mutex");
            match shared.event_queue.clone() {
                Some(queue) => (shared.connector_index, queue),
                None => return false,
            }
        };
        let index = match self.pool.acquire() {
            Ok(index) => index,
            Err(_) => return false,
        };
        let timestamp_ms = monotonic_ms();
        let data = Bytes::copy_from_slice(data);
        self.pool.with_slot(index, |slot| {
            slot.timestamp_ms = timestamp_ms;
            slot.data = data.clone();
        });
        self.pool.mark_ready(index);
        let event = ConnectorEvent::DownlinkReceived(ServerDownlinkMessage {
            connector_index,
            message_id: index,
            timestamp_ms,
            data,
        });
        if queue.try_send(event).is_err() {
            self.pool.release(index);
            return false;
        }
        true
    }

    /// Mirror the header of an uplink datagram into the matching ack.
    fn ack_for(datagram: &[u8]) -> Option<[u8; 4]> {
        if datagram.len() < 4 {
            return None;
        }
        let ack_id = if datagram[3] == GWMP_PULL_DATA {
            GWMP_PULL_ACK
        } else {
            GWMP_PUSH_ACK
        };
        Some([datagram[0], datagram[1], datagram[2], ack_id])
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn initialize(&self, params: ConnectorInitParams) -> Result<(), GatewayError> {
        if self.state.get() != AutomatonState::Created {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        if self.behavior.lock().expect("behavior mutex").fail_initialize {
            self.state.set(AutomatonState::Terminated);
            return Err(GatewayError::Transport(format!(
                "{}: network unavailable",
                self.name
            )));
        }
        {
            let mut shared = self.shared.lock().expect("shared mutex");
            shared.connector_index = params.connector_index;
            shared.event_queue = Some(params.event_queue);
        }
        *self.connection.lock().expect("connection mutex") = ConnectionState::ServerConnected;
        self.state.set(AutomatonState::Initialized);
        Ok(())
    }

    async fn start(&self) -> Result<(), GatewayError> {
        if !self.state.transition(AutomatonState::Idle, AutomatonState::Running) {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        if !self.state.transition(AutomatonState::Running, AutomatonState::Idle) {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        Ok(())
    }

    async fn send(&self, params: SendParams) -> Result<(), GatewayError> {
        if self.state.get() != AutomatonState::Running {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        let behavior = self.behavior.lock().expect("behavior mutex").clone();
        let queue = {
            let mut shared = self.shared.lock().expect("shared mutex");
            shared.sent.push(params.data.clone());
            shared.event_queue.clone()
        };
        let queue = queue.ok_or(GatewayError::NotInitialized)?;

        let outcome = if behavior.fail_send {
            SendOutcome::SendFailed
        } else {
            SendOutcome::Sent
        };
        queue
            .try_send(ConnectorEvent::ServerMsgEvent {
                message_id: params.message_id,
                outcome,
            })
            .map_err(|_| GatewayError::QueueFull)?;

        if behavior.auto_ack && outcome == SendOutcome::Sent {
            if let Some(ack) = Self::ack_for(&params.data) {
                self.inject_downlink(&ack);
            }
        }
        Ok(())
    }

    async fn send_receive(&self, data: &[u8], _wait: Duration) -> Result<Bytes, GatewayError> {
        if self.state.get() != AutomatonState::Initialized {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        self.shared
            .lock()
            .expect("shared mutex")
            .probes
            .push(Bytes::copy_from_slice(data));
        if self.behavior.lock().expect("behavior mutex").fail_send_receive {
            self.state.set(AutomatonState::Terminated);
            return Err(GatewayError::Transport(format!(
                "{}: Network Server unreachable",
                self.name
            )));
        }
        let ack = Self::ack_for(data).ok_or(GatewayError::ProtocolMessage)?;
        self.state.set(AutomatonState::Idle);
        Ok(Bytes::copy_from_slice(&ack))
    }

    async fn downlink_received(&self, message_id: u8) -> Result<(), GatewayError> {
        self.pool.release(message_id);
        Ok(())
    }

    fn state(&self) -> AutomatonState {
        self.state.get()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().expect("connection mutex")
    }

    fn name(&self) -> &str {
        &self.name
    }
}
