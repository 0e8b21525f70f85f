//! # Server Connector Boundary
//!
//! A connector manages one network bearer (Wi-Fi, cellular) used to reach
//! the LoRa Network Server. Connectors are polymorphic transports: the
//! ServerManager drives them through the [`Connector`] trait and receives
//! completions and downlink traffic asynchronously on its connector event
//! queue. Command methods return acceptance; semantic results always travel
//! as [`ConnectorEvent`]s.

pub mod mock;
pub mod sntp;
pub mod wifi;

use crate::error::GatewayError;
use crate::settings::ConnectorSettings;
use crate::util::{AutomatonState, MessagePool};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use mock::MockConnector;
pub use wifi::WifiConnector;

/// Link-level connection progress of a connector, updated from network
/// events. Tracked separately from the automaton state because link events
/// arrive on system tasks outside the connector's own loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ConnectingWifi,
    WifiConnected,
    ConnectingServer,
    ServerConnected,
}

/// Received-datagram record held in a connector's downlink pool.
#[derive(Debug, Clone, Default)]
pub struct DownlinkSlot {
    pub timestamp_ms: u64,
    pub data: Bytes,
}

/// A downlink message handed to the ServerManager.
///
/// The payload bytes stay accounted to the owning connector's pool slot
/// until the ServerManager releases it through
/// [`Connector::downlink_received`].
#[derive(Debug, Clone)]
pub struct ServerDownlinkMessage {
    /// Index of the originating connector in the ServerManager's pool.
    pub connector_index: usize,
    /// Identifier of the message in the connector (its pool slot index).
    pub message_id: u8,
    /// Monotonic tick when the datagram was received; used by the protocol
    /// engine and radio timing rules.
    pub timestamp_ms: u64,
    pub data: Bytes,
}

/// Uplink send outcome, reported per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    SendFailed,
}

/// Events a connector deposits on the ServerManager's connector queue.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// A datagram arrived from the Network Server.
    DownlinkReceived(ServerDownlinkMessage),
    /// Outcome of an asynchronous uplink send.
    ServerMsgEvent {
        message_id: u8,
        outcome: SendOutcome,
    },
}

/// Parameters for [`Connector::initialize`].
pub struct ConnectorInitParams {
    pub settings: ConnectorSettings,
    /// Index of this connector in the owning ServerManager.
    pub connector_index: usize,
    /// Queue for notification of connector events.
    pub event_queue: mpsc::Sender<ConnectorEvent>,
}

/// Parameters for [`Connector::send`].
#[derive(Debug, Clone)]
pub struct SendParams {
    pub data: Bytes,
    /// ServerManager message id quoted back in the completion event.
    pub message_id: u8,
}

/// Abstract transport between the gateway and the Network Server.
///
/// Lifecycle: `initialize` (joins the network and binds the server
/// endpoint), one `send_receive` probe during the Network Server
/// handshake, then `start` to enter the event-driven mode where `send`
/// is asynchronous and a receive loop feeds the event queue.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Join the configured network and prepare the server endpoint.
    /// Failure is fatal for this connector (it becomes `Terminated`).
    async fn initialize(&self, params: ConnectorInitParams) -> Result<(), GatewayError>;

    /// Enter the running (event-driven) mode; spawns the receive loop.
    async fn start(&self) -> Result<(), GatewayError>;

    /// Leave the running mode; the receive loop winds down.
    async fn stop(&self) -> Result<(), GatewayError>;

    /// Queue a datagram for transmission. `Ok` means the command was
    /// accepted; completion arrives as a [`ConnectorEvent::ServerMsgEvent`].
    async fn send(&self, params: SendParams) -> Result<(), GatewayError>;

    /// Synchronous probe exchange with the Network Server, used exactly
    /// once before the connector enters event-driven mode.
    async fn send_receive(&self, data: &[u8], timeout: Duration) -> Result<Bytes, GatewayError>;

    /// Release a downlink pool slot previously handed out in a
    /// [`ConnectorEvent::DownlinkReceived`].
    async fn downlink_received(&self, message_id: u8) -> Result<(), GatewayError>;

    fn state(&self) -> AutomatonState;

    fn connection_state(&self) -> ConnectionState;

    fn name(&self) -> &str;
}

/// A connector slot in the ServerManager, with its activation flag.
/// Exactly one descriptor is active after a successful initialization.
pub struct ConnectorDescriptor {
    pub connector: Arc<dyn Connector>,
    pub active: bool,
}

impl ConnectorDescriptor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectorDescriptor {
            connector,
            active: false,
        }
    }
}

pub(crate) fn new_downlink_pool() -> Arc<MessagePool<DownlinkSlot>> {
    Arc::new(MessagePool::new(
        "connector downlink messages",
        crate::constants::CONNECTOR_DOWNLINK_POOL_SIZE,
    ))
}
