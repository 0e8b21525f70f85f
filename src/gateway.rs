//! # Gateway Assembly
//!
//! Boot-time wiring: instantiates the NodeManager and ServerManager,
//! cross-attaches them, and exposes the radio-side channel ends so a
//! transceiver driver (or a test harness) can plug in.

use crate::connector::{Connector, WifiConnector};
use crate::error::GatewayError;
use crate::node::{NodeEvent, NodeManager, NodeManagerInitParams, RadioUplink};
use crate::protocol::DownlinkPacket;
use crate::server::{NodeInterface, ServerManager};
use crate::settings::LoraServerSettings;
use log::info;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A fully wired gateway core.
///
/// The radio-facing ends are public: `radio_uplink` is where a transceiver
/// driver delivers captures, `radio_downlink` is where scheduled downlink
/// packets appear, and `node_events` reports session progress.
pub struct Gateway {
    pub node: NodeManager,
    pub server: ServerManager,
    pub radio_uplink: mpsc::Sender<RadioUplink>,
    pub radio_downlink: mpsc::Receiver<DownlinkPacket>,
    pub node_events: mpsc::Receiver<NodeEvent>,
}

impl Gateway {
    /// Wire a gateway around the given connectors and initialize it.
    pub async fn bootstrap_with(
        settings: LoraServerSettings,
        connectors: Vec<Arc<dyn Connector>>,
    ) -> Result<Gateway, GatewayError> {
        settings.validate()?;

        let node = NodeManager::new(crate::constants::NODE_SESSION_POOL_SIZE);
        let server = ServerManager::new(connectors);

        let (radio_downlink_tx, radio_downlink_rx) = mpsc::channel(16);
        let (node_event_tx, node_event_rx) = mpsc::channel(64);
        node.initialize(NodeManagerInitParams {
            radio_downlink: radio_downlink_tx,
            node_events: node_event_tx,
        })?;

        let node_interface = NodeInterface {
            session_events: node.session_event_sender(),
            downlinks: node.downlink_sender(),
        };
        server.initialize(settings, Some(node_interface)).await?;
        node.attach(server.session_packet_sender())?;

        let radio_uplink = node.uplink_sender();
        info!("gateway core initialized");
        Ok(Gateway {
            node,
            server,
            radio_uplink,
            radio_downlink: radio_downlink_rx,
            node_events: node_event_rx,
        })
    }

    /// Wire a gateway with one Wi-Fi connector per configured connector
    /// record.
    pub async fn bootstrap(settings: LoraServerSettings) -> Result<Gateway, GatewayError> {
        let connectors: Vec<Arc<dyn Connector>> = settings
            .connectors
            .iter()
            .enumerate()
            .map(|(index, _)| Arc::new(WifiConnector::new(format!("wifi{index}"))) as Arc<dyn Connector>)
            .collect();
        Self::bootstrap_with(settings, connectors).await
    }

    /// Start both managers (radio side first, as the uplink source).
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.node.start()?;
        self.server.start(false).await
    }

    /// Stop packet processing; the gateway can be started again.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        self.server.stop(false).await?;
        self.node.stop()
    }
}
