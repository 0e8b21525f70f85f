//! # loragw-rs - A Rust Crate for LoRaWAN Gateway Core Orchestration
//!
//! The loragw-rs crate implements the core of a LoRaWAN gateway: the
//! software mediating between LoRa radio nodes on one side and a LoRaWAN
//! Network Server speaking the Semtech UDP packet-forwarder protocol on
//! the other.
//!
//! ## Features
//!
//! - Uplink pipeline: sessions accepted from the radio side, encoded into
//!   Network Server datagrams and tracked until the server acknowledge
//! - Downlink pipeline: server datagrams decoded into LoRa packets and
//!   scheduled for RF transmission
//! - A connector pool with first-successful failover at initialization and
//!   a single active transport afterwards (Wi-Fi/UDP in this crate)
//! - Protocol engine boundary with the Semtech GWMP v2 reference variant,
//!   including keepalive (heartbeat) scheduling
//! - Fixed-capacity message pools with distinct exhaustion errors
//! - Optional SNTP wall-clock bootstrap
//!
//! ## Usage
//!
//! ```rust,no_run
//! use loragw_rs::{Gateway, LoraServerSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = LoraServerSettings::builtin();
//!     let gateway = Gateway::bootstrap(settings).await?;
//!     gateway.start().await?;
//!     Ok(())
//! }
//! ```

pub mod connector;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod lora;
pub mod node;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod util;

pub use crate::error::GatewayError;
pub use crate::logging::{init_logger, log_info};

// Core gateway types
pub use gateway::Gateway;
pub use lora::{Bandwidth, CodingRate, CrcStatus, LoraPacket, LoraPacketInfo, SpreadingFactor};
pub use node::{NodeEvent, NodeManager, RadioUplink};
pub use server::{ServerManager, ServerUpMessage, UpMessageState};
pub use settings::{ConnectorSettings, LoraServerSettings, ProtocolVariant};

// Protocol and transport boundaries
pub use connector::{Connector, ConnectorEvent, MockConnector, WifiConnector};
pub use protocol::{
    DownlinkPacket, ProtocolEngine, ProtocolMessageId, SemtechProtocolEngine, SessionState,
};
pub use util::{AutomatonState, MessagePool};
