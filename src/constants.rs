//! Gateway Core Constants
//!
//! This module defines the pool capacities, timeouts and protocol
//! identifiers used by the gateway core. The wire identifiers follow the
//! Semtech UDP packet-forwarder protocol (GWMP), version 2.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Capacities
// ---------------------------------------------------------------------------

/// Maximum number of configured server connectors.
pub const GATEWAY_MAX_CONNECTORS: usize = 4;

/// Default capacity of the uplink `ServerUpMessage` pool.
pub const DEFAULT_UPLINK_POOL_SIZE: usize = 8;

/// Capacity of the NodeManager's radio session table. Sized above the
/// uplink pool so the ServerManager, not the radio boundary, is the
/// admission point under load.
pub const NODE_SESSION_POOL_SIZE: usize = 16;

/// Capacity of a connector's received-datagram pool.
pub const CONNECTOR_DOWNLINK_POOL_SIZE: usize = 4;

/// Capacity of the ServerManager's downlink LoRa packet pool.
pub const DOWNLINK_PACKET_POOL_SIZE: usize = 4;

/// Maximum number of in-flight protocol transactions in an engine.
pub const MAX_TRANSACTIONS: usize = 16;

/// Depth of the automaton event queues.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Maximum encoded size of an uplink Network Server datagram.
pub const MAX_UPMESSAGE_LENGTH: usize = 1024;

/// Maximum LoRa PHY payload size.
pub const LORA_MAX_PAYLOAD_LENGTH: usize = 255;

// ---------------------------------------------------------------------------
// Reserved message identifiers
// ---------------------------------------------------------------------------

/// ServerManager message id reserved for the embedded heartbeat message.
pub const HEARTBEAT_MESSAGE_ID: u8 = 0xFF;

/// ServerManager message id reserved for downlink acknowledge datagrams
/// (TX_ACK); these never occupy an uplink pool slot either.
pub const DOWNLINK_ACK_MESSAGE_ID: u8 = 0xFE;

// ---------------------------------------------------------------------------
// Timeouts and periods
// ---------------------------------------------------------------------------

/// Timeout applied to ordinary serialized commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout applied to the `initialize` command (network join + handshake).
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Queue wait used by the automaton loops before running idle work.
pub const QUEUE_WAIT: Duration = Duration::from_millis(500);

/// Transaction age after which the engine reclaims a stale entry.
pub const TRANSACTION_TIMEOUT_MS: u64 = 60_000;

/// SNTP synchronization retry policy: attempts and spacing.
pub const SNTP_MAX_ATTEMPTS: u32 = 10;
pub const SNTP_RETRY_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// GWMP wire protocol (Semtech UDP packet forwarder)
// ---------------------------------------------------------------------------

/// Protocol version byte carried by every datagram.
pub const GWMP_PROTOCOL_VERSION: u8 = 0x02;

/// Uplink: gateway -> server, carries rxpk JSON.
pub const GWMP_PUSH_DATA: u8 = 0x00;
/// Downlink: server ack for PUSH_DATA.
pub const GWMP_PUSH_ACK: u8 = 0x01;
/// Uplink: gateway -> server keepalive (heartbeat), opens the downlink path.
pub const GWMP_PULL_DATA: u8 = 0x02;
/// Downlink: server -> gateway, carries txpk JSON.
pub const GWMP_PULL_RESP: u8 = 0x03;
/// Downlink: server ack for PULL_DATA.
pub const GWMP_PULL_ACK: u8 = 0x04;
/// Uplink: gateway ack for PULL_RESP.
pub const GWMP_TX_ACK: u8 = 0x05;

/// Header sizes: version + token + identifier [+ gateway EUI].
pub const GWMP_SHORT_HEADER_LEN: usize = 4;
pub const GWMP_LONG_HEADER_LEN: usize = 12;
