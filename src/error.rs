//! # Gateway Error Handling
//!
//! This module defines the GatewayError enum, which represents the different
//! error types that can occur in the loragw-rs crate.

use crate::util::AutomatonState;

/// Represents the different error types that can occur in the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A method was called in the wrong automaton state.
    #[error("Operation not allowed in automaton state {0:?}")]
    InvalidState(AutomatonState),

    /// The object has not been initialized yet.
    #[error("Object not initialized")]
    NotInitialized,

    /// Invalid or inconsistent configuration settings.
    #[error("Settings error: {0}")]
    Settings(String),

    /// A fixed-capacity pool has no free slot. Distinct from configuration
    /// errors so callers can react differently to saturation.
    #[error("Pool exhausted: {0}")]
    PoolExhausted(&'static str),

    /// A serialized command did not complete within its timeout.
    #[error("Command timed out")]
    CommandTimeout,

    /// A command was issued while a previous one was still pending.
    #[error("A command is already pending on this object")]
    CommandPending,

    /// An event queue was full and the message was dropped.
    #[error("Event queue full")]
    QueueFull,

    /// The transport (connector) could not reach the network or send data.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A reply from the Network Server could not be parsed.
    #[error("Malformed server message")]
    ProtocolMessage,

    /// A reply targeted an unknown or already released protocol transaction
    /// (typically a late ack).
    #[error("Unknown protocol transaction: 0x{0:08X}")]
    ProtocolTransaction(u32),

    /// No configured connector completed the Network Server handshake.
    #[error("Network Server handshake failed on every connector")]
    HandshakeFailed,

    /// The provided message buffer cannot hold the encoded datagram.
    #[error("Message buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Wall-clock synchronization failed.
    #[error("Time sync error: {0}")]
    TimeSync(String),

    /// Indicates an underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
