//! # Network Server Protocol Boundary
//!
//! A protocol engine implements the message protocol used between the
//! gateway and a given LoRa Network Server: it encodes uplink LoRa packets
//! into wire messages, decodes server replies, and tracks the per-message
//! protocol transactions (including heartbeat scheduling). The engine is a
//! codec plus session state; it never touches the network itself.
//!
//! Engines are reentrant and internally synchronized, so any gateway task
//! may call them.

pub mod semtech;

use crate::constants::HEARTBEAT_MESSAGE_ID;
use crate::error::GatewayError;
use crate::lora::{LoraPacket, LoraPacketInfo};
use bytes::BytesMut;

pub use semtech::SemtechProtocolEngine;

/// Composite identifier of a message known to both the ServerManager and
/// its protocol engine.
///
/// The low 16 bits are the engine's transaction key (implementation
/// defined); the high 16 bits are the ServerManager message id
/// (`0xFF` for the embedded heartbeat message). This is the only
/// identifier exchanged across the component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolMessageId(u32);

impl ProtocolMessageId {
    pub fn new(message_id: u8, transaction_key: u16) -> Self {
        ProtocolMessageId(((message_id as u32) << 16) | transaction_key as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        ProtocolMessageId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// ServerManager message id (pool slot index, or a reserved id).
    pub fn message_id(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Engine transaction key.
    pub fn transaction_key(&self) -> u16 {
        self.0 as u16
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_id() == HEARTBEAT_MESSAGE_ID
    }
}

impl std::fmt::Display for ProtocolMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}:{:04X}", self.message_id(), self.transaction_key())
    }
}

/// Kinds of uplink messages an engine can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkKind {
    /// Ask the engine whether a keepalive message is due (and build it).
    Heartbeat,
    /// Encode an uplink LoRa packet for the Network Server.
    LoraData,
}

/// Parameters for [`ProtocolEngine::build_uplink_message`].
pub struct BuildUplinkParams<'a> {
    pub kind: UplinkKind,
    /// Message identifier in the calling ServerManager, used to build the
    /// returned composite id.
    pub message_id: u8,
    /// Build the heartbeat regardless of the configured period (used for
    /// the initial Network Server handshake).
    pub force_heartbeat: bool,
    /// The uplink LoRa packet; not required for heartbeats.
    pub packet: Option<&'a LoraPacket>,
    pub info: Option<&'a LoraPacketInfo>,
}

impl<'a> BuildUplinkParams<'a> {
    pub fn heartbeat(force: bool) -> Self {
        BuildUplinkParams {
            kind: UplinkKind::Heartbeat,
            message_id: HEARTBEAT_MESSAGE_ID,
            force_heartbeat: force,
            packet: None,
            info: None,
        }
    }

    pub fn lora_data(message_id: u8, packet: &'a LoraPacket, info: &'a LoraPacketInfo) -> Self {
        BuildUplinkParams {
            kind: UplinkKind::LoraData,
            message_id,
            force_heartbeat: false,
            packet: Some(packet),
            info: Some(info),
        }
    }
}

/// Events reported by the owner of a message to advance its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connector sent the message on the transport layer.
    Sent,
    /// The connector could not send the message.
    SendFailed,
    /// The exchange was abandoned before completion.
    Canceled,
    /// The owner will no longer reference this transaction; the engine may
    /// release its resources.
    Released,
}

/// Transaction state returned by [`ProtocolEngine::process_session_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The transaction waits for a further event or server reply.
    Progressing,
    /// The transaction completed successfully; the owner must confirm with
    /// [`SessionEvent::Released`].
    Terminated,
    /// The transaction failed; no more events or replies are expected.
    Failed,
    /// The composite id does not match any open transaction.
    UnknownTransaction,
}

/// A downlink LoRa packet decoded from a server message, ready for the
/// radio side.
#[derive(Debug, Clone, Default)]
pub struct DownlinkPacket {
    pub packet: LoraPacket,
    pub info: LoraPacketInfo,
    /// Transmit as soon as possible instead of at `packet.timestamp_ms`.
    pub immediate: bool,
}

/// Outcome of decoding a datagram received from the Network Server.
#[derive(Debug)]
pub enum ServerMessageOutcome {
    /// The reply advanced an uplink transaction which still waits for more.
    UplinkProgressing(ProtocolMessageId),
    /// The reply completed an uplink transaction successfully.
    UplinkTerminated(ProtocolMessageId),
    /// The reply completed an uplink transaction with a fatal error.
    UplinkFailed(ProtocolMessageId),
    /// The message carries payload for a node; a downlink packet was built
    /// and an acknowledge transaction opened under the returned id.
    DownlinkPrepared {
        id: ProtocolMessageId,
        downlink: DownlinkPacket,
    },
    /// The message header or body could not be parsed; dropped.
    MalformedMessage,
    /// The reply targets an unknown or already released transaction
    /// (typically an ack arriving too late); dropped.
    UnknownTransaction,
}

/// Protocol implemented between the gateway and a LoRa Network Server.
pub trait ProtocolEngine: Send + Sync {
    /// Build an uplink wire message into `buf`.
    ///
    /// For [`UplinkKind::Heartbeat`], returns `Ok(None)` when no heartbeat
    /// is due (unless forced). For [`UplinkKind::LoraData`] a message is
    /// always produced or an error returned. On success the returned
    /// composite id names the new transaction and must be quoted in all
    /// later [`ProtocolEngine::process_session_event`] calls.
    fn build_uplink_message(
        &self,
        params: BuildUplinkParams<'_>,
        buf: &mut BytesMut,
    ) -> Result<Option<ProtocolMessageId>, GatewayError>;

    /// Decode a datagram received from the Network Server and advance the
    /// matching transaction, if any.
    fn process_server_message(&self, data: &[u8]) -> ServerMessageOutcome;

    /// Report a transport-level event on a message and get the resulting
    /// transaction state.
    fn process_session_event(&self, event: SessionEvent, id: ProtocolMessageId) -> SessionState;

    /// Build the acknowledge datagram for a downlink transaction opened by
    /// [`ServerMessageOutcome::DownlinkPrepared`].
    fn build_downlink_ack(
        &self,
        id: ProtocolMessageId,
        buf: &mut BytesMut,
    ) -> Result<(), GatewayError>;
}
