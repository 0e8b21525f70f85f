//! Uplink message records and the ServerManager event vocabulary.

use crate::constants::HEARTBEAT_MESSAGE_ID;
use crate::lora::{LoraPacket, LoraPacketInfo};
use crate::node::SessionHandle;
use crate::protocol::ProtocolMessageId;
use bytes::BytesMut;
use std::sync::Arc;

/// Lifecycle of an uplink server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpMessageState {
    /// Slot allocated, packet references stored.
    Created,
    /// Wire stream encoded, transaction opened.
    Prepared,
    /// Handed to a connector, completion pending.
    Sending,
    /// On the wire, server reply awaited.
    Sent,
    /// Completed successfully.
    Terminated,
    /// Completed with a fatal error.
    Failed,
}

/// An uplink message slot: one LoRa packet (or heartbeat) on its way to
/// the Network Server.
///
/// All state transitions happen on the ServerManager main task; the
/// NodeManager-facing task only fills a freshly acquired slot and flips
/// its ready flag.
#[derive(Debug)]
pub struct ServerUpMessage {
    /// Slot index in the uplink pool, or a reserved id.
    pub message_id: u8,
    pub state: UpMessageState,
    /// Composite id assigned by the protocol engine at encode time.
    pub protocol_message_id: Option<ProtocolMessageId>,
    /// Connector used for the last send attempt; a future failover loop
    /// resumes iteration after this index.
    pub last_connector: Option<usize>,
    /// Encoded wire stream.
    pub data: BytesMut,
    /// Borrowed until the radio side observes `UplinkProgressing`.
    pub packet: Option<Arc<LoraPacket>>,
    pub info: Option<Arc<LoraPacketInfo>>,
    /// Radio-side session correlation, valid until the terminal event.
    pub session: Option<SessionHandle>,
    pub session_id: u32,
}

impl ServerUpMessage {
    /// The dedicated record reused for every heartbeat exchange. Never
    /// pooled and never carries a radio session.
    pub fn heartbeat() -> Self {
        ServerUpMessage {
            message_id: HEARTBEAT_MESSAGE_ID,
            ..ServerUpMessage::default()
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_id == HEARTBEAT_MESSAGE_ID
    }
}

impl Default for ServerUpMessage {
    fn default() -> Self {
        ServerUpMessage {
            message_id: 0,
            state: UpMessageState::Created,
            protocol_message_id: None,
            last_connector: None,
            data: BytesMut::new(),
            packet: None,
            info: None,
            session: None,
            session_id: 0,
        }
    }
}

/// Events processed by the ServerManager main task, in FIFO order.
#[derive(Debug)]
pub enum ServerMessageEvent {
    /// A new uplink slot is ready for encoding.
    UplinkReceived { message_id: u8 },
    /// The encoded message can be handed to a connector.
    UplinkPrepared { message_id: u8 },
    /// The connector put the message on the wire.
    UplinkSent { message_id: u8 },
    /// The connector could not send the message.
    UplinkSendFailed { message_id: u8 },
    /// A server reply completed the protocol transaction; run the
    /// terminal path. The full composite id is carried so the handler can
    /// verify the slot still belongs to this exchange.
    UplinkTerminated {
        id: ProtocolMessageId,
        failed: bool,
    },
    /// A downlink needs its acknowledge datagram sent.
    DownlinkAck { id: ProtocolMessageId },
}
