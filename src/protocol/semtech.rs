//! # Semtech UDP Packet-Forwarder Engine
//!
//! Implements the GWMP v2 protocol spoken by Semtech-style Network Servers:
//! PUSH_DATA datagrams carrying rxpk JSON for uplink LoRa packets,
//! PULL_DATA keepalives, their PUSH_ACK / PULL_ACK replies, and PULL_RESP
//! downlinks answered with TX_ACK.
//!
//! Every datagram starts with the protocol version, a 2-byte token and the
//! packet identifier; uplink datagrams additionally carry the 8-byte
//! gateway EUI. The token doubles as the engine's transaction key.

use crate::constants::{
    DOWNLINK_ACK_MESSAGE_ID, GWMP_LONG_HEADER_LEN, GWMP_PROTOCOL_VERSION, GWMP_PULL_ACK,
    GWMP_PULL_DATA, GWMP_PULL_RESP, GWMP_PUSH_ACK, GWMP_PUSH_DATA, GWMP_SHORT_HEADER_LEN,
    GWMP_TX_ACK, HEARTBEAT_MESSAGE_ID, MAX_TRANSACTIONS, MAX_UPMESSAGE_LENGTH,
    TRANSACTION_TIMEOUT_MS,
};
use crate::error::GatewayError;
use crate::lora::{CrcStatus, LoraPacket, LoraPacketInfo};
use crate::protocol::{
    BuildUplinkParams, DownlinkPacket, ProtocolEngine, ProtocolMessageId, ServerMessageOutcome,
    SessionEvent, SessionState, UplinkKind,
};
use crate::util::monotonic_ms;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use chrono::{SecondsFormat, Utc};
use log::{debug, warn};
use nom::number::complete::{be_u16, u8 as nom_u8};
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Uplink packet metadata as serialized in a PUSH_DATA body.
#[derive(Debug, Serialize)]
struct RxPk {
    time: String,
    tmst: u64,
    chan: u8,
    rfch: u8,
    freq: f64,
    stat: i8,
    modu: &'static str,
    datr: String,
    codr: String,
    rssi: i16,
    lsnr: f32,
    size: usize,
    data: String,
}

#[derive(Debug, Serialize)]
struct PushDataBody {
    rxpk: Vec<RxPk>,
}

/// Downlink packet descriptor as carried in a PULL_RESP body.
#[derive(Debug, Deserialize)]
struct TxPk {
    #[serde(default)]
    imme: bool,
    #[serde(default)]
    tmst: u64,
    #[serde(default)]
    freq: f64,
    #[serde(default)]
    rfch: u8,
    datr: String,
    #[serde(default)]
    codr: Option<String>,
    size: usize,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PullRespBody {
    txpk: TxPk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionKind {
    /// PUSH_DATA awaiting PUSH_ACK.
    PushData,
    /// PULL_DATA awaiting PULL_ACK.
    PullData,
    /// TX_ACK to send for a received PULL_RESP; nothing awaited.
    TxAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    /// Built, not yet reported sent.
    Pending,
    /// On the wire, reply awaited.
    Sent,
    /// Completed (successfully or not); waiting for the owner's release.
    Closed,
}

#[derive(Debug)]
struct Transaction {
    token: u16,
    message_id: u8,
    kind: TransactionKind,
    state: TransactionState,
    created_ms: u64,
}

impl Transaction {
    fn id(&self) -> ProtocolMessageId {
        ProtocolMessageId::new(self.message_id, self.token)
    }
}

struct EngineInner {
    transactions: Vec<Transaction>,
    /// Monotonic tick of the last engine-visible uplink; the heartbeat
    /// scheduler measures its period from here.
    last_uplink_ms: u64,
}

/// Protocol engine for the Semtech UDP packet-forwarder variant.
pub struct SemtechProtocolEngine {
    gateway_eui: [u8; 8],
    heartbeat_period: Duration,
    inner: Mutex<EngineInner>,
}

impl SemtechProtocolEngine {
    /// `heartbeat_period` of zero disables the keepalive scheduler.
    pub fn new(gateway_eui: [u8; 8], heartbeat_period: Duration) -> Self {
        SemtechProtocolEngine {
            gateway_eui,
            heartbeat_period,
            inner: Mutex::new(EngineInner {
                transactions: Vec::with_capacity(MAX_TRANSACTIONS),
                last_uplink_ms: monotonic_ms(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().expect("engine mutex poisoned")
    }

    /// Allocate a transaction with a token unique among live entries.
    fn open_transaction(
        inner: &mut EngineInner,
        message_id: u8,
        kind: TransactionKind,
        token: Option<u16>,
    ) -> Result<ProtocolMessageId, GatewayError> {
        let now = monotonic_ms();
        inner
            .transactions
            .retain(|t| now.saturating_sub(t.created_ms) < TRANSACTION_TIMEOUT_MS);
        if inner.transactions.len() >= MAX_TRANSACTIONS {
            return Err(GatewayError::PoolExhausted("protocol transactions"));
        }
        let token = match token {
            Some(token) => token,
            None => {
                let mut token = rand::random::<u16>();
                while inner.transactions.iter().any(|t| t.token == token) {
                    token = rand::random::<u16>();
                }
                token
            }
        };
        let transaction = Transaction {
            token,
            message_id,
            kind,
            state: TransactionState::Pending,
            created_ms: now,
        };
        let id = transaction.id();
        inner.transactions.push(transaction);
        Ok(id)
    }

    fn write_header(&self, buf: &mut BytesMut, token: u16, identifier: u8, long: bool) {
        buf.put_u8(GWMP_PROTOCOL_VERSION);
        buf.put_u16(token);
        buf.put_u8(identifier);
        if long {
            buf.put_slice(&self.gateway_eui);
        }
    }

    fn build_heartbeat(
        &self,
        params: &BuildUplinkParams<'_>,
        buf: &mut BytesMut,
    ) -> Result<Option<ProtocolMessageId>, GatewayError> {
        let mut inner = self.lock();
        if !params.force_heartbeat {
            if self.heartbeat_period.is_zero() {
                return Ok(None);
            }
            let elapsed = monotonic_ms().saturating_sub(inner.last_uplink_ms);
            if elapsed < self.heartbeat_period.as_millis() as u64 {
                return Ok(None);
            }
        }

        // A previous keepalive that never got its ack is superseded.
        inner.transactions.retain(|t| {
            !(t.kind == TransactionKind::PullData && t.message_id == HEARTBEAT_MESSAGE_ID)
        });

        let id = Self::open_transaction(
            &mut inner,
            HEARTBEAT_MESSAGE_ID,
            TransactionKind::PullData,
            None,
        )?;
        buf.clear();
        self.write_header(buf, id.transaction_key(), GWMP_PULL_DATA, true);
        inner.last_uplink_ms = monotonic_ms();
        Ok(Some(id))
    }

    fn build_lora_data(
        &self,
        params: &BuildUplinkParams<'_>,
        buf: &mut BytesMut,
    ) -> Result<Option<ProtocolMessageId>, GatewayError> {
        let packet = params.packet.ok_or(GatewayError::ProtocolMessage)?;
        let info = params.info.ok_or(GatewayError::ProtocolMessage)?;

        let rxpk = RxPk {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            tmst: packet.timestamp_ms.wrapping_mul(1000),
            chan: info.channel,
            rfch: info.rf_chain,
            freq: info.frequency_hz as f64 / 1_000_000.0,
            stat: match info.crc_status {
                CrcStatus::Ok => 1,
                CrcStatus::Fail => -1,
                CrcStatus::NoCrc => 0,
            },
            modu: "LORA",
            datr: info.datarate(),
            codr: info.coding_rate.symbol().to_string(),
            rssi: info.rssi_dbm,
            lsnr: info.snr_db,
            size: packet.len(),
            data: BASE64.encode(&packet.payload),
        };
        let body = serde_json::to_vec(&PushDataBody { rxpk: vec![rxpk] })
            .map_err(|_| GatewayError::ProtocolMessage)?;

        let needed = GWMP_LONG_HEADER_LEN + body.len();
        if needed > MAX_UPMESSAGE_LENGTH {
            return Err(GatewayError::BufferTooSmall {
                needed,
                available: MAX_UPMESSAGE_LENGTH,
            });
        }

        let mut inner = self.lock();
        let id = Self::open_transaction(
            &mut inner,
            params.message_id,
            TransactionKind::PushData,
            None,
        )?;
        buf.clear();
        self.write_header(buf, id.transaction_key(), GWMP_PUSH_DATA, true);
        buf.put_slice(&body);
        inner.last_uplink_ms = monotonic_ms();
        Ok(Some(id))
    }

    fn decode_pull_resp(token: u16, body: &[u8]) -> Option<(ProtocolMessageId, DownlinkPacket)> {
        let parsed: PullRespBody = serde_json::from_slice(body).ok()?;
        let txpk = parsed.txpk;
        let payload = BASE64.decode(txpk.data.as_bytes()).ok()?;
        if payload.len() != txpk.size {
            debug!(
                "PULL_RESP size field {} does not match payload length {}",
                txpk.size,
                payload.len()
            );
        }
        let (spreading_factor, bandwidth) = LoraPacketInfo::parse_datarate(&txpk.datr)?;
        let coding_rate = txpk
            .codr
            .as_deref()
            .and_then(crate::lora::CodingRate::from_symbol)
            .unwrap_or(crate::lora::CodingRate::Cr4_5);

        let info = LoraPacketInfo {
            channel: 0,
            rf_chain: txpk.rfch,
            frequency_hz: (txpk.freq * 1_000_000.0) as u32,
            spreading_factor,
            bandwidth,
            coding_rate,
            rssi_dbm: 0,
            snr_db: 0.0,
            crc_status: CrcStatus::NoCrc,
        };
        let timestamp_ms = if txpk.imme { 0 } else { txpk.tmst / 1000 };
        let downlink = DownlinkPacket {
            packet: LoraPacket::new(timestamp_ms, payload),
            info,
            immediate: txpk.imme,
        };
        Some((
            ProtocolMessageId::new(DOWNLINK_ACK_MESSAGE_ID, token),
            downlink,
        ))
    }
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u8, u16, u8)> {
    let (input, version) = nom_u8(input)?;
    let (input, token) = be_u16(input)?;
    let (input, identifier) = nom_u8(input)?;
    Ok((input, (version, token, identifier)))
}

impl ProtocolEngine for SemtechProtocolEngine {
    fn build_uplink_message(
        &self,
        params: BuildUplinkParams<'_>,
        buf: &mut BytesMut,
    ) -> Result<Option<ProtocolMessageId>, GatewayError> {
        match params.kind {
            UplinkKind::Heartbeat => self.build_heartbeat(&params, buf),
            UplinkKind::LoraData => self.build_lora_data(&params, buf),
        }
    }

    fn process_server_message(&self, data: &[u8]) -> ServerMessageOutcome {
        if data.len() < GWMP_SHORT_HEADER_LEN {
            return ServerMessageOutcome::MalformedMessage;
        }
        let (body, (version, token, identifier)) = match parse_header(data) {
            Ok(parsed) => parsed,
            Err(_) => return ServerMessageOutcome::MalformedMessage,
        };
        if version != GWMP_PROTOCOL_VERSION {
            return ServerMessageOutcome::MalformedMessage;
        }

        match identifier {
            GWMP_PUSH_ACK | GWMP_PULL_ACK => {
                let wanted = if identifier == GWMP_PUSH_ACK {
                    TransactionKind::PushData
                } else {
                    TransactionKind::PullData
                };
                let mut inner = self.lock();
                match inner
                    .transactions
                    .iter_mut()
                    .find(|t| t.token == token && t.kind == wanted && t.state != TransactionState::Closed)
                {
                    Some(transaction) => {
                        transaction.state = TransactionState::Closed;
                        ServerMessageOutcome::UplinkTerminated(transaction.id())
                    }
                    None => ServerMessageOutcome::UnknownTransaction,
                }
            }
            GWMP_PULL_RESP => {
                // A 4-byte header only; the body is the txpk JSON.
                match Self::decode_pull_resp(token, body) {
                    Some((id, downlink)) => {
                        let mut inner = self.lock();
                        match Self::open_transaction(
                            &mut inner,
                            DOWNLINK_ACK_MESSAGE_ID,
                            TransactionKind::TxAck,
                            Some(token),
                        ) {
                            Ok(_) => ServerMessageOutcome::DownlinkPrepared { id, downlink },
                            Err(_) => {
                                warn!("no transaction slot for PULL_RESP ack, downlink unacknowledged");
                                ServerMessageOutcome::DownlinkPrepared { id, downlink }
                            }
                        }
                    }
                    None => ServerMessageOutcome::MalformedMessage,
                }
            }
            _ => ServerMessageOutcome::MalformedMessage,
        }
    }

    fn process_session_event(&self, event: SessionEvent, id: ProtocolMessageId) -> SessionState {
        let mut inner = self.lock();
        let position = inner
            .transactions
            .iter()
            .position(|t| t.token == id.transaction_key() && t.message_id == id.message_id());
        let Some(position) = position else {
            return SessionState::UnknownTransaction;
        };

        match event {
            SessionEvent::Sent => {
                let transaction = &mut inner.transactions[position];
                match transaction.kind {
                    TransactionKind::TxAck => {
                        transaction.state = TransactionState::Closed;
                        SessionState::Terminated
                    }
                    TransactionKind::PushData | TransactionKind::PullData => {
                        if transaction.state == TransactionState::Closed {
                            // Ack already arrived (synchronous handshake path).
                            SessionState::Terminated
                        } else {
                            transaction.state = TransactionState::Sent;
                            SessionState::Progressing
                        }
                    }
                }
            }
            SessionEvent::SendFailed => {
                inner.transactions[position].state = TransactionState::Closed;
                SessionState::Failed
            }
            SessionEvent::Canceled => {
                inner.transactions.remove(position);
                SessionState::Failed
            }
            SessionEvent::Released => {
                inner.transactions.remove(position);
                SessionState::Terminated
            }
        }
    }

    fn build_downlink_ack(
        &self,
        id: ProtocolMessageId,
        buf: &mut BytesMut,
    ) -> Result<(), GatewayError> {
        let inner = self.lock();
        let known = inner
            .transactions
            .iter()
            .any(|t| t.token == id.transaction_key() && t.kind == TransactionKind::TxAck);
        if !known {
            return Err(GatewayError::ProtocolTransaction(id.raw()));
        }
        buf.clear();
        self.write_header(buf, id.transaction_key(), GWMP_TX_ACK, true);
        Ok(())
    }
}
