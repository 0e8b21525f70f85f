//! # LoRa Physical-Layer Types
//!
//! Captures exchanged with the radio side of the gateway: the raw payload
//! with its monotonic receive timestamp, and the reception metadata the
//! Network Server wants forwarded along with it.

use serde::{Deserialize, Serialize};

/// LoRa spreading factors supported by the gateway radios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpreadingFactor {
    Sf7,
    Sf8,
    Sf9,
    Sf10,
    Sf11,
    Sf12,
}

impl SpreadingFactor {
    pub fn symbol(&self) -> &'static str {
        match self {
            SpreadingFactor::Sf7 => "SF7",
            SpreadingFactor::Sf8 => "SF8",
            SpreadingFactor::Sf9 => "SF9",
            SpreadingFactor::Sf10 => "SF10",
            SpreadingFactor::Sf11 => "SF11",
            SpreadingFactor::Sf12 => "SF12",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<SpreadingFactor> {
        match symbol {
            "SF7" => Some(SpreadingFactor::Sf7),
            "SF8" => Some(SpreadingFactor::Sf8),
            "SF9" => Some(SpreadingFactor::Sf9),
            "SF10" => Some(SpreadingFactor::Sf10),
            "SF11" => Some(SpreadingFactor::Sf11),
            "SF12" => Some(SpreadingFactor::Sf12),
            _ => None,
        }
    }
}

/// Channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn symbol(&self) -> &'static str {
        match self {
            Bandwidth::Khz125 => "BW125",
            Bandwidth::Khz250 => "BW250",
            Bandwidth::Khz500 => "BW500",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Bandwidth> {
        match symbol {
            "BW125" => Some(Bandwidth::Khz125),
            "BW250" => Some(Bandwidth::Khz250),
            "BW500" => Some(Bandwidth::Khz500),
            _ => None,
        }
    }
}

/// Forward error correction coding rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodingRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl CodingRate {
    pub fn symbol(&self) -> &'static str {
        match self {
            CodingRate::Cr4_5 => "4/5",
            CodingRate::Cr4_6 => "4/6",
            CodingRate::Cr4_7 => "4/7",
            CodingRate::Cr4_8 => "4/8",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<CodingRate> {
        match symbol {
            "4/5" => Some(CodingRate::Cr4_5),
            "4/6" => Some(CodingRate::Cr4_6),
            "4/7" => Some(CodingRate::Cr4_7),
            "4/8" => Some(CodingRate::Cr4_8),
            _ => None,
        }
    }
}

/// CRC check outcome reported by the radio for a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrcStatus {
    Ok,
    Fail,
    NoCrc,
}

impl Default for CrcStatus {
    fn default() -> Self {
        CrcStatus::NoCrc
    }
}

/// Reception metadata attached to an uplink LoRa packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraPacketInfo {
    /// Frequency channel index on the concentrator.
    pub channel: u8,
    /// RF chain the packet was received on.
    pub rf_chain: u8,
    /// Center frequency in Hz.
    pub frequency_hz: u32,
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    /// Received signal strength in dBm.
    pub rssi_dbm: i16,
    /// Signal to noise ratio in dB.
    pub snr_db: f32,
    pub crc_status: CrcStatus,
}

impl LoraPacketInfo {
    /// GWMP "datr" form, e.g. `SF7BW125`.
    pub fn datarate(&self) -> String {
        format!("{}{}", self.spreading_factor.symbol(), self.bandwidth.symbol())
    }

    /// Split a GWMP "datr" string back into spreading factor and bandwidth.
    pub fn parse_datarate(datr: &str) -> Option<(SpreadingFactor, Bandwidth)> {
        let bw_at = datr.find("BW")?;
        let sf = SpreadingFactor::from_symbol(&datr[..bw_at])?;
        let bw = Bandwidth::from_symbol(&datr[bw_at..])?;
        Some((sf, bw))
    }
}

impl Default for LoraPacketInfo {
    fn default() -> Self {
        LoraPacketInfo {
            channel: 0,
            rf_chain: 0,
            frequency_hz: 868_100_000,
            spreading_factor: SpreadingFactor::Sf7,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            rssi_dbm: 0,
            snr_db: 0.0,
            crc_status: CrcStatus::NoCrc,
        }
    }
}

/// A physical-layer LoRa capture.
///
/// For uplinks `timestamp_ms` is the monotonic tick at reception. For
/// downlinks it names the monotonic tick at which the radio must transmit;
/// 0 means transmit immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoraPacket {
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl LoraPacket {
    pub fn new(timestamp_ms: u64, payload: Vec<u8>) -> Self {
        LoraPacket {
            timestamp_ms,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
