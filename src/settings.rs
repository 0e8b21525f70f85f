//! # Gateway Configuration
//!
//! Bootstrap settings for the gateway: per-connector network credentials and
//! endpoints, Network Server access, protocol variant selection and gateway
//! identity. Settings are loaded once (from a JSON file or the builtin
//! record) and are immutable after `initialize`.

use crate::constants::{DEFAULT_UPLINK_POOL_SIZE, GATEWAY_MAX_CONNECTORS};
use crate::error::GatewayError;
use crate::util::eui;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Network Server protocol variants the gateway can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// Semtech UDP packet-forwarder protocol (GWMP v2).
    Semtech,
}

/// Per-connector credentials and endpoints.
///
/// The Network Server and SNTP fields are normally left empty in a
/// configuration file and filled from the aggregate record by
/// [`LoraServerSettings::apply_connector_defaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSettings {
    /// SSID for a Wi-Fi network (network identifier for other bearers).
    pub network_name: String,
    /// Not used for Wi-Fi networks.
    #[serde(default)]
    pub network_user: String,
    /// Password for the network (Wi-Fi or cellular).
    #[serde(default)]
    pub network_password: String,
    /// Time allowed for joining the network.
    #[serde(default = "default_join_timeout_ms")]
    pub network_join_timeout_ms: u64,

    #[serde(default)]
    pub network_server_url: String,
    #[serde(default)]
    pub network_server_port: u16,
    /// Socket send/receive timeout.
    #[serde(default = "default_server_timeout_ms")]
    pub network_server_timeout_ms: u64,

    /// Empty string disables time synchronization for this connector.
    #[serde(default)]
    pub sntp_server_url: String,
    /// A 0 value indicates time synchronization is not required.
    #[serde(default)]
    pub sntp_period_secs: u64,

    /// 6-byte hardware address used as the gateway protocol identity.
    #[serde(default)]
    pub gateway_mac: [u8; 6],
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_server_timeout_ms() -> u64 {
    5_000
}

impl ConnectorSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.network_join_timeout_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.network_server_timeout_ms)
    }
}

/// Aggregate gateway settings: one or more connectors used with a single
/// LoRa Network Server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraServerSettings {
    /// Network access, in failover order.
    pub connectors: Vec<ConnectorSettings>,

    /// Network Server access.
    pub protocol: ProtocolVariant,
    pub network_server_url: String,
    pub network_server_port: u16,
    #[serde(default)]
    pub network_server_user: String,
    #[serde(default)]
    pub network_server_password: String,
    /// 16 ASCII-hex chars; derived from the MAC when left empty.
    #[serde(default)]
    pub gateway_id_token: String,

    /// SNTP Server access (optional, for gateways without a hardware RTC).
    #[serde(default)]
    pub sntp_server_url: String,
    /// A 0 value indicates time synchronization is not required.
    #[serde(default)]
    pub sntp_period_secs: u64,

    /// Gateway MAC address, required in the UDP transport and in messages
    /// sent to the Network Server.
    pub gateway_mac: [u8; 6],

    /// Keepalive period toward the Network Server; 0 disables heartbeats.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_secs: u64,

    /// Capacity of the uplink message pool.
    #[serde(default = "default_uplink_pool_size")]
    pub uplink_pool_size: usize,
}

fn default_heartbeat_period() -> u64 {
    30
}

fn default_uplink_pool_size() -> usize {
    DEFAULT_UPLINK_POOL_SIZE
}

impl LoraServerSettings {
    /// Load settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path)?;
        let mut settings: LoraServerSettings = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Settings(format!("invalid settings file: {e}")))?;
        settings.apply_connector_defaults();
        settings.validate()?;
        Ok(settings)
    }

    /// The builtin settings compiled into the firmware image. Used when no
    /// configuration file is supplied.
    pub fn builtin() -> Self {
        let mut settings = BUILTIN_SETTINGS.clone();
        settings.apply_connector_defaults();
        settings
    }

    /// Propagate the aggregate Network Server / SNTP / identity fields into
    /// each connector record that did not override them.
    pub fn apply_connector_defaults(&mut self) {
        for connector in &mut self.connectors {
            if connector.network_server_url.is_empty() {
                connector.network_server_url = self.network_server_url.clone();
            }
            if connector.network_server_port == 0 {
                connector.network_server_port = self.network_server_port;
            }
            if connector.sntp_server_url.is_empty() {
                connector.sntp_server_url = self.sntp_server_url.clone();
            }
            if connector.sntp_period_secs == 0 {
                connector.sntp_period_secs = self.sntp_period_secs;
            }
            if connector.gateway_mac == [0u8; 6] {
                connector.gateway_mac = self.gateway_mac;
            }
        }
        if self.gateway_id_token.is_empty() {
            self.gateway_id_token = eui::gateway_id_token(&self.gateway_mac);
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.connectors.is_empty() {
            return Err(GatewayError::Settings(
                "at least one connector must be configured".into(),
            ));
        }
        if self.connectors.len() > GATEWAY_MAX_CONNECTORS {
            return Err(GatewayError::Settings(format!(
                "at most {GATEWAY_MAX_CONNECTORS} connectors supported, got {}",
                self.connectors.len()
            )));
        }
        if self.network_server_url.is_empty() {
            return Err(GatewayError::Settings(
                "network_server_url must be set".into(),
            ));
        }
        if self.uplink_pool_size == 0 {
            return Err(GatewayError::Settings(
                "uplink_pool_size must be at least 1".into(),
            ));
        }
        eui::parse_gateway_token(&self.gateway_id_token)?;
        Ok(())
    }

    /// 8-byte EUI derived from the configured identity token.
    pub fn gateway_eui(&self) -> Result<[u8; 8], GatewayError> {
        eui::parse_gateway_token(&self.gateway_id_token)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }
}

static BUILTIN_SETTINGS: Lazy<LoraServerSettings> = Lazy::new(|| LoraServerSettings {
    connectors: vec![ConnectorSettings {
        network_name: "gateway-wifi".into(),
        network_user: String::new(),
        network_password: String::new(),
        network_join_timeout_ms: default_join_timeout_ms(),
        network_server_url: String::new(),
        network_server_port: 0,
        network_server_timeout_ms: default_server_timeout_ms(),
        sntp_server_url: String::new(),
        sntp_period_secs: 0,
        gateway_mac: [0u8; 6],
    }],
    protocol: ProtocolVariant::Semtech,
    network_server_url: "router.eu.thethings.network".into(),
    network_server_port: 1700,
    network_server_user: String::new(),
    network_server_password: String::new(),
    gateway_id_token: String::new(),
    sntp_server_url: "pool.ntp.org".into(),
    sntp_period_secs: 3600,
    gateway_mac: [0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01],
    heartbeat_period_secs: default_heartbeat_period(),
    uplink_pool_size: DEFAULT_UPLINK_POOL_SIZE,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_settings_are_valid() {
        let settings = LoraServerSettings::builtin();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.gateway_id_token.len(), 16);
        assert_eq!(
            settings.connectors[0].network_server_url,
            settings.network_server_url
        );
    }

    #[test]
    fn connector_overrides_are_preserved() {
        let mut settings = LoraServerSettings::builtin();
        settings.connectors[0].network_server_url = "backup.example.com".into();
        settings.apply_connector_defaults();
        assert_eq!(settings.connectors[0].network_server_url, "backup.example.com");
    }

    #[test]
    fn too_many_connectors_rejected() {
        let mut settings = LoraServerSettings::builtin();
        let connector = settings.connectors[0].clone();
        settings.connectors = vec![connector; GATEWAY_MAX_CONNECTORS + 1];
        assert!(matches!(
            settings.validate(),
            Err(GatewayError::Settings(_))
        ));
    }
}
