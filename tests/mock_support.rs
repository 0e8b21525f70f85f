//! Shared helpers for the gateway integration tests.

#![allow(dead_code)]

use loragw_rs::{ConnectorSettings, LoraServerSettings, ProtocolVariant};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const MAC: [u8; 6] = [0x24, 0x0A, 0xC4, 0x11, 0x22, 0x33];

pub fn connector_settings() -> ConnectorSettings {
    ConnectorSettings {
        network_name: "mock-net".into(),
        network_user: String::new(),
        network_password: String::new(),
        network_join_timeout_ms: 1_000,
        network_server_url: String::new(),
        network_server_port: 0,
        network_server_timeout_ms: 1_000,
        sntp_server_url: String::new(),
        sntp_period_secs: 0,
        gateway_mac: [0u8; 6],
    }
}

/// Settings for `connector_count` mock connectors, a given uplink pool
/// size and heartbeat period (0 disables keepalives).
pub fn test_settings(
    connector_count: usize,
    uplink_pool_size: usize,
    heartbeat_period_secs: u64,
) -> LoraServerSettings {
    let mut settings = LoraServerSettings {
        connectors: vec![connector_settings(); connector_count],
        protocol: ProtocolVariant::Semtech,
        network_server_url: "server.example".into(),
        network_server_port: 1700,
        network_server_user: String::new(),
        network_server_password: String::new(),
        gateway_id_token: String::new(),
        sntp_server_url: String::new(),
        sntp_period_secs: 0,
        gateway_mac: MAC,
        heartbeat_period_secs,
        uplink_pool_size,
    };
    settings.apply_connector_defaults();
    settings
}

/// Receive with a deadline; `None` when nothing arrived in time.
pub async fn recv_within<T>(rx: &mut mpsc::Receiver<T>, ms: u64) -> Option<T> {
    timeout(Duration::from_millis(ms), rx.recv()).await.ok().flatten()
}

/// Poll `predicate` every 25 ms until it holds or the deadline passes.
pub async fn wait_until(ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
