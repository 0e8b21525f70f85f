//! # SNTP Bootstrap
//!
//! Gateways without a hardware RTC slew their wall clock from an SNTP
//! server once at startup. The query is the minimal SNTPv4 client exchange:
//! a 48-byte request with only the LI/VN/Mode byte set, answered with the
//! server transmit timestamp in seconds since 1900.
//!
//! The gateway core only needs the offset for log and uplink `time` fields,
//! so the result is kept as a process-local offset rather than written to
//! the system clock.

use crate::constants::{SNTP_MAX_ATTEMPTS, SNTP_RETRY_DELAY};
use crate::error::GatewayError;
use log::{info, warn};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;

const SNTP_PACKET_LEN: usize = 48;

/// LI = 0 (no warning), VN = 4, Mode = 3 (client).
const SNTP_CLIENT_REQUEST: u8 = 0x23;

/// Query `server` (host or host:port) once and return the Unix time in
/// seconds reported by it.
pub async fn query(server: &str, recv_timeout: Duration) -> Result<u64, GatewayError> {
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:123")
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&target).await?;

    let mut request = [0u8; SNTP_PACKET_LEN];
    request[0] = SNTP_CLIENT_REQUEST;
    socket.send(&request).await?;

    let mut reply = [0u8; SNTP_PACKET_LEN];
    let received = timeout(recv_timeout, socket.recv(&mut reply))
        .await
        .map_err(|_| GatewayError::TimeSync(format!("no reply from {target}")))??;
    if received < SNTP_PACKET_LEN {
        return Err(GatewayError::TimeSync(format!(
            "short SNTP reply: {received} bytes"
        )));
    }

    // Transmit timestamp, seconds part, at offset 40.
    let seconds = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    seconds
        .checked_sub(NTP_UNIX_EPOCH_DELTA)
        .ok_or_else(|| GatewayError::TimeSync(format!("implausible server timestamp {seconds}")))
}

/// Startup synchronization: retry the query up to the configured cap.
/// Returns the Unix time on success; failure is reported but callers treat
/// it as non-fatal.
pub async fn synchronize(server: &str, recv_timeout: Duration) -> Result<u64, GatewayError> {
    let mut last_error = GatewayError::TimeSync("no attempt made".into());
    for attempt in 1..=SNTP_MAX_ATTEMPTS {
        match query(server, recv_timeout).await {
            Ok(unix_seconds) => {
                info!("SNTP sync with {server} ok ({unix_seconds}), attempt {attempt}");
                return Ok(unix_seconds);
            }
            Err(e) => {
                warn!("SNTP attempt {attempt}/{SNTP_MAX_ATTEMPTS} failed: {e}");
                last_error = e;
                tokio::time::sleep(SNTP_RETRY_DELAY).await;
            }
        }
    }
    Err(last_error)
}
