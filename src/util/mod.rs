//! # Utility Modules
//!
//! Common building blocks used throughout the loragw-rs crate: the
//! fixed-capacity message pools, the shared automaton state cell, gateway
//! identity derivation and the monotonic clock.

pub mod automaton;
pub mod eui;
pub mod pool;

use once_cell::sync::Lazy;
use std::time::Instant;

// Re-export commonly used types and functions
pub use automaton::{AutomatonState, StateCell};
pub use eui::{eui64_from_mac, gateway_id_token, parse_gateway_token};
pub use pool::{MessagePool, PoolHandle};

static BOOT_INSTANT: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic millisecond tick counter, anchored at first use.
///
/// This is the timestamp domain of `LoraPacket` and of the protocol
/// engine's heartbeat scheduler; it never goes backwards and is unrelated
/// to the (optionally SNTP-synced) wall clock.
pub fn monotonic_ms() -> u64 {
    BOOT_INSTANT.elapsed().as_millis() as u64
}
