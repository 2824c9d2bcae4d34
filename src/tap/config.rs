//! Capture configuration and pipeline tuning constants.

use std::time::Duration;

use serde::Deserialize;

/// Bytes of each frame handed to the decoder. 65535 covers any Ethernet
/// frame including jumbo payloads after kernel reassembly.
pub const SNAPLEN: i32 = 65_535;

/// Kernel read timeout in milliseconds. The capture worker wakes at least
/// this often to poll the stop flag, so `stop()` returns within one timeout
/// plus the cost of any in-flight segment.
pub const RECV_TIMEOUT_MS: i32 = 200;

/// How often the capture worker sweeps idle connections out of the
/// reassembler, independent of packet arrival.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of the bounded queue between the capture worker and the host
/// callback bridge. The worker blocks only when the host falls this many
/// messages behind.
pub const MESSAGE_QUEUE_DEPTH: usize = 1024;

/// Configuration accepted by [`Engine::start`](crate::tap::Engine::start).
///
/// Deserializes from the embedding contract's camelCase field names; every
/// field except `ports` has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Interface to capture on. Empty or `"any"` captures all interfaces.
    pub interface: String,
    /// TCP ports to observe. Must be non-empty for a live capture; the
    /// empty set compiles to a capture-any-TCP filter for tests.
    pub ports: Vec<u16>,
    /// Reserved for future use; accepted but not consumed by the pipeline.
    pub sample_rate: f64,
    /// Largest body stored per message. Longer bodies are truncated and
    /// tagged, with the excess consumed so framing stays correct.
    pub max_body_size: usize,
    /// Cap on simultaneously tracked connections. Beyond it the
    /// oldest-created connections are evicted.
    pub max_concurrent_connections: usize,
    /// Idle milliseconds after which a connection is evicted.
    pub connection_idle_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "any".to_string(),
            ports: Vec::new(),
            sample_rate: 1.0,
            max_body_size: 1_048_576,
            max_concurrent_connections: 10_000,
            connection_idle_timeout_ms: 300_000,
        }
    }
}

impl CaptureConfig {
    /// The pcap device name to open; an empty interface means `"any"`.
    pub fn device(&self) -> &str {
        if self.interface.is_empty() {
            "any"
        } else {
            &self.interface
        }
    }
}
