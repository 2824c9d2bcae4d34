use clap::Parser;

/// httptap — passive HTTP/1.x traffic tap.
///
/// Captures TCP traffic for the given ports, reassembles each connection's
/// byte streams, and prints every complete HTTP request and response as one
/// JSON line on stdout. Events (startup, evictions, reassembly gaps) go to
/// stderr.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "httptap",
    version,
    about   = "Passive HTTP/1.x traffic tap",
    long_about = None,
)]
pub struct Cli {
    // ── Capture ──────────────────────────────────────────────────────────────

    /// Network interface to capture on. "any" captures on all interfaces.
    #[arg(short = 'i', long = "interface", value_name = "IFACE", default_value = "any")]
    pub interface: String,

    /// TCP ports to observe, comma separated (e.g. 80,8080).
    #[arg(
        short = 'p',
        long = "ports",
        value_name = "PORTS",
        value_delimiter = ',',
        required = true
    )]
    pub ports: Vec<u16>,

    // ── Limits ───────────────────────────────────────────────────────────────

    /// Largest body captured per message; longer bodies are truncated and
    /// tagged bodyTruncated.
    #[arg(long = "max-body-size", value_name = "BYTES", default_value_t = 1_048_576)]
    pub max_body_size: usize,

    /// Cap on simultaneously tracked connections; the oldest are evicted
    /// beyond it.
    #[arg(long = "max-connections", value_name = "N", default_value_t = 10_000)]
    pub max_connections: usize,

    /// Milliseconds of inactivity after which a connection is evicted.
    #[arg(long = "idle-timeout-ms", value_name = "MS", default_value_t = 300_000)]
    pub idle_timeout_ms: u64,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Tee event log lines to this file in addition to stderr.
    ///
    /// The file is created if it does not exist and appended to if it does.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,
}
