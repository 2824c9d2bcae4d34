//! Structured event logging for httptap.
//!
//! Provides a [`Logger`] that writes one-line events to stderr and
//! optionally to a log file. The startup line is a single JSON object so
//! log shippers can pick up the capture parameters; runtime events are
//! terse `key=value` lines emitted at most once per occurrence, cheap
//! enough for the capture hot path.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

use crate::tap::types::{CaptureStats, Direction};

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds the tap can emit.
#[derive(Debug)]
pub enum Event<'a> {
    /// Capture opened successfully; logged once per start.
    CaptureStarted {
        interface: &'a str,
        ports: &'a [u16],
    },

    /// A connection was evicted, by idle timeout or by the connection cap.
    Eviction { connection: &'a str },

    /// An out-of-order segment left a hole in one direction of a stream.
    ReassemblyGap {
        connection: &'a str,
        direction: Direction,
    },

    /// The receive loop failed and the capture worker exited.
    Unrecoverable { message: &'a str },

    /// End-of-run counters, logged by the CLI after `stop()`.
    Summary { stats: CaptureStats },
}

/// The startup line's fixed JSON shape; field order is part of the contract.
#[derive(Serialize)]
struct StartupLine<'a> {
    timestamp: &'static str,
    level: &'static str,
    message: &'static str,
    interface: &'a str,
    ports: &'a [u16],
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe event logger.
///
/// Constructed once and passed as an `Arc<Logger>` to every part of the
/// pipeline that emits events. The file writer sits behind a `Mutex` so
/// lines are never interleaved across threads.
pub struct Logger {
    /// Optional buffered file writer; `None` when no log file was requested.
    file: Option<Mutex<BufWriter<std::fs::File>>>,
}

/// Type alias used throughout the crate.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger, opening (or creating) `log_path` for appended
    /// writes when given.
    pub fn new(log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };
        Ok(Self { file })
    }

    /// Logs a single [`Event`] to stderr and, when configured, to the file.
    pub fn log(&self, event: &Event) {
        let line = format_event(event);
        eprintln!("{}", line);
        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }
}

fn format_event(event: &Event) -> String {
    match event {
        Event::CaptureStarted { interface, ports } => serde_json::to_string(&StartupLine {
            timestamp: "startup",
            level: "info",
            message: "capture started",
            interface,
            ports,
        })
        .unwrap_or_default(),

        Event::Eviction { connection } => format!("eviction connection={}", connection),

        Event::ReassemblyGap {
            connection,
            direction,
        } => format!(
            "reassembly_gap connection={} direction={}",
            connection,
            direction.as_str()
        ),

        Event::Unrecoverable { message } => format!("unrecoverable message={}", message),

        Event::Summary { stats } => format!(
            "summary packets_received={} packets_dropped={} packets_if_dropped={}",
            stats.packets_received, stats.packets_dropped, stats.packets_if_dropped
        ),
    }
}
