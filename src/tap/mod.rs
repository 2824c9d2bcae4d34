//! The tap engine: packet decoding, TCP reassembly and HTTP parsing wired
//! behind a start/stop surface for the embedding application.
//!
//! One [`Engine`] owns one pipeline. `start` opens the capture and spawns
//! two threads: the capture worker, which runs decode → reassembly → parse
//! synchronously per frame, and the bridge, which drains a bounded message
//! queue into the host callback so the worker never calls into the host
//! directly. `stop` tears both down, dropping any in-progress parser state
//! without flushing, and returns the end-of-run counters.

pub mod capture;
pub mod config;
pub mod decode;
pub mod http;
pub mod reassembly;
pub mod types;

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::logger::SharedLogger;

use self::capture::{CaptureDriver, PipelineSink};
use self::config::{CaptureConfig, MESSAGE_QUEUE_DEPTH};
use self::http::HttpStreamParser;
use self::reassembly::Reassembler;
use self::types::{
    CaptureStats, Direction, Endpoint, HttpMessage, StreamChunk, TapError, TcpSegment,
};

/// The capture-worker side of the pipeline: reassembler plus one HTTP
/// parser per (connection, direction), created on first chunk and destroyed
/// when the connection goes away.
struct Pipeline {
    reassembler: Reassembler,
    parsers: HashMap<(String, Direction), HttpStreamParser>,
    max_body_size: usize,
    /// Above this connection count, every push is followed by an
    /// opportunistic idle sweep.
    half_cap: usize,
    tx: SyncSender<HttpMessage>,
}

impl Pipeline {
    fn dispatch_chunk(&mut self, chunk: StreamChunk) {
        let parser = self
            .parsers
            .entry((chunk.connection_key.clone(), chunk.direction))
            .or_insert_with(|| {
                HttpStreamParser::new(
                    self.max_body_size,
                    Endpoint {
                        ip: chunk.receiver_ip.clone(),
                        port: chunk.receiver_port,
                    },
                    Endpoint {
                        ip: chunk.dest_ip.clone(),
                        port: chunk.dest_port,
                    },
                )
            });
        for msg in parser.feed(&chunk.data) {
            // blocks only when the host bridge falls a full queue behind
            let _ = self.tx.send(msg);
        }
    }

    fn drop_evicted_parsers(&mut self) {
        for key in self.reassembler.take_evicted() {
            self.parsers
                .remove(&(key.clone(), Direction::ClientToServer));
            self.parsers.remove(&(key, Direction::ServerToClient));
        }
    }
}

impl PipelineSink for Pipeline {
    fn on_segment(&mut self, seg: TcpSegment) {
        for chunk in self.reassembler.push_segment(&seg) {
            self.dispatch_chunk(chunk);
        }
        self.drop_evicted_parsers();
        if self.reassembler.connection_count() > self.half_cap {
            let now = self.reassembler.now_ms();
            self.reassembler.evict_idle(now);
            self.drop_evicted_parsers();
        }
    }

    fn on_sweep(&mut self) {
        let now = self.reassembler.now_ms();
        self.reassembler.evict_idle(now);
        self.drop_evicted_parsers();
    }
}

/// The embedding surface: start/stop/status over one capture pipeline.
pub struct Engine {
    logger: SharedLogger,
    driver: Option<CaptureDriver>,
    bridge: Option<thread::JoinHandle<()>>,
    last_error: Arc<Mutex<Option<TapError>>>,
}

impl Engine {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            logger,
            driver: None,
            bridge: None,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts capturing. `on_message` is invoked on the bridge thread for
    /// every complete HTTP message, in per-direction wire order.
    ///
    /// Fails with `CAPTURE_OPEN_FAILED` on configuration or device errors
    /// and with `UNRECOVERABLE` when a capture is already running.
    pub fn start<F>(&mut self, config: &CaptureConfig, on_message: F) -> Result<(), TapError>
    where
        F: FnMut(HttpMessage) + Send + 'static,
    {
        if self.is_running() {
            let err = TapError::unrecoverable("capture already running");
            self.record_error(&err);
            return Err(err);
        }
        // reap a previous run that already finished
        let _ = self.stop();

        if config.ports.is_empty() {
            let err = TapError::open_failed("config.ports must be a non-empty port list");
            self.record_error(&err);
            return Err(err);
        }

        let (tx, rx) = sync_channel::<HttpMessage>(MESSAGE_QUEUE_DEPTH);
        let pipeline = Pipeline {
            reassembler: Reassembler::new(config, Arc::clone(&self.logger)),
            parsers: HashMap::new(),
            max_body_size: config.max_body_size,
            half_cap: config.max_concurrent_connections / 2,
            tx,
        };

        let mut driver = CaptureDriver::new(Arc::clone(&self.logger), Arc::clone(&self.last_error));
        if let Err(err) = driver.start(config, Box::new(pipeline)) {
            self.record_error(&err);
            return Err(err);
        }

        let mut on_message = on_message;
        self.bridge = Some(thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                on_message(msg);
            }
        }));
        self.driver = Some(driver);
        Ok(())
    }

    /// Stops the capture and destroys all pipeline state. In-progress
    /// messages are dropped, not flushed. Idempotent; the counters are
    /// present only when a capture actually ran.
    pub fn stop(&mut self) -> Option<CaptureStats> {
        let stats = self.driver.take().and_then(|mut driver| driver.stop());
        // the worker owned the pipeline and with it the channel sender;
        // the bridge drains what is queued and exits on disconnect
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
        stats
    }

    pub fn is_running(&self) -> bool {
        self.driver
            .as_ref()
            .map(|driver| driver.is_running())
            .unwrap_or(false)
    }

    /// The last recorded failure, readable after `start` returns an error
    /// or after the receive loop dies mid-run.
    pub fn last_error(&self) -> Option<TapError> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    fn record_error(&self, err: &TapError) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(err.clone());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
