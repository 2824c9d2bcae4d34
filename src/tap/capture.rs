//! Live capture driver.
//!
//! Owns the pcap handle and the dedicated worker thread that runs the
//! receive loop. The worker decodes each frame and hands accepted segments
//! to the pipeline sink; a short kernel read timeout doubles as the poll
//! interval for the stop flag, so `stop()` returns within one timeout plus
//! the cost of whatever segment is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use pcap::{Active, Capture, Linktype};

use crate::logger::{Event, SharedLogger};
use crate::tap::config::{CaptureConfig, IDLE_SWEEP_INTERVAL, RECV_TIMEOUT_MS, SNAPLEN};
use crate::tap::decode::decode_segment;
use crate::tap::types::{CaptureStats, TapError, TcpSegment};

/// Where decoded traffic and housekeeping ticks go. Implemented by the
/// engine's pipeline; the driver never looks inside.
pub trait PipelineSink: Send {
    /// Called from the worker thread for every segment the decoder accepts.
    fn on_segment(&mut self, seg: TcpSegment);
    /// Called from the worker thread roughly once per sweep interval,
    /// whether or not traffic arrived.
    fn on_sweep(&mut self);
}

/// Compiles the kernel-side filter from the configured port set. The empty
/// set captures any TCP traffic.
pub fn bpf_filter(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "tcp".to_string();
    }
    let mut filter = format!("tcp port {}", ports[0]);
    for port in &ports[1..] {
        filter.push_str(&format!(" or tcp port {}", port));
    }
    filter
}

pub struct CaptureDriver {
    logger: SharedLogger,
    stop_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Option<CaptureStats>>>,
    last_error: Arc<Mutex<Option<TapError>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureDriver {
    pub fn new(logger: SharedLogger, last_error: Arc<Mutex<Option<TapError>>>) -> Self {
        Self {
            logger,
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(None)),
            last_error,
            worker: None,
        }
    }

    /// Opens the device, installs the port filter, logs the startup line and
    /// spawns the receive worker. Any open/compile/install failure is fatal
    /// and reported as `CAPTURE_OPEN_FAILED`.
    pub fn start(
        &mut self,
        config: &CaptureConfig,
        sink: Box<dyn PipelineSink>,
    ) -> Result<(), TapError> {
        let device = config.device().to_string();
        let mut cap = Capture::from_device(device.as_str())
            .map_err(|e| TapError::open_failed(format!("open {}: {}", device, e)))?
            .snaplen(SNAPLEN)
            .promisc(true)
            .timeout(RECV_TIMEOUT_MS)
            .open()
            .map_err(|e| TapError::open_failed(format!("activate {}: {}", device, e)))?;

        // Plain Ethernet framing where the device supports it; the "any"
        // pseudo-device only speaks Linux cooked capture and keeps its
        // native link type.
        let _ = cap.set_datalink(Linktype::ETHERNET);

        let filter = bpf_filter(&config.ports);
        cap.filter(&filter, true)
            .map_err(|e| TapError::open_failed(format!("filter '{}': {}", filter, e)))?;

        self.logger.log(&Event::CaptureStarted {
            interface: &device,
            ports: &config.ports,
        });

        self.stop_flag.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.stats.lock() {
            *slot = None;
        }

        let stop_flag = Arc::clone(&self.stop_flag);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let last_error = Arc::clone(&self.last_error);
        let logger = Arc::clone(&self.logger);
        self.worker = Some(thread::spawn(move || {
            run_loop(cap, sink, stop_flag, running, stats, last_error, logger);
        }));
        Ok(())
    }

    /// Signals the worker, joins it, and returns the end-of-run counters if
    /// a capture actually ran. Safe to call repeatedly.
    pub fn stop(&mut self) -> Option<CaptureStats> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
        self.stats.lock().ok().and_then(|slot| *slot)
    }

    /// Whether the receive worker is alive. Goes false on its own if the
    /// loop hits an unrecoverable error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn run_loop(
    mut cap: Capture<Active>,
    mut sink: Box<dyn PipelineSink>,
    stop_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Option<CaptureStats>>>,
    last_error: Arc<Mutex<Option<TapError>>>,
    logger: SharedLogger,
) {
    let mut last_sweep = Instant::now();
    while !stop_flag.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(packet) => {
                if let Some(seg) = decode_segment(packet.data) {
                    sink.on_segment(seg);
                }
            }
            Err(pcap::Error::TimeoutExpired) => {} // woke to poll the stop flag
            Err(e) => {
                let err = TapError::unrecoverable(format!("capture loop: {}", e));
                logger.log(&Event::Unrecoverable {
                    message: &err.message,
                });
                if let Ok(mut slot) = last_error.lock() {
                    *slot = Some(err);
                }
                break;
            }
        }
        if last_sweep.elapsed() >= IDLE_SWEEP_INTERVAL {
            sink.on_sweep();
            last_sweep = Instant::now();
        }
    }

    if let Ok(pcap_stats) = cap.stats() {
        if let Ok(mut slot) = stats.lock() {
            *slot = Some(CaptureStats {
                packets_received: pcap_stats.received,
                packets_dropped: pcap_stats.dropped,
                packets_if_dropped: pcap_stats.if_dropped,
            });
        }
    }
    running.store(false, Ordering::SeqCst);
}
