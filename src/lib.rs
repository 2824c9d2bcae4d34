//! httptap — a passive HTTP/1.x traffic tap.
//!
//! Observes TCP traffic for a configured set of ports, reassembles each
//! connection's per-direction byte streams, parses HTTP/1.x messages out of
//! them, and delivers every complete message to the embedding application.
//! The pipeline, leaves first:
//!
//! link frame → decoder → TCP segment → reassembler → ordered chunk →
//! HTTP stream parser → message → host callback.
//!
//! ```no_run
//! use std::sync::Arc;
//! use httptap::logger::Logger;
//! use httptap::tap::config::CaptureConfig;
//! use httptap::tap::Engine;
//!
//! let logger = Arc::new(Logger::new(None)?);
//! let mut engine = Engine::new(logger);
//! let config = CaptureConfig {
//!     ports: vec![8080],
//!     ..CaptureConfig::default()
//! };
//! engine.start(&config, |msg| {
//!     println!("{:?} {} {}", msg.direction, msg.method, msg.path);
//! })?;
//! // ... later
//! let _stats = engine.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod logger;
pub mod tap;

pub use tap::config::CaptureConfig;
pub use tap::types::{
    CaptureStats, Direction, Endpoint, ErrorCode, HttpMessage, MessageKind, StreamChunk, TapError,
    TcpSegment,
};
pub use tap::Engine;
