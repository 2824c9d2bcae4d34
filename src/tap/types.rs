//! Core data types shared across the tap pipeline.
//!
//! Everything that crosses a stage boundary lives here: the decoded
//! [`TcpSegment`], the ordered [`StreamChunk`] the reassembler emits, the
//! [`HttpMessage`] handed to the embedding application, and the typed
//! [`TapError`] surface. Each value owns its byte buffers; no stage holds a
//! view into another stage's memory.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Formats an endpoint as `ip:port`, the form used inside connection keys
/// and log lines.
pub fn format_endpoint(ip: &str, port: u16) -> String {
    format!("{}:{}", ip, port)
}

// ── Decoded segments ─────────────────────────────────────────────────────────

/// One decoded TCP segment: the four-tuple, sequence/acknowledgment numbers,
/// the flags the pipeline cares about, and an owned payload (possibly empty).
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

// ── Stream chunks ────────────────────────────────────────────────────────────

/// Direction of a run of stream bytes relative to the capture filter.
///
/// The receiver is the endpoint whose port matched the filter; traffic from
/// its peer toward it is `ClientToServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered, contiguous run of stream bytes for one direction of one
/// connection, emitted by the reassembler in strict sequence order.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub connection_key: String,
    pub receiver_ip: String,
    pub receiver_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub direction: Direction,
    pub data: Vec<u8>,
}

// ── Emitted messages ─────────────────────────────────────────────────────────

/// One side of a connection as surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

/// Whether a parsed message was a request or a response, decided from its
/// start-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// A complete HTTP/1.x message.
///
/// Serializes to the embedding contract shape: camelCase keys, optional
/// fields omitted when they hold their empty sentinel (`method`/`path`/`body`
/// empty, `statusCode` zero, `bodyTruncated` false, `bodyEncoding` empty).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMessage {
    pub receiver: Endpoint,
    pub destination: Endpoint,
    pub direction: MessageKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(skip_serializing_if = "is_false")]
    pub body_truncated: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body_encoding: String,
    pub timestamp: String,
}

fn is_zero(code: &u16) -> bool {
    *code == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ── Capture statistics ───────────────────────────────────────────────────────

/// End-of-run counters collected from the kernel when the capture stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub packets_received: u32,
    pub packets_dropped: u32,
    pub packets_if_dropped: u32,
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Stable error codes of the embedding contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Interface absent, permission denied, or filter compilation failed.
    CaptureOpenFailed,
    /// The receive loop failed, or `start` was called while running.
    Unrecoverable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CaptureOpenFailed => "CAPTURE_OPEN_FAILED",
            ErrorCode::Unrecoverable => "UNRECOVERABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure from the capture surface. Data anomalies (malformed
/// frames, undecodable HTTP, sequence gaps) are never errors; only
/// configuration and fatal runtime failures reach this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TapError {
    pub code: ErrorCode,
    pub message: String,
}

impl TapError {
    pub fn open_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CaptureOpenFailed,
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unrecoverable,
            message: message.into(),
        }
    }
}
