//! Streaming HTTP/1.x message parsing.
//!
//! One parser instance per (connection, direction). Bytes are fed as they
//! come off the reassembled stream; the parser buffers internally and emits
//! a message each time one completes, so pipelined messages fall out of a
//! single feed. Parsing is restartable: when the buffer does not yet hold
//! enough bytes to finish the current step, the parser returns without
//! consuming anything and resumes on the next feed.
//!
//! Malformed input never raises. Bad start-lines or headers leave the
//! affected field empty; bodies past the configured cap are truncated with
//! the excess consumed so framing stays correct; non-UTF-8 body runs tag
//! the message `binary` instead of corrupting the text.

use std::collections::HashMap;

use chrono::Utc;

use crate::tap::types::{Endpoint, HttpMessage, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    BodyByLength,
    BodyChunked,
}

/// Stateful HTTP/1.x parser for one direction of one connection.
pub struct HttpStreamParser {
    max_body_size: usize,
    receiver: Endpoint,
    destination: Endpoint,

    buffer: Vec<u8>,
    phase: Phase,
    content_length: usize,
    /// Body bytes consumed for the current message, including bytes past
    /// the cap that were discarded.
    body_read: usize,

    kind: MessageKind,
    method: String,
    path: String,
    status_code: u16,
    headers: HashMap<String, String>,
    body: String,
    body_truncated: bool,
    body_encoding: String,
}

impl HttpStreamParser {
    pub fn new(max_body_size: usize, receiver: Endpoint, destination: Endpoint) -> Self {
        Self {
            max_body_size,
            receiver,
            destination,
            buffer: Vec::new(),
            phase: Phase::Headers,
            content_length: 0,
            body_read: 0,
            kind: MessageKind::Request,
            method: String::new(),
            path: String::new(),
            status_code: 0,
            headers: HashMap::new(),
            body: String::new(),
            body_truncated: false,
            body_encoding: String::new(),
        }
    }

    /// Feeds a run of ordered stream bytes, returning every message that
    /// completed, in wire order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<HttpMessage> {
        let mut out = Vec::new();
        if data.is_empty() {
            return out;
        }
        self.buffer.extend_from_slice(data);
        loop {
            let progressed = match self.phase {
                Phase::Headers => self.parse_headers(),
                Phase::BodyByLength => self.parse_body_by_length(&mut out),
                Phase::BodyChunked => self.parse_body_chunked(&mut out),
            };
            if !progressed {
                break;
            }
        }
        out
    }

    // ── Headers ──────────────────────────────────────────────────────────────

    /// Consumes one complete header block if the terminator has arrived.
    /// Returns false when more bytes are needed.
    fn parse_headers(&mut self) -> bool {
        let Some(header_len) = find_header_end(&self.buffer) else {
            return false;
        };
        let block: Vec<u8> = self.buffer.drain(..header_len).collect();
        let text = String::from_utf8_lossy(&block);

        let mut saw_start_line = false;
        for raw_line in text.split('\n') {
            let line = raw_line.trim_end_matches('\r');
            if !saw_start_line {
                // Tolerate blank lines before the start-line, e.g. the CRLF
                // that trails a previous chunked message.
                if line.is_empty() {
                    continue;
                }
                saw_start_line = true;
                self.parse_start_line(line);
            } else {
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    let value = value.trim_start_matches(|c| c == ' ' || c == '\t');
                    // lower-cased names, last value wins
                    self.headers
                        .insert(name.to_ascii_lowercase(), value.to_string());
                }
            }
        }
        if !saw_start_line {
            // a block of nothing but blank lines frames no message
            return true;
        }

        let chunked = self
            .headers
            .get("transfer-encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        self.body_read = 0;
        if chunked {
            self.phase = Phase::BodyChunked;
        } else {
            self.content_length = self
                .headers
                .get("content-length")
                .map(|cl| parse_content_length(cl))
                .unwrap_or(0);
            self.phase = Phase::BodyByLength;
        }
        true
    }

    fn parse_start_line(&mut self, line: &str) {
        if line.starts_with("HTTP/") {
            self.kind = MessageKind::Response;
            let mut parts = line.splitn(3, ' ');
            parts.next();
            if let Some(code) = parts.next() {
                self.status_code = code.parse().unwrap_or(0);
            }
            // the reason phrase, if any, is not part of the emitted shape
        } else {
            self.kind = MessageKind::Request;
            if let Some((method, rest)) = line.split_once(' ') {
                self.method = method.to_string();
                self.path = rest.split(' ').next().unwrap_or("").to_string();
            }
        }
    }

    // ── Bodies ───────────────────────────────────────────────────────────────

    /// Content-Length body: waits until the whole declared body is buffered,
    /// then stores the capped prefix, discards the excess, and emits.
    fn parse_body_by_length(&mut self, out: &mut Vec<HttpMessage>) -> bool {
        let need = self.content_length.saturating_sub(self.body_read);
        if need > 0 {
            if self.buffer.len() < need {
                return false;
            }
            let budget = self.max_body_size.saturating_sub(self.body_read);
            let add = need.min(budget);
            if add < need {
                self.body_truncated = true;
            }
            if add > 0 {
                let run: Vec<u8> = self.buffer[..add].to_vec();
                self.append_body(&run);
            }
            self.buffer.drain(..need);
            self.body_read += need;
        }
        out.push(self.emit());
        true
    }

    /// Chunked body: processes every chunk already buffered in full. A
    /// chunk-size line is only consumed together with its data and trailing
    /// CRLF, so a chunk split across feeds never loses its framing.
    fn parse_body_chunked(&mut self, out: &mut Vec<HttpMessage>) -> bool {
        loop {
            let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                return false;
            };
            let line_len = newline + 1;
            let chunk_size = parse_chunk_size(&self.buffer[..newline]);

            if chunk_size == 0 {
                // end of body; trailers are not parsed
                self.buffer.drain(..line_len);
                out.push(self.emit());
                return true;
            }
            if self.buffer.len() < line_len + chunk_size + 2 {
                return false;
            }

            let budget = self.max_body_size.saturating_sub(self.body_read);
            let add = chunk_size.min(budget);
            if add < chunk_size {
                self.body_truncated = true;
            }
            if add > 0 {
                let run: Vec<u8> = self.buffer[line_len..line_len + add].to_vec();
                self.append_body(&run);
            }
            // chunk data plus the CRLF that terminates it
            self.buffer.drain(..line_len + chunk_size + 2);
            self.body_read += chunk_size;
        }
    }

    /// Appends one run of body bytes, or tags the message binary when the
    /// run is not valid UTF-8 (the bytes are consumed either way).
    fn append_body(&mut self, run: &[u8]) {
        match std::str::from_utf8(run) {
            Ok(text) => self.body.push_str(text),
            Err(_) => self.body_encoding = "binary".to_string(),
        }
    }

    // ── Emission ─────────────────────────────────────────────────────────────

    /// Builds the completed message, stamps it, and resets per-message state.
    /// Buffered bytes after the message survive for pipelined successors.
    fn emit(&mut self) -> HttpMessage {
        let msg = HttpMessage {
            receiver: self.receiver.clone(),
            destination: self.destination.clone(),
            direction: self.kind,
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            status_code: self.status_code,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
            body_truncated: self.body_truncated,
            body_encoding: std::mem::take(&mut self.body_encoding),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        };
        self.status_code = 0;
        self.body_truncated = false;
        self.body_read = 0;
        self.content_length = 0;
        self.phase = Phase::Headers;
        msg
    }
}

/// Finds the end of the header block: the byte index just past the first
/// `CRLFCRLF` (or bare `LFLF`) terminator.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i] == b'\r'
            && i + 3 < buf.len()
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some(i + 4);
        }
        if buf[i] == b'\n' && i + 1 < buf.len() && buf[i + 1] == b'\n' {
            return Some(i + 2);
        }
    }
    None
}

/// Parses the leading decimal digit run of a content-length value; trailing
/// garbage is ignored and a value with no leading digits reads as zero.
fn parse_content_length(value: &str) -> usize {
    let value = value.trim();
    let digits_len = value
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(value.len());
    if digits_len == 0 {
        return 0;
    }
    value[..digits_len].parse().unwrap_or(0)
}

/// Parses the hexadecimal prefix of a chunk-size line; any extension after
/// `;` is ignored, and a line with no hex digits reads as zero.
fn parse_chunk_size(line: &[u8]) -> usize {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };
    let hex_len = line
        .iter()
        .position(|b| !b.is_ascii_hexdigit())
        .unwrap_or(line.len());
    if hex_len == 0 {
        return 0;
    }
    std::str::from_utf8(&line[..hex_len])
        .ok()
        .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}
