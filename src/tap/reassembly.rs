//! Per-connection TCP stream reassembly.
//!
//! Turns decoded segments into two ordered byte streams per connection, one
//! for each direction, and enforces the connection cap and idle timeout.
//! Within a direction, emitted chunks are in strict sequence order; nothing
//! is guaranteed between directions or between connections.
//!
//! Sequence numbers live in a 32-bit modular space, so every comparison
//! here goes through a signed-delta helper rather than `<`/`>` on the raw
//! values.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Instant;

use crate::logger::{Event, SharedLogger};
use crate::tap::config::CaptureConfig;
use crate::tap::types::{format_endpoint, Direction, StreamChunk, TcpSegment};

/// Canonical, direction-independent connection key: both endpoints rendered
/// as `ip:port`, sorted lexicographically, joined with `-`.
pub fn connection_key(src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> String {
    let a = format_endpoint(src_ip, src_port);
    let b = format_endpoint(dst_ip, dst_port);
    if a < b {
        format!("{}-{}", a, b)
    } else {
        format!("{}-{}", b, a)
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}

/// One direction of a connection.
///
/// Invariants: every pending segment starts strictly after `next_seq`, and
/// pending segments never overlap (the older one wins, the newcomer is
/// trimmed). Delivered bytes are never re-delivered.
#[derive(Debug, Default)]
struct StreamState {
    /// Next sequence number expected to be delivered.
    next_seq: u32,
    /// Whether `next_seq` has been anchored by a SYN or a first data segment.
    initial_seq_set: bool,
    /// Out-of-order segments keyed by their starting sequence.
    pending: BTreeMap<u32, Vec<u8>>,
}

struct ConnectionState {
    receiver_ip: String,
    receiver_port: u16,
    dest_ip: String,
    dest_port: u16,
    client_to_server: StreamState,
    server_to_client: StreamState,
    created_at_ms: u64,
    /// Creation order, breaking ties when several connections share a
    /// millisecond; eviction by age must be deterministic.
    created_order: u64,
    last_activity_ms: u64,
}

/// Connection metadata stamped onto every chunk of one push.
struct ChunkTemplate<'a> {
    key: &'a str,
    receiver_ip: &'a str,
    receiver_port: u16,
    dest_ip: &'a str,
    dest_port: u16,
    direction: Direction,
}

impl ChunkTemplate<'_> {
    fn chunk(&self, data: Vec<u8>) -> StreamChunk {
        StreamChunk {
            connection_key: self.key.to_string(),
            receiver_ip: self.receiver_ip.to_string(),
            receiver_port: self.receiver_port,
            dest_ip: self.dest_ip.to_string(),
            dest_port: self.dest_port,
            direction: self.direction,
            data,
        }
    }
}

/// Reassembles TCP segments into ordered per-direction streams and owns the
/// connection table. Accessed only from the capture worker.
pub struct Reassembler {
    capture_ports: Vec<u16>,
    max_connections: usize,
    idle_timeout_ms: u64,
    logger: SharedLogger,
    connections: HashMap<String, ConnectionState>,
    /// Keys evicted since the last `take_evicted` call, so the caller can
    /// drop any per-connection state of its own (HTTP parsers).
    evicted: Vec<String>,
    next_order: u64,
    epoch: Instant,
}

impl Reassembler {
    pub fn new(config: &CaptureConfig, logger: SharedLogger) -> Self {
        Self {
            capture_ports: config.ports.clone(),
            max_connections: config.max_concurrent_connections,
            idle_timeout_ms: config.connection_idle_timeout_ms,
            logger,
            connections: HashMap::new(),
            evicted: Vec::new(),
            next_order: 0,
            epoch: Instant::now(),
        }
    }

    /// Milliseconds on the reassembler's monotonic clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connection keys evicted since the last call.
    pub fn take_evicted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.evicted)
    }

    /// Processes one decoded segment, returning the ordered chunks it made
    /// deliverable (the segment itself and any pending segments it
    /// unblocked), in sequence order.
    pub fn push_segment(&mut self, seg: &TcpSegment) -> Vec<StreamChunk> {
        let now = self.now_ms();
        let key = connection_key(&seg.src_ip, seg.src_port, &seg.dst_ip, seg.dst_port);
        let receiver_is_src = self.capture_ports.contains(&seg.src_port);

        let order = &mut self.next_order;
        let conn = self.connections.entry(key.clone()).or_insert_with(|| {
            let (receiver_ip, receiver_port, dest_ip, dest_port) = if receiver_is_src {
                (seg.src_ip.clone(), seg.src_port, seg.dst_ip.clone(), seg.dst_port)
            } else {
                (seg.dst_ip.clone(), seg.dst_port, seg.src_ip.clone(), seg.src_port)
            };
            let created_order = *order;
            *order += 1;
            ConnectionState {
                receiver_ip,
                receiver_port,
                dest_ip,
                dest_port,
                client_to_server: StreamState::default(),
                server_to_client: StreamState::default(),
                created_at_ms: now,
                created_order,
                last_activity_ms: now,
            }
        });
        conn.last_activity_ms = now;

        // Traffic from the peer toward the filtered port is the request
        // direction. The receiver/dest assignment is fixed at first sight,
        // so this holds even when both ports are in the capture set.
        let from_client = seg.src_ip == conn.dest_ip && seg.src_port == conn.dest_port;
        let direction = if from_client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        let mut chunks = Vec::new();
        {
            let ConnectionState {
                ref receiver_ip,
                receiver_port,
                ref dest_ip,
                dest_port,
                ref mut client_to_server,
                ref mut server_to_client,
                ..
            } = *conn;
            let stream = if from_client {
                client_to_server
            } else {
                server_to_client
            };
            let tmpl = ChunkTemplate {
                key: &key,
                receiver_ip,
                receiver_port,
                dest_ip,
                dest_port,
                direction,
            };

            if seg.payload.is_empty() {
                // A SYN anchors the stream one past its sequence number.
                if seg.syn && !stream.initial_seq_set {
                    stream.initial_seq_set = true;
                    stream.next_seq = seg.seq.wrapping_add(1);
                }
            } else {
                if !stream.initial_seq_set {
                    stream.initial_seq_set = true;
                    stream.next_seq = seg.seq;
                }
                Self::deliver(stream, &tmpl, seg.seq, &seg.payload, &self.logger, &mut chunks);
            }
        }

        self.ensure_connection_cap();
        chunks
    }

    /// Applies the delivery discipline for one data segment.
    fn deliver(
        stream: &mut StreamState,
        tmpl: &ChunkTemplate<'_>,
        seq: u32,
        data: &[u8],
        logger: &SharedLogger,
        out: &mut Vec<StreamChunk>,
    ) {
        let mut gap_logged = false;
        let delta = seq.wrapping_sub(stream.next_seq) as i32;

        if delta == 0 {
            stream.next_seq = seq_add(seq, data.len());
            out.push(tmpl.chunk(data.to_vec()));
            Self::drain_pending(stream, tmpl, logger, out, &mut gap_logged);
        } else if delta > 0 {
            Self::buffer_pending(stream, seq, data);
            logger.log(&Event::ReassemblyGap {
                connection: tmpl.key,
                direction: tmpl.direction,
            });
        } else {
            // Starts before next_seq: retransmission or partial overlap.
            // Deliver only the suffix that has not been seen yet.
            let end = seq_add(seq, data.len());
            if seq_lt(stream.next_seq, end) {
                let skip = stream.next_seq.wrapping_sub(seq) as usize;
                stream.next_seq = end;
                out.push(tmpl.chunk(data[skip..].to_vec()));
                Self::drain_pending(stream, tmpl, logger, out, &mut gap_logged);
            }
        }
    }

    /// Delivers every pending segment that has caught up with `next_seq`.
    fn drain_pending(
        stream: &mut StreamState,
        tmpl: &ChunkTemplate<'_>,
        logger: &SharedLogger,
        out: &mut Vec<StreamChunk>,
        gap_logged: &mut bool,
    ) {
        loop {
            let Some((&pseq, _)) = stream.pending.first_key_value() else {
                break;
            };
            let delta = pseq.wrapping_sub(stream.next_seq) as i32;
            if delta == 0 {
                let data = stream.pending.remove(&pseq).unwrap();
                stream.next_seq = seq_add(pseq, data.len());
                out.push(tmpl.chunk(data));
            } else if delta < 0 {
                // A delivered overlap caught up past this one; salvage any
                // unseen suffix and drop the rest.
                let data = stream.pending.remove(&pseq).unwrap();
                let end = seq_add(pseq, data.len());
                if seq_lt(stream.next_seq, end) {
                    let skip = stream.next_seq.wrapping_sub(pseq) as usize;
                    stream.next_seq = end;
                    out.push(tmpl.chunk(data[skip..].to_vec()));
                }
            } else {
                if !*gap_logged {
                    logger.log(&Event::ReassemblyGap {
                        connection: tmpl.key,
                        direction: tmpl.direction,
                    });
                    *gap_logged = true;
                }
                break;
            }
        }
    }

    /// Buffers an out-of-order segment, trimming it against existing pending
    /// segments so the pending set never holds overlapping byte ranges.
    fn buffer_pending(stream: &mut StreamState, seq: u32, data: &[u8]) {
        let mut start = seq;
        let mut slice = data;

        // Trim the head against the nearest earlier (or equal) neighbour.
        if let Some((&pseq, pdata)) = stream.pending.range(..=start).next_back() {
            let pend = seq_add(pseq, pdata.len());
            let overlap = pend.wrapping_sub(start) as i32;
            if overlap > 0 {
                if overlap as usize >= slice.len() {
                    return;
                }
                slice = &slice[overlap as usize..];
                start = pend;
            }
        }

        // Trim the tail against the next neighbour.
        if let Some((&nseq, _)) = stream
            .pending
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
        {
            let room = nseq.wrapping_sub(start) as i32;
            if room > 0 && (room as usize) < slice.len() {
                slice = &slice[..room as usize];
            }
        }

        if !slice.is_empty() {
            stream.pending.insert(start, slice.to_vec());
        }
    }

    /// Evicts every connection idle for at least the configured timeout,
    /// then re-enforces the connection cap.
    pub fn evict_idle(&mut self, now_ms: u64) {
        let timeout = self.idle_timeout_ms;
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| now_ms.saturating_sub(conn.last_activity_ms) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            self.remove_connection(key);
        }
        self.ensure_connection_cap();
    }

    /// Evicts oldest-created connections until the count is within the cap.
    fn ensure_connection_cap(&mut self) {
        while self.connections.len() > self.max_connections {
            let oldest = self
                .connections
                .iter()
                .min_by_key(|(_, conn)| (conn.created_at_ms, conn.created_order))
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => self.remove_connection(&key),
                None => break,
            }
        }
    }

    fn remove_connection(&mut self, key: &str) {
        if self.connections.remove(key).is_some() {
            self.logger.log(&Event::Eviction { connection: key });
            self.evicted.push(key.to_string());
        }
    }
}
