//! End-to-end pipeline tests: synthetic Ethernet frames pushed through the
//! decoder, the reassembler, and the HTTP stream parsers, exactly as the
//! capture worker wires them. No capture device is involved.

use std::collections::HashMap;
use std::sync::Arc;

use etherparse::PacketBuilder;

use httptap::logger::Logger;
use httptap::tap::config::CaptureConfig;
use httptap::tap::decode::decode_segment;
use httptap::tap::http::HttpStreamParser;
use httptap::tap::reassembly::Reassembler;
use httptap::tap::types::{Direction, Endpoint, HttpMessage, MessageKind};

const CLIENT: [u8; 4] = [10, 0, 0, 1];
const SERVER: [u8; 4] = [10, 0, 0, 2];
const CLIENT_PORT: u16 = 40_000;
const SERVER_PORT: u16 = 8080;

fn frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 65_535);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

fn request_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    frame(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT, seq, payload)
}

fn response_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    frame(SERVER, SERVER_PORT, CLIENT, CLIENT_PORT, seq, payload)
}

/// The worker-side wiring: decode each frame, reassemble, feed the parser
/// for the chunk's (connection, direction), collect completed messages.
struct TestPipeline {
    reassembler: Reassembler,
    parsers: HashMap<(String, Direction), HttpStreamParser>,
    max_body_size: usize,
    messages: Vec<HttpMessage>,
}

impl TestPipeline {
    fn new(config: &CaptureConfig) -> Self {
        let logger = Arc::new(Logger::new(None).unwrap());
        Self {
            reassembler: Reassembler::new(config, logger),
            parsers: HashMap::new(),
            max_body_size: config.max_body_size,
            messages: Vec::new(),
        }
    }

    fn push_frame(&mut self, raw: &[u8]) {
        let seg = decode_segment(raw).expect("test frame should decode");
        for chunk in self.reassembler.push_segment(&seg) {
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
            self.messages.extend(parser.feed(&chunk.data));
        }
    }
}

fn config() -> CaptureConfig {
    CaptureConfig {
        ports: vec![SERVER_PORT],
        ..CaptureConfig::default()
    }
}

// Scenario 1: a Content-Length request in one segment
#[test]
fn content_length_request_end_to_end() {
    let mut pipeline = TestPipeline::new(&config());
    pipeline.push_frame(&request_frame(
        1000,
        b"GET /hi HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
    ));

    assert_eq!(pipeline.messages.len(), 1);
    let msg = &pipeline.messages[0];
    assert_eq!(msg.direction, MessageKind::Request);
    assert_eq!(msg.method, "GET");
    assert_eq!(msg.path, "/hi");
    assert_eq!(msg.headers.get("host").map(String::as_str), Some("x"));
    assert_eq!(msg.body, "hello");
    assert_eq!(msg.receiver.ip, "10.0.0.2");
    assert_eq!(msg.receiver.port, SERVER_PORT);
    assert_eq!(msg.destination.ip, "10.0.0.1");
    assert_eq!(msg.destination.port, CLIENT_PORT);
}

// Scenario 2: a chunked response
#[test]
fn chunked_response_end_to_end() {
    let mut pipeline = TestPipeline::new(&config());
    pipeline.push_frame(&response_frame(
        2000,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    ));

    assert_eq!(pipeline.messages.len(), 1);
    let msg = &pipeline.messages[0];
    assert_eq!(msg.direction, MessageKind::Response);
    assert_eq!(msg.status_code, 200);
    assert_eq!(
        msg.headers.get("transfer-encoding").map(String::as_str),
        Some("chunked")
    );
    assert_eq!(msg.body, "hello");
}

// Scenario 3: the request split in two segments delivered out of order
#[test]
fn out_of_order_segments_end_to_end() {
    let wire = b"GET /ooo HTTP/1.1\r\nHost: x\r\nContent-Length: 6\r\n\r\nabcdef";
    let (head, tail) = wire.split_at(30);

    let mut pipeline = TestPipeline::new(&config());
    // anchor the client stream so the later half is recognizably future
    let syn = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(CLIENT, SERVER, 64)
        .tcp(CLIENT_PORT, SERVER_PORT, 999, 65_535)
        .syn();
    let mut syn_frame = Vec::with_capacity(syn.size(0));
    syn.write(&mut syn_frame, &[]).unwrap();
    pipeline.push_frame(&syn_frame);

    pipeline.push_frame(&request_frame(1000 + head.len() as u32, tail));
    assert!(pipeline.messages.is_empty());
    pipeline.push_frame(&request_frame(1000, head));

    assert_eq!(pipeline.messages.len(), 1);
    let msg = &pipeline.messages[0];
    assert_eq!(msg.path, "/ooo");
    assert_eq!(msg.body, "abcdef");
}

// Scenario 4: body truncation, then a clean pipelined successor
#[test]
fn truncation_end_to_end() {
    let mut cfg = config();
    cfg.max_body_size = 4;
    let mut pipeline = TestPipeline::new(&cfg);

    let first: &[u8] = b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
    pipeline.push_frame(&request_frame(1000, first));
    pipeline.push_frame(&request_frame(
        1000 + first.len() as u32,
        b"GET /next HTTP/1.1\r\nHost: x\r\n\r\n",
    ));

    assert_eq!(pipeline.messages.len(), 2);
    assert_eq!(pipeline.messages[0].body, "0123");
    assert!(pipeline.messages[0].body_truncated);
    assert_eq!(pipeline.messages[1].path, "/next");
    assert!(!pipeline.messages[1].body_truncated);
}

// Scenario 5: a binary body is tagged instead of stored as text
#[test]
fn binary_body_end_to_end() {
    let mut pipeline = TestPipeline::new(&config());
    let mut wire = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n".to_vec();
    wire.extend_from_slice(&[0xff, 0xfe, 0xfd]);
    pipeline.push_frame(&response_frame(2000, &wire));

    assert_eq!(pipeline.messages.len(), 1);
    assert_eq!(pipeline.messages[0].body_encoding, "binary");
    assert!(pipeline.messages[0].body.is_empty());
}

// Scenario 6: the connection cap evicts exactly one, oldest-created first
#[test]
fn cap_eviction_end_to_end() {
    let mut cfg = config();
    cfg.max_concurrent_connections = 10;
    let mut pipeline = TestPipeline::new(&cfg);

    for i in 0..11u16 {
        pipeline.push_frame(&frame(
            [10, 0, 1, (i + 1) as u8],
            CLIENT_PORT + i,
            SERVER,
            SERVER_PORT,
            1,
            b"GET / HTTP/1.1\r\n",
        ));
    }

    assert_eq!(pipeline.reassembler.connection_count(), 10);
    let evicted = pipeline.reassembler.take_evicted();
    assert_eq!(evicted.len(), 1);
    assert!(evicted[0].contains("10.0.1.1:40000"));
}

// Both directions of one connection interleaved: request and response each
// come out once, against the same connection metadata
#[test]
fn full_exchange_end_to_end() {
    let mut pipeline = TestPipeline::new(&config());
    pipeline.push_frame(&request_frame(
        1000,
        b"POST /api HTTP/1.1\r\nHost: api\r\nContent-Length: 2\r\n\r\nok",
    ));
    pipeline.push_frame(&response_frame(
        5000,
        b"HTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\ndone",
    ));

    assert_eq!(pipeline.messages.len(), 2);
    let request = &pipeline.messages[0];
    let response = &pipeline.messages[1];
    assert_eq!(request.direction, MessageKind::Request);
    assert_eq!(request.method, "POST");
    assert_eq!(request.body, "ok");
    assert_eq!(response.direction, MessageKind::Response);
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body, "done");
    // both sides agree on who the receiver is
    assert_eq!(request.receiver, response.receiver);
    assert_eq!(request.destination, response.destination);
}
