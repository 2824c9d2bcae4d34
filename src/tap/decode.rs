//! Link-layer frame decoding.
//!
//! Accepts plain Ethernet II / IPv4 / TCP frames and nothing else: no VLAN
//! tags, no IPv6, no IP fragments reassembled here. Rejection is a return
//! value, never a panic, so a hostile frame cannot take the capture loop
//! down.

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};

use crate::tap::types::TcpSegment;

/// Ethernet II + minimal IPv4 + minimal TCP headers.
const MIN_FRAME_LEN: usize = 14 + 20 + 20;

/// Decodes a raw link-layer frame into a [`TcpSegment`], or returns `None`
/// when any acceptance rule fails (short frame, non-IPv4 EtherType, non-TCP
/// protocol, header lengths exceeding the frame).
pub fn decode_segment(data: &[u8]) -> Option<TcpSegment> {
    if data.len() < MIN_FRAME_LEN {
        return None;
    }

    let sliced = SlicedPacket::from_ethernet(data).ok()?;
    if sliced.vlan.is_some() {
        return None;
    }

    let ip = match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => header,
        _ => return None,
    };
    let tcp = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    Some(TcpSegment {
        src_ip: ip.source_addr().to_string(),
        src_port: tcp.source_port(),
        dst_ip: ip.destination_addr().to_string(),
        dst_port: tcp.destination_port(),
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        syn: tcp.syn(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: sliced.payload.to_vec(),
    })
}
