//! TLS-aware marker (spec §4.5): reassembles each TCP stream direction
//! and parses the reassembled byte stream as a sequence of TLS records,
//! emitting keep-ranges in TCP sequence space.
//!
//! The `Marker` trait exists so a future non-TLS marker can plug into
//! the same orchestrator (spec §1: "the marker interface is designed to
//! accept new protocol markers but only TLS is specified here").

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Instant;

use crate::capture::CaptureReader;
use crate::config::TlsMaskConfig;
use crate::error::StageError;
use crate::model::StageStats;
use crate::net;

use super::tcp_stream::{Direction, ReassemblyState, StreamKey};
use super::{KeepRuleInput, KeepRuleSet};

const MAX_TLS_RECORD_LEN: usize = (1 << 14) + 2304;

pub trait Marker {
    fn mark_file(&mut self, input: &Path) -> Result<(KeepRuleSet, StageStats), StageError>;
}

/// Per-direction parse state: bytes delivered contiguously by the
/// reassembler but not yet consumed into a complete TLS record, plus the
/// sequence number of the first byte in that buffer.
struct DirectionState {
    reassembly: ReassemblyState,
    buffer: Vec<u8>,
    buffer_start_seq: Option<u32>,
    abandoned: bool,
}

impl DirectionState {
    fn new(max_bytes: usize) -> Self {
        DirectionState {
            reassembly: ReassemblyState::new(max_bytes),
            buffer: Vec::new(),
            buffer_start_seq: None,
            abandoned: false,
        }
    }
}

pub struct TlsMarker {
    tls: TlsMaskConfig,
    max_out_of_order_bytes: usize,
}

impl TlsMarker {
    pub fn new(tls: TlsMaskConfig, max_out_of_order_bytes: usize) -> Self {
        TlsMarker {
            tls,
            max_out_of_order_bytes,
        }
    }

    fn preserve_fully(&self, content_type: u8) -> bool {
        match content_type {
            20 => self.tls.preserve_change_cipher_spec,
            21 => self.tls.preserve_alert,
            22 => self.tls.preserve_handshake,
            23 => self.tls.preserve_application_data,
            24 => self.tls.preserve_heartbeat,
            _ => false,
        }
    }
}

impl Marker for TlsMarker {
    fn mark_file(&mut self, input: &Path) -> Result<(KeepRuleSet, StageStats), StageError> {
        let start = Instant::now();
        let mut reader = CaptureReader::open(input)?;

        let mut directions: HashMap<(StreamKey, Direction), DirectionState> = HashMap::new();
        let mut rule_set = KeepRuleSet::new();

        let mut tls_records_seen = 0u64;
        let mut tls23_records = 0u64;
        let mut tls_handshake_records = 0u64;
        let mut streams_abandoned = 0u64;
        let mut processed = 0u64;

        while let Some(record) = reader.next_packet() {
            let record = record?;
            processed += 1;

            let Some(transport) = net::locate_transport(&record.data) else {
                continue;
            };
            if transport.proto != net::PROTO_TCP {
                continue;
            }
            let Some((src, dst, seq, payload_offset)) =
                parse_tcp_endpoints(&record.data, &transport)
            else {
                continue;
            };
            if transport.segment_end <= payload_offset {
                continue;
            }
            let payload = &record.data[payload_offset..transport.segment_end];
            if payload.is_empty() {
                continue;
            }

            let (stream_key, direction) = StreamKey::from_endpoints(src, dst);
            let state = directions
                .entry((stream_key, direction))
                .or_insert_with(|| DirectionState::new(self.max_out_of_order_bytes));

            if state.abandoned {
                continue;
            }

            let Some((contig_start, mut contig_bytes)) = state.reassembly.feed(seq, payload)
            else {
                if state.reassembly.abandoned {
                    state.abandoned = true;
                    streams_abandoned += 1;
                }
                continue;
            };

            if state.buffer.is_empty() {
                state.buffer_start_seq = Some(contig_start);
            }
            state.buffer.append(&mut contig_bytes);

            loop {
                if state.buffer.len() < 5 {
                    break;
                }
                let content_type = state.buffer[0];
                let length = u16::from_be_bytes([state.buffer[3], state.buffer[4]]) as usize;

                if length > MAX_TLS_RECORD_LEN || !(20..=24).contains(&content_type) {
                    state.abandoned = true;
                    streams_abandoned += 1;
                    break;
                }

                let total = 5 + length;
                if state.buffer.len() < total {
                    break;
                }

                tls_records_seen += 1;
                if content_type == 23 {
                    tls23_records += 1;
                }
                if content_type == 22 {
                    tls_handshake_records += 1;
                }

                let record_start_seq = state.buffer_start_seq.unwrap();
                let keep_end = if self.preserve_fully(content_type) {
                    record_start_seq.wrapping_add(total as u32)
                } else {
                    record_start_seq.wrapping_add(5)
                };

                rule_set.push(KeepRuleInput {
                    stream_key,
                    direction,
                    seq_start: record_start_seq,
                    seq_end_exclusive: keep_end,
                    reason_tag: reason_tag(content_type, self.preserve_fully(content_type)),
                });

                state.buffer.drain(0..total);
                state.buffer_start_seq = Some(record_start_seq.wrapping_add(total as u32));
            }

            if state.abandoned {
                state.buffer.clear();
            }
        }

        rule_set.normalize();

        let streams_parsed = directions.len() as u64;
        let stats = StageStats::new("mask.marker")
            .with_extra("tls_records_seen", tls_records_seen)
            .with_extra("tls23_records", tls23_records)
            .with_extra("tls_handshake_records", tls_handshake_records)
            .with_extra("streams_parsed", streams_parsed)
            .with_extra("streams_abandoned", streams_abandoned);

        Ok((
            rule_set,
            StageStats {
                packets_processed: processed,
                packets_modified: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                ..stats
            },
        ))
    }
}

fn reason_tag(content_type: u8, fully_preserved: bool) -> String {
    let name = match content_type {
        20 => "change_cipher_spec",
        21 => "alert",
        22 => "handshake",
        23 => "application_data",
        24 => "heartbeat",
        _ => "unknown",
    };
    if fully_preserved {
        format!("tls-{name}")
    } else {
        format!("tls-{name}-header")
    }
}

/// Pull `(src, dst, seq, payload_offset)` out of a located TCP transport
/// header.
fn parse_tcp_endpoints(
    data: &[u8],
    transport: &net::TransportLocation,
) -> Option<(
    (IpAddr, u16),
    (IpAddr, u16),
    u32,
    usize,
)> {
    let offset = transport.offset;
    if data.len() < offset + 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let dst_port = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
    let seq = u32::from_be_bytes([
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ]);
    let data_offset = ((data[offset + 12] >> 4) as usize) * 4;
    if data_offset < 20 || data.len() < offset + data_offset {
        return None;
    }

    let ip = transport.ip;
    let src_ip = ip_from_bytes(ip.src_bytes(data));
    let dst_ip = ip_from_bytes(ip.dst_bytes(data));

    Some((
        (src_ip, src_port),
        (dst_ip, dst_port),
        seq,
        offset + data_offset,
    ))
}

fn ip_from_bytes(bytes: &[u8]) -> IpAddr {
    match bytes.len() {
        4 => IpAddr::V4(std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            IpAddr::V6(std::net::Ipv6Addr::from(octets))
        }
        _ => unreachable!("ip address is always 4 or 16 bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::tcp_stream::{seq_le, seq_lt};

    fn tls_record(content_type: u8, payload_len: usize) -> Vec<u8> {
        let mut record = vec![content_type, 0x03, 0x03];
        record.extend_from_slice(&(payload_len as u16).to_be_bytes());
        record.extend(std::iter::repeat(0xAB).take(payload_len));
        record
    }

    #[test]
    fn default_policy_preserves_header_only_for_application_data() {
        let marker = TlsMarker::new(TlsMaskConfig::default(), 16 * 1024 * 1024);
        assert!(!marker.preserve_fully(23));
        assert!(marker.preserve_fully(22));
        assert!(marker.preserve_fully(21));
        assert!(marker.preserve_fully(20));
        assert!(marker.preserve_fully(24));
    }

    #[test]
    fn reassembled_record_buffer_has_header_plus_body() {
        let mut state = DirectionState::new(16 * 1024 * 1024);
        let record = tls_record(23, 40);

        let (start, bytes) = state.reassembly.feed(1000, &record).unwrap();
        state.buffer_start_seq = Some(start);
        state.buffer = bytes;

        assert_eq!(state.buffer.len(), 45);
        assert_eq!(start, 1000);
    }

    #[test]
    fn seq_helpers_agree_with_plain_ordering_in_range() {
        assert!(seq_lt(10, 20));
        assert!(seq_le(10, 10));
    }
}
