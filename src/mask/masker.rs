//! Payload masker (spec §4.6): applies a [`super::KeepRuleSet`] to every
//! TCP packet, zeroing payload bytes outside every keep-range and
//! recomputing the TCP checksum. Non-TCP packets pass through unchanged.

use std::path::Path;

use crate::capture::{CaptureReader, CaptureWriter};
use crate::error::{MaskerError, StageError};
use crate::model::LinkType;
use crate::net;
use crate::net::checksum;

use super::tcp_stream::{Direction, StreamKey};
use super::KeepRuleSet;

/// Masker-half stats, merged into the orchestrator's combined
/// [`crate::model::StageStats`] by [`super::MaskingStage`].
pub struct MaskerStats {
    pub packets_processed: u64,
    pub packets_modified: u64,
    pub rule_count: u64,
    pub keep_bytes: u64,
    pub masked_bytes: u64,
    pub stream_count: u64,
}

pub struct PayloadMasker {
    rules: KeepRuleSet,
}

impl PayloadMasker {
    pub fn new(rules: KeepRuleSet) -> Self {
        PayloadMasker { rules }
    }

    pub fn mask_file(&mut self, input: &Path, output: &Path) -> Result<MaskerStats, StageError> {
        let mut reader = CaptureReader::open(input)?;
        let format = reader.format();
        let global_link_type = reader.global_link_type().unwrap_or(LinkType::ETHERNET);
        let mut writer = CaptureWriter::create(format, global_link_type)?;

        let mut processed = 0u64;
        let mut modified = 0u64;
        let mut masked_bytes = 0u64;
        let mut kept_bytes = 0u64;

        while let Some(record) = reader.next_packet() {
            let mut record = record?;
            processed += 1;

            if let Some((zeroed, kept)) = self.mask_packet(&mut record.data)? {
                masked_bytes += zeroed;
                kept_bytes += kept;
                if zeroed > 0 {
                    modified += 1;
                }
            }

            writer.write_packet(&record)?;
        }

        writer.persist(output)?;

        Ok(MaskerStats {
            packets_processed: processed,
            packets_modified: modified,
            rule_count: self.rules.rule_count(),
            keep_bytes: kept_bytes,
            masked_bytes,
            stream_count: self.rules.stream_count(),
        })
    }

    /// Mask one packet's TCP payload in place. Returns
    /// `Some((bytes_zeroed, bytes_kept))` for TCP packets with a
    /// payload, `None` for everything else (left untouched).
    fn mask_packet(&self, data: &mut [u8]) -> Result<Option<(u64, u64)>, StageError> {
        let Some(transport) = net::locate_transport(data) else {
            return Ok(None);
        };
        if transport.proto != net::PROTO_TCP {
            return Ok(None);
        }
        if data.len() < transport.offset + 20 {
            return Ok(None);
        }

        let data_offset = ((data[transport.offset + 12] >> 4) as usize) * 4;
        if data_offset < 20 || data.len() < transport.offset + data_offset {
            return Ok(None);
        }
        let payload_offset = transport.offset + data_offset;
        if data.len() <= payload_offset {
            return Ok(None);
        }

        let seq = u32::from_be_bytes([
            data[transport.offset + 4],
            data[transport.offset + 5],
            data[transport.offset + 6],
            data[transport.offset + 7],
        ]);

        let ip = transport.ip;
        let src_port = u16::from_be_bytes([data[transport.offset], data[transport.offset + 1]]);
        let dst_port =
            u16::from_be_bytes([data[transport.offset + 2], data[transport.offset + 3]]);
        let src_ip = ip_from_bytes(ip.src_bytes(data));
        let dst_ip = ip_from_bytes(ip.dst_bytes(data));
        let (stream_key, direction) =
            StreamKey::from_endpoints((src_ip, src_port), (dst_ip, dst_port));

        if transport.segment_end <= payload_offset {
            return Ok(None);
        }
        let payload_len = transport.segment_end - payload_offset;
        let rules = self.rules.rules_for(&stream_key, direction);

        let mut zeroed = 0u64;
        let mut kept = 0u64;
        for i in 0..payload_len {
            let byte_seq = seq.wrapping_add(i as u32);
            let keep = rules
                .map(|rs| rs.iter().any(|r| r.rule.contains(byte_seq)))
                .unwrap_or(false);
            if keep {
                kept += 1;
            } else {
                data[payload_offset + i] = 0;
                zeroed += 1;
            }
        }

        recompute_tcp_checksum(data, &transport).map_err(StageError::Masker)?;
        Ok(Some((zeroed, kept)))
    }
}

fn recompute_tcp_checksum(
    data: &mut [u8],
    transport: &net::TransportLocation,
) -> Result<(), MaskerError> {
    let checksum_offset = transport.offset + 16;
    if data.len() < checksum_offset + 2 {
        return Err(MaskerError::Checksum("tcp header truncated".into()));
    }
    data[checksum_offset] = 0;
    data[checksum_offset + 1] = 0;

    let ip = transport.ip;
    let segment_end = transport.segment_end.max(checksum_offset + 2).min(data.len());
    let segment = &data[transport.offset..segment_end];
    let checksum = match ip.version {
        4 => {
            let src = ipv4_from_bytes(ip.src_bytes(data));
            let dst = ipv4_from_bytes(ip.dst_bytes(data));
            checksum::tcp_checksum_ipv4(src, dst, segment)
        }
        6 => {
            let src = ipv6_from_bytes(ip.src_bytes(data));
            let dst = ipv6_from_bytes(ip.dst_bytes(data));
            checksum::tcp_checksum_ipv6(src, dst, segment)
        }
        _ => return Err(MaskerError::Checksum("unknown ip version".into())),
    };
    data[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

fn ip_from_bytes(bytes: &[u8]) -> std::net::IpAddr {
    match bytes.len() {
        4 => std::net::IpAddr::V4(ipv4_from_bytes(bytes)),
        16 => std::net::IpAddr::V6(ipv6_from_bytes(bytes)),
        _ => unreachable!("ip address is always 4 or 16 bytes"),
    }
}

fn ipv4_from_bytes(bytes: &[u8]) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn ipv6_from_bytes(bytes: &[u8]) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    std::net::Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{KeepRuleInput, KeepRuleSet};

    fn build_ipv4_tcp_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 14];
        pkt[12..14].copy_from_slice(&net::ETHERTYPE_IPV4.to_be_bytes());

        let total_len = (20 + 20 + payload.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = net::PROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[12] = 0x50;

        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&tcp);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn no_rules_masks_entire_payload() {
        let mut pkt = build_ipv4_tcp_packet(1000, b"secretdata");
        let masker = PayloadMasker::new(KeepRuleSet::new());
        let (zeroed, kept) = masker.mask_packet(&mut pkt).unwrap().unwrap();
        assert_eq!(zeroed, 10);
        assert_eq!(kept, 0);
        let payload = &pkt[14 + 20 + 20..];
        assert!(payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn keep_range_preserves_matching_bytes() {
        let mut pkt = build_ipv4_tcp_packet(1000, b"0123456789");
        let src = ("10.0.0.1".parse().unwrap(), 1234u16);
        let dst = ("10.0.0.2".parse().unwrap(), 443u16);
        let (stream_key, direction) = StreamKey::from_endpoints(src, dst);

        let mut rules = KeepRuleSet::new();
        rules.push(KeepRuleInput {
            stream_key,
            direction,
            seq_start: 1002,
            seq_end_exclusive: 1005,
            reason_tag: "test".into(),
        });
        rules.normalize();

        let masker = PayloadMasker::new(rules);
        masker.mask_packet(&mut pkt).unwrap();
        let payload = &pkt[14 + 20 + 20..];
        let expected: Vec<u8> = vec![0, 0, b'2', b'3', b'4', 0, 0, 0, 0, 0];
        assert_eq!(payload, expected.as_slice());
    }
}
