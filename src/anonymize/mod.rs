//! Prefix-preserving IP anonymization (spec §4.3): rewrites every IPv4
//! and IPv6 address in every packet (including nested IP-in-IP headers)
//! through the directory-scoped [`IpMap`], recomputing every dependent
//! checksum.

pub mod ipmap;

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::capture::{CaptureReader, CaptureWriter};
use crate::error::{AnonymizeError, StageError};
use crate::model::StageStats;
use crate::net;
use crate::net::checksum;

pub use ipmap::IpMap;

pub struct AnonymizeStage {
    map: Arc<Mutex<IpMap>>,
}

impl AnonymizeStage {
    pub fn new(map: Arc<Mutex<IpMap>>) -> Self {
        AnonymizeStage { map }
    }

    pub fn name(&self) -> &'static str {
        "anonymize"
    }

    pub fn process_file(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        let start = Instant::now();
        let mut reader = CaptureReader::open(input)?;
        let format = reader.format();
        let global_link_type = reader.global_link_type().unwrap_or(crate::model::LinkType::ETHERNET);
        let mut writer = CaptureWriter::create(format, global_link_type)?;

        let mut processed = 0u64;
        let mut modified = 0u64;
        let mut ipv4_mapped = 0u64;
        let mut ipv6_mapped = 0u64;

        while let Some(record) = reader.next_packet() {
            let mut record = record?;
            processed += 1;

            let mut changed = false;
            {
                let mut map = self.map.lock().expect("ip map mutex poisoned");
                let (v4, v6, touched) =
                    rewrite_packet(&mut record.data, &mut map).map_err(StageError::Anonymize)?;
                ipv4_mapped += v4;
                ipv6_mapped += v6;
                changed = touched;
            }
            if changed {
                modified += 1;
            }

            writer.write_packet(&record)?;
        }

        writer.persist(output)?;

        let stats = StageStats::new(self.name())
            .with_extra("ipv4_addresses_mapped", ipv4_mapped)
            .with_extra("ipv6_addresses_mapped", ipv6_mapped)
            .with_extra("packets_rewritten", modified);

        Ok(StageStats {
            packets_processed: processed,
            packets_modified: modified,
            duration_ms: start.elapsed().as_millis() as u64,
            ..stats
        })
    }
}

/// Rewrite every IP header's source/destination address in `data`
/// through `map`, recomputing all dependent checksums. Returns
/// `(ipv4_addresses_mapped, ipv6_addresses_mapped, packet_changed)`.
fn rewrite_packet(data: &mut [u8], map: &mut IpMap) -> Result<(u64, u64, bool), AnonymizeError> {
    let headers = net::locate_all_ip_headers(data);
    if headers.is_empty() {
        return Ok((0, 0, false));
    }

    let mut ipv4_count = 0u64;
    let mut ipv6_count = 0u64;
    let mut changed = false;

    for header in &headers {
        match header.version {
            4 => {
                let src = read_ipv4(data, header.src_offset);
                let dst = read_ipv4(data, header.dst_offset);
                let new_src = map.get_or_insert_v4(src);
                let new_dst = map.get_or_insert_v4(dst);
                if new_src != src || new_dst != dst {
                    changed = true;
                }
                write_ipv4(data, header.src_offset, new_src);
                write_ipv4(data, header.dst_offset, new_dst);
                ipv4_count += 2;

                let header_bytes = &data[header.offset..header.offset + header.header_len];
                let checksum = checksum::ipv4_header_checksum(header_bytes);
                data[header.offset + 10..header.offset + 12].copy_from_slice(&checksum.to_be_bytes());
            }
            6 => {
                let src = read_ipv6(data, header.src_offset);
                let dst = read_ipv6(data, header.dst_offset);
                let new_src = map.get_or_insert_v6(src);
                let new_dst = map.get_or_insert_v6(dst);
                if new_src != src || new_dst != dst {
                    changed = true;
                }
                write_ipv6(data, header.src_offset, new_src);
                write_ipv6(data, header.dst_offset, new_dst);
                ipv6_count += 2;
            }
            _ => unreachable!("locate_all_ip_headers only yields v4/v6 headers"),
        }
    }

    // Recompute the transport checksum against the innermost IP header's
    // (possibly rewritten) addresses.
    if let Some(transport) = net::locate_transport(data) {
        recompute_transport_checksum(data, &transport)?;
    }

    Ok((ipv4_count, ipv6_count, changed))
}

fn recompute_transport_checksum(
    data: &mut [u8],
    transport: &net::TransportLocation,
) -> Result<(), AnonymizeError> {
    let ip = transport.ip;
    match transport.proto {
        net::PROTO_TCP => {
            if data.len() < transport.offset + 20 {
                return Ok(());
            }
            let checksum_offset = transport.offset + 16;
            data[checksum_offset] = 0;
            data[checksum_offset + 1] = 0;
            let segment_end = transport.segment_end.max(checksum_offset + 2).min(data.len());
            let segment = &data[transport.offset..segment_end];
            let checksum = match ip.version {
                4 => {
                    let src = read_ipv4(data, ip.src_offset);
                    let dst = read_ipv4(data, ip.dst_offset);
                    checksum::tcp_checksum_ipv4(src, dst, segment)
                }
                6 => {
                    let src = read_ipv6(data, ip.src_offset);
                    let dst = read_ipv6(data, ip.dst_offset);
                    checksum::tcp_checksum_ipv6(src, dst, segment)
                }
                _ => return Err(AnonymizeError::Checksum("unknown ip version".into())),
            };
            data[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());
        }
        net::PROTO_UDP => {
            if data.len() < transport.offset + 8 {
                return Ok(());
            }
            let checksum_offset = transport.offset + 6;
            let original =
                u16::from_be_bytes([data[checksum_offset], data[checksum_offset + 1]]);
            if ip.version == 4 && original == 0 {
                // UDP-over-IPv4 zero checksum is "no checksum"; preserve it.
                return Ok(());
            }
            data[checksum_offset] = 0;
            data[checksum_offset + 1] = 0;
            let segment_end = transport.segment_end.max(checksum_offset + 2).min(data.len());
            let segment = &data[transport.offset..segment_end];
            let checksum = match ip.version {
                4 => {
                    let src = read_ipv4(data, ip.src_offset);
                    let dst = read_ipv4(data, ip.dst_offset);
                    checksum::udp_checksum_ipv4(src, dst, segment)
                }
                6 => {
                    let src = read_ipv6(data, ip.src_offset);
                    let dst = read_ipv6(data, ip.dst_offset);
                    checksum::udp_checksum_ipv6(src, dst, segment)
                }
                _ => return Err(AnonymizeError::Checksum("unknown ip version".into())),
            };
            data[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());
        }
        net::PROTO_ICMPV4 => {
            if data.len() < transport.offset + 8 {
                return Ok(());
            }
            data[transport.offset + 2] = 0;
            data[transport.offset + 3] = 0;
            let segment_end = transport.segment_end.max(transport.offset + 4).min(data.len());
            let checksum = checksum::icmpv4_checksum(&data[transport.offset..segment_end]);
            data[transport.offset + 2..transport.offset + 4].copy_from_slice(&checksum.to_be_bytes());
        }
        net::PROTO_ICMPV6 => {
            if data.len() < transport.offset + 8 {
                return Ok(());
            }
            data[transport.offset + 2] = 0;
            data[transport.offset + 3] = 0;
            let src = read_ipv6(data, ip.src_offset);
            let dst = read_ipv6(data, ip.dst_offset);
            let segment_end = transport.segment_end.max(transport.offset + 4).min(data.len());
            let checksum = checksum::icmpv6_checksum(src, dst, &data[transport.offset..segment_end]);
            data[transport.offset + 2..transport.offset + 4].copy_from_slice(&checksum.to_be_bytes());
        }
        _ => {}
    }
    Ok(())
}

fn read_ipv4(data: &[u8], offset: usize) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

fn write_ipv4(data: &mut [u8], offset: usize, addr: std::net::Ipv4Addr) {
    data[offset..offset + 4].copy_from_slice(&addr.octets());
}

fn read_ipv6(data: &[u8], offset: usize) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    std::net::Ipv6Addr::from(octets)
}

fn write_ipv6(data: &mut [u8], offset: usize, addr: std::net::Ipv6Addr) {
    data[offset..offset + 16].copy_from_slice(&addr.octets());
}

/// Convenience used by the directory driver to label which addresses
/// were observed, independent of whether the map ultimately maps them to
/// themselves (reserved ranges).
pub fn is_reserved(addr: IpAddr) -> bool {
    IpMap::is_reserved(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ipv4_tcp_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut pkt = vec![0u8; 14];
        pkt[12..14].copy_from_slice(&net::ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&40u16.to_be_bytes());
        ip[8] = 64;
        ip[9] = net::PROTO_TCP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 0x50;

        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&tcp);
        pkt
    }

    #[test]
    fn rewrite_preserves_length_and_produces_valid_checksums() {
        let mut pkt = build_ipv4_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        let original_len = pkt.len();
        let mut map = IpMap::with_seed(42);

        let (v4, v6, changed) = rewrite_packet(&mut pkt, &mut map).unwrap();
        assert_eq!(pkt.len(), original_len);
        assert_eq!(v4, 2);
        assert_eq!(v6, 0);
        assert!(changed);

        let ip_header = &pkt[14..34];
        assert_eq!(checksum::ones_complement_sum(&[ip_header]), 0);

        let transport = net::locate_transport(&pkt).unwrap();
        let ip = transport.ip;
        let src = read_ipv4(&pkt, ip.src_offset);
        let dst = read_ipv4(&pkt, ip.dst_offset);
        let segment = &pkt[transport.offset..transport.segment_end];
        // Summing the segment with the already-written (non-zeroed) checksum
        // field in place must fold to zero iff the checksum is valid.
        let verify = checksum::tcp_checksum_ipv4(src, dst, segment);
        assert_eq!(verify, 0, "tcp checksum does not verify after rewrite");
    }

    #[test]
    fn reserved_addresses_left_unchanged() {
        let mut pkt = build_ipv4_tcp_packet([127, 0, 0, 1], [10, 0, 0, 2]);
        let mut map = IpMap::with_seed(7);
        rewrite_packet(&mut pkt, &mut map).unwrap();
        assert_eq!(read_ipv4(&pkt, 14 + 12), std::net::Ipv4Addr::new(127, 0, 0, 1));
    }
}
