//! Encapsulation helpers (spec §4.7): hand-rolled, bounds-checked parsers
//! for Ethernet, single/double 802.1Q VLAN tags, IPv4 (with options),
//! IPv6 (with extension headers), and the one `locate_transport` entry
//! point every stage uses to find the transport header.
//!
//! Per spec §9's design note ("reflection-based packet editing... the
//! systems-language version must hand-roll encapsulation parsers with
//! explicit struct layouts and bounds-checked slicing"), nothing here
//! uses a generic reflective field-access layer; every offset is computed
//! and bounds-checked explicitly.

pub mod checksum;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const PROTO_ICMPV4: u8 = 1;
pub const PROTO_IPV4_IN_IP: u8 = 4;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_IPV6_IN_IP: u8 = 41;
pub const PROTO_ESP: u8 = 50;
pub const PROTO_AH: u8 = 51;
pub const PROTO_ICMPV6: u8 = 58;

/// Location and shape of a single IP header (v4 or v6, including any
/// IPv6 extension header chain that precedes the upper-layer protocol).
#[derive(Debug, Clone, Copy)]
pub struct IpHeaderLocation {
    pub offset: usize,
    pub version: u8,
    pub header_len: usize,
    pub src_offset: usize,
    pub dst_offset: usize,
    pub addr_len: usize,
    pub next_proto: u8,
    /// True when this is a non-initial IPv4/IPv6 fragment: there is no
    /// transport header here even though `next_proto` names one.
    pub fragment_continuation: bool,
}

impl IpHeaderLocation {
    pub fn src_bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.src_offset..self.src_offset + self.addr_len]
    }

    pub fn dst_bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.dst_offset..self.dst_offset + self.addr_len]
    }
}

/// Peel Ethernet + up to two 802.1Q tags (QinQ), returning the offset of
/// the first byte after the link layer and the resolved EtherType.
pub fn parse_link_layer(data: &[u8]) -> Option<(usize, u16)> {
    if data.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    offset += 2;

    for _ in 0..2 {
        if ethertype != ETHERTYPE_VLAN {
            break;
        }
        if data.len() < offset + VLAN_TAG_LEN {
            return None;
        }
        ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        offset += VLAN_TAG_LEN;
    }

    Some((offset, ethertype))
}

/// Parse an IPv4 header at `offset`, respecting the IHL-declared options
/// length and the fragment-offset field.
pub fn parse_ipv4(data: &[u8], offset: usize) -> Option<IpHeaderLocation> {
    if data.len() < offset + 20 {
        return None;
    }
    let version_ihl = data[offset];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = (version_ihl & 0x0F) as usize * 4;
    if header_len < 20 || data.len() < offset + header_len {
        return None;
    }

    let flags_frag = u16::from_be_bytes([data[offset + 6], data[offset + 7]]);
    let fragment_offset = flags_frag & 0x1FFF;

    Some(IpHeaderLocation {
        offset,
        version: 4,
        header_len,
        src_offset: offset + 12,
        dst_offset: offset + 16,
        addr_len: 4,
        next_proto: data[offset + 9],
        fragment_continuation: fragment_offset != 0,
    })
}

/// Parse an IPv6 header at `offset`, walking the extension header chain
/// (HBH, Routing, Fragment, AH, Destination Options, Mobility) until the
/// upper-layer protocol or an opaque ESP header is reached.
pub fn parse_ipv6(data: &[u8], offset: usize) -> Option<IpHeaderLocation> {
    if data.len() < offset + 40 {
        return None;
    }
    if data[offset] >> 4 != 6 {
        return None;
    }

    let mut next_header = data[offset + 6];
    let mut cursor = offset + 40;
    let mut fragment_continuation = false;

    loop {
        match next_header {
            0 | 43 | 60 | 135 => {
                if data.len() < cursor + 2 {
                    return None;
                }
                let nh = data[cursor];
                let ext_len_units = data[cursor + 1] as usize;
                let total = (ext_len_units + 1) * 8;
                if data.len() < cursor + total {
                    return None;
                }
                next_header = nh;
                cursor += total;
            }
            44 => {
                if data.len() < cursor + 8 {
                    return None;
                }
                let nh = data[cursor];
                let offset_flags = u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]);
                if offset_flags >> 3 != 0 {
                    fragment_continuation = true;
                }
                next_header = nh;
                cursor += 8;
                if fragment_continuation {
                    break;
                }
            }
            PROTO_AH => {
                if data.len() < cursor + 2 {
                    return None;
                }
                let nh = data[cursor];
                // AH payload length is in 4-byte units, offset by 2 -
                // unlike every other IPv6 extension header, which uses
                // 8-byte units. RFC 4302 §2.2.
                let payload_len_units = data[cursor + 1] as usize;
                let total = (payload_len_units + 2) * 4;
                if data.len() < cursor + total {
                    return None;
                }
                next_header = nh;
                cursor += total;
            }
            PROTO_ESP => {
                // ESP payload is encrypted; nothing past this point is
                // parseable.
                return Some(IpHeaderLocation {
                    offset,
                    version: 6,
                    header_len: cursor - offset,
                    src_offset: offset + 8,
                    dst_offset: offset + 24,
                    addr_len: 16,
                    next_proto: PROTO_ESP,
                    fragment_continuation: false,
                });
            }
            _ => break,
        }
    }

    Some(IpHeaderLocation {
        offset,
        version: 6,
        header_len: cursor - offset,
        src_offset: offset + 8,
        dst_offset: offset + 24,
        addr_len: 16,
        next_proto: next_header,
        fragment_continuation,
    })
}

fn locate_first_ip(data: &[u8]) -> Option<IpHeaderLocation> {
    let (offset, ethertype) = parse_link_layer(data)?;
    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(data, offset),
        ETHERTYPE_IPV6 => parse_ipv6(data, offset),
        _ => None,
    }
}

/// Every IP header in the packet, outermost first, recursing through
/// IPv4-in-IP (proto 4) and IPv6-in-IP (proto 41) tunnels. Used by the
/// anonymization stage, which must rewrite addresses at every nesting
/// level (spec §4.3.2).
pub fn locate_all_ip_headers(data: &[u8]) -> Vec<IpHeaderLocation> {
    let mut out = Vec::new();
    let Some(first) = locate_first_ip(data) else {
        return out;
    };
    let mut next_proto = first.next_proto;
    let mut cursor = first.offset + first.header_len;
    let mut fragment_continuation = first.fragment_continuation;
    out.push(first);

    while !fragment_continuation
        && matches!(next_proto, PROTO_IPV4_IN_IP | PROTO_IPV6_IN_IP)
    {
        let inner = if next_proto == PROTO_IPV4_IN_IP {
            parse_ipv4(data, cursor)
        } else {
            parse_ipv6(data, cursor)
        };
        match inner {
            Some(loc) => {
                next_proto = loc.next_proto;
                cursor = loc.offset + loc.header_len;
                fragment_continuation = loc.fragment_continuation;
                out.push(loc);
            }
            None => break,
        }
    }

    out
}

/// Outermost transport header reachable from this packet's outermost IP
/// header (after unwrapping any IP-in-IP tunnels).
#[derive(Debug, Clone, Copy)]
pub struct TransportLocation {
    pub ip: IpHeaderLocation,
    pub offset: usize,
    pub proto: u8,
    /// Exclusive end of the transport segment, derived from the IP
    /// header's own declared length rather than the captured buffer's
    /// length — Ethernet pads frames below 60 bytes, and that padding is
    /// not part of the IP datagram. Checksums and payload spans must stop
    /// here, not at `data.len()`.
    pub segment_end: usize,
}

/// Exclusive end offset of `ip`'s IP datagram within `data`, taken from
/// the header's own declared length field (IPv4 total length; IPv6
/// payload length added to the fixed 40-byte main header) and clamped to
/// the captured buffer. Falls back to `data.len()` if the declared length
/// is missing or shorter than the header itself (truncated capture).
pub fn ip_payload_end(data: &[u8], ip: &IpHeaderLocation) -> usize {
    let floor = (ip.offset + ip.header_len).min(data.len());
    let declared_end = match ip.version {
        4 if data.len() >= ip.offset + 4 => {
            let total_len = u16::from_be_bytes([data[ip.offset + 2], data[ip.offset + 3]]) as usize;
            Some(ip.offset + total_len)
        }
        6 if data.len() >= ip.offset + 6 => {
            let payload_len = u16::from_be_bytes([data[ip.offset + 4], data[ip.offset + 5]]) as usize;
            Some(ip.offset + 40 + payload_len)
        }
        _ => None,
    };
    match declared_end {
        Some(end) => end.clamp(floor, data.len()),
        None => data.len(),
    }
}

/// Single entry point required by spec §4.7: locate the transport header
/// across every supported encapsulation combination, or return `None` so
/// the caller can pass the packet through unchanged.
pub fn locate_transport(data: &[u8]) -> Option<TransportLocation> {
    let headers = locate_all_ip_headers(data);
    let last = *headers.last()?;

    if last.fragment_continuation {
        return None;
    }

    match last.next_proto {
        PROTO_TCP | PROTO_UDP | PROTO_ICMPV4 | PROTO_ICMPV6 => {
            let offset = last.offset + last.header_len;
            if data.len() < offset {
                return None;
            }
            let segment_end = ip_payload_end(data, &last).max(offset);
            Some(TransportLocation {
                ip: last,
                offset,
                proto: last.next_proto,
                segment_end,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_tcp(payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 14];
        pkt[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let mut tcp = vec![0u8; 20];
        tcp.extend_from_slice(payload);

        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&tcp);
        pkt
    }

    #[test]
    fn locates_plain_ipv4_tcp() {
        let pkt = eth_ipv4_tcp(b"hello");
        let loc = locate_transport(&pkt).expect("should locate");
        assert_eq!(loc.proto, PROTO_TCP);
        assert_eq!(loc.offset, 14 + 20);
    }

    #[test]
    fn single_vlan_tag_is_skipped() {
        let mut pkt = vec![0u8; 12];
        pkt.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x0a]); // TCI
        pkt.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = PROTO_UDP;
        ip[12..16].copy_from_slice(&[192, 168, 0, 1]);
        ip[16..20].copy_from_slice(&[192, 168, 0, 2]);
        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&[0u8; 8]);

        let loc = locate_transport(&pkt).expect("should locate through vlan");
        assert_eq!(loc.proto, PROTO_UDP);
        assert_eq!(loc.offset, 18 + 20);
    }

    #[test]
    fn qinq_double_tag_is_skipped() {
        let mut pkt = vec![0u8; 12];
        pkt.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x01]);
        pkt.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x02]);
        pkt.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = PROTO_TCP;
        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&[0u8; 20]);

        let loc = locate_transport(&pkt).expect("should locate through qinq");
        assert_eq!(loc.proto, PROTO_TCP);
    }

    #[test]
    fn non_initial_fragment_has_no_transport() {
        let mut pkt = vec![0u8; 14];
        pkt[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = PROTO_TCP;
        // Fragment offset = 1 (non-zero -> continuation fragment).
        ip[6..8].copy_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&[0u8; 8]);

        assert!(locate_transport(&pkt).is_none());
    }

    #[test]
    fn ip_in_ip_recurses_to_inner_transport() {
        let mut pkt = vec![0u8; 14];
        pkt[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut outer_ip = vec![0u8; 20];
        outer_ip[0] = 0x45;
        outer_ip[9] = PROTO_IPV4_IN_IP;
        outer_ip[12..16].copy_from_slice(&[1, 1, 1, 1]);
        outer_ip[16..20].copy_from_slice(&[2, 2, 2, 2]);

        let mut inner_ip = vec![0u8; 20];
        inner_ip[0] = 0x45;
        inner_ip[9] = PROTO_UDP;
        inner_ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        inner_ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        pkt.extend_from_slice(&outer_ip);
        pkt.extend_from_slice(&inner_ip);
        pkt.extend_from_slice(&[0u8; 8]);

        let headers = locate_all_ip_headers(&pkt);
        assert_eq!(headers.len(), 2);
        let transport = locate_transport(&pkt).expect("should locate inner transport");
        assert_eq!(transport.proto, PROTO_UDP);
    }

    #[test]
    fn truncated_packet_yields_none() {
        let pkt = vec![0u8; 10];
        assert!(locate_transport(&pkt).is_none());
    }
}
