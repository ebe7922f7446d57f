//! Prefix-preserving IP anonymization (spec §4.3.1).
//!
//! Builds a binary trie keyed by address bits. Each node lazily fixes one
//! random bit per child slot on first visit; an address's pseudonym is
//! assembled bit by bit by walking the trie along the path its own bits
//! select, emitting the slot's random bit at each step. Two addresses
//! that share a bit-prefix walk the same nodes for that prefix and so
//! emit the same output bits; they diverge into independent subtrees the
//! moment their bits differ, after which output bits are drawn
//! independently. The trie grows on demand — addresses never seen are
//! never allocated a node.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Default)]
struct Node {
    slot_bits: [Option<bool>; 2],
    children: [Option<Box<Node>>; 2],
}

impl Node {
    fn bit_for(&mut self, rng: &mut StdRng, selector: usize) -> bool {
        *self.slot_bits[selector].get_or_insert_with(|| rng.gen())
    }

    fn child_mut(&mut self, selector: usize) -> &mut Node {
        self.children[selector].get_or_insert_with(|| Box::new(Node::default()))
    }
}

/// Directory-scoped, injective, prefix-preserving IPv4/IPv6 pseudonym
/// map. Constructed once per directory run (spec §3: "IPMap ... built
/// once per directory run"); mutation must be serialized by the caller
/// when files are processed in parallel (spec §5) — this type is not
/// internally synchronized, matching the teacher's pattern of wrapping
/// genuinely shared mutable state in caller-supplied `Mutex`/`Arc` rather
/// than baking locking into the data structure itself.
pub struct IpMap {
    v4_root: Node,
    v6_root: Node,
    v4_cache: HashMap<Ipv4Addr, Ipv4Addr>,
    v6_cache: HashMap<Ipv6Addr, Ipv6Addr>,
    rng: StdRng,
}

impl IpMap {
    pub fn new() -> Self {
        IpMap {
            v4_root: Node::default(),
            v6_root: Node::default(),
            v4_cache: HashMap::new(),
            v6_cache: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        IpMap {
            v4_root: Node::default(),
            v6_root: Node::default(),
            v4_cache: HashMap::new(),
            v6_cache: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Loopback, multicast, link-local, broadcast, unspecified, and
    /// IPv4-mapped-IPv6 addresses map to themselves (spec §4.3.1
    /// "Reserved-range policy").
    pub fn is_reserved(addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_multicast()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_multicast()
                    || v6.is_unspecified()
                    || v6.is_unicast_link_local()
                    || v6.to_ipv4_mapped().is_some()
            }
        }
    }

    pub fn get_or_insert(&mut self, addr: IpAddr) -> IpAddr {
        match addr {
            IpAddr::V4(v4) => IpAddr::V4(self.get_or_insert_v4(v4)),
            IpAddr::V6(v6) => IpAddr::V6(self.get_or_insert_v6(v6)),
        }
    }

    pub fn get_or_insert_v4(&mut self, addr: Ipv4Addr) -> Ipv4Addr {
        if Self::is_reserved(IpAddr::V4(addr)) {
            return addr;
        }
        if let Some(mapped) = self.v4_cache.get(&addr) {
            return *mapped;
        }

        let input = u32::from(addr);
        let mut output: u32 = 0;
        let mut node = &mut self.v4_root;
        for i in (0..32).rev() {
            let selector = ((input >> i) & 1) as usize;
            let bit = node.bit_for(&mut self.rng, selector);
            output = (output << 1) | (bit as u32);
            node = node.child_mut(selector);
        }

        let mapped = Ipv4Addr::from(output);
        self.v4_cache.insert(addr, mapped);
        mapped
    }

    pub fn get_or_insert_v6(&mut self, addr: Ipv6Addr) -> Ipv6Addr {
        if Self::is_reserved(IpAddr::V6(addr)) {
            return addr;
        }
        if let Some(mapped) = self.v6_cache.get(&addr) {
            return *mapped;
        }

        let input = u128::from(addr);
        let mut output: u128 = 0;
        let mut node = &mut self.v6_root;
        for i in (0..128).rev() {
            let selector = ((input >> i) & 1) as usize;
            let bit = node.bit_for(&mut self.rng, selector);
            output = (output << 1) | (bit as u128);
            node = node.child_mut(selector);
        }

        let mapped = Ipv6Addr::from(output);
        self.v6_cache.insert(addr, mapped);
        mapped
    }
}

impl Default for IpMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common_prefix_len_v4(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
        (u32::from(a) ^ u32::from(b)).leading_zeros()
    }

    fn common_prefix_len_v6(a: Ipv6Addr, b: Ipv6Addr) -> u32 {
        (u128::from(a) ^ u128::from(b)).leading_zeros()
    }

    #[test]
    fn reserved_addresses_are_identity() {
        let mut map = IpMap::with_seed(1);
        let loopback: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert_eq!(map.get_or_insert_v4(loopback), loopback);
    }

    #[test]
    fn mapping_is_deterministic_within_a_run() {
        let mut map = IpMap::with_seed(2);
        let addr: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let first = map.get_or_insert_v4(addr);
        let second = map.get_or_insert_v4(addr);
        assert_eq!(first, second);
    }

    #[test]
    fn family_is_preserved() {
        let mut map = IpMap::with_seed(3);
        let v4: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let mapped = map.get_or_insert(IpAddr::V4(v4));
        assert!(matches!(mapped, IpAddr::V4(_)));
    }

    #[test]
    fn shared_prefix_is_never_shorter_than_input_prefix() {
        let mut map = IpMap::with_seed(4);
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let input_lcp = common_prefix_len_v4(a, b);

        let fa = map.get_or_insert_v4(a);
        let fb = map.get_or_insert_v4(b);
        let output_lcp = common_prefix_len_v4(fa, fb);

        assert!(output_lcp >= input_lcp);
    }

    #[test]
    fn shared_prefix_is_never_shorter_than_input_prefix_v6() {
        let mut map = IpMap::with_seed(6);
        let a: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let b: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let input_lcp = common_prefix_len_v6(a, b);

        let fa = map.get_or_insert_v6(a);
        let fb = map.get_or_insert_v6(b);
        let output_lcp = common_prefix_len_v6(fa, fb);

        assert!(output_lcp >= input_lcp);
    }

    #[test]
    fn distinct_inputs_map_to_distinct_outputs() {
        let mut map = IpMap::with_seed(5);
        let addrs: Vec<Ipv4Addr> = (1..50).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        let mapped: Vec<Ipv4Addr> = addrs.iter().map(|a| map.get_or_insert_v4(*a)).collect();
        let mut sorted = mapped.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), mapped.len());
    }
}
