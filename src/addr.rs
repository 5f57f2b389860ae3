//! Net-address parsing and the radix-tree IP ACL (design component C1).
//!
//! Grounded on `libinetd/accessip.cpp`'s ISC-radix-backed allow/deny table:
//! longest-prefix-match over a binary trie, family-tagged, with the default
//! verdict installed as the zero-length prefix so it naturally falls out of
//! the same lookup as every other rule.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::InetdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// A parsed `(family, network, mask)` triple. Equality is tuple equality
/// over network + mask + family, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    pub family: Family,
    /// Network address, left-aligned: for `V4` only the low 32 bits of a
    /// 128-bit value are meaningful, for `V6` all 128 bits are.
    pub bits: u128,
    pub prefix_len: u8,
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::V4 => write!(f, "{}/{}", Ipv4Addr::from((self.bits as u32)), self.prefix_len),
            Family::V6 => write!(f, "{}/{}", Ipv6Addr::from(self.bits), self.prefix_len),
        }
    }
}

impl NetAddr {
    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => NetAddr {
                family: Family::V4,
                bits: u32::from(v4) as u128,
                prefix_len: 32,
            },
            IpAddr::V6(v6) => NetAddr {
                family: Family::V6,
                bits: u128::from(v6),
                prefix_len: 128,
            },
        }
    }

    fn masked(bits: u128, family: Family, prefix_len: u8) -> u128 {
        let width = family.width();
        if prefix_len >= width {
            return bits;
        }
        let shift = width - prefix_len;
        (bits >> shift) << shift
    }
}

/// Count of trailing all-zero octets, used for "implied mask" (`a.b.c.0`
/// reads as `/24`).
fn trailing_zero_octets(octets: &[u8]) -> u32 {
    octets.iter().rev().take_while(|&&b| b == 0).count() as u32
}

fn contiguous_mask_bits(mask: u32) -> Option<u8> {
    // A valid mask is a run of 1s followed by a run of 0s (when read MSB first).
    let leading = mask.leading_ones();
    if leading == 32 {
        return Some(32);
    }
    let rest = mask << leading;
    if rest == 0 { Some(leading as u8) } else { None }
}

/// Parse a textual address spec into a `(family, network, mask)` triple.
///
/// Accepts: dotted-quad IPv4, IPv6 literals, `addr/prefix`, `addr/mask`
/// (dotted mask), `a.b.*.*` wildcard notation, and bare decimal integers
/// interpreted as a network-byte-order IPv4 address. `implied_mask` causes
/// a bare `a.b.c.0`-style address (no explicit `/prefix`) to be read with
/// its trailing zero octets counted as host bits.
pub fn parse_addr(text: &str, implied_mask: bool) -> Result<NetAddr, InetdError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(InetdError::BadAddress {
            text: text.to_string(),
            reason: "empty address".into(),
        });
    }

    if let Some((addr_part, mask_part)) = text.split_once('/') {
        return parse_addr_mask(addr_part, mask_part, text);
    }

    if text.contains('*') {
        return parse_wildcard(text);
    }

    if text.contains(':') {
        let v6: Ipv6Addr = text.parse().map_err(|_| InetdError::BadAddress {
            text: text.to_string(),
            reason: "invalid IPv6 literal".into(),
        })?;
        return Ok(NetAddr {
            family: Family::V6,
            bits: u128::from(v6),
            prefix_len: 128,
        });
    }

    if text.contains('.') {
        let v4: Ipv4Addr = text.parse().map_err(|_| InetdError::BadAddress {
            text: text.to_string(),
            reason: "invalid IPv4 literal".into(),
        })?;
        let bits = u32::from(v4);
        let prefix_len = if implied_mask {
            32 - trailing_zero_octets(&v4.octets()).saturating_mul(8) as u8
        } else {
            32
        };
        return Ok(NetAddr { family: Family::V4, bits: bits as u128, prefix_len });
    }

    // Bare integer: a decimal literal interpreted as a network-byte-order
    // IPv4 address (same reading `inet_network()`-style callers use).
    let value: u32 = text.parse().map_err(|_| InetdError::BadAddress {
        text: text.to_string(),
        reason: "not an address, mask-pair, or integer".into(),
    })?;
    let v4 = Ipv4Addr::from(value);
    let prefix_len = if implied_mask {
        32 - trailing_zero_octets(&v4.octets()).saturating_mul(8) as u8
    } else {
        32
    };
    Ok(NetAddr { family: Family::V4, bits: value as u128, prefix_len })
}

fn parse_addr_mask(addr_part: &str, mask_part: &str, whole: &str) -> Result<NetAddr, InetdError> {
    let bad = |reason: &str| InetdError::BadAddress {
        text: whole.to_string(),
        reason: reason.to_string(),
    };

    if addr_part.contains(':') {
        let v6: Ipv6Addr = addr_part.parse().map_err(|_| bad("invalid IPv6 literal"))?;
        let prefix_len: u8 = mask_part.parse().map_err(|_| bad("invalid IPv6 prefix length"))?;
        if prefix_len > 128 {
            return Err(bad("IPv6 prefix length out of range"));
        }
        return Ok(NetAddr {
            family: Family::V6,
            bits: NetAddr::masked(u128::from(v6), Family::V6, prefix_len),
            prefix_len,
        });
    }

    let v4: Ipv4Addr = addr_part.parse().map_err(|_| bad("invalid IPv4 literal"))?;
    let prefix_len = if let Ok(dotted_mask) = mask_part.parse::<Ipv4Addr>() {
        contiguous_mask_bits(u32::from(dotted_mask)).ok_or_else(|| bad("non-contiguous mask"))?
    } else {
        let n: u8 = mask_part.parse().map_err(|_| bad("invalid prefix length"))?;
        if n > 32 {
            return Err(bad("IPv4 prefix length out of range"));
        }
        n
    };
    let bits = NetAddr::masked(u32::from(v4) as u128, Family::V4, prefix_len);
    Ok(NetAddr { family: Family::V4, bits, prefix_len })
}

fn parse_wildcard(text: &str) -> Result<NetAddr, InetdError> {
    let bad = || InetdError::BadAddress {
        text: text.to_string(),
        reason: "malformed wildcard address".to_string(),
    };
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 4 {
        return Err(bad());
    }
    let mut octets = [0u8; 4];
    let mut seen_wildcard = false;
    let mut concrete = 0u32;
    for (i, p) in parts.iter().enumerate() {
        if *p == "*" {
            seen_wildcard = true;
        } else {
            if seen_wildcard {
                // Wildcards must be trailing only.
                return Err(bad());
            }
            octets[i] = p.parse::<u8>().map_err(|_| bad())?;
            concrete += 1;
        }
    }
    let prefix_len = (concrete * 8) as u8;
    Ok(NetAddr {
        family: Family::V4,
        bits: u32::from_be_bytes(octets) as u128,
        prefix_len,
    })
}

// ---------------------------------------------------------------------------
// Radix-tree ACL
// ---------------------------------------------------------------------------

struct RadixNode {
    left: Option<Box<RadixNode>>,
    right: Option<Box<RadixNode>>,
    data: Option<(bool, u32)>,
}

impl RadixNode {
    fn empty() -> Self {
        RadixNode { left: None, right: None, data: None }
    }
}

struct RadixTrie {
    root: Box<RadixNode>,
    width: u8,
}

impl RadixTrie {
    fn new(width: u8) -> Self {
        RadixTrie { root: Box::new(RadixNode::empty()), width }
    }

    fn bit_at(&self, bits: u128, i: u8) -> u128 {
        (bits >> (self.width - 1 - i)) & 1
    }

    fn insert(&mut self, bits: u128, prefix_len: u8, verdict: bool, counter: &mut u32) -> bool {
        let mut node = &mut self.root;
        for i in 0..prefix_len {
            let go_right = self.bit_at(bits, i) == 1;
            node = if go_right {
                node.right.get_or_insert_with(|| Box::new(RadixNode::empty()))
            } else {
                node.left.get_or_insert_with(|| Box::new(RadixNode::empty()))
            };
        }
        if node.data.is_some() {
            return false;
        }
        *counter += 1;
        node.data = Some((verdict, *counter));
        true
    }

    fn search_best(&self, bits: u128) -> Option<(bool, u32)> {
        let mut node: &RadixNode = &self.root;
        let mut best = node.data;
        for i in 0..self.width {
            let go_right = self.bit_at(bits, i) == 1;
            let next = if go_right { node.right.as_deref() } else { node.left.as_deref() };
            match next {
                Some(n) => {
                    node = n;
                    if n.data.is_some() {
                        best = n.data;
                    }
                }
                None => break,
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultVerdict {
    AllowAll,
    DenyAll,
    #[default]
    Unset,
}

/// IP access-control list: longest-prefix-match allow/deny over IPv4 and
/// IPv6, backed by two radix tries (one per family) and a monotonic match
/// counter shared across both.
pub struct AccessIp {
    v4: RadixTrie,
    v6: RadixTrie,
    match_counter: u32,
    rules: std::collections::HashSet<(Family, u128, u8)>,
}

impl Default for AccessIp {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessIp {
    pub fn new() -> Self {
        AccessIp {
            v4: RadixTrie::new(32),
            v6: RadixTrie::new(128),
            match_counter: 0,
            rules: std::collections::HashSet::new(),
        }
    }

    /// Insert an allow (`verdict = true`) or deny (`verdict = false`) rule
    /// for the given network. Returns `Duplicate` if `(family, net, mask)`
    /// was already inserted.
    pub fn insert(&mut self, addr: NetAddr, verdict: bool) -> Result<(), InetdError> {
        let key = (addr.family, addr.bits, addr.prefix_len);
        if self.rules.contains(&key) {
            return Err(InetdError::BadConfig {
                file: String::new(),
                line: 0,
                reason: format!("duplicate ACL rule for {addr}"),
            });
        }
        let trie = match addr.family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        };
        if !trie.insert(addr.bits, addr.prefix_len, verdict, &mut self.match_counter) {
            return Err(InetdError::BadConfig {
                file: String::new(),
                line: 0,
                reason: format!("duplicate ACL rule for {addr}"),
            });
        }
        self.rules.insert(key);
        Ok(())
    }

    /// Install the default verdict as the zero-length-prefix rule, for
    /// both families (a default is family-agnostic).
    pub fn set_default(&mut self, verdict: DefaultVerdict) -> Result<(), InetdError> {
        let v = match verdict {
            DefaultVerdict::AllowAll => true,
            DefaultVerdict::DenyAll => false,
            DefaultVerdict::Unset => return Ok(()),
        };
        for trie in [&mut self.v4, &mut self.v6] {
            // A default may be (re)installed once; root data starts empty.
            trie.root.data = Some((v, 0));
        }
        Ok(())
    }

    /// Longest-prefix-match verdict for `addr`. `true` = allow. When no
    /// rule and no default match, the result is allow.
    pub fn allowed(&self, addr: IpAddr) -> bool {
        let net = NetAddr::from_ip(addr);
        let trie = match net.family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        };
        match trie.search_best(net.bits) {
            Some((verdict, _)) => verdict,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_dotted_quad() {
        let a = parse_addr("10.0.0.5", false).unwrap();
        assert_eq!(a.family, Family::V4);
        assert_eq!(a.prefix_len, 32);
    }

    #[test]
    fn parses_cidr() {
        let a = parse_addr("10.0.0.0/24", false).unwrap();
        assert_eq!(a.prefix_len, 24);
        assert_eq!(a.bits, u32::from(Ipv4Addr::new(10, 0, 0, 0)) as u128);
    }

    #[test]
    fn parses_dotted_mask() {
        let a = parse_addr("10.0.0.0/255.255.255.0", false).unwrap();
        assert_eq!(a.prefix_len, 24);
    }

    #[test]
    fn rejects_noncontiguous_mask() {
        assert!(parse_addr("10.0.0.0/255.0.255.0", false).is_err());
    }

    #[test]
    fn parses_wildcard() {
        let a = parse_addr("10.0.*.*", false).unwrap();
        assert_eq!(a.prefix_len, 16);
    }

    #[test]
    fn rejects_leading_wildcard() {
        assert!(parse_addr("*.0.0.1", false).is_err());
    }

    #[test]
    fn implied_mask_counts_trailing_zero_octets() {
        let a = parse_addr("10.0.0.0", true).unwrap();
        assert_eq!(a.prefix_len, 24);
        let b = parse_addr("10.1.2.3", true).unwrap();
        assert_eq!(b.prefix_len, 32);
    }

    #[test]
    fn parses_ipv6_cidr() {
        let a = parse_addr("2001:db8::/32", false).unwrap();
        assert_eq!(a.family, Family::V6);
        assert_eq!(a.prefix_len, 32);
    }

    #[test]
    fn acl_longest_prefix_wins() {
        let mut acl = AccessIp::new();
        acl.insert(parse_addr("10.0.0.0/24", false).unwrap(), true).unwrap();
        acl.insert(parse_addr("10.0.0.5/32", false).unwrap(), false).unwrap();
        assert!(!acl.allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(acl.allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
    }

    #[test]
    fn acl_default_allow_when_unset() {
        let acl = AccessIp::new();
        assert!(acl.allowed(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn acl_deny_all_default() {
        let mut acl = AccessIp::new();
        acl.set_default(DefaultVerdict::DenyAll).unwrap();
        acl.insert(parse_addr("10.0.0.0/8", false).unwrap(), true).unwrap();
        assert!(acl.allowed(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))));
        assert!(!acl.allowed(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn acl_rejects_duplicate_rule() {
        let mut acl = AccessIp::new();
        let net = parse_addr("10.0.0.0/24", false).unwrap();
        acl.insert(net, true).unwrap();
        assert!(acl.insert(net, false).is_err());
    }
}
