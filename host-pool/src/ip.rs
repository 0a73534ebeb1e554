//! Subnet extraction and the greedy same-subnet filter.
//!
//! Hosts sharing a subnet are assumed to be under one operator's control, so
//! at most one of them may count toward a redundancy set. IPv4 collapses to
//! /24, IPv6 to /64.

use std::collections::HashSet;
use std::net::IpAddr;

/// Prefix length applied to IPv4 addresses.
pub const IPV4_PREFIX_BITS: u8 = 24;

/// Prefix length applied to IPv6 addresses.
pub const IPV6_PREFIX_BITS: u8 = 64;

/// Canonical subnet key for an IP address string. Unparseable addresses get
/// no subnet and never collide.
pub fn subnet(ip: &str) -> Option<String> {
    // Tolerate host:port shapes
    let bare = ip.rsplit_once(':').map_or(ip, |(head, tail)| {
        if tail.bytes().all(|b| b.is_ascii_digit()) && head.contains('.') {
            head
        } else {
            ip
        }
    });
    match bare.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(format!(
                "{}.{}.{}.0/{IPV4_PREFIX_BITS}",
                octets[0], octets[1], octets[2]
            ))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            Some(format!(
                "{:x}:{:x}:{:x}:{:x}::/{IPV6_PREFIX_BITS}",
                segments[0], segments[1], segments[2], segments[3]
            ))
        }
    }
}

/// Greedy subnet-conflict filter: the first host seen in a subnet claims it.
#[derive(Debug, Default)]
pub struct IpFilter {
    seen: HashSet<String>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this IP's subnet has already been claimed.
    pub fn filtered(&self, ip: &str) -> bool {
        subnet(ip).map(|s| self.seen.contains(&s)).unwrap_or(false)
    }

    /// Claim this IP's subnet.
    pub fn add(&mut self, ip: &str) {
        if let Some(s) = subnet(ip) {
            self.seen.insert(s);
        }
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_collapses_to_slash_24() {
        assert_eq!(subnet("10.0.1.5").unwrap(), "10.0.1.0/24");
        assert_eq!(subnet("10.0.1.200").unwrap(), "10.0.1.0/24");
        assert_ne!(subnet("10.0.2.5").unwrap(), subnet("10.0.1.5").unwrap());
    }

    #[test]
    fn host_port_is_tolerated() {
        assert_eq!(subnet("10.0.1.5:30303").unwrap(), "10.0.1.0/24");
    }

    #[test]
    fn garbage_never_collides() {
        let mut filter = IpFilter::new();
        filter.add("not-an-ip");
        assert!(!filter.filtered("not-an-ip"));
    }

    #[test]
    fn filter_is_greedy() {
        let mut filter = IpFilter::new();
        assert!(!filter.filtered("10.0.1.5"));
        filter.add("10.0.1.5");
        assert!(filter.filtered("10.0.1.77"));
        assert!(!filter.filtered("10.0.2.5"));
    }
}
