//! In-memory IPv4 transport-address pool.

use super::Pool4;
use crate::config::Pool4Config;
use crate::error::{Nat64Error, Nat64Result};
use crate::types::{Ipv4TransportAddr, L4Protocol};
use dashmap::DashMap;
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Ports of one `(protocol, address)` that are out on loan.
#[derive(Debug, Default)]
struct PortSpace {
    ports: HashSet<u16>,
    /// In-range ports taken, by parity.
    taken: [u32; 2],
    /// Where the next same-parity scan starts, by parity.
    parity_cursor: [Option<u16>; 2],
    /// Where the next any-port scan starts.
    any_cursor: Option<u16>,
}

impl PortSpace {
    fn take(&mut self, port: u16, range: (u16, u16)) -> bool {
        if !self.ports.insert(port) {
            return false;
        }
        if (range.0..=range.1).contains(&port) {
            self.taken[usize::from(port % 2)] += 1;
        }
        true
    }

    fn release(&mut self, port: u16, range: (u16, u16)) -> bool {
        if !self.ports.remove(&port) {
            return false;
        }
        if (range.0..=range.1).contains(&port) {
            self.taken[usize::from(port % 2)] -= 1;
        }
        true
    }

    fn taken_in_range(&self) -> u32 {
        self.taken[0] + self.taken[1]
    }
}

/// Number of ports in `lo..=hi` whose parity is `parity`.
fn parity_span(lo: u16, hi: u16, parity: u16) -> u32 {
    let first = if lo % 2 == parity {
        Some(lo)
    } else {
        lo.checked_add(1)
    };
    match first {
        Some(first) if first <= hi => u32::from(hi - first) / 2 + 1,
        _ => 0,
    }
}

/// Pool of `address#port` pairs carved out of the configured prefixes.
///
/// Borrowed ports are tracked per protocol and address; the same
/// `address#port` can be out for TCP and UDP at once. A claim holds the
/// map entry of its address, so two concurrent borrowers never get the same
/// pair. Full addresses are skipped without scanning, and scans resume from
/// where the previous one stopped.
pub struct AddressPool {
    prefixes: Vec<Ipv4Net>,
    port_range: (u16, u16),
    borrowed: DashMap<(L4Protocol, Ipv4Addr), PortSpace>,
}

impl AddressPool {
    pub fn new(config: &Pool4Config) -> Self {
        Self {
            prefixes: config.prefixes.clone(),
            port_range: config.port_range,
            borrowed: DashMap::new(),
        }
    }

    fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.prefixes.iter().flat_map(|net| net.hosts())
    }

    fn is_borrowable(&self, addr: Ipv4Addr) -> bool {
        self.prefixes.iter().any(|net| {
            net.contains(&addr)
                && (net.prefix_len() >= 31 || (addr != net.network() && addr != net.broadcast()))
        })
    }

    /// Claim a port on `addr`.
    ///
    /// Order of preference: `hint` itself, then (TCP and UDP only) a free
    /// port with the same parity, then any free port. Scans wrap inside the
    /// port range and start where the last scan of the same kind ended.
    fn claim_port(&self, protocol: L4Protocol, addr: Ipv4Addr, hint: u16) -> Option<u16> {
        let (lo, hi) = self.port_range;
        if hi < lo {
            return None;
        }
        let range = self.port_range;
        let span = u32::from(hi - lo) + 1;

        let mut space = self.borrowed.entry((protocol, addr)).or_default();
        if space.taken_in_range() >= span {
            return None;
        }

        let start = if (lo..=hi).contains(&hint) { hint } else { lo };
        if space.take(start, range) {
            return Some(start);
        }

        let scan = |from: u16| {
            let offset = u32::from(from.clamp(lo, hi) - lo);
            (0..span).map(move |i| lo + ((offset + i) % span) as u16)
        };

        if protocol != L4Protocol::Icmp {
            let parity = hint % 2;
            let slot = usize::from(parity);
            if space.taken[slot] < parity_span(lo, hi, parity) {
                let from = space.parity_cursor[slot].unwrap_or(start);
                let found = scan(from)
                    .filter(|port| port % 2 == parity)
                    .find(|port| !space.ports.contains(port));
                if let Some(port) = found {
                    space.take(port, range);
                    space.parity_cursor[slot] = Some(port);
                    return Some(port);
                }
            }
        }

        let from = space.any_cursor.unwrap_or(start);
        let found = scan(from).find(|port| !space.ports.contains(port));
        if let Some(port) = found {
            space.take(port, range);
            space.any_cursor = Some(port);
        }
        found
    }
}

impl Pool4 for AddressPool {
    fn borrow_similar(
        &self,
        hint: Ipv4TransportAddr,
        protocol: L4Protocol,
    ) -> Nat64Result<Ipv4TransportAddr> {
        if self.is_borrowable(hint.addr) {
            if let Some(port) = self.claim_port(protocol, hint.addr, hint.id) {
                return Ok(Ipv4TransportAddr::new(hint.addr, port));
            }
            log::debug!("{} has no free {} ports, trying the rest of pool4", hint.addr, protocol);
        }
        self.borrow_any(protocol, hint.id)
    }

    fn borrow_any(&self, protocol: L4Protocol, port_hint: u16) -> Nat64Result<Ipv4TransportAddr> {
        for addr in self.addresses() {
            if let Some(port) = self.claim_port(protocol, addr, port_hint) {
                return Ok(Ipv4TransportAddr::new(addr, port));
            }
        }
        Err(Nat64Error::AddressExhausted(protocol))
    }

    fn give_back(&self, addr: Ipv4TransportAddr, protocol: L4Protocol) {
        let released = match self.borrowed.get_mut(&(protocol, addr.addr)) {
            Some(mut space) => space.release(addr.id, self.port_range),
            None => false,
        };
        if !released {
            log::warn!("Returned {} address {} was not borrowed", protocol, addr);
        }
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        self.prefixes.iter().any(|net| net.contains(&addr))
    }

    fn reserve(&self, addr: Ipv4TransportAddr, protocol: L4Protocol) -> Nat64Result<()> {
        if !self.contains(addr.addr) {
            return Err(Nat64Error::config(format!("{} is not within pool4", addr)));
        }
        let mut space = self.borrowed.entry((protocol, addr.addr)).or_default();
        if !space.take(addr.id, self.port_range) {
            return Err(Nat64Error::DuplicateEntry(format!(
                "{} address {} is already in use",
                protocol, addr
            )));
        }
        Ok(())
    }

    fn outstanding(&self, protocol: L4Protocol) -> usize {
        self.borrowed
            .iter()
            .filter(|entry| entry.key().0 == protocol)
            .map(|entry| entry.value().ports.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(prefix: &str, port_range: (u16, u16)) -> AddressPool {
        AddressPool::new(&Pool4Config {
            prefixes: vec![prefix.parse().unwrap()],
            port_range,
        })
    }

    #[test]
    fn test_borrow_any_prefers_hint() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        let addr = pool.borrow_any(L4Protocol::Udp, 5000).unwrap();
        assert_eq!(addr, Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 5000));
        assert_eq!(pool.outstanding(L4Protocol::Udp), 1);
        assert_eq!(pool.outstanding(L4Protocol::Tcp), 0);
    }

    #[test]
    fn test_borrow_keeps_parity() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        let first = pool.borrow_any(L4Protocol::Tcp, 5001).unwrap();
        let second = pool.borrow_any(L4Protocol::Tcp, 5001).unwrap();
        assert_eq!(first.id, 5001);
        assert_eq!(second.id, 5003);
    }

    #[test]
    fn test_icmp_ignores_parity() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        pool.borrow_any(L4Protocol::Icmp, 2000).unwrap();
        let second = pool.borrow_any(L4Protocol::Icmp, 2000).unwrap();
        assert_eq!(second.id, 2001);
    }

    #[test]
    fn test_hint_outside_range_starts_at_low_port() {
        let pool = pool("192.0.2.1/32", (2000, 2010));
        let addr = pool.borrow_any(L4Protocol::Icmp, 80).unwrap();
        assert_eq!(addr.id, 2000);
    }

    #[test]
    fn test_parity_falls_back_to_any_port() {
        let pool = pool("192.0.2.1/32", (2000, 2001));
        assert_eq!(pool.borrow_any(L4Protocol::Udp, 2000).unwrap().id, 2000);
        assert_eq!(pool.borrow_any(L4Protocol::Udp, 2000).unwrap().id, 2001);
    }

    #[test]
    fn test_exhaustion() {
        let pool = pool("192.0.2.1/32", (2000, 2001));
        pool.borrow_any(L4Protocol::Udp, 2000).unwrap();
        pool.borrow_any(L4Protocol::Udp, 2000).unwrap();
        let err = pool.borrow_any(L4Protocol::Udp, 2000).unwrap_err();
        assert!(matches!(err, Nat64Error::AddressExhausted(L4Protocol::Udp)));

        // Other protocols have their own port space.
        assert!(pool.borrow_any(L4Protocol::Tcp, 2000).is_ok());
    }

    #[test]
    fn test_borrow_similar_stays_on_hinted_address() {
        let pool = pool("192.0.2.0/29", (1024, 65535));
        let hint = Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 5), 7000);
        let addr = pool.borrow_similar(hint, L4Protocol::Tcp).unwrap();
        assert_eq!(addr, hint);

        let again = pool.borrow_similar(hint, L4Protocol::Tcp).unwrap();
        assert_eq!(again.addr, hint.addr);
        assert_eq!(again.id, 7002);
    }

    #[test]
    fn test_borrow_similar_falls_back_when_hint_not_in_pool() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        let hint = Ipv4TransportAddr::new(Ipv4Addr::new(198, 51, 100, 1), 7000);
        let addr = pool.borrow_similar(hint, L4Protocol::Udp).unwrap();
        assert_eq!(addr, Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 7000));
    }

    #[test]
    fn test_borrow_similar_falls_back_when_address_full() {
        let pool = pool("192.0.2.0/30", (3000, 3000));
        let first = pool.borrow_any(L4Protocol::Udp, 3000).unwrap();
        assert_eq!(first.addr, Ipv4Addr::new(192, 0, 2, 1));

        let addr = pool.borrow_similar(first, L4Protocol::Udp).unwrap();
        assert_eq!(addr, Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 2), 3000));
    }

    #[test]
    fn test_give_back_frees_the_pair() {
        let pool = pool("192.0.2.1/32", (4000, 4000));
        let addr = pool.borrow_any(L4Protocol::Udp, 4000).unwrap();
        assert!(pool.borrow_any(L4Protocol::Udp, 4000).is_err());

        pool.give_back(addr, L4Protocol::Udp);
        assert_eq!(pool.outstanding(L4Protocol::Udp), 0);
        assert_eq!(pool.borrow_any(L4Protocol::Udp, 4000).unwrap(), addr);
    }

    #[test]
    fn test_reserve() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        let addr = Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 8080);
        pool.reserve(addr, L4Protocol::Tcp).unwrap();
        assert!(matches!(
            pool.reserve(addr, L4Protocol::Tcp),
            Err(Nat64Error::DuplicateEntry(_))
        ));

        // A reserved pair is skipped by dynamic borrowing.
        assert_eq!(pool.borrow_any(L4Protocol::Tcp, 8080).unwrap().id, 8082);

        let outside = Ipv4TransportAddr::new(Ipv4Addr::new(198, 51, 100, 1), 80);
        assert!(matches!(
            pool.reserve(outside, L4Protocol::Tcp),
            Err(Nat64Error::Config(_))
        ));
    }

    #[test]
    fn test_parity_span() {
        assert_eq!(parity_span(1024, 65535, 0), 32256);
        assert_eq!(parity_span(1024, 65535, 1), 32256);
        assert_eq!(parity_span(2000, 2000, 1), 0);
        assert_eq!(parity_span(2001, 2003, 1), 2);
        assert_eq!(parity_span(65535, 65535, 0), 0);
        assert_eq!(parity_span(65535, 65535, 1), 1);
    }

    #[test]
    fn test_scan_resumes_after_last_claim() {
        let pool = pool("192.0.2.1/32", (1024, 65535));
        let ports: Vec<u16> = (0..4)
            .map(|_| pool.borrow_any(L4Protocol::Udp, 5001).unwrap().id)
            .collect();
        assert_eq!(ports, vec![5001, 5003, 5005, 5007]);

        // A returned port is found again once the scan wraps back to it.
        pool.give_back(
            Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 5003),
            L4Protocol::Udp,
        );
        assert_eq!(pool.borrow_any(L4Protocol::Udp, 5001).unwrap().id, 5009);
    }

    #[test]
    fn test_returned_port_reused_after_wrap() {
        let pool = pool("192.0.2.1/32", (2000, 2003));
        let ports: Vec<u16> = (0..4)
            .map(|_| pool.borrow_any(L4Protocol::Udp, 2000).unwrap().id)
            .collect();
        assert_eq!(ports, vec![2000, 2002, 2001, 2003]);

        pool.give_back(
            Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 2002),
            L4Protocol::Udp,
        );
        assert_eq!(pool.borrow_any(L4Protocol::Udp, 2000).unwrap().id, 2002);
        assert!(pool.borrow_any(L4Protocol::Udp, 2000).is_err());
    }

    #[test]
    fn test_full_addresses_are_skipped() {
        let pool = pool("192.0.2.0/29", (3000, 3001));
        for _ in 0..10 {
            pool.borrow_any(L4Protocol::Tcp, 3000).unwrap();
        }
        // Five of the six hosts are full; the sixth still has both ports.
        let addr = pool.borrow_any(L4Protocol::Tcp, 3000).unwrap();
        assert_eq!(addr, Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 6), 3000));
        assert_eq!(pool.outstanding(L4Protocol::Tcp), 11);
    }

    #[test]
    fn test_reservation_outside_range_keeps_range_free() {
        let pool = pool("192.0.2.1/32", (2000, 2000));
        let reserved = Ipv4TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 80);
        pool.reserve(reserved, L4Protocol::Tcp).unwrap();
        assert_eq!(pool.borrow_any(L4Protocol::Tcp, 2000).unwrap().id, 2000);
        assert_eq!(pool.outstanding(L4Protocol::Tcp), 2);
    }

    #[test]
    fn test_contains() {
        let pool = pool("192.0.2.0/24", (1024, 65535));
        assert!(pool.contains(Ipv4Addr::new(192, 0, 2, 200)));
        assert!(!pool.contains(Ipv4Addr::new(192, 0, 3, 1)));
    }
}
