//! BIB and session tables of all protocols, mutated together.
//!
//! Everything here runs under the engine's table lock. Sessions reach their
//! BIB entry through the `bib` key they carry; BIB entries list their
//! sessions by IPv6 pair. Both links are plain keys, so removing either side
//! can never leave a dangling reference.

use crate::bib::{BibEntry, BibTable};
use crate::error::{Nat64Error, Nat64Result};
use crate::pool::Pool4;
use crate::session::{SessionEntry, SessionTable};
use crate::types::{Ipv4TransportAddr, Ipv6Pair, Ipv6TransportAddr, L4Protocol};
use std::net::Ipv4Addr;

/// One `T` per tracked protocol.
#[derive(Debug)]
pub struct PerProtocol<T> {
    tcp: T,
    udp: T,
    icmp: T,
}

impl<T> PerProtocol<T> {
    pub fn new(mut f: impl FnMut(L4Protocol) -> T) -> Self {
        Self {
            tcp: f(L4Protocol::Tcp),
            udp: f(L4Protocol::Udp),
            icmp: f(L4Protocol::Icmp),
        }
    }

    pub fn get(&self, protocol: L4Protocol) -> &T {
        match protocol {
            L4Protocol::Tcp => &self.tcp,
            L4Protocol::Udp => &self.udp,
            L4Protocol::Icmp => &self.icmp,
        }
    }

    pub fn get_mut(&mut self, protocol: L4Protocol) -> &mut T {
        match protocol {
            L4Protocol::Tcp => &mut self.tcp,
            L4Protocol::Udp => &mut self.udp,
            L4Protocol::Icmp => &mut self.icmp,
        }
    }
}

/// A BIB entry found or created for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BibHandle {
    pub ipv6: Ipv6TransportAddr,
    pub ipv4: Ipv4TransportAddr,
    /// Created for this packet; must be rolled back if the session fails.
    pub created: bool,
}

impl BibHandle {
    pub fn existing(entry: &BibEntry) -> Self {
        Self {
            ipv6: entry.ipv6,
            ipv4: entry.ipv4,
            created: false,
        }
    }
}

#[derive(Debug)]
pub struct Tables {
    bibs: PerProtocol<BibTable>,
    sessions: PerProtocol<SessionTable>,
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        Self {
            bibs: PerProtocol::new(BibTable::new),
            sessions: PerProtocol::new(SessionTable::new),
        }
    }

    pub fn bib(&self, protocol: L4Protocol) -> &BibTable {
        self.bibs.get(protocol)
    }

    pub fn bib_mut(&mut self, protocol: L4Protocol) -> &mut BibTable {
        self.bibs.get_mut(protocol)
    }

    pub fn sessions(&self, protocol: L4Protocol) -> &SessionTable {
        self.sessions.get(protocol)
    }

    pub fn sessions_mut(&mut self, protocol: L4Protocol) -> &mut SessionTable {
        self.sessions.get_mut(protocol)
    }

    /// Borrow an IPv4 transport address for a new binding of `src`.
    ///
    /// UDP only looks at UDP bindings of the same IPv6 host for a similarity
    /// hint. TCP and ICMP look through the TCP, UDP and ICMP tables in that
    /// order and take the first hit.
    pub fn allocate<P: Pool4 + ?Sized>(
        &self,
        protocol: L4Protocol,
        src: &Ipv6TransportAddr,
        pool: &P,
    ) -> Nat64Result<Ipv4TransportAddr> {
        let similar = match protocol {
            L4Protocol::Udp => self.bibs.get(L4Protocol::Udp).lookup_by_host(&src.addr),
            L4Protocol::Tcp | L4Protocol::Icmp => L4Protocol::ALL
                .iter()
                .find_map(|p| self.bibs.get(*p).lookup_by_host(&src.addr)),
        };

        match similar {
            Some(existing) => {
                log::debug!(
                    "{} binding for {} will mimic {}",
                    protocol,
                    src,
                    existing.ipv4
                );
                pool.borrow_similar(Ipv4TransportAddr::new(existing.ipv4.addr, src.id), protocol)
            }
            None => pool.borrow_any(protocol, src.id),
        }
    }

    /// Find the binding of `src`, creating one if there is none.
    pub fn bib_for_v6<P: Pool4 + ?Sized>(
        &mut self,
        protocol: L4Protocol,
        src: &Ipv6TransportAddr,
        pool: &P,
    ) -> Nat64Result<BibHandle> {
        if let Some(entry) = self.bibs.get(protocol).lookup_by_v6(src) {
            return Ok(BibHandle::existing(entry));
        }

        let ipv4 = self.allocate(protocol, src, pool)?;
        match self.bibs.get_mut(protocol).create_and_insert(ipv4, *src, false) {
            Ok(entry) => {
                log::debug!("Created {} BIB entry {} <-> {}", protocol, entry.ipv6, entry.ipv4);
                Ok(BibHandle {
                    ipv6: entry.ipv6,
                    ipv4: entry.ipv4,
                    created: true,
                })
            }
            Err(e) => {
                log::error!("{}", e);
                pool.give_back(ipv4, protocol);
                // Retry as a lookup; the winner may already serve this source.
                self.bibs
                    .get(protocol)
                    .lookup_by_v6(src)
                    .map(BibHandle::existing)
                    .ok_or(e)
            }
        }
    }

    /// Store `session` and link it to its BIB entry.
    pub fn add_session(&mut self, session: SessionEntry) -> Nat64Result<()> {
        let protocol = session.protocol;
        let bib = self.bibs.get(protocol).lookup_by_v6(&session.bib).ok_or_else(|| {
            Nat64Error::UnknownFlow(format!("no {} BIB entry for {}", protocol, session.bib))
        })?;
        if bib.ipv4 != session.ipv4.local {
            return Err(Nat64Error::InvalidState(format!(
                "{} session local {} does not match BIB address {}",
                protocol, session.ipv4.local, bib.ipv4
            )));
        }

        let key = session.ipv6;
        let bib_key = session.bib;
        self.sessions.get_mut(protocol).add(session)?;
        self.bibs.get_mut(protocol).link_session(&bib_key, key);
        Ok(())
    }

    /// Remove a session and, if that leaves a dynamic BIB entry without
    /// sessions, the entry too.
    pub fn remove_session<P: Pool4 + ?Sized>(
        &mut self,
        protocol: L4Protocol,
        key: &Ipv6Pair,
        pool: &P,
    ) -> Option<SessionEntry> {
        let session = self.sessions.get_mut(protocol).remove(key)?;
        let orphan = self
            .bibs
            .get_mut(protocol)
            .unlink_session(&session.bib, key)
            .map(|entry| entry.ipv6);
        if let Some(bib_key) = orphan {
            self.remove_bib(protocol, &bib_key, pool);
        }
        Some(session)
    }

    /// Remove a BIB entry with all its sessions.
    ///
    /// The borrowed IPv4 address goes back to the pool unless the entry is
    /// static; static reservations are released by their owner.
    pub fn remove_bib<P: Pool4 + ?Sized>(
        &mut self,
        protocol: L4Protocol,
        key: &Ipv6TransportAddr,
        pool: &P,
    ) -> Option<BibEntry> {
        let entry = self.bibs.get_mut(protocol).remove(key)?;
        let sessions = self.sessions.get_mut(protocol);
        for pair in entry.sessions() {
            sessions.remove(pair);
        }
        if !entry.is_static {
            pool.give_back(entry.ipv4, protocol);
        }
        log::debug!("Removed {} BIB entry {} <-> {}", protocol, entry.ipv6, entry.ipv4);
        Some(entry)
    }

    /// Whether some session of the binding `bib` already talks to `remote`.
    ///
    /// This is the address-dependent filtering test; ports are ignored.
    pub fn session_allows(
        &self,
        protocol: L4Protocol,
        bib: &Ipv6TransportAddr,
        remote: Ipv4Addr,
    ) -> bool {
        let Some(entry) = self.bibs.get(protocol).lookup_by_v6(bib) else {
            return false;
        };
        let sessions = self.sessions.get(protocol);
        entry
            .sessions()
            .filter_map(|pair| sessions.lookup_v6(pair))
            .any(|session| session.ipv4.remote.addr == remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Instant, MockClock};
    use crate::config::Pool4Config;
    use crate::pool::AddressPool;
    use crate::types::{Ipv4Pair, TransportAddr};
    use std::time::Duration;

    fn pool() -> AddressPool {
        AddressPool::new(&Pool4Config {
            prefixes: vec!["192.0.2.0/29".parse().unwrap()],
            port_range: (1024, 65535),
        })
    }

    fn src(port: u16) -> Ipv6TransportAddr {
        TransportAddr::new("2001:db8::1".parse().unwrap(), port)
    }

    fn session_for(bib: &BibHandle, protocol: L4Protocol, remote_port: u16) -> SessionEntry {
        let ipv6 = Ipv6Pair {
            local: TransportAddr::new("64:ff9b::93.184.216.34".parse().unwrap(), remote_port),
            remote: bib.ipv6,
        };
        let ipv4 = Ipv4Pair {
            local: bib.ipv4,
            remote: TransportAddr::new(Ipv4Addr::new(93, 184, 216, 34), remote_port),
        };
        SessionEntry::new(protocol, ipv6, ipv4, None, Instant::now())
    }

    #[test]
    fn test_bib_for_v6_reuses_entry() {
        let pool = pool();
        let mut tables = Tables::new();

        let first = tables.bib_for_v6(L4Protocol::Udp, &src(5000), &pool).unwrap();
        assert!(first.created);
        let second = tables.bib_for_v6(L4Protocol::Udp, &src(5000), &pool).unwrap();
        assert!(!second.created);
        assert_eq!(first.ipv4, second.ipv4);
        assert_eq!(pool.outstanding(L4Protocol::Udp), 1);
    }

    #[test]
    fn test_udp_allocation_only_mimics_udp() {
        let pool = pool();
        let mut tables = Tables::new();

        // A TCP binding on a non-default address.
        let tcp_addr = TransportAddr::new(Ipv4Addr::new(192, 0, 2, 5), 4000);
        pool.reserve(tcp_addr, L4Protocol::Tcp).unwrap();
        tables
            .bibs
            .get_mut(L4Protocol::Tcp)
            .create_and_insert(tcp_addr, src(4000), false)
            .unwrap();

        let udp = tables.bib_for_v6(L4Protocol::Udp, &src(5000), &pool).unwrap();
        assert_eq!(udp.ipv4.addr, Ipv4Addr::new(192, 0, 2, 1));

        let udp2 = tables.bib_for_v6(L4Protocol::Udp, &src(5002), &pool).unwrap();
        assert_eq!(udp2.ipv4, TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 5002));
    }

    #[test]
    fn test_digger_allocation_searches_all_protocols() {
        let pool = pool();
        let mut tables = Tables::new();

        let udp_addr = TransportAddr::new(Ipv4Addr::new(192, 0, 2, 5), 4000);
        pool.reserve(udp_addr, L4Protocol::Udp).unwrap();
        tables
            .bibs
            .get_mut(L4Protocol::Udp)
            .create_and_insert(udp_addr, src(4000), false)
            .unwrap();

        let icmp = tables.bib_for_v6(L4Protocol::Icmp, &src(77), &pool).unwrap();
        assert_eq!(icmp.ipv4.addr, Ipv4Addr::new(192, 0, 2, 5));

        let tcp = tables.bib_for_v6(L4Protocol::Tcp, &src(6000), &pool).unwrap();
        assert_eq!(tcp.ipv4.addr, Ipv4Addr::new(192, 0, 2, 5));
    }

    #[test]
    fn test_last_session_removes_dynamic_bib() {
        MockClock::set_time(Duration::ZERO);
        let pool = pool();
        let mut tables = Tables::new();

        let bib = tables.bib_for_v6(L4Protocol::Udp, &src(5000), &pool).unwrap();
        let first = session_for(&bib, L4Protocol::Udp, 80);
        let second = session_for(&bib, L4Protocol::Udp, 443);
        tables.add_session(first.clone()).unwrap();
        tables.add_session(second.clone()).unwrap();
        assert_eq!(tables.bib(L4Protocol::Udp).lookup_by_v6(&bib.ipv6).unwrap().session_count(), 2);

        tables.remove_session(L4Protocol::Udp, &first.ipv6, &pool).unwrap();
        assert!(tables.bib(L4Protocol::Udp).lookup_by_v6(&bib.ipv6).is_some());

        tables.remove_session(L4Protocol::Udp, &second.ipv6, &pool).unwrap();
        assert!(tables.bib(L4Protocol::Udp).is_empty());
        assert_eq!(pool.outstanding(L4Protocol::Udp), 0);
    }

    #[test]
    fn test_add_session_requires_bib() {
        MockClock::set_time(Duration::ZERO);
        let mut tables = Tables::new();
        let bib = BibHandle {
            ipv6: src(5000),
            ipv4: TransportAddr::new(Ipv4Addr::new(192, 0, 2, 1), 5000),
            created: false,
        };
        let err = tables
            .add_session(session_for(&bib, L4Protocol::Udp, 80))
            .unwrap_err();
        assert!(matches!(err, Nat64Error::UnknownFlow(_)));
        assert!(tables.sessions(L4Protocol::Udp).is_empty());
    }

    #[test]
    fn test_remove_bib_drops_sessions() {
        MockClock::set_time(Duration::ZERO);
        let pool = pool();
        let mut tables = Tables::new();

        let bib = tables.bib_for_v6(L4Protocol::Tcp, &src(5000), &pool).unwrap();
        tables
            .add_session(session_for(&bib, L4Protocol::Tcp, 80))
            .unwrap();

        let removed = tables.remove_bib(L4Protocol::Tcp, &bib.ipv6, &pool).unwrap();
        assert_eq!(removed.session_count(), 1);
        assert!(tables.sessions(L4Protocol::Tcp).is_empty());
        assert_eq!(pool.outstanding(L4Protocol::Tcp), 0);
    }

    #[test]
    fn test_session_allows_ignores_port() {
        MockClock::set_time(Duration::ZERO);
        let pool = pool();
        let mut tables = Tables::new();

        let bib = tables.bib_for_v6(L4Protocol::Udp, &src(5000), &pool).unwrap();
        assert!(!tables.session_allows(L4Protocol::Udp, &bib.ipv6, Ipv4Addr::new(93, 184, 216, 34)));

        tables
            .add_session(session_for(&bib, L4Protocol::Udp, 80))
            .unwrap();
        assert!(tables.session_allows(L4Protocol::Udp, &bib.ipv6, Ipv4Addr::new(93, 184, 216, 34)));
        assert!(!tables.session_allows(L4Protocol::Udp, &bib.ipv6, Ipv4Addr::new(198, 51, 100, 1)));
    }
}
