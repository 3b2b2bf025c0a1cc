//! Binding Information Base.
//!
//! One [`BibTable`] per transport protocol maps IPv6 transport addresses to
//! borrowed IPv4 transport addresses, 1:1 in both directions. Entries remember
//! the IPv6 pairs of their sessions so the last removal can be detected.

use crate::error::{Nat64Error, Nat64Result};
use crate::types::{Ipv4TransportAddr, Ipv6Pair, Ipv6TransportAddr, L4Protocol};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv6Addr;

/// A single binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BibEntry {
    pub protocol: L4Protocol,
    pub ipv6: Ipv6TransportAddr,
    pub ipv4: Ipv4TransportAddr,
    /// Installed by the operator; survives losing its last session.
    pub is_static: bool,
    /// Keys of the sessions using this binding. Non-owning.
    sessions: HashSet<Ipv6Pair>,
}

impl BibEntry {
    fn new(
        protocol: L4Protocol,
        ipv6: Ipv6TransportAddr,
        ipv4: Ipv4TransportAddr,
        is_static: bool,
    ) -> Self {
        Self {
            protocol,
            ipv6,
            ipv4,
            is_static,
            sessions: HashSet::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Ipv6Pair> {
        self.sessions.iter()
    }
}

/// BIB for one protocol.
#[derive(Debug)]
pub struct BibTable {
    protocol: L4Protocol,
    by_v6: HashMap<Ipv6TransportAddr, BibEntry>,
    by_v4: HashMap<Ipv4TransportAddr, Ipv6TransportAddr>,
    /// Ports in use per IPv6 host, for address selection.
    by_host: HashMap<Ipv6Addr, BTreeSet<u16>>,
}

impl BibTable {
    pub fn new(protocol: L4Protocol) -> Self {
        Self {
            protocol,
            by_v6: HashMap::new(),
            by_v4: HashMap::new(),
            by_host: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> L4Protocol {
        self.protocol
    }

    pub fn lookup_by_v6(&self, addr: &Ipv6TransportAddr) -> Option<&BibEntry> {
        self.by_v6.get(addr)
    }

    pub fn lookup_by_v4(&self, addr: &Ipv4TransportAddr) -> Option<&BibEntry> {
        self.by_v4.get(addr).and_then(|key| self.by_v6.get(key))
    }

    /// Any binding of `host`, whatever its port. The lowest port wins.
    pub fn lookup_by_host(&self, host: &Ipv6Addr) -> Option<&BibEntry> {
        let port = self.by_host.get(host)?.iter().next()?;
        self.by_v6.get(&Ipv6TransportAddr::new(*host, *port))
    }

    /// Insert a new binding.
    ///
    /// Fails with [`Nat64Error::DuplicateEntry`] if either address is already
    /// bound; the table is left untouched in that case.
    pub fn create_and_insert(
        &mut self,
        ipv4: Ipv4TransportAddr,
        ipv6: Ipv6TransportAddr,
        is_static: bool,
    ) -> Nat64Result<&BibEntry> {
        if self.by_v6.contains_key(&ipv6) {
            return Err(Nat64Error::DuplicateEntry(format!(
                "{} BIB entry for {}",
                self.protocol, ipv6
            )));
        }
        if self.by_v4.contains_key(&ipv4) {
            return Err(Nat64Error::DuplicateEntry(format!(
                "{} BIB entry for {}",
                self.protocol, ipv4
            )));
        }

        let protocol = self.protocol;
        self.by_v4.insert(ipv4, ipv6);
        self.by_host.entry(ipv6.addr).or_default().insert(ipv6.id);
        let entry = self
            .by_v6
            .entry(ipv6)
            .or_insert_with(|| BibEntry::new(protocol, ipv6, ipv4, is_static));
        Ok(entry)
    }

    /// Remove a binding. Returning its IPv4 address to the pool is up to the
    /// caller.
    pub fn remove(&mut self, ipv6: &Ipv6TransportAddr) -> Option<BibEntry> {
        let entry = self.by_v6.remove(ipv6)?;
        self.by_v4.remove(&entry.ipv4);
        if let Some(ports) = self.by_host.get_mut(&ipv6.addr) {
            ports.remove(&ipv6.id);
            if ports.is_empty() {
                self.by_host.remove(&ipv6.addr);
            }
        }
        Some(entry)
    }

    pub(crate) fn link_session(&mut self, bib: &Ipv6TransportAddr, session: Ipv6Pair) -> bool {
        match self.by_v6.get_mut(bib) {
            Some(entry) => entry.sessions.insert(session),
            None => false,
        }
    }

    /// Detach a session. Returns the entry if it is now orphaned and dynamic.
    pub(crate) fn unlink_session(
        &mut self,
        bib: &Ipv6TransportAddr,
        session: &Ipv6Pair,
    ) -> Option<&BibEntry> {
        let entry = self.by_v6.get_mut(bib)?;
        entry.sessions.remove(session);
        if entry.sessions.is_empty() && !entry.is_static {
            Some(&*entry)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.by_v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_v6.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BibEntry> {
        self.by_v6.values()
    }
}
