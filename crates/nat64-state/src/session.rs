//! Session table.

use crate::clock::{self, Instant};
use crate::error::{Nat64Error, Nat64Result};
use crate::tcp::TcpState;
use crate::types::{Ipv4Pair, Ipv6Pair, Ipv6TransportAddr, L4Protocol};
use std::collections::HashMap;
use std::time::Duration;

/// One tracked flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub protocol: L4Protocol,
    pub ipv6: Ipv6Pair,
    pub ipv4: Ipv4Pair,
    /// `Some` exactly when `protocol` is TCP.
    pub state: Option<TcpState>,
    pub dying_time: Instant,
    /// Key of the owning BIB entry.
    pub bib: Ipv6TransportAddr,
}

impl SessionEntry {
    pub fn new(
        protocol: L4Protocol,
        ipv6: Ipv6Pair,
        ipv4: Ipv4Pair,
        state: Option<TcpState>,
        dying_time: Instant,
    ) -> Self {
        Self {
            protocol,
            ipv6,
            ipv4,
            state,
            dying_time,
            bib: ipv6.remote,
        }
    }

    /// Push the deadline to `now + timeout`.
    pub fn refresh(&mut self, timeout: Duration, now: Instant) {
        self.dying_time = clock::deadline(now, timeout);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.dying_time <= now
    }
}

/// Sessions of one protocol, indexed by both pairs.
#[derive(Debug)]
pub struct SessionTable {
    protocol: L4Protocol,
    by_v6: HashMap<Ipv6Pair, SessionEntry>,
    by_v4: HashMap<Ipv4Pair, Ipv6Pair>,
}

impl SessionTable {
    pub fn new(protocol: L4Protocol) -> Self {
        Self {
            protocol,
            by_v6: HashMap::new(),
            by_v4: HashMap::new(),
        }
    }

    pub fn lookup_v6(&self, pair: &Ipv6Pair) -> Option<&SessionEntry> {
        self.by_v6.get(pair)
    }

    pub fn lookup_v4(&self, pair: &Ipv4Pair) -> Option<&SessionEntry> {
        self.by_v4.get(pair).and_then(|key| self.by_v6.get(key))
    }

    pub fn get_mut(&mut self, pair: &Ipv6Pair) -> Option<&mut SessionEntry> {
        self.by_v6.get_mut(pair)
    }

    pub fn get_mut_v4(&mut self, pair: &Ipv4Pair) -> Option<&mut SessionEntry> {
        let key = self.by_v4.get(pair)?;
        self.by_v6.get_mut(key)
    }

    /// Add a session. Fails if either pair is already tracked.
    pub fn add(&mut self, entry: SessionEntry) -> Nat64Result<()> {
        if self.by_v6.contains_key(&entry.ipv6) || self.by_v4.contains_key(&entry.ipv4) {
            return Err(Nat64Error::DuplicateEntry(format!(
                "{} session {} -> {} / {} -> {}",
                self.protocol,
                entry.ipv6.remote,
                entry.ipv6.local,
                entry.ipv4.local,
                entry.ipv4.remote
            )));
        }
        self.by_v4.insert(entry.ipv4, entry.ipv6);
        self.by_v6.insert(entry.ipv6, entry);
        Ok(())
    }

    pub fn remove(&mut self, pair: &Ipv6Pair) -> Option<SessionEntry> {
        let entry = self.by_v6.remove(pair)?;
        self.by_v4.remove(&entry.ipv4);
        Some(entry)
    }

    /// Keys of the sessions whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<Ipv6Pair> {
        self.by_v6
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.ipv6)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_v6.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionEntry> {
        self.by_v6.values()
    }
}
