//! Filtering and updating (RFC 6146 section 3.5).
//!
//! [`FilteringEngine::process`] is called once per classified packet. It
//! decides whether the packet may pass, creating or refreshing BIB and
//! session entries on the way. All table work for one packet happens under
//! a single lock; any ICMP error the packet earns is returned as an
//! [`Effect`](crate::effect::Effect) and sent by the caller after the lock is released.

use crate::bib::BibEntry;
use crate::clock::{self, Instant};
use crate::config::{ConfigHandle, FilteringConfig, Nat64Config};
use crate::effect::{Decision, EffectSink, IcmpError, Verdict};
use crate::error::{Nat64Error, Nat64Result};
use crate::pool::{AddressPool, Pool4, Pool6, Rfc6052Prefix};
use crate::session::SessionEntry;
use crate::tables::{BibHandle, Tables};
use crate::tcp::{self, TcpState, TimerAction};
use crate::types::{
    FlowTuple, Ipv4Pair, Ipv4TransportAddr, Ipv6Pair, Ipv6TransportAddr, L4Protocol, Packet,
    TransportAddr, Tuple,
};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Stateful NAT64 core: BIB, sessions, policy and pools.
pub struct FilteringEngine<P4 = AddressPool, P6 = Rfc6052Prefix> {
    pub(crate) tables: Mutex<Tables>,
    pub(crate) config: ConfigHandle,
    pub(crate) pool4: P4,
    pub(crate) pool6: P6,
}

impl FilteringEngine {
    /// Build an engine from a validated configuration, installing its static
    /// BIB entries.
    pub fn from_config(config: &Nat64Config) -> Nat64Result<Self> {
        config.validate()?;

        let engine = Self::new(
            config.filtering,
            AddressPool::new(&config.pool4),
            Rfc6052Prefix::from_config(&config.pool6)?,
        );

        for entry in &config.static_bib {
            engine
                .add_static_bib(entry.protocol, entry.ipv6_transport(), entry.ipv4_transport())
                .map_err(|e| {
                    Nat64Error::config_with_source(
                        format!(
                            "[static_bib] Cannot install {} {} <-> {}",
                            entry.protocol, entry.ipv6, entry.ipv4
                        ),
                        e,
                    )
                })?;
        }

        Ok(engine)
    }
}

impl<P4: Pool4, P6: Pool6> FilteringEngine<P4, P6> {
    pub fn new(filtering: FilteringConfig, pool4: P4, pool6: P6) -> Self {
        Self {
            tables: Mutex::new(Tables::new()),
            config: ConfigHandle::new(filtering),
            pool4,
            pool6,
        }
    }

    /// Live filtering policy.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn pool4(&self) -> &P4 {
        &self.pool4
    }

    pub fn pool6(&self) -> &P6 {
        &self.pool6
    }

    pub(crate) fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filter and update the tables for one packet.
    pub fn process(&self, packet: &Packet) -> Decision {
        if packet.icmp_error {
            log::debug!("ICMP error {} skips filtering", packet.tuple);
            return Decision::CONTINUE;
        }
        if !self.passes_pools(&packet.tuple) {
            return Decision::DROP;
        }

        let mut tables = self.lock_tables();
        let mut step = Step {
            packet: *packet,
            tables: &mut *tables,
            config: self.config.snapshot(),
            pool4: &self.pool4,
            pool6: &self.pool6,
            now: Instant::now(),
        };
        step.dispatch(packet)
    }

    /// [`process`](Self::process) the packet, then perform its effect.
    pub fn process_and_apply(&self, packet: &Packet, sink: &dyn EffectSink) -> Verdict {
        let decision = self.process(packet);
        sink.apply(&decision.effect);
        decision.verdict
    }

    /// Reject packets that cannot belong to this translator.
    fn passes_pools(&self, tuple: &FlowTuple) -> bool {
        match tuple {
            FlowTuple::V6(t) => {
                if self.pool6.contains(&t.src.addr) {
                    log::info!("Hairpinning loop prevented: source {} is inside pool6", t.src);
                    return false;
                }
                if !self.pool6.contains(&t.dst.addr) {
                    log::info!("Destination {} is not inside pool6", t.dst);
                    return false;
                }
                true
            }
            FlowTuple::V4(t) => {
                if !self.pool4.contains(t.dst.addr) {
                    log::info!("Destination {} is not inside pool4", t.dst);
                    return false;
                }
                true
            }
        }
    }

    /// Install an operator-defined binding.
    ///
    /// The IPv4 transport address is reserved in the pool so it is never
    /// handed out dynamically.
    pub fn add_static_bib(
        &self,
        protocol: L4Protocol,
        ipv6: Ipv6TransportAddr,
        ipv4: Ipv4TransportAddr,
    ) -> Nat64Result<()> {
        let mut tables = self.lock_tables();
        let bib = tables.bib(protocol);
        if bib.lookup_by_v6(&ipv6).is_some() || bib.lookup_by_v4(&ipv4).is_some() {
            return Err(Nat64Error::DuplicateEntry(format!(
                "{} BIB entry {} <-> {}",
                protocol, ipv6, ipv4
            )));
        }

        self.pool4.reserve(ipv4, protocol)?;
        if let Err(e) = tables.bib_mut(protocol).create_and_insert(ipv4, ipv6, true) {
            self.pool4.give_back(ipv4, protocol);
            return Err(e);
        }

        log::info!("Added static {} BIB entry {} <-> {}", protocol, ipv6, ipv4);
        Ok(())
    }

    /// Remove a static binding together with its sessions.
    pub fn remove_static_bib(
        &self,
        protocol: L4Protocol,
        ipv6: &Ipv6TransportAddr,
    ) -> Nat64Result<BibEntry> {
        let mut tables = self.lock_tables();
        match tables.bib(protocol).lookup_by_v6(ipv6) {
            Some(entry) if entry.is_static => {}
            _ => {
                return Err(Nat64Error::UnknownFlow(format!(
                    "no static {} BIB entry for {}",
                    protocol, ipv6
                )))
            }
        }

        let entry = tables
            .remove_bib(protocol, ipv6, &self.pool4)
            .ok_or_else(|| Nat64Error::UnknownFlow(format!("{} BIB entry {}", protocol, ipv6)))?;
        self.pool4.give_back(entry.ipv4, protocol);

        log::info!(
            "Removed static {} BIB entry {} <-> {} ({} sessions)",
            protocol,
            entry.ipv6,
            entry.ipv4,
            entry.session_count()
        );
        Ok(entry)
    }

    /// Copy of every BIB entry of `protocol`.
    pub fn bib_entries(&self, protocol: L4Protocol) -> Vec<BibEntry> {
        self.lock_tables().bib(protocol).iter().cloned().collect()
    }

    /// Copy of every session of `protocol`.
    pub fn sessions(&self, protocol: L4Protocol) -> Vec<SessionEntry> {
        self.lock_tables().sessions(protocol).iter().cloned().collect()
    }

    pub fn bib_count(&self, protocol: L4Protocol) -> usize {
        self.lock_tables().bib(protocol).len()
    }

    pub fn session_count(&self, protocol: L4Protocol) -> usize {
        self.lock_tables().sessions(protocol).len()
    }

    /// The session an IPv6 packet with this tuple would belong to.
    pub fn session_by_v6(&self, protocol: L4Protocol, pair: &Ipv6Pair) -> Option<SessionEntry> {
        self.lock_tables().sessions(protocol).lookup_v6(pair).cloned()
    }

    /// The session an IPv4 packet with this tuple would belong to.
    pub fn session_by_v4(&self, protocol: L4Protocol, pair: &Ipv4Pair) -> Option<SessionEntry> {
        self.lock_tables().sessions(protocol).lookup_v4(pair).cloned()
    }
}

/// One packet's view of the engine while the table lock is held.
struct Step<'a, P4, P6> {
    packet: Packet,
    tables: &'a mut Tables,
    config: FilteringConfig,
    pool4: &'a P4,
    pool6: &'a P6,
    now: Instant,
}

impl<P4: Pool4, P6: Pool6> Step<'_, P4, P6> {
    fn reject(&self, error: IcmpError) -> Decision {
        Decision::reject(error, self.packet)
    }

    fn dispatch(&mut self, packet: &Packet) -> Decision {
        match (&packet.tuple, packet.l4()) {
            (FlowTuple::V6(t), L4Protocol::Udp) => self.query_from_v6(t),
            (FlowTuple::V4(t), L4Protocol::Udp) => self.query_from_v4(t),
            (FlowTuple::V6(t), L4Protocol::Icmp) => {
                if self.config.filter_icmpv6_info {
                    log::info!("Filtering informational ICMPv6 {}", packet.tuple);
                    return Decision::DROP;
                }
                self.query_from_v6(t)
            }
            (FlowTuple::V4(t), L4Protocol::Icmp) => self.query_from_v4(t),
            (_, L4Protocol::Tcp) => self.tcp(packet),
        }
    }

    fn query_timeout(&self, protocol: L4Protocol) -> Duration {
        match protocol {
            L4Protocol::Icmp => self.config.icmp_timeout(),
            _ => self.config.udp_timeout(),
        }
    }

    /// UDP or ICMP query from the IPv6 side.
    fn query_from_v6(&mut self, t: &Tuple<Ipv6Addr>) -> Decision {
        let protocol = t.protocol;
        let timeout = self.query_timeout(protocol);

        let bib = match self.tables.bib_for_v6(protocol, &t.src, self.pool4) {
            Ok(bib) => bib,
            Err(e) => {
                log::warn!("Cannot bind {} {}: {}", protocol, t.src, e);
                return self.reject(IcmpError::Icmpv6AddressUnreachable);
            }
        };

        if let Some(session) = self.tables.sessions_mut(protocol).get_mut(&t.pair()) {
            session.refresh(timeout, self.now);
            return Decision::CONTINUE;
        }

        match self.create_from_v6(t, &bib, None, timeout) {
            Ok(()) => Decision::CONTINUE,
            Err(e) => {
                log::error!("Cannot create {} session for {}: {}", protocol, t.src, e);
                self.rollback(protocol, &bib);
                self.reject(IcmpError::Icmpv6AddressUnreachable)
            }
        }
    }

    /// UDP or ICMP query from the IPv4 side.
    fn query_from_v4(&mut self, t: &Tuple<Ipv4Addr>) -> Decision {
        let protocol = t.protocol;
        let timeout = self.query_timeout(protocol);

        let Some(bib) = self.tables.bib(protocol).lookup_by_v4(&t.dst).map(BibHandle::existing)
        else {
            log::warn!("No {} BIB entry for {}", protocol, t.dst);
            return self.reject(IcmpError::Icmpv4HostUnreachable);
        };

        if self.config.drop_by_addr && !self.tables.session_allows(protocol, &bib.ipv6, t.src.addr) {
            log::info!(
                "{} from {} blocked by address-dependent filtering",
                protocol,
                t.src
            );
            return self.reject(IcmpError::Icmpv4PacketFiltered);
        }

        if let Some(session) = self.tables.sessions_mut(protocol).get_mut_v4(&t.pair()) {
            session.refresh(timeout, self.now);
            return Decision::CONTINUE;
        }

        match self.create_from_v4(t, &bib, None, timeout) {
            Ok(()) => Decision::CONTINUE,
            Err(e) => {
                log::error!("Cannot create {} session for {}: {}", protocol, t.src, e);
                self.reject(IcmpError::Icmpv4HostUnreachable)
            }
        }
    }

    fn tcp(&mut self, packet: &Packet) -> Decision {
        let sessions = self.tables.sessions(L4Protocol::Tcp);
        let found = match &packet.tuple {
            FlowTuple::V6(t) => sessions.lookup_v6(&t.pair()),
            FlowTuple::V4(t) => sessions.lookup_v4(&t.pair()),
        }
        .map(|session| (session.ipv6, session.state));

        match found {
            None => self.tcp_closed(packet),
            Some((key, Some(state))) => {
                self.tcp_transition(&key, state, packet);
                Decision::CONTINUE
            }
            Some((key, None)) => {
                let err = Nat64Error::InvalidState(format!(
                    "TCP session {} -> {} has no state",
                    key.remote, key.local
                ));
                log::error!("{}; removing it", err);
                self.tables.remove_session(L4Protocol::Tcp, &key, self.pool4);
                Decision::DROP
            }
        }
    }

    fn tcp_transition(&mut self, key: &Ipv6Pair, state: TcpState, packet: &Packet) {
        let transition = tcp::on_packet(state, packet.l3(), packet.tcp_flags);
        let timeout = match transition.timer {
            TimerAction::Keep => None,
            TimerAction::Established => Some(self.config.tcp_est_timeout()),
            TimerAction::Transitory => Some(self.config.tcp_trans_timeout()),
        };

        let now = self.now;
        if let Some(session) = self.tables.sessions_mut(L4Protocol::Tcp).get_mut(key) {
            session.state = Some(transition.next);
            if let Some(timeout) = timeout {
                session.refresh(timeout, now);
            }
        }

        if transition.next != state {
            log::debug!(
                "TCP {} -> {}: {} -> {}",
                key.remote,
                key.local,
                state,
                transition.next
            );
        }
    }

    /// TCP packet with no session.
    fn tcp_closed(&mut self, packet: &Packet) -> Decision {
        let bib = self.tables.bib(L4Protocol::Tcp);
        match &packet.tuple {
            FlowTuple::V6(t) => {
                if packet.tcp_flags.syn {
                    return self.tcp_v6_syn(t);
                }
                if bib.lookup_by_v6(&t.src).is_some() {
                    return Decision::CONTINUE;
                }
                log::warn!("No TCP BIB entry for {}", t.src);
                Decision::DROP
            }
            FlowTuple::V4(t) => {
                if packet.tcp_flags.syn {
                    return self.tcp_v4_syn(t);
                }
                if bib.lookup_by_v4(&t.dst).is_some() {
                    return Decision::CONTINUE;
                }
                log::warn!("No TCP BIB entry for {}", t.dst);
                Decision::DROP
            }
        }
    }

    fn tcp_v6_syn(&mut self, t: &Tuple<Ipv6Addr>) -> Decision {
        let bib = match self.tables.bib_for_v6(L4Protocol::Tcp, &t.src, self.pool4) {
            Ok(bib) => bib,
            Err(e) => {
                log::warn!("Cannot bind TCP {}: {}", t.src, e);
                return self.reject(IcmpError::Icmpv6AddressUnreachable);
            }
        };

        let timeout = self.config.tcp_trans_timeout();
        match self.create_from_v6(t, &bib, Some(TcpState::V6Init), timeout) {
            Ok(()) => Decision::CONTINUE,
            Err(e) => {
                log::error!("Cannot create TCP session for {}: {}", t.src, e);
                self.rollback(L4Protocol::Tcp, &bib);
                self.reject(IcmpError::Icmpv6AddressUnreachable)
            }
        }
    }

    fn tcp_v4_syn(&mut self, t: &Tuple<Ipv4Addr>) -> Decision {
        if self.config.drop_externally_initiated_tcp {
            log::info!("Externally initiated TCP connection from {} dropped", t.src);
            return Decision::DROP;
        }

        let Some(bib) = self
            .tables
            .bib(L4Protocol::Tcp)
            .lookup_by_v4(&t.dst)
            .map(BibHandle::existing)
        else {
            // Storing the SYN for simultaneous open is not supported.
            log::warn!(
                "No TCP BIB entry for {}; cannot accept connection from {}",
                t.dst,
                t.src
            );
            return self.reject(IcmpError::Icmpv4HostUnreachable);
        };

        let timeout = if self.config.drop_by_addr {
            self.config.tcp_incoming_syn_timeout()
        } else {
            self.config.tcp_trans_timeout()
        };
        match self.create_from_v4(t, &bib, Some(TcpState::V4Init), timeout) {
            Ok(()) => Decision::CONTINUE,
            Err(e) => {
                log::error!("Cannot create TCP session for {}: {}", t.src, e);
                self.reject(IcmpError::Icmpv4HostUnreachable)
            }
        }
    }

    /// Session for a packet from the IPv6 node `t.src` to `t.dst`.
    fn create_from_v6(
        &mut self,
        t: &Tuple<Ipv6Addr>,
        bib: &BibHandle,
        state: Option<TcpState>,
        timeout: Duration,
    ) -> Nat64Result<()> {
        let remote = self.pool6.translate_6to4(&t.dst.addr)?;
        let remote_id = match t.protocol {
            L4Protocol::Icmp => bib.ipv4.id,
            _ => t.dst.id,
        };
        let ipv4 = Ipv4Pair {
            local: bib.ipv4,
            remote: TransportAddr::new(remote, remote_id),
        };
        self.insert(SessionEntry::new(
            t.protocol,
            t.pair(),
            ipv4,
            state,
            clock::deadline(self.now, timeout),
        ))
    }

    /// Session for a packet from the IPv4 node `t.src` to the binding at
    /// `t.dst`.
    fn create_from_v4(
        &mut self,
        t: &Tuple<Ipv4Addr>,
        bib: &BibHandle,
        state: Option<TcpState>,
        timeout: Duration,
    ) -> Nat64Result<()> {
        let local = self.pool6.translate_4to6(&t.src.addr)?;
        let local_id = match t.protocol {
            L4Protocol::Icmp => bib.ipv6.id,
            _ => t.src.id,
        };
        let ipv6 = Ipv6Pair {
            local: TransportAddr::new(local, local_id),
            remote: bib.ipv6,
        };
        self.insert(SessionEntry::new(
            t.protocol,
            ipv6,
            t.pair(),
            state,
            clock::deadline(self.now, timeout),
        ))
    }

    /// Add a session. A duplicate is resolved in favour of the stored entry.
    fn insert(&mut self, session: SessionEntry) -> Nat64Result<()> {
        let protocol = session.protocol;
        let key = session.ipv6;
        let dying_time = session.dying_time;

        match self.tables.add_session(session) {
            Err(Nat64Error::DuplicateEntry(what)) => {
                log::error!("Duplicate {}; keeping the stored entry", what);
                match self.tables.sessions_mut(protocol).get_mut(&key) {
                    Some(existing) => {
                        existing.dying_time = dying_time;
                        Ok(())
                    }
                    None => Err(Nat64Error::DuplicateEntry(what)),
                }
            }
            other => other,
        }
    }

    /// Undo a BIB entry created for a session that could not be added.
    fn rollback(&mut self, protocol: L4Protocol, bib: &BibHandle) {
        if bib.created {
            self.tables.remove_bib(protocol, &bib.ipv6, self.pool4);
            log::debug!("Rolled back {} BIB entry {} <-> {}", protocol, bib.ipv6, bib.ipv4);
        }
    }
}
