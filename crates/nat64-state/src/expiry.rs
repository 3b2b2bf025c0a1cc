//! Session expiry.
//!
//! Deadlines are only checked here; packet processing never removes a
//! session because its timer ran out.

use crate::clock::Instant;
use crate::config::FilteringConfig;
use crate::effect::TcpProbe;
use crate::filtering::FilteringEngine;
use crate::pool::{Pool4, Pool6};
use crate::session::SessionEntry;
use crate::tcp::{self, ExpiryAction, TcpState};
use crate::types::L4Protocol;
use log::{debug, error};

/// What became of an expired session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    Remove,
    /// The session was kept in TRANS; the probe asks the IPv6 node whether
    /// the connection is still alive.
    Renewed(TcpProbe),
}

/// Decide the fate of `session`, whose deadline has passed, updating it in
/// place when it survives.
pub fn session_expired(
    session: &mut SessionEntry,
    config: &FilteringConfig,
    now: Instant,
) -> ExpiryOutcome {
    if session.protocol != L4Protocol::Tcp {
        return ExpiryOutcome::Remove;
    }
    let Some(state) = session.state else {
        error!(
            "TCP session {} -> {} has no state, removing it",
            session.ipv6.remote, session.ipv6.local
        );
        return ExpiryOutcome::Remove;
    };

    match tcp::on_expiry(state) {
        ExpiryAction::Remove => ExpiryOutcome::Remove,
        ExpiryAction::ProbeAndRenew => {
            session.state = Some(TcpState::Trans);
            session.refresh(config.tcp_trans_timeout(), now);
            ExpiryOutcome::Renewed(TcpProbe::for_session(&session.ipv6))
        }
    }
}

impl<P4: Pool4, P6: Pool6> FilteringEngine<P4, P6> {
    /// Process every session whose deadline is at or before `now`.
    ///
    /// Returns the keepalive probes to send. They must be sent after this
    /// call returns, since the tables are locked while it runs.
    pub fn expire(&self, now: Instant) -> Vec<TcpProbe> {
        let mut tables = self.lock_tables();
        let config = self.config.snapshot();
        let mut probes = Vec::new();
        let mut removed = 0usize;

        for protocol in L4Protocol::ALL {
            for key in tables.sessions(protocol).expired(now) {
                let outcome = match tables.sessions_mut(protocol).get_mut(&key) {
                    Some(session) => session_expired(session, &config, now),
                    // Already gone with its BIB entry.
                    None => continue,
                };
                match outcome {
                    ExpiryOutcome::Remove => {
                        if tables.remove_session(protocol, &key, &self.pool4).is_some() {
                            removed += 1;
                        }
                    }
                    ExpiryOutcome::Renewed(probe) => probes.push(probe),
                }
            }
        }

        if removed > 0 || !probes.is_empty() {
            debug!(
                "Expiry pass: {} sessions removed, {} probes queued",
                removed,
                probes.len()
            );
        }
        probes
    }
}
