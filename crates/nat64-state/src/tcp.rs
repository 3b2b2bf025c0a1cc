//! TCP session state machine (RFC 6146 section 3.5.2.2).
//!
//! Pure functions over a session's state. Table updates and timer arming
//! are applied by the caller from the returned [`Transition`].

use crate::types::{L3Protocol, TcpFlags};
use std::fmt;

/// States a stored TCP session can be in.
///
/// CLOSED is not a variant: a closed connection is one with no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    V6Init,
    V4Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4FinV6FinRcv,
    Trans,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::V6Init => "V6_INIT",
            TcpState::V4Init => "V4_INIT",
            TcpState::Established => "ESTABLISHED",
            TcpState::V4FinRcv => "V4_FIN_RCV",
            TcpState::V6FinRcv => "V6_FIN_RCV",
            TcpState::V4FinV6FinRcv => "V4_FIN_V6_FIN_RCV",
            TcpState::Trans => "TRANS",
        };
        f.write_str(name)
    }
}

/// Which deadline, if any, a transition re-arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Leave `dying_time` alone.
    Keep,
    /// `now + tcp_est_timeout`.
    Established,
    /// `now + tcp_trans_timeout`.
    Transitory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: TcpState,
    pub timer: TimerAction,
}

impl Transition {
    fn to(next: TcpState, timer: TimerAction) -> Self {
        Self { next, timer }
    }

    fn stay(state: TcpState) -> Self {
        Self::to(state, TimerAction::Keep)
    }
}

/// State change caused by a packet arriving from `origin` with `flags` on a
/// session in `state`.
pub fn on_packet(state: TcpState, origin: L3Protocol, flags: TcpFlags) -> Transition {
    use L3Protocol::{Ipv4, Ipv6};
    use TimerAction::{Established, Transitory};

    match state {
        TcpState::V6Init => match (origin, flags.syn) {
            (Ipv4, true) => Transition::to(TcpState::Established, Established),
            (Ipv6, true) => Transition::to(TcpState::V6Init, Transitory),
            _ => Transition::stay(state),
        },
        TcpState::V4Init => match (origin, flags.syn) {
            (Ipv6, true) => Transition::to(TcpState::Established, Established),
            _ => Transition::stay(state),
        },
        TcpState::Established => {
            if flags.fin {
                let next = match origin {
                    Ipv4 => TcpState::V4FinRcv,
                    Ipv6 => TcpState::V6FinRcv,
                };
                Transition::stay(next)
            } else if flags.rst {
                Transition::to(TcpState::Trans, Transitory)
            } else {
                Transition::to(state, Established)
            }
        }
        TcpState::V4FinRcv => match (origin, flags.fin) {
            (Ipv6, true) => Transition::to(TcpState::V4FinV6FinRcv, Transitory),
            _ => Transition::to(state, Established),
        },
        TcpState::V6FinRcv => match (origin, flags.fin) {
            (Ipv4, true) => Transition::to(TcpState::V4FinV6FinRcv, Transitory),
            _ => Transition::to(state, Established),
        },
        // Only expiry moves a session out of here.
        TcpState::V4FinV6FinRcv => Transition::stay(state),
        TcpState::Trans => {
            if flags.rst {
                Transition::stay(state)
            } else {
                Transition::to(TcpState::Established, Established)
            }
        }
    }
}

/// What to do with a TCP session whose deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    Remove,
    /// Probe the IPv6 node, move to TRANS and re-arm the transitory timer.
    ProbeAndRenew,
}

pub fn on_expiry(state: TcpState) -> ExpiryAction {
    match state {
        TcpState::Established => ExpiryAction::ProbeAndRenew,
        // TODO: V4_INIT should answer the stored SYN with ICMP Port
        // Unreachable once simultaneous open is supported.
        TcpState::V4Init
        | TcpState::V6Init
        | TcpState::V4FinRcv
        | TcpState::V6FinRcv
        | TcpState::V4FinV6FinRcv
        | TcpState::Trans => ExpiryAction::Remove,
    }
}
