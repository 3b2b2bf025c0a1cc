//! Verdicts and the I/O the engine asks its caller to perform.
//!
//! The engine never sends anything itself. Every packet-processing call
//! returns a [`Decision`]; whatever it carries in [`Effect`] is executed by the
//! caller once the table lock is gone.

use crate::types::{Ipv6Pair, Ipv6TransportAddr, Packet};

/// What to do with the packet that was just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the packet on to header translation.
    Continue,
    Drop,
}

/// ICMP errors the engine may ask for. Each one refers to the packet that
/// caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// ICMPv6 Destination Unreachable, code 3.
    Icmpv6AddressUnreachable,
    /// ICMPv4 Destination Unreachable, code 1.
    Icmpv4HostUnreachable,
    /// ICMPv4 Destination Unreachable, code 13 (communication administratively
    /// prohibited).
    Icmpv4PacketFiltered,
}

impl IcmpError {
    /// `(type, code)` as written on the wire.
    pub fn type_code(&self) -> (u8, u8) {
        match self {
            IcmpError::Icmpv6AddressUnreachable => (1, 3),
            IcmpError::Icmpv4HostUnreachable => (3, 1),
            IcmpError::Icmpv4PacketFiltered => (3, 13),
        }
    }
}

/// An empty TCP ACK sent toward the IPv6 node of an idle ESTABLISHED session.
///
/// A live peer answers, which refreshes the session; a dead one does not, and
/// the session expires from the TRANS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpProbe {
    /// Source of the probe (the IPv4 node as seen on the IPv6 side).
    pub src: Ipv6TransportAddr,
    /// The IPv6 node.
    pub dst: Ipv6TransportAddr,
}

impl TcpProbe {
    pub const SEQ: u32 = 0;
    pub const ACK: u32 = 0;
    pub const WINDOW: u16 = 8192;
    pub const HOP_LIMIT: u8 = 255;

    pub fn for_session(ipv6: &Ipv6Pair) -> Self {
        Self {
            src: ipv6.local,
            dst: ipv6.remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Answer `packet` with `error`.
    SendIcmpError { error: IcmpError, packet: Packet },
    SendTcpProbe(TcpProbe),
}

/// Result of processing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub effect: Effect,
}

impl Decision {
    pub const CONTINUE: Decision = Decision {
        verdict: Verdict::Continue,
        effect: Effect::None,
    };

    pub const DROP: Decision = Decision {
        verdict: Verdict::Drop,
        effect: Effect::None,
    };

    /// Drop `packet` and answer it with an ICMP error.
    pub fn reject(error: IcmpError, packet: Packet) -> Self {
        Self {
            verdict: Verdict::Drop,
            effect: Effect::SendIcmpError { error, packet },
        }
    }

    pub fn is_continue(&self) -> bool {
        self.verdict == Verdict::Continue
    }
}

/// Performs the I/O requested through [`Effect`]s.
pub trait EffectSink: Send + Sync {
    fn send_icmp_error(&self, packet: &Packet, error: IcmpError);

    fn send_tcp_probe(&self, probe: &TcpProbe);

    /// Execute `effect`.
    fn apply(&self, effect: &Effect) {
        match effect {
            Effect::None => {}
            Effect::SendIcmpError { error, packet } => self.send_icmp_error(packet, *error),
            Effect::SendTcpProbe(probe) => self.send_tcp_probe(probe),
        }
    }
}

/// Sink that only logs. Useful when no packet writer is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EffectSink for LogSink {
    fn send_icmp_error(&self, packet: &Packet, error: IcmpError) {
        log::debug!("Would send {:?} in reply to {}", error, packet.tuple);
    }

    fn send_tcp_probe(&self, probe: &TcpProbe) {
        log::debug!(
            "Would send TCP probe {} -> {} (ACK seq {} ack {} window {} hop limit {})",
            probe.src,
            probe.dst,
            TcpProbe::SEQ,
            TcpProbe::ACK,
            TcpProbe::WINDOW,
            TcpProbe::HOP_LIMIT
        );
    }
}
