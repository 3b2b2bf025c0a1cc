//! Flow descriptors handed to the filtering engine.
//!
//! A packet reaches this crate already classified into a 5-tuple plus the few
//! header bits the state machine needs (TCP flags, whether an ICMP message is
//! an error). Nothing here touches wire bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// Network-layer protocol a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Protocol {
    Ipv6,
    Ipv4,
}

impl fmt::Display for L3Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L3Protocol::Ipv6 => f.write_str("IPv6"),
            L3Protocol::Ipv4 => f.write_str("IPv4"),
        }
    }
}

/// Transport protocol tracked by the BIB and session tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl L4Protocol {
    /// Every tracked protocol, in the order BIBs are searched when picking
    /// an IPv4 address for a new TCP or ICMP binding.
    pub const ALL: [L4Protocol; 3] = [L4Protocol::Tcp, L4Protocol::Udp, L4Protocol::Icmp];

    pub fn as_str(&self) -> &'static str {
        match self {
            L4Protocol::Tcp => "TCP",
            L4Protocol::Udp => "UDP",
            L4Protocol::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address plus a port, or an ICMP query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddr<A> {
    pub addr: A,
    /// Port (TCP/UDP) or ICMP identifier.
    pub id: u16,
}

pub type Ipv4TransportAddr = TransportAddr<Ipv4Addr>;
pub type Ipv6TransportAddr = TransportAddr<Ipv6Addr>;

impl<A> TransportAddr<A> {
    pub fn new(addr: A, id: u16) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for Ipv4TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.id)
    }
}

impl fmt::Display for Ipv6TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.id)
    }
}

impl From<SocketAddrV4> for Ipv4TransportAddr {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

impl From<SocketAddrV6> for Ipv6TransportAddr {
    fn from(sa: SocketAddrV6) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

/// The two ends of a flow as seen from one side of the translator.
///
/// `local` is the translator-facing end (the packet destination on the way
/// in), `remote` the node on that network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pair<A> {
    pub local: TransportAddr<A>,
    pub remote: TransportAddr<A>,
}

pub type Ipv4Pair = Pair<Ipv4Addr>;
pub type Ipv6Pair = Pair<Ipv6Addr>;

/// Source, destination and transport protocol of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple<A> {
    pub src: TransportAddr<A>,
    pub dst: TransportAddr<A>,
    pub protocol: L4Protocol,
}

impl<A: Copy> Tuple<A> {
    /// The session-table pair this packet belongs to.
    pub fn pair(&self) -> Pair<A> {
        Pair {
            local: self.dst,
            remote: self.src,
        }
    }
}

/// A classified tuple from either network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowTuple {
    V6(Tuple<Ipv6Addr>),
    V4(Tuple<Ipv4Addr>),
}

impl FlowTuple {
    pub fn l3(&self) -> L3Protocol {
        match self {
            FlowTuple::V6(_) => L3Protocol::Ipv6,
            FlowTuple::V4(_) => L3Protocol::Ipv4,
        }
    }

    pub fn l4(&self) -> L4Protocol {
        match self {
            FlowTuple::V6(t) => t.protocol,
            FlowTuple::V4(t) => t.protocol,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowTuple::V6(t) => write!(f, "{} {} -> {}", t.protocol, t.src, t.dst),
            FlowTuple::V4(t) => write!(f, "{} {} -> {}", t.protocol, t.src, t.dst),
        }
    }
}

/// The TCP header flags the state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags {
        syn: false,
        fin: false,
        rst: false,
    };
    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        fin: false,
        rst: false,
    };
    pub const FIN: TcpFlags = TcpFlags {
        syn: false,
        fin: true,
        rst: false,
    };
    pub const RST: TcpFlags = TcpFlags {
        syn: false,
        fin: false,
        rst: true,
    };
}

/// A packet as seen by the filtering engine.
///
/// The caller keeps the original bytes; they are only needed again if the
/// engine asks for an ICMP error to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub tuple: FlowTuple,
    /// Only meaningful when the transport protocol is TCP.
    pub tcp_flags: TcpFlags,
    /// ICMP error messages never touch the tables.
    pub icmp_error: bool,
}

impl Packet {
    /// A TCP or UDP packet that arrived on the IPv6 side.
    pub fn v6(protocol: L4Protocol, src: Ipv6TransportAddr, dst: Ipv6TransportAddr) -> Self {
        Self::from_tuple(FlowTuple::V6(Tuple { src, dst, protocol }))
    }

    /// A TCP or UDP packet that arrived on the IPv4 side.
    pub fn v4(protocol: L4Protocol, src: Ipv4TransportAddr, dst: Ipv4TransportAddr) -> Self {
        Self::from_tuple(FlowTuple::V4(Tuple { src, dst, protocol }))
    }

    /// An ICMPv6 query (echo request/reply) keyed by its identifier.
    pub fn icmp6(src: Ipv6Addr, dst: Ipv6Addr, id: u16) -> Self {
        Self::v6(
            L4Protocol::Icmp,
            TransportAddr::new(src, id),
            TransportAddr::new(dst, id),
        )
    }

    /// An ICMPv4 query (echo request/reply) keyed by its identifier.
    pub fn icmp4(src: Ipv4Addr, dst: Ipv4Addr, id: u16) -> Self {
        Self::v4(
            L4Protocol::Icmp,
            TransportAddr::new(src, id),
            TransportAddr::new(dst, id),
        )
    }

    pub fn from_tuple(tuple: FlowTuple) -> Self {
        Self {
            tuple,
            tcp_flags: TcpFlags::NONE,
            icmp_error: false,
        }
    }

    pub fn with_tcp_flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    /// Mark this ICMP message as an error (destination unreachable, time
    /// exceeded, ...).
    pub fn as_icmp_error(mut self) -> Self {
        self.icmp_error = true;
        self
    }

    pub fn l3(&self) -> L3Protocol {
        self.tuple.l3()
    }

    pub fn l4(&self) -> L4Protocol {
        self.tuple.l4()
    }
}
