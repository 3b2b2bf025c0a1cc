//! Address pools consumed by the filtering engine.
//!
//! [`Pool4`] hands out IPv4 transport addresses for new BIB entries and
//! [`Pool6`] maps addresses across the RFC 6052 prefix. The engine only sees
//! the traits, so tests can plug in pools that fail on demand.

mod pool4;
mod pool6;

pub use pool4::AddressPool;
pub use pool6::Rfc6052Prefix;

use crate::error::Nat64Result;
use crate::types::{Ipv4TransportAddr, L4Protocol};
use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 transport-address pool.
pub trait Pool4: Send + Sync {
    /// Borrow an address as close to `hint` as possible: the same IPv4
    /// address if it has room, preferably at `hint.id`.
    fn borrow_similar(
        &self,
        hint: Ipv4TransportAddr,
        protocol: L4Protocol,
    ) -> Nat64Result<Ipv4TransportAddr>;

    /// Borrow any free address, preferably at `port_hint`.
    fn borrow_any(&self, protocol: L4Protocol, port_hint: u16) -> Nat64Result<Ipv4TransportAddr>;

    /// Return a borrowed (or reserved) address.
    fn give_back(&self, addr: Ipv4TransportAddr, protocol: L4Protocol);

    /// Whether `addr` belongs to the pool.
    fn contains(&self, addr: Ipv4Addr) -> bool;

    /// Claim a specific address, e.g. for a static BIB entry.
    fn reserve(&self, addr: Ipv4TransportAddr, protocol: L4Protocol) -> Nat64Result<()>;

    /// Number of addresses currently borrowed or reserved for `protocol`.
    fn outstanding(&self, protocol: L4Protocol) -> usize;
}

/// IPv6 prefix used to represent IPv4 hosts on the IPv6 side.
pub trait Pool6: Send + Sync {
    fn contains(&self, addr: &Ipv6Addr) -> bool;

    /// Extract the embedded IPv4 address.
    fn translate_6to4(&self, addr: &Ipv6Addr) -> Nat64Result<Ipv4Addr>;

    /// Embed an IPv4 address in the prefix.
    fn translate_4to6(&self, addr: &Ipv4Addr) -> Nat64Result<Ipv6Addr>;
}
