//! RFC 6052 IPv4-embedded IPv6 addresses.

use super::Pool6;
use crate::config::Pool6Config;
use crate::error::{Nat64Error, Nat64Result};
use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Octet 8 (bits 64-71) is the reserved "u" octet and never carries IPv4 bits.
const U_OCTET: usize = 8;

/// A NAT64 prefix of length 32, 40, 48, 56, 64 or 96.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rfc6052Prefix {
    prefix: Ipv6Net,
}

impl Rfc6052Prefix {
    pub fn new(prefix: Ipv6Net) -> Nat64Result<Self> {
        Pool6Config { prefix }.validate()?;
        Ok(Self { prefix })
    }

    pub fn from_config(config: &Pool6Config) -> Nat64Result<Self> {
        Self::new(config.prefix)
    }

    pub fn prefix(&self) -> Ipv6Net {
        self.prefix
    }

    /// Octet indices holding the IPv4 address, most significant first.
    fn ipv4_octets(&self) -> impl Iterator<Item = usize> {
        let start = usize::from(self.prefix.prefix_len() / 8);
        (start..16).filter(|&i| i != U_OCTET).take(4)
    }
}

impl Pool6 for Rfc6052Prefix {
    fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.prefix.contains(addr)
    }

    fn translate_6to4(&self, addr: &Ipv6Addr) -> Nat64Result<Ipv4Addr> {
        if !self.contains(addr) {
            return Err(Nat64Error::AddressTranslation(format!(
                "{} is not within {}",
                addr, self.prefix
            )));
        }

        let octets = addr.octets();
        if self.prefix.prefix_len() < 96 && octets[U_OCTET] != 0 {
            return Err(Nat64Error::AddressTranslation(format!(
                "{} has a non-zero u octet",
                addr
            )));
        }

        let mut v4 = [0u8; 4];
        for (dst, src) in v4.iter_mut().zip(self.ipv4_octets()) {
            *dst = octets[src];
        }
        Ok(Ipv4Addr::from(v4))
    }

    fn translate_4to6(&self, addr: &Ipv4Addr) -> Nat64Result<Ipv6Addr> {
        let mut octets = self.prefix.network().octets();
        for (src, dst) in addr.octets().into_iter().zip(self.ipv4_octets()) {
            octets[dst] = src;
        }
        Ok(Ipv6Addr::from(octets))
    }
}
