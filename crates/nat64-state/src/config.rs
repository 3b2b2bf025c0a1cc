//! NAT64 configuration types.
//!
//! The filtering policy (timeouts and the three drop flags) is the only part
//! that changes at runtime. It lives in a [`ConfigHandle`] and is read by
//! copying out a [`FilteringConfig`] snapshot, so nobody holds the config
//! lock while the tables are being mutated.

use crate::error::{Nat64Error, Nat64Result};
use crate::types::{Ipv4TransportAddr, Ipv6TransportAddr, L4Protocol};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Default UDP session lifetime (RFC 6146 section 4).
pub const UDP_DEFAULT_SECS: u64 = 5 * 60;
/// Minimum UDP session lifetime.
pub const UDP_MIN_SECS: u64 = 2 * 60;
/// Default ICMP query session lifetime.
pub const ICMP_DEFAULT_SECS: u64 = 60;
/// TCP established lifetime; also the lowest accepted value.
pub const TCP_EST_SECS: u64 = 2 * 60 * 60;
/// TCP transitory lifetime; also the lowest accepted value.
pub const TCP_TRANS_SECS: u64 = 4 * 60;
/// Lifetime of a V4_INIT session while address-dependent filtering is on.
pub const TCP_INCOMING_SYN_SECS: u64 = 6;
/// Upper bound for every configurable session lifetime (one year).
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Well-known NAT64 prefix (RFC 6052).
pub const DEFAULT_POOL6_PREFIX: &str = "64:ff9b::/96";

/// Prefix lengths RFC 6052 defines an embedding for.
pub const RFC6052_PREFIX_LENGTHS: [u8; 6] = [32, 40, 48, 56, 64, 96];

/// Runtime filtering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    /// UDP session lifetime in seconds.
    pub udp_timeout_secs: u64,
    /// ICMP query session lifetime in seconds.
    pub icmp_timeout_secs: u64,
    /// TCP lifetime in the ESTABLISHED and FIN_RCV states, in seconds.
    pub tcp_est_timeout_secs: u64,
    /// TCP lifetime in the handshake/teardown states, in seconds.
    pub tcp_trans_timeout_secs: u64,
    /// Address-dependent filtering: IPv4 packets need a session permitting
    /// their source address, not just a BIB entry.
    pub drop_by_addr: bool,
    /// Refuse TCP connections opened from the IPv4 side.
    pub drop_externally_initiated_tcp: bool,
    /// Drop informational ICMPv6 instead of translating it.
    pub filter_icmpv6_info: bool,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            udp_timeout_secs: UDP_DEFAULT_SECS,
            icmp_timeout_secs: ICMP_DEFAULT_SECS,
            tcp_est_timeout_secs: TCP_EST_SECS,
            tcp_trans_timeout_secs: TCP_TRANS_SECS,
            drop_by_addr: false,
            drop_externally_initiated_tcp: false,
            filter_icmpv6_info: false,
        }
    }
}

impl FilteringConfig {
    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_secs(self.icmp_timeout_secs)
    }

    pub fn tcp_est_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_est_timeout_secs)
    }

    pub fn tcp_trans_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_trans_timeout_secs)
    }

    pub fn tcp_incoming_syn_timeout(&self) -> Duration {
        Duration::from_secs(TCP_INCOMING_SYN_SECS)
    }

    /// Validate the timeouts against their protocol bounds.
    pub fn validate(&self) -> Nat64Result<()> {
        check_udp(self.udp_timeout_secs)?;
        check_icmp(self.icmp_timeout_secs)?;
        check_tcp_est(self.tcp_est_timeout_secs)?;
        check_tcp_trans(self.tcp_trans_timeout_secs)?;
        Ok(())
    }
}

fn check_timeout(field: &str, secs: u64, min: u64) -> Nat64Result<()> {
    if secs < min {
        return Err(Nat64Error::config(format!(
            "'{}' must be at least {}",
            field, min
        )));
    }
    if secs > MAX_TIMEOUT_SECS {
        return Err(Nat64Error::config(format!(
            "'{}' must be at most {}",
            field, MAX_TIMEOUT_SECS
        )));
    }
    Ok(())
}

fn check_udp(secs: u64) -> Nat64Result<()> {
    check_timeout("udp_timeout_secs", secs, UDP_MIN_SECS)
}

fn check_icmp(secs: u64) -> Nat64Result<()> {
    check_timeout("icmp_timeout_secs", secs, 0)
}

fn check_tcp_est(secs: u64) -> Nat64Result<()> {
    check_timeout("tcp_est_timeout_secs", secs, TCP_EST_SECS)
}

fn check_tcp_trans(secs: u64) -> Nat64Result<()> {
    check_timeout("tcp_trans_timeout_secs", secs, TCP_TRANS_SECS)
}

/// Field-mask update of the filtering policy. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub udp_timeout_secs: Option<u64>,
    pub icmp_timeout_secs: Option<u64>,
    pub tcp_est_timeout_secs: Option<u64>,
    pub tcp_trans_timeout_secs: Option<u64>,
    pub drop_by_addr: Option<bool>,
    pub drop_externally_initiated_tcp: Option<bool>,
    pub filter_icmpv6_info: Option<bool>,
}

/// Owner of the live filtering policy.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    inner: RwLock<FilteringConfig>,
}

impl ConfigHandle {
    pub fn new(config: FilteringConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Copy out the current policy.
    pub fn snapshot(&self) -> FilteringConfig {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` field by field.
    ///
    /// Every acceptable field is applied even if another one is rejected.
    /// The returned error names all rejected fields.
    pub fn update(&self, update: &ConfigUpdate) -> Nat64Result<()> {
        let mut rejected = Vec::new();
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(value) = update.drop_by_addr {
            config.drop_by_addr = value;
        }
        if let Some(value) = update.drop_externally_initiated_tcp {
            config.drop_externally_initiated_tcp = value;
        }
        if let Some(value) = update.filter_icmpv6_info {
            config.filter_icmpv6_info = value;
        }
        if let Some(secs) = update.icmp_timeout_secs {
            match check_icmp(secs) {
                Ok(()) => config.icmp_timeout_secs = secs,
                Err(e) => rejected.push(e.to_string()),
            }
        }

        if let Some(secs) = update.udp_timeout_secs {
            match check_udp(secs) {
                Ok(()) => config.udp_timeout_secs = secs,
                Err(e) => rejected.push(e.to_string()),
            }
        }
        if let Some(secs) = update.tcp_est_timeout_secs {
            match check_tcp_est(secs) {
                Ok(()) => config.tcp_est_timeout_secs = secs,
                Err(e) => rejected.push(e.to_string()),
            }
        }
        if let Some(secs) = update.tcp_trans_timeout_secs {
            match check_tcp_trans(secs) {
                Ok(()) => config.tcp_trans_timeout_secs = secs,
                Err(e) => rejected.push(e.to_string()),
            }
        }
        drop(config);

        if rejected.is_empty() {
            Ok(())
        } else {
            for reason in &rejected {
                log::error!("{}", reason);
            }
            Err(Nat64Error::config(rejected.join("; ")))
        }
    }
}

/// IPv4 transport-address pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pool4Config {
    /// IPv4 prefixes whose addresses may be borrowed.
    pub prefixes: Vec<Ipv4Net>,
    /// Ports (and ICMP identifiers) that may be borrowed, inclusive.
    pub port_range: (u16, u16),
}

impl Default for Pool4Config {
    fn default() -> Self {
        Self {
            prefixes: vec![],
            port_range: (1024, 65535),
        }
    }
}

impl Pool4Config {
    pub fn validate(&self) -> Nat64Result<()> {
        if self.prefixes.is_empty() {
            return Err(Nat64Error::config(
                "[pool4] At least one prefix is required",
            ));
        }
        let (start, end) = self.port_range;
        if end < start {
            return Err(Nat64Error::config(format!(
                "[pool4] 'port_range' end ({}) must be >= start ({})",
                end, start
            )));
        }
        Ok(())
    }
}

/// RFC 6052 prefix configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pool6Config {
    pub prefix: Ipv6Net,
}

impl Default for Pool6Config {
    fn default() -> Self {
        Self {
            prefix: default_pool6_prefix(),
        }
    }
}

impl Pool6Config {
    pub fn validate(&self) -> Nat64Result<()> {
        let len = self.prefix.prefix_len();
        if !RFC6052_PREFIX_LENGTHS.contains(&len) {
            return Err(Nat64Error::config(format!(
                "[pool6] Prefix length /{} is not one of {:?}",
                len, RFC6052_PREFIX_LENGTHS
            )));
        }
        if self.prefix.trunc() != self.prefix {
            return Err(Nat64Error::config(format!(
                "[pool6] Prefix {} has host bits set",
                self.prefix
            )));
        }
        if len > 64 && self.prefix.addr().octets()[8] != 0 {
            return Err(Nat64Error::config(format!(
                "[pool6] Prefix {} sets bits 64-71, which RFC 6052 reserves",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// Background expiry task configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Seconds between expiry sweeps.
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_secs: 1 }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A BIB entry installed by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBibConfig {
    pub protocol: L4Protocol,
    /// IPv6 transport address, e.g. `"[2001:db8::5]:80"`.
    pub ipv6: SocketAddrV6,
    /// IPv4 transport address, e.g. `"192.0.2.1:8080"`.
    pub ipv4: SocketAddrV4,
}

impl StaticBibConfig {
    pub fn ipv6_transport(&self) -> Ipv6TransportAddr {
        self.ipv6.into()
    }

    pub fn ipv4_transport(&self) -> Ipv4TransportAddr {
        self.ipv4.into()
    }
}

/// Complete NAT64 configuration (config file root).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nat64Config {
    pub filtering: FilteringConfig,
    pub pool4: Pool4Config,
    pub pool6: Pool6Config,
    pub reaper: ReaperConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub static_bib: Vec<StaticBibConfig>,
}

impl Nat64Config {
    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - a timeout is below its protocol minimum
    /// - pool4 is empty or its port range is inverted
    /// - the pool6 prefix is not a valid RFC 6052 prefix
    /// - the reaper interval is zero
    /// - a static BIB entry's IPv4 address is outside pool4
    pub fn validate(&self) -> Nat64Result<()> {
        self.filtering.validate()?;
        self.pool4.validate()?;
        self.pool6.validate()?;

        if self.reaper.interval_secs == 0 {
            return Err(Nat64Error::config(
                "[reaper] 'interval_secs' must be at least 1",
            ));
        }

        for entry in &self.static_bib {
            if !self.pool4.prefixes.iter().any(|net| net.contains(entry.ipv4.ip())) {
                return Err(Nat64Error::config(format!(
                    "[static_bib] {} is not within pool4",
                    entry.ipv4
                )));
            }
        }

        Ok(())
    }
}

fn default_pool6_prefix() -> Ipv6Net {
    Ipv6Net::new_assert(Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96)
}
