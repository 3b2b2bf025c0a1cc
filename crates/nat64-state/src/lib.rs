//! nat64-state library
//!
//! Stateful NAT64 filtering and updating (RFC 6146 section 3.5): binding
//! and session tables, the TCP state machine, session expiry and the
//! address pools the engine borrows from.

pub mod bib;
pub mod clock;
pub mod config;
pub mod effect;
pub mod error;
pub mod expiry;
pub mod filtering;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod tables;
pub mod tcp;
pub mod types;

pub use config::{ConfigHandle, ConfigUpdate, FilteringConfig, Nat64Config};
pub use effect::{Decision, Effect, EffectSink, IcmpError, LogSink, TcpProbe, Verdict};
pub use error::{Nat64Error, Nat64Result};
pub use filtering::FilteringEngine;
pub use pool::{AddressPool, Pool4, Pool6, Rfc6052Prefix};
pub use reaper::Reaper;
pub use types::{L3Protocol, L4Protocol, Packet, TcpFlags, TransportAddr};
