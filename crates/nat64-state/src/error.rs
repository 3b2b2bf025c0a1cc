//! Error types for the NAT64 state core.

use crate::types::L4Protocol;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Administrative policies that can reject a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// No session permits this IPv4 remote.
    AddressDependentFiltering,
    /// IPv4 nodes may not open TCP connections.
    ExternallyInitiatedTcp,
    /// Informational ICMPv6 is not translated.
    Icmpv6Info,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::AddressDependentFiltering => f.write_str("address-dependent filtering"),
            Policy::ExternallyInitiatedTcp => f.write_str("drop externally initiated TCP"),
            Policy::Icmpv6Info => f.write_str("filter ICMPv6 info"),
        }
    }
}

/// NAT64 state errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Nat64Error {
    /// An administrative policy rejected the packet.
    #[error("Rejected by policy: {0}")]
    PolicyRejected(Policy),

    /// The IPv4 pool could not supply a transport address.
    #[error("No {0} transport address available in pool4")]
    AddressExhausted(L4Protocol),

    /// A table already holds an entry with the same key.
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// No BIB or session entry exists for the packet.
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    /// A session was found in a state its protocol cannot reach.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// RFC 6052 address translation failed.
    #[error("Address translation failed: {0}")]
    AddressTranslation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),
}

impl Nat64Error {
    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }
}

/// Result type alias for NAT64 state operations.
pub type Nat64Result<T> = Result<T, Nat64Error>;
