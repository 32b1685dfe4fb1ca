//! Error types for the load generator.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. None of them is fatal to the
//! process: the core stays usable after any error.

use crate::endpoint::Endpoint;

/// Errors that can occur while generating, sending or matching requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No socket in the pool has a free transaction id left.
    ///
    /// The load generator treats this as back-pressure and throttles
    /// until replies or timeouts release ids.
    #[error("No free transaction id on any socket")]
    ExhaustedIds,

    /// Another in-flight request already holds this
    /// (xid, local endpoint, destination endpoint) tuple.
    #[error("Duplicate in-flight request: xid 0x{xid:08x}, {local} -> {destination}")]
    DuplicateFingerprint {
        xid: u32,
        local: Endpoint,
        destination: Endpoint,
    },

    /// A request was inserted before an xid and socket were assigned to it.
    #[error("Request has no transaction id or local endpoint assigned")]
    Unallocated,

    /// A socket reported a failure while receiving.
    ///
    /// The socket stays in the pool; the owning layer decides what to do.
    #[error("Socket {0} reported a failure: {1}")]
    SocketClosed(Endpoint, std::io::Error),

    /// A datagram too small to hold a DHCP header was received and dropped.
    #[error("Short read on {local}: {len} bytes")]
    ShortRead { local: Endpoint, len: usize },

    /// A socket with this local endpoint is already in the pool.
    #[error("A socket bound to {0} is already registered")]
    DuplicateEndpoint(Endpoint),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Unparseable generator argument, or a range whose lower bound
    /// is above its upper bound.
    #[error("Invalid range: {0}")]
    BadRange(String),

    /// A template referenced a generator or attribute that doesn't exist.
    #[error("Unknown generator or attribute: {0}")]
    UnknownGenerator(String),

    /// Malformed template syntax (e.g. unterminated `%{`).
    #[error("Invalid template: {0}")]
    Template(String),

    /// An internal table could not grow.
    #[error("Allocation failure: {0}")]
    AllocFailure(String),

    /// A reply matched no in-flight request (late or duplicate reply).
    #[error("No in-flight request matches reply xid 0x{0:08x}")]
    NoMatch(u32),

    /// Malformed DHCP packet or attribute value.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Address or port that can't be parsed into an endpoint.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A specialized Result type for load generator operations.
pub type Result<T> = std::result::Result<T, Error>;
