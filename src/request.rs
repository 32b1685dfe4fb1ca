//! Outbound requests, inbound replies and the in-flight fingerprint.

use std::fmt;
use std::net::Ipv4Addr;

use crate::endpoint::Endpoint;
use crate::packet::peek_xid;

/// Where a request is in its lifetime.
///
/// Only `Registered -> AwaitingReply` happens implicitly (on send); every
/// other transition follows an explicit registry or socket pool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    New,
    Registered,
    AwaitingReply,
    Matched,
    TimedOut,
    Released,
}

/// A pending outbound DHCP request.
///
/// `source` starts out as a constraint (any unspecified address or zero port
/// matches any socket) and is overwritten with the socket's local endpoint
/// when an xid is allocated.
#[derive(Debug, Clone)]
pub struct Request<C = ()> {
    pub xid: Option<u32>,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub payload: Vec<u8>,
    pub state: RequestState,
    pub context: C,
}

impl<C> Request<C> {
    pub fn new(destination: Endpoint, payload: Vec<u8>, context: C) -> Self {
        Self {
            xid: None,
            source: Endpoint::UNSPECIFIED,
            destination,
            payload,
            state: RequestState::New,
            context,
        }
    }

    /// Restricts which sockets may carry this request.
    pub fn with_source(mut self, source: Endpoint) -> Self {
        self.source = source;
        self
    }

    /// The registry key, once an xid and local endpoint are assigned.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.xid
            .map(|xid| Fingerprint::new(xid, self.source, self.destination))
    }
}

/// An inbound datagram received on one of the pool's sockets.
#[derive(Debug, Clone)]
pub struct Reply {
    pub xid: u32,
    pub source: Endpoint,
    /// The local endpoint of the socket the datagram arrived on.
    pub destination: Endpoint,
    pub payload: Vec<u8>,
}

impl Reply {
    /// Builds a reply from a received datagram. `None` if it is too short
    /// to carry an xid.
    pub fn from_datagram(payload: Vec<u8>, source: Endpoint, destination: Endpoint) -> Option<Self> {
        let xid = peek_xid(&payload)?;
        Some(Self {
            xid,
            source,
            destination,
            payload,
        })
    }
}

/// The (xid, local endpoint, destination endpoint) tuple, flattened into
/// 128 bits: xid (32) | local ip (32) | local port (16) | dest ip (32) | dest port (16).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub fn new(xid: u32, local: Endpoint, destination: Endpoint) -> Self {
        let key = (u128::from(xid) << 96)
            | (u128::from(u32::from(local.ip)) << 64)
            | (u128::from(local.port) << 48)
            | (u128::from(u32::from(destination.ip)) << 16)
            | u128::from(destination.port);
        Self(key)
    }

    pub fn xid(&self) -> u32 {
        (self.0 >> 96) as u32
    }

    pub fn local(&self) -> Endpoint {
        Endpoint::new(
            Ipv4Addr::from((self.0 >> 64) as u32),
            (self.0 >> 48) as u16,
        )
    }

    pub fn destination(&self) -> Endpoint {
        Endpoint::new(Ipv4Addr::from((self.0 >> 16) as u32), self.0 as u16)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fingerprint(xid=0x{:08x}, {} -> {})",
            self.xid(),
            self.local(),
            self.destination()
        )
    }
}
