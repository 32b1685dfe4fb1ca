//! Transport endpoints (IPv4 address + UDP port).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An IPv4 transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub const UNSPECIFIED: Endpoint = Endpoint::new(Ipv4Addr::UNSPECIFIED, 0);

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Both address and port are set.
    pub fn is_defined(&self) -> bool {
        !self.ip.is_unspecified() && self.port != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.ip == Ipv4Addr::BROADCAST
    }

    /// Parses `<ip>:<port>`, `<ip>`, `:<port>` or `<port>`.
    ///
    /// Whatever the input leaves out is taken from `default`.
    pub fn parse_with_default(input: &str, default: Endpoint) -> Result<Self> {
        let input = input.trim();
        let port_only = input.strip_prefix(':').unwrap_or(input);

        if !port_only.is_empty() && port_only.bytes().all(|byte| byte.is_ascii_digit()) {
            return Ok(Self::new(default.ip, parse_port(port_only)?));
        }

        match input.rsplit_once(':') {
            Some((ip, port)) => {
                let ip = Ipv4Addr::from_str(ip)
                    .map_err(|_| Error::InvalidEndpoint(format!("bad address in '{}'", input)))?;
                Ok(Self::new(ip, parse_port(port)?))
            }
            None => {
                let ip = Ipv4Addr::from_str(input)
                    .map_err(|_| Error::InvalidEndpoint(format!("bad address '{}'", input)))?;
                Ok(Self::new(ip, default.port))
            }
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u32>() {
        Ok(0) | Err(_) => Err(Error::InvalidEndpoint(format!(
            "port '{}' outside valid port range 1-{}",
            port,
            u16::MAX
        ))),
        Ok(value) => u16::try_from(value).map_err(|_| {
            Error::InvalidEndpoint(format!(
                "port {} outside valid port range 1-{}",
                value,
                u16::MAX
            ))
        }),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with_default(s, Endpoint::UNSPECIFIED)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    /// Reads the exact `ip:port` form written by `Display`. Port 0 is kept
    /// so ephemeral binds survive a config round-trip.
    fn try_from(value: String) -> Result<Self> {
        value
            .parse::<SocketAddrV4>()
            .map(Self::from)
            .map_err(|_| Error::InvalidEndpoint(format!("expected ip:port, got '{}'", value)))
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddrV4::new(endpoint.ip, endpoint.port)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddr::V4(endpoint.into())
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(Error::InvalidEndpoint(format!(
                "only IPv4 is supported, got {}",
                v6
            ))),
        }
    }
}

/// Endpoints handed out in round-robin order.
#[derive(Debug, Clone, Default)]
pub struct EndpointList {
    endpoints: Vec<Endpoint>,
    next: usize,
}

impl EndpointList {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints, next: 0 }
    }

    /// Adds an endpoint parsed from `input`, completing it from `default`.
    ///
    /// Both address and port must end up defined.
    pub fn add(&mut self, input: &str, default: Endpoint) -> Result<Endpoint> {
        let endpoint = Endpoint::parse_with_default(input, default)?;
        if !endpoint.is_defined() {
            return Err(Error::InvalidEndpoint(
                "IP address and port must be provided".to_string(),
            ));
        }
        self.endpoints.push(endpoint);
        Ok(endpoint)
    }

    /// Returns the next endpoint, cycling through the list.
    pub fn next(&mut self) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.endpoints[self.next];
        self.next = (self.next + 1) % self.endpoints.len();
        Some(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }
}

impl fmt::Display for EndpointList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", endpoint)?;
        }
        Ok(())
    }
}
