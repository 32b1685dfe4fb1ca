//! UDP sockets and the transaction ids in use on each of them.
//!
//! Every socket carries a bitmap with one bit per xid value (65 536 by
//! default). Only the low 16 bits of an xid index the bitmap; the high 16
//! bits are always `base_xid >> 16`.
//!
//! Sockets are owned by the pool for their whole lifetime. A failing socket
//! is reported but never removed automatically.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::event::ReadySet;
use crate::packet::DHCP_HEADER_SIZE;
use crate::request::{Reply, Request};

/// Number of xid values tracked per socket.
pub const XID_SPACE: u32 = 1 << 16;

const RECV_BUFFER_SIZE: usize = 1500;

/// One bit per xid value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IdBitmap {
    words: Vec<u64>,
    size: u32,
    used: u32,
}

impl IdBitmap {
    fn new(size: u32) -> Self {
        Self {
            words: vec![0; size.div_ceil(64) as usize],
            size,
            used: 0,
        }
    }

    fn free(&self) -> u32 {
        self.size - self.used
    }

    fn is_set(&self, index: u32) -> bool {
        index < self.size && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: u32) {
        debug_assert!(!self.is_set(index));
        self.words[(index / 64) as usize] |= 1 << (index % 64);
        self.used += 1;
    }

    /// Returns false if the bit was already clear.
    fn clear(&mut self, index: u32) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.words[(index / 64) as usize] &= !(1 << (index % 64));
        self.used -= 1;
        true
    }

    /// First clear bit at or after `start`, wrapping around once.
    fn first_clear_from(&self, start: u32) -> Option<u32> {
        if self.free() == 0 {
            return None;
        }
        let start = start % self.size;
        self.first_clear_in(start, self.size)
            .or_else(|| self.first_clear_in(0, start))
    }

    fn first_clear_in(&self, from: u32, to: u32) -> Option<u32> {
        let mut index = from;
        while index < to {
            let word = self.words[(index / 64) as usize];
            if word == u64::MAX {
                index = (index / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (index % 64)) == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }
}

#[derive(Debug)]
struct PoolSocket {
    socket: UdpSocket,
    local: Endpoint,
    ids: IdBitmap,
}

impl PoolSocket {
    /// Whether a request constrained to `source` may go out on this socket.
    /// An unspecified address or a zero port matches anything.
    fn accepts(&self, source: Endpoint) -> bool {
        (source.ip.is_unspecified() || source.ip == self.local.ip)
            && (source.port == 0 || source.port == self.local.port)
    }
}

/// Counters for datagrams the pool dropped on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub received: u64,
    pub short_reads: u64,
}

/// A set of bound UDP sockets and the xids allocated on each.
#[derive(Debug)]
pub struct SocketPool {
    sockets: Vec<PoolSocket>,
    base_xid: u32,
    id_space: u32,
    /// Bitmap index the next allocation scan starts at.
    cursor: u32,
    last_serviced: Option<usize>,
    stats: ReceiveStats,
}

impl SocketPool {
    /// Creates an empty pool with the full 16-bit xid space per socket.
    pub fn new(base_xid: u32) -> Self {
        Self {
            sockets: Vec::new(),
            base_xid,
            id_space: XID_SPACE,
            cursor: (base_xid & 0xffff) % XID_SPACE,
            last_serviced: None,
            stats: ReceiveStats::default(),
        }
    }

    /// Creates an empty pool tracking only `id_space` xids per socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless `1 <= id_space <= 65536`.
    pub fn with_id_space(base_xid: u32, id_space: u32) -> Result<Self> {
        if id_space == 0 || id_space > XID_SPACE {
            return Err(Error::InvalidConfig(format!(
                "xid space must be between 1 and {}, got {}",
                XID_SPACE, id_space
            )));
        }
        Ok(Self {
            id_space,
            cursor: (base_xid & 0xffff) % id_space,
            ..Self::new(base_xid)
        })
    }

    pub fn base_xid(&self) -> u32 {
        self.base_xid
    }

    /// Creates a UDP socket bound to `local` and registers it.
    ///
    /// The socket is non-blocking, may broadcast, and is optionally tied to
    /// a network device. Returns the endpoint actually bound (a zero port is
    /// resolved by the kernel).
    pub fn bind(&mut self, local: Endpoint, interface: Option<&str>) -> Result<Endpoint> {
        let socket = create_socket(local, interface)?;
        let bound = match socket.local_addr()? {
            std::net::SocketAddr::V4(addr) => Endpoint::from(addr),
            other => {
                return Err(Error::Socket(format!("unexpected local address {}", other)));
            }
        };
        self.insert_socket(socket, bound)?;
        Ok(bound)
    }

    /// Registers an already-bound socket under `local`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEndpoint`] if a socket with the same local
    /// endpoint is already in the pool.
    pub fn insert_socket(&mut self, socket: UdpSocket, local: Endpoint) -> Result<()> {
        if self.sockets.iter().any(|entry| entry.local == local) {
            return Err(Error::DuplicateEndpoint(local));
        }
        if self.sockets.try_reserve(1).is_err() {
            return Err(Error::AllocFailure("socket table".to_string()));
        }

        info!("Added socket {} (fd {})", local, socket.as_raw_fd());
        self.sockets.push(PoolSocket {
            socket,
            local,
            ids: IdBitmap::new(self.id_space),
        });
        Ok(())
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn local_endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.sockets.iter().map(|entry| entry.local)
    }

    /// Free xids summed over every socket.
    pub fn free_ids(&self) -> u64 {
        self.sockets.iter().map(|entry| u64::from(entry.ids.free())).sum()
    }

    /// Whether `xid` is marked in use on the socket bound to `local`.
    pub fn is_allocated(&self, local: Endpoint, xid: u32) -> bool {
        self.socket_index(local)
            .is_some_and(|index| self.sockets[index].ids.is_set(xid & 0xffff))
    }

    /// The xid bitmap of the socket bound to `local`, 64 indices per word.
    pub fn id_words(&self, local: Endpoint) -> Option<&[u64]> {
        self.socket_index(local)
            .map(|index| self.sockets[index].ids.words.as_slice())
    }

    fn socket_index(&self, local: Endpoint) -> Option<usize> {
        self.sockets.iter().position(|entry| entry.local == local)
    }

    /// Picks a socket and a free xid for a request that has none yet, marks
    /// the xid in use and stamps both onto the request.
    ///
    /// Among the sockets compatible with the request's source constraint,
    /// the one with the most free xids wins (first inserted on ties). The
    /// bitmap is scanned from one past the last allocated index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExhaustedIds`] if no compatible socket has a free xid.
    pub fn allocate_for<C>(&mut self, request: &mut Request<C>) -> Result<()> {
        debug_assert!(request.xid.is_none(), "request already has an xid");

        let mut chosen: Option<(usize, u32)> = None;
        for (index, entry) in self.sockets.iter().enumerate() {
            let free = entry.ids.free();
            if free == 0 || !entry.accepts(request.source) {
                continue;
            }
            if chosen.is_none_or(|(_, best)| free > best) {
                chosen = Some((index, free));
            }
        }
        let Some((socket_index, _)) = chosen else {
            return Err(Error::ExhaustedIds);
        };

        let entry = &mut self.sockets[socket_index];
        let Some(id) = entry.ids.first_clear_from(self.cursor) else {
            return Err(Error::ExhaustedIds);
        };
        entry.ids.set(id);
        self.cursor = (id + 1) % self.id_space;

        let xid = (self.base_xid & 0xffff_0000) | id;
        request.xid = Some(xid);
        request.source = entry.local;

        trace!("Allocated xid 0x{:08x} on {}", xid, entry.local);
        Ok(())
    }

    /// Releases the request's xid on its socket.
    ///
    /// Returns false if the request holds no xid or the xid was already free.
    pub fn free<C>(&mut self, request: &Request<C>) -> bool {
        let Some(xid) = request.xid else {
            return false;
        };
        let Some(index) = self.socket_index(request.source) else {
            return false;
        };
        let freed = self.sockets[index].ids.clear(xid & 0xffff);
        if !freed {
            debug!("xid 0x{:08x} on {} was already free", xid, request.source);
        }
        freed
    }

    /// Sends the request's payload from its allocated socket.
    pub fn send<C>(&self, request: &Request<C>) -> Result<usize> {
        let index = self
            .socket_index(request.source)
            .ok_or_else(|| Error::Socket(format!("no socket bound to {}", request.source)))?;
        let destination: SocketAddrV4 = request.destination.into();
        let sent = self.sockets[index]
            .socket
            .send_to(&request.payload, destination)?;
        Ok(sent)
    }

    /// Adds every socket descriptor to `set`. Returns the highest descriptor,
    /// or `None` for an empty pool.
    pub fn poll_set(&self, set: &mut ReadySet) -> Option<RawFd> {
        let mut max_fd = None;
        for entry in &self.sockets {
            let fd = entry.socket.as_raw_fd();
            set.insert(fd);
            max_fd = max_fd.max(Some(fd));
        }
        max_fd
    }

    /// Receives one datagram from the first ready socket, scanning round-robin
    /// from one past the socket serviced last.
    ///
    /// Each ready socket is read at most once per call. Datagrams too short
    /// for a DHCP header are counted and dropped, and the scan moves on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketClosed`] if a ready socket fails to read.
    pub fn receive(&mut self, set: &ReadySet) -> Result<Option<Reply>> {
        let count = self.sockets.len();
        let first = self.last_serviced.map_or(0, |last| (last + 1) % count.max(1));

        for offset in 0..count {
            let index = (first + offset) % count;
            if !set.is_ready(self.sockets[index].socket.as_raw_fd()) {
                continue;
            }
            self.last_serviced = Some(index);

            match self.recv_one(index) {
                Ok(Some(reply)) => return Ok(Some(reply)),
                Ok(None) => continue,
                Err(Error::ShortRead { local, len }) => {
                    self.stats.short_reads += 1;
                    debug!("Dropped {} byte datagram on {}", len, local);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    fn recv_one(&mut self, index: usize) -> Result<Option<Reply>> {
        let entry = &self.sockets[index];
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        let (len, source) = match entry.socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(error) => return Err(Error::SocketClosed(entry.local, error)),
        };
        self.stats.received += 1;

        if len < DHCP_HEADER_SIZE {
            return Err(Error::ShortRead {
                local: entry.local,
                len,
            });
        }
        let source = Endpoint::try_from(source)?;
        trace!("Received {} bytes from {} on {}", len, source, entry.local);

        Ok(Reply::from_datagram(buffer[..len].to_vec(), source, entry.local))
    }

    pub fn stats(&self) -> ReceiveStats {
        self.stats
    }
}

fn create_socket(local: Endpoint, interface: Option<&str>) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    if let Some(interface) = interface {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
            Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
        })?;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        tracing::warn!(
            "Binding to interface {} is only supported on Linux and will be ignored",
            interface
        );
    }

    let bind_addr = SocketAddrV4::new(local.ip, local.port);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    Ok(socket.into())
}

/// The conventional DHCP client endpoint, `0.0.0.0:68`.
pub fn default_client_endpoint() -> Endpoint {
    Endpoint::new(Ipv4Addr::UNSPECIFIED, 68)
}
