//! The registry of in-flight requests.
//!
//! Requests are owned by the caller (typically in a slab); the registry only
//! maps each in-flight fingerprint to the caller's handle. At most one
//! request may hold a given fingerprint at a time, and every registered
//! request has its xid marked in use in the socket pool.
//!
//! Replies are matched on xid and receiving socket, and on the reply source
//! being the request's destination, except that a request sent to
//! `255.255.255.255` accepts a reply from any unicast server address.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::request::{Fingerprint, Reply, Request, RequestState};
use crate::socket_pool::SocketPool;

/// The caller's handle for a registered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub usize);

/// In-flight requests indexed by fingerprint, plus the sockets they go out on.
///
/// Every operation that touches the index takes `&mut self`, so a callback
/// can never re-enter the registry while an operation is in progress.
#[derive(Debug)]
pub struct Registry {
    pool: SocketPool,
    entries: HashMap<Fingerprint, RequestHandle>,
}

impl Registry {
    pub fn new(pool: SocketPool) -> Self {
        Self {
            pool,
            entries: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut SocketPool {
        &mut self.pool
    }

    /// Number of registered requests.
    pub fn num_elements(&self) -> usize {
        self.entries.len()
    }

    /// Every registered fingerprint, in ascending order.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut fingerprints: Vec<Fingerprint> = self.entries.keys().copied().collect();
        fingerprints.sort_unstable();
        fingerprints
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.entries.contains_key(&fingerprint)
    }

    /// Registers a request that already has an xid and local endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Unallocated`] if the request has no xid yet.
    /// - [`Error::DuplicateFingerprint`] if another request holds the same
    ///   fingerprint. The request is left untouched.
    pub fn insert<C>(&mut self, handle: RequestHandle, request: &mut Request<C>) -> Result<()> {
        let fingerprint = request.fingerprint().ok_or(Error::Unallocated)?;
        debug_assert!(
            self.pool.is_allocated(fingerprint.local(), fingerprint.xid()),
            "xid {:#010x} is not allocated on {}",
            fingerprint.xid(),
            fingerprint.local()
        );

        if self.entries.contains_key(&fingerprint) {
            return Err(Error::DuplicateFingerprint {
                xid: fingerprint.xid(),
                local: fingerprint.local(),
                destination: fingerprint.destination(),
            });
        }
        if self.entries.try_reserve(1).is_err() {
            return Err(Error::AllocFailure("registry index".to_string()));
        }

        self.entries.insert(fingerprint, handle);
        request.state = RequestState::Registered;
        trace!("Registered {:?} as {:?}", fingerprint, handle);
        Ok(())
    }

    /// Finds the registered request a reply answers. The request stays
    /// registered.
    pub fn find_by_reply(&self, reply: &Reply) -> Option<RequestHandle> {
        let direct = Fingerprint::new(reply.xid, reply.destination, reply.source);
        if let Some(handle) = self.entries.get(&direct) {
            return Some(*handle);
        }

        let broadcast = Endpoint::new(Ipv4Addr::BROADCAST, reply.source.port);
        let via_broadcast = Fingerprint::new(reply.xid, reply.destination, broadcast);
        self.entries.get(&via_broadcast).copied()
    }

    /// Like [`find_by_reply`](Self::find_by_reply), reporting a miss as
    /// [`Error::NoMatch`].
    pub fn match_reply(&self, reply: &Reply) -> Result<RequestHandle> {
        self.find_by_reply(reply).ok_or(Error::NoMatch(reply.xid))
    }

    /// Removes a request from the index. Does not free its xid.
    ///
    /// Returns false if the request wasn't registered.
    pub fn yank<C>(&mut self, request: &Request<C>) -> bool {
        let Some(fingerprint) = request.fingerprint() else {
            return false;
        };
        let removed = self.entries.remove(&fingerprint).is_some();
        if !removed {
            debug!("Yank of unregistered {:?}", fingerprint);
        }
        removed
    }

    /// Allocates an xid and socket for the request and registers it.
    ///
    /// If registration fails the xid is released and the request's xid and
    /// source constraint are restored, so nothing is left behind.
    pub fn id_allocate<C>(&mut self, handle: RequestHandle, request: &mut Request<C>) -> Result<()> {
        let constraint = request.source;
        self.pool.allocate_for(request)?;

        if let Err(error) = self.insert(handle, request) {
            self.pool.free(request);
            request.xid = None;
            request.source = constraint;
            return Err(error);
        }
        Ok(())
    }

    /// Releases the request's xid, yanking it from the index first if asked.
    ///
    /// A request that is still indexed keeps its xid so a later
    /// [`yank`](Self::yank) can find its entry.
    ///
    /// Returns false if the xid was already free.
    pub fn id_free<C>(&mut self, request: &mut Request<C>, yank: bool) -> bool {
        if yank {
            self.yank(request);
        }
        let freed = self.pool.free(request);
        match request.fingerprint() {
            Some(fingerprint) if self.entries.contains_key(&fingerprint) => {
                debug!("Freed xid of {:?} while still indexed", fingerprint);
            }
            _ => request.xid = None,
        }
        request.state = RequestState::Released;
        freed
    }
}
