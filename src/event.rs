//! Event loop primitives: a cancellable timer heap and a `poll(2)` readiness set.
//!
//! The driver owns both and dispatches on what they return; nothing here
//! calls back into the registry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Timers ordered by deadline, each carrying a payload handed back on expiry.
///
/// Cancelled timers are dropped lazily when they reach the top of the heap.
#[derive(Debug)]
pub struct TimerHeap<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    pending: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, payload);
        id
    }

    /// Cancels a timer, returning its payload if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.pending.remove(&id)
    }

    /// The earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns the payloads of every timer due at `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(payload) = self.pending.remove(&id) {
                expired.push(payload);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Descriptors to wait on for readability, and which of them are ready.
#[derive(Default)]
pub struct ReadySet {
    fds: Vec<libc::pollfd>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn insert(&mut self, fd: RawFd) {
        if !self.fds.iter().any(|entry| entry.fd == fd) {
            self.fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Blocks until a descriptor is readable or `timeout` elapses
    /// (`None` waits forever). Returns the number of ready descriptors;
    /// an interrupted wait reports zero.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        for entry in &mut self.fds {
            entry.revents = 0;
        }

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(duration) => {
                let millis = duration.as_nanos().div_ceil(1_000_000);
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        // SAFETY: `fds` is a live, exclusively borrowed slice of `pollfd` and
        // its length is passed alongside the pointer.
        let ready = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if ready < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(error);
        }
        Ok(ready as usize)
    }

    /// Readable, or in an error/hangup state that a read will surface.
    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.fds.iter().any(|entry| {
            entry.fd == fd
                && entry.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)
                    != 0
        })
    }

    /// Flags a descriptor as readable without polling.
    pub fn mark_ready(&mut self, fd: RawFd) {
        if let Some(entry) = self.fds.iter_mut().find(|entry| entry.fd == fd) {
            entry.revents |= libc::POLLIN;
        }
    }
}
