//! The load generator: builds requests from input templates, sends them
//! through the registry and accounts for replies and timeouts.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, Input};
use crate::endpoint::EndpointList;
use crate::error::{Error, Result};
use crate::event::{ReadySet, TimerHeap, TimerId};
use crate::packet::{DhcpMessage, set_xid_in_place};
use crate::registry::{Registry, RequestHandle};
use crate::request::{Reply, Request, RequestState};
use crate::socket_pool::SocketPool;
use crate::stats::Stats;
use crate::xlat::Expander;

/// Longest single wait, so the shutdown flag is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Replies read per wakeup before timers and sending get a turn again.
const MAX_REPLIES_PER_WAKEUP: usize = 64;

/// Per-request bookkeeping carried in the request itself.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub stream: usize,
    pub sent_at: Instant,
    pub timer: Option<TimerId>,
}

/// What became of one attempt to send a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Every xid is in use; retry once something is released.
    Throttled,
    /// The request could not be built or sent and was abandoned.
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    timeout: Duration,
    max_outstanding: usize,
    num_requests: Option<u64>,
    lifetime: Option<Duration>,
    interval: Option<Duration>,
}

pub struct LoadGenerator {
    registry: Registry,
    expander: Expander,
    inputs: Vec<Input>,
    next_input: usize,
    servers: EndpointList,
    gateway: Option<Ipv4Addr>,
    in_flight: Slab<Request<Transaction>>,
    timers: TimerHeap<usize>,
    ready: ReadySet,
    limits: Limits,
    issued: u64,
    stats: Stats,
    shutdown: Arc<AtomicBool>,
}

impl LoadGenerator {
    /// Binds the configured sockets and prepares the expander.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let base_xid = config.base_xid.unwrap_or_else(rand::random);
        let mut pool = SocketPool::with_id_space(base_xid, config.xid_space)?;
        for local in &config.bind {
            let bound = pool.bind(*local, config.interface.as_deref())?;
            debug!("Bound {}", bound);
        }
        info!(
            "Using {} socket(s), base xid 0x{:08x}",
            pool.num_sockets(),
            base_xid
        );

        Self::with_registry(config, Registry::new(pool))
    }

    /// Like [`new`](Self::new), over sockets the caller has already set up.
    pub fn with_registry(config: &Config, registry: Registry) -> Result<Self> {
        let mut expander = match config.rng_seed {
            Some(seed) => Expander::with_seed(seed),
            None => Expander::new(),
        };
        expander.set_scratch_max_uses(config.scratch_max_uses);

        let limits = Limits {
            timeout: config.timeout(),
            max_outstanding: config.max_outstanding,
            num_requests: config.num_requests,
            lifetime: config.lifetime_seconds.map(Duration::from_secs_f64),
            interval: config.rate.map(|rate| Duration::from_secs_f64(1.0 / rate)),
        };

        Ok(Self {
            registry,
            expander,
            inputs: config.inputs.clone(),
            next_input: 0,
            servers: EndpointList::new(config.servers.clone()),
            gateway: config.gateway,
            in_flight: Slab::new(),
            timers: TimerHeap::new(),
            ready: ReadySet::new(),
            limits,
            issued: 0,
            stats: Stats::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A flag that stops the run when raised. Outstanding requests are
    /// still drained.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Expands the next request without sending it.
    pub fn expand_next(&mut self) -> Result<(usize, Vec<(String, String)>)> {
        let stream = self.next_input;
        self.next_input = (self.next_input + 1) % self.inputs.len().max(1);

        let input = self
            .inputs
            .get(stream)
            .ok_or_else(|| Error::InvalidConfig("no inputs configured".to_string()))?;
        let attributes = self.expander.expand_attributes(stream, input.pairs())?;
        Ok((stream, attributes))
    }

    fn build_message(&mut self) -> Result<(usize, DhcpMessage)> {
        let (stream, attributes) = self.expand_next()?;
        let mut message = DhcpMessage::from_attributes(
            attributes
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )?;
        if let Some(gateway) = self.gateway
            && message.giaddr.is_unspecified()
        {
            message.giaddr = gateway;
        }
        Ok((stream, message))
    }

    /// Builds, registers and sends one request.
    ///
    /// # Errors
    ///
    /// Only registry failures other than id exhaustion are returned; bad
    /// templates and send failures are counted and the request dropped.
    pub fn send_next(&mut self, now: Instant) -> Result<SendOutcome> {
        // Keep generator progress for when an xid frees up.
        if self.registry.pool().free_ids() == 0 {
            self.stats.exhausted += 1;
            return Ok(SendOutcome::Throttled);
        }

        let (stream, message) = match self.build_message() {
            Ok(built) => built,
            Err(error) => {
                self.stats.template_failures += 1;
                self.issued += 1;
                warn!("Failed to build request: {}", error);
                return Ok(SendOutcome::Abandoned);
            }
        };
        let destination = self
            .servers
            .next()
            .ok_or_else(|| Error::InvalidConfig("no servers configured".to_string()))?;

        let entry = self.in_flight.vacant_entry();
        let handle = entry.key();
        let context = Transaction {
            stream,
            sent_at: now,
            timer: None,
        };
        let mut request = Request::new(destination, message.encode(), context);

        match self.registry.id_allocate(RequestHandle(handle), &mut request) {
            Ok(()) => {}
            Err(Error::ExhaustedIds) => {
                self.stats.exhausted += 1;
                trace!("Out of xids, throttling");
                return Ok(SendOutcome::Throttled);
            }
            Err(error) => return Err(error),
        }
        let Some(xid) = request.xid else {
            return Err(Error::Unallocated);
        };
        set_xid_in_place(&mut request.payload, xid);

        request.state = RequestState::AwaitingReply;
        if let Err(error) = self.registry.pool().send(&request) {
            warn!("Failed to send xid 0x{:08x} to {}: {}", xid, destination, error);
            self.registry.id_free(&mut request, true);
            self.stats.send_failures += 1;
            self.issued += 1;
            return Ok(SendOutcome::Abandoned);
        }

        request.context.timer = Some(self.timers.schedule(now + self.limits.timeout, handle));
        trace!("Sent xid 0x{:08x} {} -> {}", xid, request.source, destination);
        entry.insert(request);
        self.stats.sent += 1;
        self.issued += 1;
        Ok(SendOutcome::Sent)
    }

    /// Accounts for a received datagram. Returns true if it answered an
    /// outstanding request.
    pub fn handle_reply(&mut self, reply: Reply, now: Instant) -> bool {
        let handle = match self.registry.match_reply(&reply) {
            Ok(handle) => handle,
            Err(error) => {
                self.stats.no_match += 1;
                debug!("{} from {}", error, reply.source);
                return false;
            }
        };
        let Some(mut request) = self.in_flight.try_remove(handle.0) else {
            self.stats.no_match += 1;
            warn!("Registry handle {:?} has no request", handle);
            return false;
        };

        request.state = RequestState::Matched;
        self.registry.id_free(&mut request, true);
        if let Some(timer) = request.context.timer {
            self.timers.cancel(timer);
        }

        let message_type = DhcpMessage::parse(&reply.payload)
            .ok()
            .and_then(|message| message.message_type());
        let rtt = now.saturating_duration_since(request.context.sent_at);
        debug!(
            "{} for xid 0x{:08x} from {} after {:?}",
            message_type.map_or_else(|| "Reply".to_string(), |kind| kind.to_string()),
            reply.xid,
            reply.source,
            rtt
        );
        self.stats.record_reply(message_type, rtt);
        true
    }

    /// Releases every request whose timeout is due. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for handle in self.timers.pop_expired(now) {
            let Some(mut request) = self.in_flight.try_remove(handle) else {
                continue;
            };
            request.state = RequestState::TimedOut;
            debug!(
                "Timed out xid 0x{:08x} to {} (stream {})",
                request.xid.unwrap_or_default(),
                request.destination,
                request.context.stream
            );
            self.registry.id_free(&mut request, true);
            self.stats.timeouts += 1;
            expired += 1;
        }
        expired
    }

    fn stopping(&self, started: Instant, now: Instant) -> bool {
        self.shutdown.load(Ordering::Relaxed)
            || self.limits.num_requests.is_some_and(|limit| self.issued >= limit)
            || self
                .limits
                .lifetime
                .is_some_and(|lifetime| now.duration_since(started) >= lifetime)
    }

    /// Runs until a limit is reached or the shutdown flag is raised, then
    /// waits for outstanding requests to be answered or time out.
    pub fn run(mut self) -> Result<Stats> {
        let started = Instant::now();
        self.stats = Stats::new();
        let mut next_send = started;
        let mut throttled = false;
        let mut draining = false;

        info!("Sending to {}", self.servers);

        loop {
            let now = Instant::now();
            if self.expire(now) > 0 {
                throttled = false;
            }

            if !draining && self.stopping(started, now) {
                draining = true;
                info!("Stopping, draining {} outstanding request(s)", self.in_flight.len());
            }
            if draining && self.in_flight.is_empty() {
                break;
            }

            let may_send = !draining
                && !throttled
                && self.in_flight.len() < self.limits.max_outstanding
                && now >= next_send;
            if may_send {
                match self.send_next(now)? {
                    SendOutcome::Throttled => throttled = true,
                    SendOutcome::Sent | SendOutcome::Abandoned => {
                        if let Some(interval) = self.limits.interval {
                            next_send += interval;
                            // Don't burst to catch up after a stall.
                            if next_send + interval < now {
                                next_send = now;
                            }
                        }
                    }
                }
            }

            let wait = self.wait_time(now, draining, throttled, next_send);
            self.ready.clear();
            self.registry.pool().poll_set(&mut self.ready);
            if self.ready.wait(Some(wait))? == 0 {
                continue;
            }

            for _ in 0..MAX_REPLIES_PER_WAKEUP {
                match self.registry.pool_mut().receive(&self.ready) {
                    Ok(Some(reply)) => {
                        if self.handle_reply(reply, Instant::now()) {
                            throttled = false;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!("{}", error);
                        break;
                    }
                }
            }
        }

        self.stats.short_reads = self.registry.pool().stats().short_reads;
        info!(
            "Done: {} sent, {} replies, {} timeouts",
            self.stats.sent, self.stats.matched, self.stats.timeouts
        );
        Ok(self.stats)
    }

    fn wait_time(&mut self, now: Instant, draining: bool, throttled: bool, next_send: Instant) -> Duration {
        let can_send_more =
            !draining && !throttled && self.in_flight.len() < self.limits.max_outstanding;

        let mut wake = now + MAX_WAIT;
        if let Some(deadline) = self.timers.next_deadline() {
            wake = wake.min(deadline);
        }
        if can_send_more {
            wake = wake.min(next_send);
        }
        wake.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attribute;
    use crate::endpoint::Endpoint;
    use crate::options::{DhcpOption, MessageType};
    use std::net::UdpSocket;
    use std::thread;

    fn loopback_config(server: Endpoint) -> Config {
        Config {
            base_xid: Some(0x1234_0000),
            bind: vec![Endpoint::new(Ipv4Addr::LOCALHOST, 0)],
            servers: vec![server],
            timeout_ms: 2000,
            rng_seed: Some(1),
            inputs: vec![Input {
                name: None,
                attributes: vec![
                    Attribute::new(
                        "Client-Hardware-Address",
                        "%{ethaddr.range:02:00:00:00:00:01-02:00:00:00:00:ff}",
                    ),
                    Attribute::new("Hostname", "host-%{num.range:1-100}"),
                ],
            }],
            ..Default::default()
        }
    }

    /// Answers `count` requests with a DHCP-Offer carrying the same xid.
    fn spawn_responder(count: usize) -> (Endpoint, thread::JoinHandle<Vec<DhcpMessage>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let local = Endpoint::try_from(socket.local_addr().unwrap()).unwrap();

        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buffer = [0u8; 1500];
            for _ in 0..count {
                let Ok((len, peer)) = socket.recv_from(&mut buffer) else {
                    break;
                };
                let request = DhcpMessage::parse(&buffer[..len]).unwrap();
                let mut offer = request.clone();
                offer.op = crate::packet::BOOTREPLY;
                offer.yiaddr = Ipv4Addr::new(10, 0, 0, 50);
                offer.options = vec![DhcpOption::MessageType(MessageType::Offer)];
                socket.send_to(&offer.encode(), peer).unwrap();
                seen.push(request);
            }
            seen
        });
        (local, handle)
    }

    #[test]
    fn test_requests_are_answered() {
        let (server, responder) = spawn_responder(5);
        let config = Config {
            num_requests: Some(5),
            ..loopback_config(server)
        };

        let generator = LoadGenerator::new(&config).unwrap();
        let stats = generator.run().unwrap();
        let seen = responder.join().unwrap();

        assert_eq!(stats.sent, 5);
        assert_eq!(stats.matched, 5);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.replies_by_type[&(MessageType::Offer as u8)], 5);

        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].mac(), "02:00:00:00:00:01");
        assert_eq!(seen[4].mac(), "02:00:00:00:00:05");
        assert!(seen.iter().all(|message| message.xid >> 16 == 0x1234));
        assert!(
            seen[1]
                .options
                .contains(&DhcpOption::Hostname("host-2".to_string()))
        );
    }

    #[test]
    fn test_unanswered_requests_time_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        let config = Config {
            num_requests: Some(3),
            timeout_ms: 50,
            ..loopback_config(server)
        };

        let generator = LoadGenerator::new(&config).unwrap();
        let stats = generator.run().unwrap();

        assert_eq!(stats.sent, 3);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.timeouts, 3);
    }

    #[test]
    fn test_exhausted_ids_throttle() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        let config = Config {
            xid_space: 2,
            ..loopback_config(server)
        };

        let mut generator = LoadGenerator::new(&config).unwrap();
        let now = Instant::now();
        assert_eq!(generator.send_next(now).unwrap(), SendOutcome::Sent);
        assert_eq!(generator.send_next(now).unwrap(), SendOutcome::Sent);
        assert_eq!(generator.send_next(now).unwrap(), SendOutcome::Throttled);
        assert_eq!(generator.outstanding(), 2);
        assert_eq!(generator.registry().num_elements(), 2);

        assert_eq!(generator.expire(now + Duration::from_secs(10)), 2);
        assert_eq!(generator.outstanding(), 0);
        assert_eq!(generator.registry().num_elements(), 0);
        assert_eq!(generator.registry().pool().free_ids(), 2);
        assert_eq!(generator.send_next(now).unwrap(), SendOutcome::Sent);
    }

    #[test]
    fn test_bad_template_is_abandoned() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        let mut config = loopback_config(server);
        config.inputs[0]
            .attributes
            .push(Attribute::new("Lease-Time", "%{num.range:9-1}"));

        let mut generator = LoadGenerator::new(&config).unwrap();
        assert_eq!(
            generator.send_next(Instant::now()).unwrap(),
            SendOutcome::Abandoned
        );
        assert_eq!(generator.stats().template_failures, 1);
        assert_eq!(generator.registry().num_elements(), 0);
    }

    #[test]
    fn test_unmatched_reply_is_counted() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        let mut generator = LoadGenerator::new(&loopback_config(server)).unwrap();

        let local = generator.registry().pool().local_endpoints().next().unwrap();
        let stray = Reply {
            xid: 0xdead_beef,
            source: server,
            destination: local,
            payload: Vec::new(),
        };
        assert!(!generator.handle_reply(stray, Instant::now()));
        assert_eq!(generator.stats().no_match, 1);
    }

    #[test]
    fn test_inputs_rotate_streams() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        let mut config = loopback_config(server);
        config.inputs.push(Input {
            name: None,
            attributes: vec![Attribute::new("Message-Type", "Request")],
        });

        let mut generator = LoadGenerator::new(&config).unwrap();
        let streams: Vec<usize> = (0..4)
            .map(|_| generator.expand_next().unwrap().0)
            .collect();
        assert_eq!(streams, [0, 1, 0, 1]);
    }
}
