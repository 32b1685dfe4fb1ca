//! # dhcperf
//!
//! A DHCPv4 load generator: sends templated DHCP requests to one or more
//! servers over a pool of UDP sockets and matches the replies.
//!
//! ## Features
//!
//! - Per-socket transaction id bitmaps, so ids never collide in flight
//! - Reply matching on xid and socket, accepting unicast answers to broadcasts
//! - Request templates with stateful generators (`num.range`, `ipaddr.rand`...)
//! - Rate, concurrency, count and duration limits
//! - Per-type reply counts and response times
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcperf::{Config, LoadGenerator};
//!
//! fn main() -> dhcperf::Result<()> {
//!     let config = Config::load_or_create("dhcperf.json")?;
//!     let stats = LoadGenerator::new(&config)?.run()?;
//!     print!("{}", stats.report());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`SocketPool`] - Bound sockets and the xids allocated on each
//! - [`Registry`] - In-flight requests indexed by fingerprint
//! - [`Expander`] - Template expansion with per-stream generator state
//! - [`LoadGenerator`] - The event loop tying them together
//! - [`DhcpMessage`] - DHCP message building and parsing

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod options;
pub mod packet;
pub mod registry;
pub mod request;
pub mod socket_pool;
pub mod stats;
pub mod xlat;

pub use client::LoadGenerator;
pub use config::Config;
pub use endpoint::{Endpoint, EndpointList};
pub use error::{Error, Result};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpMessage;
pub use registry::{Registry, RequestHandle};
pub use request::{Fingerprint, Reply, Request, RequestState};
pub use socket_pool::SocketPool;
pub use stats::Stats;
pub use xlat::Expander;
