//! # portmapper-core - Relay engine for port mappings
//!
//! `portmapper-core` relays traffic from a listening address to a destination.
//! Tcp streams are spliced onto a dialed destination connection one to one. Udp
//! has no connections, so the udp relay emulates a stateful NAT: every source
//! address gets its own [`udp::Session`] with a dedicated destination connection,
//! kept alive by traffic and closed after an idle window.
//!
//! ## Architecture
//!
//! - [`pool`] - reusable datagram buffers with release-once accounting
//! - [`dial`] - the [`dial::Dialer`] capability used to reach destinations
//! - [`udp`] - listener loop, session registry and sessions
//! - [`tcp`] - accept loop and stream splice
//! - [`idle`] - idle tick counting
//! - [`socket`] - address resolution and socket setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_shutdown::ShutdownManager;
//! use portmapper_core::dial::DirectDialer;
//! use portmapper_core::udp::{UdpRelay, UdpRelayConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> portmapper_core::error::Result<()> {
//! let relay = UdpRelay::bind(
//!     "udp",
//!     "127.0.0.1:9000",
//!     "127.0.0.1:9100",
//!     Box::new(DirectDialer::default()),
//!     UdpRelayConfig::default(),
//! )
//! .await?;
//! let shutdown = ShutdownManager::new();
//! tokio::spawn(relay.run(shutdown.clone()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! Only setting up a relay (resolving and binding the listening address) reports
//! errors. Once running, failures are logged and absorbed: a datagram whose
//! session cannot be dialed is dropped, transient write or read errors are
//! skipped, and terminal conditions on a destination connection close the
//! affected session.

pub mod dial;
pub mod error;
pub mod idle;
pub mod pool;
pub mod socket;
pub mod tcp;
pub mod udp;
