//! Stateful udp relaying.
//!
//! Udp has no connection to follow, so the relay makes one up per source address:
//! the first datagram from a new peer dials the destination and starts a
//! [`Session`], later datagrams from that peer are handed to it in arrival order,
//! and a session with no traffic for the idle window closes itself.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::dial::Dialer;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, PacketBuf};
use crate::socket::{bind_udp, resolve_addr};

pub mod config;
pub mod registry;
pub mod session;

pub use config::UdpRelayConfig;
pub use registry::{PeerKey, SessionRegistry};
pub use session::Session;

/// The listener of one udp mapping.
pub struct UdpRelay {
    shared: Arc<RelayShared>,
}

struct RelayShared {
    network: String,
    dest: String,
    socket: Arc<UdpSocket>,
    registry: SessionRegistry,
    pool: BufferPool,
    dialer: Box<dyn Dialer>,
    config: UdpRelayConfig,
    /// Datagrams of peers whose session is being opened, in arrival order.
    pending: Mutex<HashMap<PeerKey, VecDeque<PacketBuf>>>,
}

impl UdpRelay {
    /// Bind the listening socket. Failing here is the only error the relay reports.
    pub async fn bind(
        network: &str,
        listen: &str,
        dest: &str,
        dialer: Box<dyn Dialer>,
        config: UdpRelayConfig,
    ) -> Result<UdpRelay> {
        config.check()?;
        let laddr = resolve_addr(network, listen)
            .await
            .map_err(|e| Error::not_resolved(network, listen, e))?;
        let socket = bind_udp(laddr, Some(config.listen_recv_buf_size))?;
        log::info!("udp listening in {}", socket.local_addr()?);
        Ok(UdpRelay {
            shared: Arc::new(RelayShared {
                network: network.to_string(),
                dest: dest.to_string(),
                socket: Arc::new(socket),
                registry: SessionRegistry::new(),
                pool: BufferPool::new(config.pool_capacity, config.packet_buf_size),
                dialer,
                config,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
    pub fn registry(&self) -> SessionRegistry {
        self.shared.registry.clone()
    }
    pub fn pool(&self) -> BufferPool {
        self.shared.pool.clone()
    }

    /// Relay until `shutdown` is triggered, then close every session.
    pub async fn run(self, shutdown: ShutdownManager<()>) -> Result<()> {
        let shared = self.shared;
        let rs = shutdown.wrap_cancel(shared.relay_loop(&shutdown)).await;
        shared.pending.lock().clear();
        shared.registry.close_all();
        match rs {
            Ok(rs) => rs,
            Err(()) => {
                log::debug!("recv shutdown signal: udp relay to {} is shutdown", shared.dest);
                Ok(())
            }
        }
    }
}

impl RelayShared {
    async fn relay_loop(self: &Arc<Self>, shutdown: &ShutdownManager<()>) -> Result<()> {
        loop {
            let mut packet = self.pool.acquire();
            let peer = match self.socket.recv_buf_from(&mut *packet).await {
                Ok((_, peer)) => peer,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => {
                    if should_ignore_error(&e) {
                        continue;
                    }
                    log::error!("udp recv for {}: {e:?}", self.dest);
                    if let Some(backoff) = self.config.read_error_backoff {
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };
            self.dispatch(peer, packet, shutdown).await;
        }
    }

    /// Hand a datagram to the session of its peer.
    ///
    /// A live session gets it inline, which keeps per-peer order and lets a slow
    /// destination push back on the listener. A peer without a session has its
    /// datagrams parked while the session is opened in the background, so a slow
    /// dial never holds up other peers.
    async fn dispatch(
        self: &Arc<Self>,
        peer: SocketAddr,
        packet: PacketBuf,
        shutdown: &ShutdownManager<()>,
    ) {
        let key = PeerKey::from(peer);
        let session = {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.get_mut(&key) {
                self.park(key, queue, packet);
                return;
            }
            self.registry.get(&key)
        };
        let packet = match session {
            Some(session) => match session.send(packet).await {
                Ok(()) => return,
                Err(packet) => {
                    log::debug!("udp session {key} closed before handoff");
                    // no-op unless the duties are still winding down
                    session.close();
                    packet
                }
            },
            None => packet,
        };
        // only the listener adds entries, none can have appeared meanwhile
        self.pending.lock().entry(key).or_default().push_back(packet);
        let relay = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = shutdown
                .wrap_cancel(relay.open_session(key, peer, &shutdown))
                .await;
        });
    }

    fn park(&self, key: PeerKey, queue: &mut VecDeque<PacketBuf>, packet: PacketBuf) {
        if queue.len() >= self.config.pending_packets {
            log::debug!(
                "drop udp packet from {key}: {} packets wait for {}",
                queue.len(),
                self.dest
            );
            return;
        }
        queue.push_back(packet);
    }

    /// Open the session of `key` and feed it the datagrams parked meanwhile.
    /// The parked queue goes away only once it is empty, so the listener
    /// switches to the live session without reordering.
    async fn open_session(
        self: Arc<Self>,
        key: PeerKey,
        peer: SocketAddr,
        shutdown: &ShutdownManager<()>,
    ) {
        let session = match self
            .registry
            .acquire_session(key, || self.create_session(peer))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let dropped = self.pending.lock().remove(&key).map_or(0, |queue| queue.len());
                log::error!(
                    "udp forward {key} => {}: {e}, drop {dropped} packets",
                    self.dest
                );
                return;
            }
        };
        if shutdown.is_shutdown_triggered() {
            session.close();
            return;
        }
        loop {
            let packet = {
                let mut pending = self.pending.lock();
                let Some(queue) = pending.get_mut(&key) else {
                    return;
                };
                match queue.pop_front() {
                    Some(packet) => packet,
                    None => {
                        pending.remove(&key);
                        return;
                    }
                }
            };
            if session.send(packet).await.is_err() {
                let dropped = self.pending.lock().remove(&key).map_or(0, |queue| queue.len());
                log::warn!(
                    "drop {} udp packets from {key}: session closed",
                    dropped + 1
                );
                return;
            }
        }
    }

    async fn create_session(&self, peer: SocketAddr) -> Result<Arc<Session>> {
        log::info!("udp forward got new addr {peer}");
        let dial = self.dialer.dial(&self.network, &self.dest);
        let conn = match self.config.dial_timeout {
            Some(timeout) => tokio::time::timeout(timeout, dial)
                .await
                .map_err(|_| Error::DialTimeout {
                    addr: self.dest.clone(),
                })??,
            None => dial.await?,
        };
        Ok(Session::new(
            peer,
            self.dest.clone(),
            conn,
            self.socket.clone(),
            self.registry.downgrade(),
            &self.config,
        ))
    }
}

fn should_ignore_error(e: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // WSAECONNRESET
        if let Some(os_error) = e.raw_os_error() {
            return os_error == 10054;
        }
    }
    _ = e;
    false
}
