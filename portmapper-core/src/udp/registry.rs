use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::udp::session::Session;

/// The session key of a udp peer.
///
/// IPv4-mapped IPv6 sources are folded into their IPv4 form so a peer seen
/// through a dual-stack socket always maps to one key. Displays as `ip:port`.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct PeerKey(SocketAddr);

impl PeerKey {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        if let IpAddr::V6(ip) = addr.ip() {
            if let Some(v4) = ip.to_ipv4_mapped() {
                return PeerKey(SocketAddr::new(IpAddr::V4(v4), addr.port()));
            }
        }
        PeerKey(addr)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Empty while the destination of a new peer is being dialed.
type Slot = Arc<OnceCell<Arc<Session>>>;

pub(crate) struct RegistryInner {
    ports: Mutex<HashMap<PeerKey, Slot>>,
}

/// Peer address to live [`Session`].
///
/// The lock only guards map operations. Creating a session for a new peer runs
/// outside of it behind a per-peer slot, so a slow dial only holds up datagrams
/// from that same peer.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Self {
            inner: Arc::new(RegistryInner {
                ports: Mutex::new(HashMap::new()),
            }),
        }
    }
    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }
    pub(crate) fn upgrade(inner: &Weak<RegistryInner>) -> Option<SessionRegistry> {
        inner.upgrade().map(|inner| SessionRegistry { inner })
    }

    /// Return the live session of `peer`, creating it with `create` if there is none.
    ///
    /// Concurrent callers for the same peer share a single `create` call. A failed
    /// `create` leaves no entry behind. The duties of the session are started once
    /// it is in the registry.
    pub async fn acquire_session<F, Fut>(&self, peer: PeerKey, create: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>>>,
    {
        let slot = {
            let mut guard = self.inner.ports.lock();
            guard.entry(peer).or_default().clone()
        };
        match slot.get_or_try_init(create).await {
            Ok(session) => {
                let session = session.clone();
                session.run();
                Ok(session)
            }
            Err(e) => {
                let mut guard = self.inner.ports.lock();
                if let Some(current) = guard.get(&peer) {
                    // other callers still waiting on this slot will retry the creation
                    if Arc::ptr_eq(current, &slot)
                        && !current.initialized()
                        && Arc::strong_count(&slot) == 2
                    {
                        guard.remove(&peer);
                    }
                }
                Err(e)
            }
        }
    }

    /// Remove the entry of `peer` whatever session it holds.
    pub fn remove_port(&self, peer: &PeerKey) -> bool {
        let mut guard = self.inner.ports.lock();
        if guard.remove(peer).is_none() {
            log::warn!("remove a port not exists: {peer}");
            return false;
        }
        log::debug!("remove port {peer}");
        true
    }

    /// Remove the entry of `peer` only if it still holds the session `id`.
    pub fn remove_session(&self, peer: &PeerKey, id: u64) -> bool {
        let mut guard = self.inner.ports.lock();
        let owned = guard
            .get(peer)
            .and_then(|slot| slot.get())
            .is_some_and(|session| session.id() == id);
        if !owned {
            log::warn!("remove a port not exists: {peer} (session {id})");
            return false;
        }
        guard.remove(peer);
        log::debug!("remove port {peer} (session {id})");
        true
    }

    pub fn get(&self, peer: &PeerKey) -> Option<Arc<Session>> {
        self.inner
            .ports
            .lock()
            .get(peer)
            .and_then(|slot| slot.get().cloned())
    }
    pub fn contains(&self, peer: &PeerKey) -> bool {
        self.get(peer).is_some()
    }
    /// Number of live sessions, pending creations excluded.
    pub fn len(&self) -> usize {
        self.inner
            .ports
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn peers(&self) -> Vec<PeerKey> {
        self.inner
            .ports
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(peer, _)| *peer)
            .collect()
    }
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .ports
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        for session in sessions {
            session.close();
        }
    }
}
