//! Port mappings: relay what arrives on a listening address to a destination.
//!
//! A [`Mapping`] names a network, a listening address and a destination.
//! [`create_portmap`] starts the matching relay from `portmapper-core` in the
//! background and hands back a [`PortMapHandle`] to observe or stop it.

pub mod config;
pub mod error;
pub mod mapping;

use std::net::SocketAddr;

use async_shutdown::ShutdownManager;

pub use config::{FileConfig, RelayConfig};
pub use error::{Error, Result};
pub use mapping::{Mapping, RelayKind};
pub use portmapper_core::dial::{BoxConn, Dialer, DirectDialer};
pub use portmapper_core::tcp::TcpRelayConfig;
pub use portmapper_core::udp::{SessionRegistry, UdpRelayConfig};

use portmapper_core::tcp::TcpRelay;
use portmapper_core::udp::UdpRelay;

/// Start the relay described by `mapping`.
///
/// Returns `Ok(None)` when the network is neither udp nor tcp. The listening
/// socket is bound before this returns, so setup failures are reported here;
/// everything after that is logged by the running relay.
pub async fn create_portmap(
    mapping: &Mapping,
    dialer: Box<dyn Dialer>,
    config: &RelayConfig,
) -> Result<Option<PortMapHandle>> {
    let Some(kind) = mapping.kind() else {
        log::warn!("unsupported network {:?} in {mapping}", mapping.network);
        return Ok(None);
    };
    let shutdown = ShutdownManager::new();
    let handle = match kind {
        RelayKind::Udp => {
            let relay = UdpRelay::bind(
                &mapping.network,
                &mapping.listen,
                &mapping.destination,
                dialer,
                config.udp.clone(),
            )
            .await?;
            let local_addr = relay.local_addr()?;
            let registry = relay.registry();
            let run = relay.run(shutdown.clone());
            spawn_relay(mapping.clone(), run);
            PortMapHandle {
                mapping: mapping.clone(),
                kind,
                local_addr,
                registry: Some(registry),
                shutdown,
            }
        }
        RelayKind::Tcp => {
            let relay = TcpRelay::bind(
                &mapping.network,
                &mapping.listen,
                &mapping.destination,
                dialer,
                config.tcp.clone(),
            )
            .await?;
            let local_addr = relay.local_addr()?;
            let run = relay.run(shutdown.clone());
            spawn_relay(mapping.clone(), run);
            PortMapHandle {
                mapping: mapping.clone(),
                kind,
                local_addr,
                registry: None,
                shutdown,
            }
        }
    };
    log::info!("port map {mapping} started on {}", handle.local_addr);
    Ok(Some(handle))
}

fn spawn_relay<F>(mapping: Mapping, run: F)
where
    F: std::future::Future<Output = portmapper_core::error::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = run.await {
            log::error!("port map {mapping}: {e:?}");
        }
        log::info!("port map {mapping} stopped");
    });
}

/// A running port mapping.
///
/// Dropping the handle leaves the relay running; call [`PortMapHandle::shutdown`]
/// to stop it.
pub struct PortMapHandle {
    mapping: Mapping,
    kind: RelayKind,
    local_addr: SocketAddr,
    registry: Option<SessionRegistry>,
    shutdown: ShutdownManager<()>,
}

impl PortMapHandle {
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }
    pub fn kind(&self) -> RelayKind {
        self.kind
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Live udp sessions. Always zero for tcp.
    pub fn session_count(&self) -> usize {
        self.registry.as_ref().map_or(0, |registry| registry.len())
    }
    pub fn registry(&self) -> Option<&SessionRegistry> {
        self.registry.as_ref()
    }
    /// Stop accepting and close every session. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shutdown.trigger_shutdown(()).is_err() {
            return;
        }
        if let Some(registry) = &self.registry {
            registry.close_all();
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown_triggered()
    }
}

/// Builds a port mapping step by step.
pub struct Builder {
    mapping: Option<Mapping>,
    dialer: Option<Box<dyn Dialer>>,
    config: RelayConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            mapping: None,
            dialer: None,
            config: RelayConfig::default(),
        }
    }
    pub fn mapping(mut self, mapping: Mapping) -> Self {
        self.mapping.replace(mapping);
        self
    }
    pub fn dialer<D: Dialer + 'static>(mut self, dialer: D) -> Self {
        self.dialer.replace(Box::new(dialer));
        self
    }
    pub fn udp_config(mut self, udp: UdpRelayConfig) -> Self {
        self.config.udp = udp;
        self
    }
    pub fn tcp_config(mut self, tcp: TcpRelayConfig) -> Self {
        self.config.tcp = tcp;
        self
    }
    pub async fn build(self) -> Result<Option<PortMapHandle>> {
        let mapping = self
            .mapping
            .ok_or_else(|| Error::InvalidArgument("mapping is required".into()))?;
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Box::new(DirectDialer::default().set_nodelay(self.config.tcp.nodelay)),
        };
        create_portmap(&mapping, dialer, &self.config).await
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
