//! Stateless tcp relaying: every accepted stream is spliced onto a freshly dialed
//! destination connection until either side is done.

use std::io;
use std::net::SocketAddr;

use async_shutdown::ShutdownManager;
use tokio::net::{TcpListener, TcpStream};

use crate::dial::Dialer;
use crate::error::{Error, Result};
use crate::socket::{create_tcp_listener, resolve_addr};

#[derive(Clone, Debug)]
pub struct TcpRelayConfig {
    pub nodelay: bool,
}

impl Default for TcpRelayConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpRelayConfig {
    pub fn set_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

pub struct TcpRelay {
    network: String,
    listen: String,
    dest: String,
    listener: TcpListener,
    dialer: Box<dyn Dialer>,
    config: TcpRelayConfig,
}

impl TcpRelay {
    pub async fn bind(
        network: &str,
        listen: &str,
        dest: &str,
        dialer: Box<dyn Dialer>,
        config: TcpRelayConfig,
    ) -> Result<TcpRelay> {
        let laddr = resolve_addr(network, listen)
            .await
            .map_err(|e| Error::not_resolved(network, listen, e))?;
        let listener = create_tcp_listener(laddr)?;
        log::info!("tcp listening in {}", listener.local_addr()?);
        Ok(TcpRelay {
            network: network.to_string(),
            listen: listen.to_string(),
            dest: dest.to_string(),
            listener,
            dialer,
            config,
        })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` is triggered. Splices already running are left alone.
    pub async fn run(self, shutdown: ShutdownManager<()>) -> Result<()> {
        if shutdown.wrap_cancel(self.accept_loop()).await.is_err() {
            log::debug!("recv shutdown signal: tcp relay to {} is shutdown", self.dest);
        }
        Ok(())
    }

    async fn accept_loop(&self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(rs) => rs,
                Err(e) => {
                    log::warn!("tcp accept in {}: {e:?}", self.listen);
                    continue;
                }
            };
            log::info!(
                "accept {addr} in {}:{}, try to dial {}",
                self.network,
                self.listen,
                self.dest
            );
            if let Err(e) = stream.set_nodelay(self.config.nodelay) {
                log::debug!("set_nodelay {addr}: {e:?}");
            }
            let dest = match self.dialer.dial(&self.network, &self.dest).await {
                Ok(dest) => dest,
                Err(e) => {
                    log::error!("tcp dial {} for {addr}: {e:?}", self.dest);
                    continue;
                }
            };
            tokio::spawn(splice(stream, dest, addr, self.dest.clone()));
        }
    }
}

async fn splice<D>(mut stream: TcpStream, mut dest: D, addr: SocketAddr, dest_addr: String)
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut stream, &mut dest).await {
        Ok((up, down)) => {
            log::debug!("tcp {addr} <=> {dest_addr} done, sent {up} received {down}")
        }
        Err(e) => log::debug!("tcp {addr} <=> {dest_addr}: {e:?}"),
    }
}
