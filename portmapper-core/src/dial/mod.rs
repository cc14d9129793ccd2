//! Outbound connections to a mapping's destination.
//!
//! The relays never open sockets towards the destination themselves; they go
//! through a [`Dialer`], so the destination may be reached over any transport
//! (for instance a further proxy hop) as long as it yields a duplex connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dyn_clone::DynClone;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use crate::socket::{bind_udp_for, resolve_addr};

pub trait DuplexConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexConn for T {}

pub type BoxConn = Box<dyn DuplexConn>;

#[async_trait]
pub trait Dialer: Send + Sync + DynClone {
    /// Open a connection to `addr` over `network` (`udp`, `tcp4`, ...).
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxConn>;
}
dyn_clone::clone_trait_object!(Dialer);

/// Dials the destination directly from this host.
#[derive(Clone, Debug)]
pub struct DirectDialer {
    nodelay: bool,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl DirectDialer {
    pub fn set_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxConn> {
        if network.starts_with("udp") {
            let dest = resolve_addr(network, addr).await?;
            let udp = bind_udp_for(&dest).map_err(io::Error::other)?;
            udp.connect(dest).await?;
            Ok(Box::new(DatagramConn::new(udp)))
        } else if network.starts_with("tcp") {
            let dest = resolve_addr(network, addr).await?;
            let stream = TcpStream::connect(dest).await?;
            stream.set_nodelay(self.nodelay)?;
            Ok(Box::new(stream))
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network: {network}"),
            ))
        }
    }
}

/// A connected datagram socket seen as a duplex connection: one read yields one
/// datagram and one write sends one datagram.
///
/// Empty datagrams are skipped on read since a zero-length read means end of
/// stream to every `AsyncRead` consumer.
#[derive(Debug)]
pub struct DatagramConn {
    udp: UdpSocket,
}

impl DatagramConn {
    pub fn new(udp: UdpSocket) -> Self {
        Self { udp }
    }
    pub fn get_ref(&self) -> &UdpSocket {
        &self.udp
    }
}

impl AsyncRead for DatagramConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let before = buf.filled().len();
            match self.udp.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() == before && buf.remaining() > 0 {
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
                rs => return rs,
            }
        }
    }
}

impl AsyncWrite for DatagramConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.udp.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    use super::{Dialer, DirectDialer};

    #[tokio::test]
    async fn dial_udp_keeps_datagram_boundaries() {
        let dest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let mut conn = DirectDialer::default().dial("udp", &dest_addr).await.unwrap();
        conn.write_all(b"first").await.unwrap();
        conn.write_all(b"second").await.unwrap();

        let mut buf = [0; 64];
        let (len, from) = dest.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"first");
        let (len, _) = dest.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"second");

        dest.send_to(b"", from).await.unwrap();
        dest.send_to(b"reply", from).await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(1), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"reply");
    }

    #[tokio::test]
    async fn dial_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut conn = DirectDialer::default().dial("tcp4", &addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn dial_unknown_network() {
        let rs = DirectDialer::default().dial("unix", "/tmp/x").await;
        assert_eq!(rs.err().unwrap().kind(), std::io::ErrorKind::Unsupported);
    }
}
