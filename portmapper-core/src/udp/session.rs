use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_shutdown::ShutdownManager;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;

use crate::dial::BoxConn;
use crate::error::is_terminal;
use crate::idle::{idle_interval, IdleCounter};
use crate::pool::PacketBuf;
use crate::udp::config::UdpRelayConfig;
use crate::udp::registry::{PeerKey, RegistryInner, SessionRegistry};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the duties take ownership of when the session starts.
struct Duties {
    conn: BoxConn,
    receiver: flume::Receiver<PacketBuf>,
    socket: Arc<UdpSocket>,
    tick_interval: Duration,
    read_buf_size: usize,
}

/// One peer bound to its own destination connection.
///
/// A running session has three duties: the outbound relay (peer datagrams from
/// the handoff queue to the destination), the inbound relay (destination back to
/// the peer through the listening socket) and the idle supervisor. Any of them
/// may close the session; closing is idempotent.
pub struct Session {
    id: u64,
    key: PeerKey,
    peer: SocketAddr,
    dest: String,
    sender: flume::Sender<PacketBuf>,
    idle: IdleCounter,
    shutdown: ShutdownManager<()>,
    registry: Weak<RegistryInner>,
    duties: Mutex<Option<Duties>>,
}

impl Session {
    pub(crate) fn new(
        peer: SocketAddr,
        dest: String,
        conn: BoxConn,
        socket: Arc<UdpSocket>,
        registry: Weak<RegistryInner>,
        config: &UdpRelayConfig,
    ) -> Arc<Session> {
        // zero capacity: a send completes only once the outbound relay takes the datagram
        let (sender, receiver) = flume::bounded(0);
        Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            key: peer.into(),
            peer,
            dest,
            sender,
            idle: IdleCounter::new(config.idle_ticks),
            shutdown: ShutdownManager::new(),
            registry,
            duties: Mutex::new(Some(Duties {
                conn,
                receiver,
                socket,
                tick_interval: config.tick_interval,
                read_buf_size: config.dest_read_buf_size,
            })),
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn peer_key(&self) -> PeerKey {
        self.key
    }
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
    pub fn destination(&self) -> &str {
        &self.dest
    }
    pub fn idle_ticks(&self) -> u32 {
        self.idle.ticks()
    }
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_shutdown_triggered()
    }

    /// Start the duties. Only the first call has an effect.
    pub fn run(self: &Arc<Self>) {
        let Some(duties) = self.duties.lock().take() else {
            return;
        };
        let (reader, writer) = tokio::io::split(duties.conn);
        tokio::spawn(self.clone().outbound_relay(writer, duties.receiver));
        tokio::spawn(
            self.clone()
                .inbound_relay(reader, duties.socket, duties.read_buf_size),
        );
        tokio::spawn(self.clone().idle_supervisor(duties.tick_interval));
    }

    /// Tear the session down: stops every duty, which drops the destination
    /// connection and the receiving end of the handoff queue, and removes the
    /// session from its registry. Repeated or concurrent calls are no-ops.
    pub fn close(&self) {
        if self.shutdown.trigger_shutdown(()).is_err() {
            return;
        }
        log::info!("udp redirect {} <=> {} closed", self.key, self.dest);
        // never started
        drop(self.duties.lock().take());
        if let Some(registry) = SessionRegistry::upgrade(&self.registry) {
            registry.remove_session(&self.key, self.id);
        }
    }

    /// Hand a datagram to the outbound relay, waiting until it is taken.
    /// The datagram comes back if the session is closed.
    pub async fn send(&self, packet: PacketBuf) -> Result<(), PacketBuf> {
        if self.is_closed() {
            return Err(packet);
        }
        self.sender
            .send_async(packet)
            .await
            .map_err(|e| e.into_inner())
    }

    async fn outbound_relay(
        self: Arc<Self>,
        mut writer: WriteHalf<BoxConn>,
        receiver: flume::Receiver<PacketBuf>,
    ) {
        let rs = self
            .shutdown
            .wrap_cancel(async {
                // dropped with this future, so a closed session stops taking datagrams
                // even while a write to the destination is stuck
                let receiver = receiver;
                while let Ok(packet) = receiver.recv_async().await {
                    let rs = if packet.is_empty() {
                        writer.write(&packet).await.map(|_| ())
                    } else {
                        writer.write_all(&packet).await
                    };
                    packet.release();
                    match rs {
                        Ok(()) => {
                            self.idle.reset();
                            log::debug!("udp packet sent {} => {}", self.key, self.dest);
                        }
                        Err(e) if is_terminal(&e) => {
                            log::warn!("udp write {} => {}: {e:?}", self.key, self.dest);
                            return;
                        }
                        Err(e) => {
                            log::error!("udp write {} => {}: {e:?}", self.key, self.dest);
                        }
                    }
                }
            })
            .await;
        if rs.is_ok() {
            self.close();
            if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown())
                .await
                .is_err()
            {
                log::debug!("udp destination {} of {} shutdown timed out", self.dest, self.key);
            }
        }
    }

    async fn inbound_relay(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxConn>,
        socket: Arc<UdpSocket>,
        read_buf_size: usize,
    ) {
        let rs = self
            .shutdown
            .wrap_cancel(async {
                let mut buf = vec![0u8; read_buf_size];
                loop {
                    let len = match reader.read(&mut buf).await {
                        Ok(0) => {
                            log::debug!("udp destination {} of {} eof", self.dest, self.key);
                            return;
                        }
                        Ok(len) => len,
                        Err(e) if is_terminal(&e) => {
                            log::warn!("udp read {} <= {}: {e:?}", self.key, self.dest);
                            return;
                        }
                        Err(e) => {
                            log::error!("udp read {} <= {}: {e:?}", self.key, self.dest);
                            continue;
                        }
                    };
                    if let Err(e) = socket.send_to(&buf[..len], self.peer).await {
                        if is_terminal(&e) {
                            log::warn!("udp reply {} <= {}: {e:?}", self.key, self.dest);
                            return;
                        }
                        log::error!("udp reply {} <= {}: {e:?}", self.key, self.dest);
                        continue;
                    }
                    self.idle.reset();
                    log::debug!("udp packet received {} <= {}", self.key, self.dest);
                }
            })
            .await;
        if rs.is_ok() {
            self.close();
        }
    }

    async fn idle_supervisor(self: Arc<Self>, tick_interval: Duration) {
        let mut interval = idle_interval(tick_interval);
        let rs = self
            .shutdown
            .wrap_cancel(async {
                loop {
                    interval.tick().await;
                    if self.idle.tick() {
                        return;
                    }
                }
            })
            .await;
        if rs.is_ok() {
            log::debug!(
                "udp session {} idle for {} ticks",
                self.key,
                self.idle.threshold()
            );
            self.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::net::UdpSocket;

    use super::Session;
    use crate::pool::BufferPool;
    use crate::udp::config::UdpRelayConfig;
    use crate::udp::registry::SessionRegistry;

    /// A destination that accepts every write and never answers.
    pub(crate) struct SilentConn;

    impl AsyncRead for SilentConn {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for SilentConn {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A destination whose writes and shutdown never complete.
    struct StuckConn;

    impl AsyncRead for StuckConn {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for StuckConn {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    pub(crate) async fn new_session(registry: &SessionRegistry, peer: SocketAddr) -> Arc<Session> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Session::new(
            peer,
            "dest".into(),
            Box::new(SilentConn),
            socket,
            registry.downgrade(),
            &UdpRelayConfig::default(),
        )
    }

    /// A session whose destination is the returned in-memory stream.
    async fn duplex_session(
        registry: &SessionRegistry,
        peer: SocketAddr,
        config: &UdpRelayConfig,
    ) -> (Arc<Session>, DuplexStream) {
        let (conn, far) = tokio::io::duplex(4096);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let session = Session::new(
            peer,
            "dest".into(),
            Box::new(conn),
            socket,
            registry.downgrade(),
            config,
        );
        (session, far)
    }

    async fn register(registry: &SessionRegistry, session: Arc<Session>) -> Arc<Session> {
        registry
            .acquire_session(session.peer_key(), || async move { Ok(session) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn close_is_idempotent_and_concurrent() {
        let registry = SessionRegistry::new();
        let session = new_session(&registry, "127.0.0.1:41000".parse().unwrap()).await;
        let session = register(&registry, session).await;
        assert_eq!(registry.len(), 1);

        let mut join = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            join.push(tokio::spawn(async move { session.close() }));
        }
        for handle in join {
            handle.await.unwrap();
        }
        session.close();
        assert!(session.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let registry = SessionRegistry::new();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, mut far) = duplex_session(
            &registry,
            peer.local_addr().unwrap(),
            &UdpRelayConfig::default(),
        )
        .await;
        let session = register(&registry, session).await;
        let pool = BufferPool::new(4, 1500);

        let mut packet = pool.acquire();
        packet.extend_from_slice(b"to destination");
        session.send(packet).await.unwrap();
        let mut buf = [0; 64];
        let len = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"to destination");

        far.write_all(b"to peer").await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"to peer");

        session.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn close_drops_destination_and_rejects_sends() {
        let registry = SessionRegistry::new();
        let (session, mut far) = duplex_session(
            &registry,
            "127.0.0.1:41001".parse().unwrap(),
            &UdpRelayConfig::default(),
        )
        .await;
        let session = register(&registry, session).await;
        session.close();

        let mut buf = [0; 16];
        let len = tokio::time::timeout(Duration::from_secs(1), far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 0);

        let pool = BufferPool::new(4, 64);
        assert!(session.send(pool.acquire()).await.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn destination_eof_closes_session() {
        let registry = SessionRegistry::new();
        let (session, far) = duplex_session(
            &registry,
            "127.0.0.1:41002".parse().unwrap(),
            &UdpRelayConfig::default(),
        )
        .await;
        let session = register(&registry, session).await;
        drop(far);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_supervisor_closes_at_threshold() {
        let registry = SessionRegistry::new();
        let config = UdpRelayConfig::default()
            .set_tick_interval(Duration::from_millis(100))
            .set_idle_ticks(3);
        let (session, _far) =
            duplex_session(&registry, "127.0.0.1:41003".parse().unwrap(), &config).await;
        let session = register(&registry, session).await;

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(!session.is_closed());
        assert_eq!(session.idle_ticks(), 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(session.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_in_last_tick_restarts_window() {
        let registry = SessionRegistry::new();
        let config = UdpRelayConfig::default()
            .set_tick_interval(Duration::from_millis(100))
            .set_idle_ticks(3);
        let (session, mut far) =
            duplex_session(&registry, "127.0.0.1:41005".parse().unwrap(), &config).await;
        let session = register(&registry, session).await;
        let pool = BufferPool::new(4, 64);

        // two ticks are in, the third would close the session
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(session.idle_ticks(), 2);
        let mut packet = pool.acquire();
        packet.extend_from_slice(b"late");
        session.send(packet).await.unwrap();
        let mut buf = [0; 16];
        far.read(&mut buf).await.unwrap();
        assert_eq!(session.idle_ticks(), 0);

        // ticks at 300 and 400 only count up again, the one at 500 closes
        tokio::time::sleep(Duration::from_millis(249)).await;
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn close_releases_sender_behind_stuck_write() {
        let registry = SessionRegistry::new();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let session = Session::new(
            "127.0.0.1:41006".parse().unwrap(),
            "dest".into(),
            Box::new(StuckConn),
            socket,
            registry.downgrade(),
            &UdpRelayConfig::default(),
        );
        let session = register(&registry, session).await;
        let pool = BufferPool::new(4, 64);

        // taken by the outbound relay, whose write never completes
        session.send(pool.acquire()).await.unwrap();
        let blocked = {
            let session = session.clone();
            let packet = pool.acquire();
            tokio::spawn(async move { session.send(packet).await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        session.close();
        let rejected = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("sender still blocked after close")
            .unwrap();
        assert!(rejected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn activity_resets_idle_window() {
        let registry = SessionRegistry::new();
        let config = UdpRelayConfig::default()
            .set_tick_interval(Duration::from_millis(40))
            .set_idle_ticks(3);
        let (session, mut far) =
            duplex_session(&registry, "127.0.0.1:41004".parse().unwrap(), &config).await;
        let session = register(&registry, session).await;
        let pool = BufferPool::new(4, 64);

        let mut buf = [0; 16];
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let mut packet = pool.acquire();
            packet.extend_from_slice(b"keep");
            session.send(packet).await.unwrap();
            far.read(&mut buf).await.unwrap();
        }
        assert!(!session.is_closed());
        session.close();
    }
}
