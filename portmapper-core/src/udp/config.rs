use std::time::Duration;

use crate::error::{Error, Result};

pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const IDLE_TICKS: u32 = 5;
pub(crate) const DEST_READ_BUF_SIZE: usize = 8192;
pub(crate) const LISTEN_RECV_BUF_SIZE: usize = 1048576;
pub(crate) const PACKET_BUF_SIZE: usize = 65536;
pub(crate) const POOL_CAPACITY: usize = 128;
pub(crate) const PENDING_PACKETS: usize = 64;

#[derive(Clone, Debug)]
pub struct UdpRelayConfig {
    /// Period of a session's idle supervisor.
    pub tick_interval: Duration,
    /// Ticks without relay activity before a session is closed. A session idles
    /// out between `(idle_ticks - 1) * tick_interval` and `idle_ticks * tick_interval`.
    pub idle_ticks: u32,
    pub dest_read_buf_size: usize,
    pub listen_recv_buf_size: usize,
    pub packet_buf_size: usize,
    pub pool_capacity: usize,
    /// Datagrams parked for a peer while its destination is being dialed.
    /// Later ones are dropped until the session is up.
    pub pending_packets: usize,
    /// Bound on dialing the destination for a new peer. `None` waits forever.
    pub dial_timeout: Option<Duration>,
    /// Pause after a failed read on the listening socket. `None` retries at once.
    pub read_error_backoff: Option<Duration>,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            idle_ticks: IDLE_TICKS,
            dest_read_buf_size: DEST_READ_BUF_SIZE,
            listen_recv_buf_size: LISTEN_RECV_BUF_SIZE,
            packet_buf_size: PACKET_BUF_SIZE,
            pool_capacity: POOL_CAPACITY,
            pending_packets: PENDING_PACKETS,
            dial_timeout: None,
            read_error_backoff: None,
        }
    }
}

impl UdpRelayConfig {
    pub fn check(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick_interval cannot be 0"));
        }
        if self.idle_ticks == 0 {
            return Err(Error::InvalidConfig("idle_ticks cannot be 0"));
        }
        if self.dest_read_buf_size == 0 {
            return Err(Error::InvalidConfig("dest_read_buf_size cannot be 0"));
        }
        if self.packet_buf_size == 0 {
            return Err(Error::InvalidConfig("packet_buf_size cannot be 0"));
        }
        if self.pending_packets == 0 {
            return Err(Error::InvalidConfig("pending_packets cannot be 0"));
        }
        Ok(())
    }
    pub fn set_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
    pub fn set_idle_ticks(mut self, idle_ticks: u32) -> Self {
        self.idle_ticks = idle_ticks;
        self
    }
    pub fn set_dest_read_buf_size(mut self, size: usize) -> Self {
        self.dest_read_buf_size = size;
        self
    }
    pub fn set_listen_recv_buf_size(mut self, size: usize) -> Self {
        self.listen_recv_buf_size = size;
        self
    }
    pub fn set_packet_buf_size(mut self, size: usize) -> Self {
        self.packet_buf_size = size;
        self
    }
    pub fn set_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
    pub fn set_pending_packets(mut self, pending_packets: usize) -> Self {
        self.pending_packets = pending_packets;
        self
    }
    pub fn set_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = Some(dial_timeout);
        self
    }
    pub fn set_read_error_backoff(mut self, backoff: Duration) -> Self {
        self.read_error_backoff = Some(backoff);
        self
    }
}
