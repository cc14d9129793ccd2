use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mapping::Mapping;
use portmapper_core::tcp::TcpRelayConfig;
use portmapper_core::udp::UdpRelayConfig;

/// Runtime settings shared by every mapping started from one configuration.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub udp: UdpRelayConfig,
    pub tcp: TcpRelayConfig,
}

impl RelayConfig {
    pub fn set_udp_config(mut self, udp: UdpRelayConfig) -> Self {
        self.udp = udp;
        self
    }
    pub fn set_tcp_config(mut self, tcp: TcpRelayConfig) -> Self {
        self.tcp = tcp;
        self
    }
}

/// The on-disk configuration.
///
/// ```json
/// {
///   "mappings": [{ "net": "udp", "src": "0.0.0.0:5353", "dst": "10.0.0.1:53" }],
///   "udp": { "tick_secs": 60, "idle_ticks": 5 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub mappings: Vec<Mapping>,
    pub udp: UdpSettings,
    pub tcp: TcpSettings,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FileConfig> {
        let data = std::fs::read(path)?;
        Self::from_slice(&data)
    }
    pub fn from_slice(data: &[u8]) -> Result<FileConfig> {
        Ok(serde_json::from_slice(data)?)
    }
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            udp: (&self.udp).into(),
            tcp: (&self.tcp).into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    pub tick_secs: u64,
    pub idle_ticks: u32,
    pub dest_read_buf_size: usize,
    pub listen_recv_buf_size: usize,
    pub packet_buf_size: usize,
    pub pool_capacity: usize,
    pub pending_packets: usize,
    pub dial_timeout_ms: Option<u64>,
    pub read_error_backoff_ms: Option<u64>,
}

impl Default for UdpSettings {
    fn default() -> Self {
        let config = UdpRelayConfig::default();
        Self {
            tick_secs: config.tick_interval.as_secs(),
            idle_ticks: config.idle_ticks,
            dest_read_buf_size: config.dest_read_buf_size,
            listen_recv_buf_size: config.listen_recv_buf_size,
            packet_buf_size: config.packet_buf_size,
            pool_capacity: config.pool_capacity,
            pending_packets: config.pending_packets,
            dial_timeout_ms: None,
            read_error_backoff_ms: None,
        }
    }
}

impl From<&UdpSettings> for UdpRelayConfig {
    fn from(settings: &UdpSettings) -> Self {
        let mut config = UdpRelayConfig::default()
            .set_tick_interval(Duration::from_secs(settings.tick_secs))
            .set_idle_ticks(settings.idle_ticks)
            .set_dest_read_buf_size(settings.dest_read_buf_size)
            .set_listen_recv_buf_size(settings.listen_recv_buf_size)
            .set_packet_buf_size(settings.packet_buf_size)
            .set_pool_capacity(settings.pool_capacity)
            .set_pending_packets(settings.pending_packets);
        if let Some(ms) = settings.dial_timeout_ms {
            config = config.set_dial_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.read_error_backoff_ms {
            config = config.set_read_error_backoff(Duration::from_millis(ms));
        }
        config
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub nodelay: bool,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl From<&TcpSettings> for TcpRelayConfig {
    fn from(settings: &TcpSettings) -> Self {
        TcpRelayConfig::default().set_nodelay(settings.nodelay)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::FileConfig;
    use crate::mapping::Mapping;

    #[test]
    fn empty_document_uses_defaults() {
        let file = FileConfig::from_slice(b"{}").unwrap();
        assert!(file.mappings.is_empty());
        let config = file.relay_config();
        assert_eq!(config.udp.tick_interval, Duration::from_secs(60));
        assert_eq!(config.udp.idle_ticks, 5);
        assert_eq!(config.udp.dest_read_buf_size, 8192);
        assert_eq!(config.udp.listen_recv_buf_size, 1048576);
        assert_eq!(config.udp.dial_timeout, None);
        assert!(config.tcp.nodelay);
    }

    #[test]
    fn parses_mappings_and_overrides() {
        let file = FileConfig::from_slice(
            br#"{
                "mappings": [
                    {"net": "udp", "src": "127.0.0.1:9000", "dst": "127.0.0.1:9100"},
                    {"network": "tcp", "listen": "127.0.0.1:8000", "destination": "127.0.0.1:8100"}
                ],
                "udp": {"tick_secs": 10, "idle_ticks": 3, "dial_timeout_ms": 500}
            }"#,
        )
        .unwrap();
        assert_eq!(
            file.mappings,
            vec![
                Mapping::new("udp", "127.0.0.1:9000", "127.0.0.1:9100"),
                Mapping::new("tcp", "127.0.0.1:8000", "127.0.0.1:8100"),
            ]
        );
        let config = file.relay_config();
        assert_eq!(config.udp.tick_interval, Duration::from_secs(10));
        assert_eq!(config.udp.idle_ticks, 3);
        assert_eq!(config.udp.dial_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.udp.dest_read_buf_size, 8192);
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(FileConfig::from_slice(b"{\"mappings\": 1}").is_err());
    }
}
