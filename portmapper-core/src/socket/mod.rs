use anyhow::Context;
use socket2::Protocol;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family restriction carried by the network name, `udp4`/`tcp6` and so on.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Family {
    #[default]
    Any,
    V4,
    V6,
}

impl Family {
    pub fn from_network(network: &str) -> Family {
        if network.ends_with('4') {
            Family::V4
        } else if network.ends_with('6') {
            Family::V6
        } else {
            Family::Any
        }
    }
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `addr` and pick the first result allowed by the family of `network`.
pub async fn resolve_addr(network: &str, addr: &str) -> io::Result<SocketAddr> {
    let family = Family::from_network(network);
    let mut addrs = tokio::net::lookup_host(addr).await?;
    addrs.find(|v| family.matches(v)).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address resolved for {addr}"),
        )
    })
}

pub(crate) fn bind_udp_ops(
    addr: SocketAddr,
    only_v6: bool,
    recv_buffer_size: Option<usize>,
) -> anyhow::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(only_v6)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    if let Some(size) = recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            log::warn!("set_recv_buffer_size {size} on {addr}: {e:?}")
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind the listening socket of a udp mapping.
pub fn bind_udp(
    addr: SocketAddr,
    recv_buffer_size: Option<usize>,
) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket =
        bind_udp_ops(addr, false, recv_buffer_size).with_context(|| format!("bind_udp {}", addr))?;
    let udp: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(udp)?)
}

/// Bind an ephemeral socket able to reach `dest`.
pub(crate) fn bind_udp_for(dest: &SocketAddr) -> anyhow::Result<tokio::net::UdpSocket> {
    let local: SocketAddr = if dest.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = bind_udp_ops(local, true, None).with_context(|| format!("bind_udp for {}", dest))?;
    let udp: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(udp)?)
}

pub fn create_tcp_listener(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv6() {
        let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?;
        socket
            .set_only_v6(false)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    } else {
        socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    };
    socket
        .set_reuse_address(true)
        .context("set_reuse_address")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind_tcp {}", addr))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(tokio::net::TcpListener::from_std(listener)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_network() {
        assert_eq!(Family::from_network("udp"), Family::Any);
        assert_eq!(Family::from_network("udp4"), Family::V4);
        assert_eq!(Family::from_network("tcp6"), Family::V6);
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(Family::V4.matches(&v4));
        assert!(!Family::V6.matches(&v4));
    }

    #[tokio::test]
    async fn resolve_respects_family() {
        let addr = resolve_addr("udp4", "127.0.0.1:9000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert!(resolve_addr("udp6", "127.0.0.1:9000").await.is_err());
    }

    #[tokio::test]
    async fn bind_udp_loopback() {
        let udp = bind_udp("127.0.0.1:0".parse().unwrap(), Some(1 << 20)).unwrap();
        assert_ne!(udp.local_addr().unwrap().port(), 0);
    }
}
