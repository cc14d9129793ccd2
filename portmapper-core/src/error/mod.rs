use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("{0:#}")]
    Setup(#[from] anyhow::Error),
    #[error("resolve {network} address {addr}: {source}")]
    AddrNotResolved {
        network: String,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial {addr} timed out")]
    DialTimeout { addr: String },
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl Error {
    pub(crate) fn not_resolved(network: &str, addr: &str, source: io::Error) -> Error {
        Error::AddrNotResolved {
            network: network.to_string(),
            addr: addr.to_string(),
            source,
        }
    }
}

/// Whether an I/O failure on an established connection should end the relay duty
/// that observed it. Everything else is treated as transient.
pub fn is_terminal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
