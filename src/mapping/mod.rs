use std::fmt;

use serde::{Deserialize, Serialize};

/// One declared relay: traffic to `listen` is relayed to `destination`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// `udp`, `udp4`, `udp6`, `tcp`, `tcp4` or `tcp6`.
    #[serde(alias = "net")]
    pub network: String,
    #[serde(alias = "src")]
    pub listen: String,
    #[serde(alias = "dst")]
    pub destination: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RelayKind {
    Udp,
    Tcp,
}

impl Mapping {
    pub fn new<N: Into<String>, L: Into<String>, D: Into<String>>(
        network: N,
        listen: L,
        destination: D,
    ) -> Mapping {
        Self {
            network: network.into(),
            listen: listen.into(),
            destination: destination.into(),
        }
    }
    /// The relay selected by the network prefix, `None` for anything unknown.
    pub fn kind(&self) -> Option<RelayKind> {
        if self.network.starts_with("udp") {
            Some(RelayKind::Udp)
        } else if self.network.starts_with("tcp") {
            Some(RelayKind::Tcp)
        } else {
            None
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{} => {}", self.network, self.listen, self.destination)
    }
}
