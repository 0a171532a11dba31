//! Endpoint addresses: `unix:///path/to/csi.sock` or `tcp://host:port`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CsiError;

/// Where the plugin listens (or a client connects).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(CsiError::Config(format!("endpoint {s:?} has no socket path")));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let addr = addr.trim_end_matches('/');
            return addr
                .parse()
                .map(Self::Tcp)
                .map_err(|e| CsiError::Config(format!("endpoint {s:?}: {e}")));
        }
        Err(CsiError::Config(format!(
            "endpoint {s:?} must start with unix:// or tcp://"
        )))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix() {
        let ep: Endpoint = "unix:///csi/csi.sock".parse().unwrap();
        assert_eq!(ep, Endpoint::Unix("/csi/csi.sock".into()));
        assert_eq!(ep.to_string(), "unix:///csi/csi.sock");

        let ep: Endpoint = "unix:/tmp/plugin.sock".parse().unwrap();
        assert_eq!(ep, Endpoint::Unix("/tmp/plugin.sock".into()));
    }

    #[test]
    fn parse_tcp() {
        let ep: Endpoint = "tcp://127.0.0.1:10000".parse().unwrap();
        assert_eq!(ep, Endpoint::Tcp("127.0.0.1:10000".parse().unwrap()));
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:10000");
        assert!("tcp://[::1]:0".parse::<Endpoint>().is_ok());
    }

    #[test]
    fn reject_bad_endpoints() {
        for bad in ["", "unix://", "http://x:1", "/tmp/csi.sock", "tcp://nohost"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(CsiError::Config(_))),
                "{bad:?}"
            );
        }
    }
}
