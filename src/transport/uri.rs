//! Transport URI parsing.
//!
//! Client-side URIs accepted by [`crate::client::ClientBuilder`]:
//!
//! - `tcp://host:port` and `tcps://host:port`
//! - `ws://host:port/path` and `wss://host:port/path`
//! - `unix:///path/to.sock`
//!
//! `tcps`/`wss` parse fine but fail at dial time: TLS configuration lives
//! outside this crate.

use crate::error::{RSocketError, Result};

/// A parsed transport URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUri {
    /// Plain TCP, `host:port`.
    Tcp(String),
    /// TLS over TCP, `host:port`.
    Tls(String),
    /// WebSocket; keeps the full URL for the handshake request.
    Ws { url: String, addr: String },
    /// WebSocket over TLS.
    Wss { url: String, addr: String },
    /// Unix domain socket path.
    Unix(String),
}

impl TransportUri {
    /// Parse a URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| RSocketError::Unsupported(format!("URI without scheme: {}", uri)))?;

        match scheme {
            "tcp" => Ok(TransportUri::Tcp(host_port(rest, uri)?)),
            "tcps" | "tcp+tls" => Ok(TransportUri::Tls(host_port(rest, uri)?)),
            "ws" => Ok(TransportUri::Ws {
                url: uri.to_string(),
                addr: ws_addr(rest, 80, uri)?,
            }),
            "wss" => Ok(TransportUri::Wss {
                url: uri.to_string(),
                addr: ws_addr(rest, 443, uri)?,
            }),
            "unix" => {
                if rest.is_empty() {
                    return Err(RSocketError::Unsupported(format!(
                        "unix URI without path: {}",
                        uri
                    )));
                }
                Ok(TransportUri::Unix(rest.to_string()))
            }
            other => Err(RSocketError::Unsupported(format!(
                "unknown transport scheme: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TransportUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportUri::Tcp(addr) => write!(f, "tcp://{}", addr),
            TransportUri::Tls(addr) => write!(f, "tcps://{}", addr),
            TransportUri::Ws { url, .. } | TransportUri::Wss { url, .. } => f.write_str(url),
            TransportUri::Unix(path) => write!(f, "unix://{}", path),
        }
    }
}

fn host_port(rest: &str, uri: &str) -> Result<String> {
    if rest.is_empty() || !rest.contains(':') {
        return Err(RSocketError::Unsupported(format!(
            "expected host:port in {}",
            uri
        )));
    }
    Ok(rest.to_string())
}

/// Dial address for a websocket URL: strip the path, default the port.
fn ws_addr(rest: &str, default_port: u16, uri: &str) -> Result<String> {
    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(RSocketError::Unsupported(format!(
            "websocket URI without host: {}",
            uri
        )));
    }
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:{}", authority, default_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            TransportUri::parse("tcp://127.0.0.1:7878").unwrap(),
            TransportUri::Tcp("127.0.0.1:7878".to_string())
        );
    }

    #[test]
    fn test_parse_tcps() {
        assert_eq!(
            TransportUri::parse("tcps://example.com:443").unwrap(),
            TransportUri::Tls("example.com:443".to_string())
        );
    }

    #[test]
    fn test_parse_ws_with_path_and_default_port() {
        let uri = TransportUri::parse("ws://example.com/rsocket").unwrap();
        assert_eq!(
            uri,
            TransportUri::Ws {
                url: "ws://example.com/rsocket".to_string(),
                addr: "example.com:80".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_wss_explicit_port() {
        let uri = TransportUri::parse("wss://example.com:9443/sock").unwrap();
        assert_eq!(
            uri,
            TransportUri::Wss {
                url: "wss://example.com:9443/sock".to_string(),
                addr: "example.com:9443".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            TransportUri::parse("unix:///tmp/app.sock").unwrap(),
            TransportUri::Unix("/tmp/app.sock".to_string())
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(TransportUri::parse("127.0.0.1:7878").is_err());
        assert!(TransportUri::parse("ftp://host:21").is_err());
        assert!(TransportUri::parse("tcp://nohostport").is_err());
        assert!(TransportUri::parse("unix://").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for uri in [
            "tcp://127.0.0.1:7878",
            "ws://example.com:8080/rsocket",
            "unix:///tmp/app.sock",
        ] {
            assert_eq!(TransportUri::parse(uri).unwrap().to_string(), uri);
        }
    }
}
