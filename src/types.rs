//! forelay/src/types.rs
//! Core data structures and type aliases shared across the pipeline.

use crate::error::{ProxyError, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Configured upstream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
    Pac,
    Direct,
}

impl ProxyKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProxyKind::Http),
            "SOCKS4" => Ok(ProxyKind::Socks4),
            "SOCKS5" => Ok(ProxyKind::Socks5),
            "PAC" => Ok(ProxyKind::Pac),
            "DIRECT" => Ok(ProxyKind::Direct),
            other => Err(ProxyError::Internal(format!("unknown proxy type: {other}"))),
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyKind::Http => "HTTP",
            ProxyKind::Socks4 => "SOCKS4",
            ProxyKind::Socks5 => "SOCKS5",
            ProxyKind::Pac => "PAC",
            ProxyKind::Direct => "DIRECT",
        };
        f.write_str(s)
    }
}

/// One selectable way to reach a target. A selection yields a finite
/// ordered sequence of these to try.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamDirective {
    Http { host: String, port: u16 },
    Socks4 { host: String, port: u16 },
    Socks5 { host: String, port: u16 },
    Direct,
}

impl UpstreamDirective {
    pub fn kind(&self) -> ProxyKind {
        match self {
            UpstreamDirective::Http { .. } => ProxyKind::Http,
            UpstreamDirective::Socks4 { .. } => ProxyKind::Socks4,
            UpstreamDirective::Socks5 { .. } => ProxyKind::Socks5,
            UpstreamDirective::Direct => ProxyKind::Direct,
        }
    }

    /// Host and port of the upstream itself; absent for DIRECT.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            UpstreamDirective::Http { host, port }
            | UpstreamDirective::Socks4 { host, port }
            | UpstreamDirective::Socks5 { host, port } => Some((host.as_str(), *port)),
            UpstreamDirective::Direct => None,
        }
    }
}

impl fmt::Display for UpstreamDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamDirective::Http { host, port } => write!(f, "PROXY {host}:{port}"),
            UpstreamDirective::Socks4 { host, port } => write!(f, "SOCKS4 {host}:{port}"),
            UpstreamDirective::Socks5 { host, port } => write!(f, "SOCKS5 {host}:{port}"),
            UpstreamDirective::Direct => f.write_str("DIRECT"),
        }
    }
}

/// Where the client ultimately wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    pub host: String,
    pub port: u16,
    pub scheme: String,
}

impl TargetEndpoint {
    /// Parses an authority-form target (`host:port`, `[v6]:port`). The port
    /// is mandatory unless a default is supplied.
    pub fn from_authority(s: &str, default_port: Option<u16>, scheme: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProxyError::Protocol("empty request target".into()));
        }
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6 literal
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ProxyError::Protocol(format!("unclosed IPv6 literal: {s}")))?;
            match tail.strip_prefix(':') {
                Some(p) => (host.to_string(), Some(p)),
                None if tail.is_empty() => (host.to_string(), None),
                None => return Err(ProxyError::Protocol(format!("bad authority: {s}"))),
            }
        } else {
            match s.rsplit_once(':') {
                Some((h, p)) if !h.contains(':') => (h.to_string(), Some(p)),
                Some(_) => (s.to_string(), None), // unbracketed v6, no port
                None => (s.to_string(), None),
            }
        };
        let port = match (port, default_port) {
            (Some(p), _) => p
                .parse::<u16>()
                .map_err(|_| ProxyError::Protocol(format!("bad port in target: {s}")))?,
            (None, Some(d)) => d,
            (None, None) => {
                return Err(ProxyError::Protocol(format!("target is missing a port: {s}")));
            }
        };
        if host.is_empty() {
            return Err(ProxyError::Protocol(format!("target is missing a host: {s}")));
        }
        Ok(TargetEndpoint {
            host,
            port,
            scheme: scheme.to_string(),
        })
    }

    /// Parses an absolute-form target (`http://host:port/path`).
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| ProxyError::Protocol(format!("bad request target {uri}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Protocol(format!("target has no host: {uri}")))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::Protocol(format!("target has no port: {uri}")))?;
        Ok(TargetEndpoint {
            host,
            port,
            scheme: url.scheme().to_string(),
        })
    }

    /// `host:port`, with IPv6 literals re-bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Stored upstream credentials.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_kerberos: bool,
}

impl Credentials {
    /// Username/password pair for Basic and SOCKS5 sub-negotiation.
    /// A missing password counts as empty, a missing username as no creds.
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| (u, self.password.as_deref().unwrap_or("")))
    }
}

// Unified async stream trait so processors can hand heterogeneous upstream
// streams (plain TCP, buffered, SOCKS-wrapped) to the tunnel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_with_port() {
        let t = TargetEndpoint::from_authority("secure.example:443", None, "https").unwrap();
        assert_eq!(t.host, "secure.example");
        assert_eq!(t.port, 443);
        assert_eq!(t.authority(), "secure.example:443");
    }

    #[test]
    fn authority_requires_port_for_connect() {
        assert!(TargetEndpoint::from_authority("secure.example", None, "https").is_err());
        let t = TargetEndpoint::from_authority("example.org", Some(80), "http").unwrap();
        assert_eq!(t.port, 80);
    }

    #[test]
    fn authority_ipv6() {
        let t = TargetEndpoint::from_authority("[::1]:8443", None, "https").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.port, 8443);
        assert_eq!(t.authority(), "[::1]:8443");
    }

    #[test]
    fn absolute_uri_default_ports() {
        let t = TargetEndpoint::from_uri("http://example.org/index.html").unwrap();
        assert_eq!((t.host.as_str(), t.port, t.scheme.as_str()), ("example.org", 80, "http"));
        let t = TargetEndpoint::from_uri("https://example.org/").unwrap();
        assert_eq!(t.port, 443);
    }

    #[test]
    fn directive_display_matches_pac_syntax() {
        let d = UpstreamDirective::Http {
            host: "gw".into(),
            port: 8080,
        };
        assert_eq!(d.to_string(), "PROXY gw:8080");
        assert_eq!(UpstreamDirective::Direct.to_string(), "DIRECT");
    }

    #[test]
    fn credentials_pair() {
        let c = Credentials {
            username: Some("bob".into()),
            password: None,
            use_kerberos: false,
        };
        assert_eq!(c.basic_pair(), Some(("bob", "")));
        assert_eq!(Credentials::default().basic_pair(), None);
    }
}
