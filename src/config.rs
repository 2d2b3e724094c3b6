//! forelay/src/config.rs
//! Immutable per-session configuration, persisted as a key=value file.

use crate::error::{ProxyError, Result};
use crate::types::{Credentials, ProxyKind};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_LOCAL_PORT: u16 = 3129;
pub const DEFAULT_BLACKLIST_MINUTES: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_GRACE_SECS: u64 = 5;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Configuration snapshot. A session never mutates it; start/stop is the
/// boundary at which a new snapshot takes effect.
///
/// The stored password is Base64-wrapped on disk. That is obfuscation, not
/// encryption: anyone with read access to the file can recover it.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_port: u16,
    pub proxy_kind: ProxyKind,
    pub http_host: Option<String>,
    pub http_port: u16,
    pub socks4_host: Option<String>,
    pub socks4_port: u16,
    pub socks5_host: Option<String>,
    pub socks5_port: u16,
    pub pac_file_location: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub store_password: bool,
    pub use_kerberos: bool,
    pub test_url: String,
    pub blacklist_timeout: Duration,
    pub connect_timeout: Duration,
    pub tunnel_read_timeout: Option<Duration>,
    pub duplex_grace: Duration,
    /// Whether failed CONNECTs get a synthesized 502/504; some clients
    /// mishandle an error status after CONNECT was issued.
    pub connect_error_responses: bool,
    pub max_connections: usize,
    pub autostart: bool,
    pub autodetect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_port: DEFAULT_LOCAL_PORT,
            proxy_kind: ProxyKind::Direct,
            http_host: None,
            http_port: 3128,
            socks4_host: None,
            socks4_port: 1080,
            socks5_host: None,
            socks5_port: 1080,
            pac_file_location: None,
            username: None,
            password: None,
            store_password: false,
            use_kerberos: false,
            test_url: "http://example.com".to_string(),
            blacklist_timeout: Duration::from_secs(DEFAULT_BLACKLIST_MINUTES * 60),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            tunnel_read_timeout: None,
            duplex_grace: Duration::from_secs(DEFAULT_GRACE_SECS),
            connect_error_responses: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            autostart: false,
            autodetect: false,
        }
    }
}

impl Config {
    /// Loads a key=value properties file. Unknown keys are ignored with a
    /// warning so newer files still load on older builds.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        let mut cfg = Config::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ProxyError::Internal(format!(
                    "{}:{}: expected key=value",
                    path.display(),
                    lineno + 1
                )));
            };
            cfg.apply(key.trim(), value.trim())?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "local.port" => self.local_port = parse_port(key, value)?,
            "proxy.type" => self.proxy_kind = ProxyKind::parse(value)?,
            "proxy.http.host" => self.http_host = non_empty(value),
            "proxy.http.port" => self.http_port = parse_port(key, value)?,
            "proxy.socks4.host" => self.socks4_host = non_empty(value),
            "proxy.socks4.port" => self.socks4_port = parse_port(key, value)?,
            "proxy.socks5.host" => self.socks5_host = non_empty(value),
            "proxy.socks5.port" => self.socks5_port = parse_port(key, value)?,
            "proxy.pac.fileLocation" => self.pac_file_location = non_empty(value),
            "proxy.username" => self.username = non_empty(value),
            "proxy.password" => {
                self.password = match BASE64.decode(value) {
                    Ok(raw) => String::from_utf8(raw).ok().and_then(|s| non_empty(&s)),
                    Err(_) => {
                        warn!("proxy.password is not valid Base64, ignoring");
                        None
                    }
                }
            }
            "proxy.storePassword" => self.store_password = parse_bool(key, value)?,
            "proxy.kerberos" => self.use_kerberos = parse_bool(key, value)?,
            "proxy.test.url" => {
                if let Some(v) = non_empty(value) {
                    self.test_url = v;
                }
            }
            "blacklist.timeout" => {
                self.blacklist_timeout = Duration::from_secs(parse_u64(key, value)? * 60)
            }
            "connect.timeout" => {
                self.connect_timeout = Duration::from_secs(parse_u64(key, value)?)
            }
            "tunnel.readTimeout" => {
                let secs = parse_u64(key, value)?;
                self.tunnel_read_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "connect.errorResponses" => self.connect_error_responses = parse_bool(key, value)?,
            "max.connections" => {
                let n = parse_u64(key, value)? as usize;
                if n == 0 {
                    return Err(ProxyError::Internal("max.connections must be > 0".into()));
                }
                self.max_connections = n;
            }
            "autostart" => self.autostart = parse_bool(key, value)?,
            "autodetect" => self.autodetect = parse_bool(key, value)?,
            other => warn!("ignoring unknown configuration key {other}"),
        }
        Ok(())
    }

    /// Serializes the snapshot back to the properties format.
    pub fn store(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "local.port={}", self.local_port);
        let _ = writeln!(out, "proxy.type={}", self.proxy_kind);
        if let Some(h) = &self.http_host {
            let _ = writeln!(out, "proxy.http.host={h}");
        }
        let _ = writeln!(out, "proxy.http.port={}", self.http_port);
        if let Some(h) = &self.socks4_host {
            let _ = writeln!(out, "proxy.socks4.host={h}");
        }
        let _ = writeln!(out, "proxy.socks4.port={}", self.socks4_port);
        if let Some(h) = &self.socks5_host {
            let _ = writeln!(out, "proxy.socks5.host={h}");
        }
        let _ = writeln!(out, "proxy.socks5.port={}", self.socks5_port);
        if let Some(p) = &self.pac_file_location {
            let _ = writeln!(out, "proxy.pac.fileLocation={p}");
        }
        if let Some(u) = &self.username {
            let _ = writeln!(out, "proxy.username={u}");
        }
        if self.store_password {
            if let Some(p) = &self.password {
                let _ = writeln!(out, "proxy.password={}", BASE64.encode(p.as_bytes()));
            }
        }
        let _ = writeln!(out, "proxy.storePassword={}", self.store_password);
        let _ = writeln!(out, "proxy.kerberos={}", self.use_kerberos);
        let _ = writeln!(out, "proxy.test.url={}", self.test_url);
        let _ = writeln!(
            out,
            "blacklist.timeout={}",
            self.blacklist_timeout.as_secs() / 60
        );
        let _ = writeln!(out, "connect.timeout={}", self.connect_timeout.as_secs());
        let _ = writeln!(
            out,
            "tunnel.readTimeout={}",
            self.tunnel_read_timeout.map_or(0, |d| d.as_secs())
        );
        let _ = writeln!(
            out,
            "connect.errorResponses={}",
            self.connect_error_responses
        );
        let _ = writeln!(out, "max.connections={}", self.max_connections);
        let _ = writeln!(out, "autostart={}", self.autostart);
        let _ = writeln!(out, "autodetect={}", self.autodetect);
        fs::write(path, out)?;
        Ok(())
    }

    /// Host and port for one specific upstream kind. Each kind reads its own
    /// fields; setting one never touches another.
    pub fn upstream_endpoint(&self, kind: ProxyKind) -> Option<(String, u16)> {
        match kind {
            ProxyKind::Http => self.http_host.clone().map(|h| (h, self.http_port)),
            ProxyKind::Socks4 => self.socks4_host.clone().map(|h| (h, self.socks4_port)),
            ProxyKind::Socks5 => self.socks5_host.clone().map(|h| (h, self.socks5_port)),
            ProxyKind::Pac | ProxyKind::Direct => None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            use_kerberos: self.use_kerberos,
        }
    }

    /// Populates the upstream settings from the system proxy configuration
    /// when `autodetect` is set and nothing explicit is configured.
    pub fn apply_system_proxy(&mut self, detector: &dyn SystemProxyDetector) {
        if !self.autodetect {
            return;
        }
        let Some(found) = detector.detect() else {
            warn!("autodetect is set but no system proxy settings were found");
            return;
        };
        if let Some(pac) = found.pac_url {
            if self.pac_file_location.is_none() {
                self.proxy_kind = ProxyKind::Pac;
                self.pac_file_location = Some(pac);
            }
        } else if let Some((host, port)) = found.http {
            if self.http_host.is_none() {
                self.http_host = Some(host);
                self.http_port = port;
            }
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| ProxyError::Internal(format!("{key}: bad port value {value}")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| ProxyError::Internal(format!("{key}: bad numeric value {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ProxyError::Internal(format!(
            "{key}: bad boolean value {value}"
        ))),
    }
}

/// System proxy settings as read from the OS.
#[derive(Debug, Default, Clone)]
pub struct DetectedProxy {
    pub pac_url: Option<String>,
    pub http: Option<(String, u16)>,
}

/// Reads the system's configured proxy settings. Platform-native readers
/// are supplied by the embedder; the default reads the `http_proxy`
/// environment convention.
pub trait SystemProxyDetector {
    fn detect(&self) -> Option<DetectedProxy>;
}

pub struct EnvProxyDetector;

impl SystemProxyDetector for EnvProxyDetector {
    fn detect(&self) -> Option<DetectedProxy> {
        let raw = std::env::var("http_proxy")
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .ok()?;
        let url = url::Url::parse(&raw).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port().unwrap_or(3128);
        Some(DetectedProxy {
            pac_url: None,
            http: Some((host, port)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.local_port, DEFAULT_LOCAL_PORT);
        assert_eq!(cfg.blacklist_timeout, Duration::from_secs(30 * 60));
        assert!(cfg.connect_error_responses);
    }

    #[test]
    fn load_round_trip() {
        let mut cfg = Config::default();
        cfg.local_port = 3130;
        cfg.proxy_kind = ProxyKind::Http;
        cfg.http_host = Some("gw.corp".into());
        cfg.http_port = 8080;
        cfg.username = Some("alice".into());
        cfg.password = Some("s3cret".into());
        cfg.store_password = true;
        cfg.blacklist_timeout = Duration::from_secs(10 * 60);
        cfg.tunnel_read_timeout = Some(Duration::from_secs(90));

        let file = NamedTempFile::new().unwrap();
        cfg.store(file.path()).unwrap();
        let loaded = Config::load(file.path()).unwrap();

        assert_eq!(loaded.local_port, 3130);
        assert_eq!(loaded.proxy_kind, ProxyKind::Http);
        assert_eq!(
            loaded.upstream_endpoint(ProxyKind::Http),
            Some(("gw.corp".to_string(), 8080))
        );
        assert_eq!(loaded.password.as_deref(), Some("s3cret"));
        assert_eq!(loaded.blacklist_timeout, Duration::from_secs(10 * 60));
        assert_eq!(loaded.tunnel_read_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn password_is_base64_wrapped_on_disk() {
        let mut cfg = Config::default();
        cfg.password = Some("hunter2".into());
        cfg.store_password = true;
        let file = NamedTempFile::new().unwrap();
        cfg.store(file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains(&BASE64.encode("hunter2")));
    }

    #[test]
    fn password_not_persisted_unless_requested() {
        let mut cfg = Config::default();
        cfg.password = Some("hunter2".into());
        cfg.store_password = false;
        let file = NamedTempFile::new().unwrap();
        cfg.store(file.path()).unwrap();
        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.password, None);
    }

    #[test]
    fn per_kind_endpoints_stay_separate() {
        let mut cfg = Config::default();
        cfg.http_host = Some("http-gw".into());
        cfg.http_port = 8080;
        cfg.socks5_host = Some("socks-gw".into());
        cfg.socks5_port = 1080;

        assert_eq!(
            cfg.upstream_endpoint(ProxyKind::Http),
            Some(("http-gw".to_string(), 8080))
        );
        assert_eq!(
            cfg.upstream_endpoint(ProxyKind::Socks5),
            Some(("socks-gw".to_string(), 1080))
        );
        assert_eq!(cfg.upstream_endpoint(ProxyKind::Socks4), None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "local.port=4000\nfuture.key=1\n").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.local_port, 4000);
    }

    struct FixedDetector(DetectedProxy);
    impl SystemProxyDetector for FixedDetector {
        fn detect(&self) -> Option<DetectedProxy> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn autodetect_fills_only_unset_fields() {
        let mut cfg = Config::default();
        cfg.autodetect = true;
        cfg.apply_system_proxy(&FixedDetector(DetectedProxy {
            pac_url: None,
            http: Some(("detected".into(), 8888)),
        }));
        assert_eq!(cfg.http_host.as_deref(), Some("detected"));
        assert_eq!(cfg.http_port, 8888);

        // An explicit host wins over detection.
        let mut cfg = Config::default();
        cfg.autodetect = true;
        cfg.http_host = Some("explicit".into());
        cfg.apply_system_proxy(&FixedDetector(DetectedProxy {
            pac_url: None,
            http: Some(("detected".into(), 8888)),
        }));
        assert_eq!(cfg.http_host.as_deref(), Some("explicit"));
    }
}
