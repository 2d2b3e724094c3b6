//! forelay/src/selector.rs
//! Produces the ordered list of upstream directives to try for a target.

use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::types::{ProxyKind, UpstreamDirective};
use tracing::{debug, warn};

/// Contract for the external PAC evaluator: a pure function from
/// (url, host) to a semicolon-separated directive list, safe to call
/// concurrently.
pub trait PacEvaluator: Send + Sync {
    fn find_proxy_for_url(&self, url: &str, host: &str) -> Result<String>;
}

/// Parses a PAC result string (`PROXY h:p; SOCKS h:p; DIRECT`) into
/// directives, preserving order. Entries that cannot be understood are
/// skipped with a warning.
pub fn parse_pac_directives(list: &str) -> Vec<UpstreamDirective> {
    let mut out = Vec::new();
    for entry in list.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.split_whitespace();
        let keyword = parts.next().unwrap_or("").to_ascii_uppercase();
        if keyword == "DIRECT" {
            out.push(UpstreamDirective::Direct);
            continue;
        }
        let Some((host, port)) = parts.next().and_then(split_host_port) else {
            warn!("skipping malformed PAC entry: {entry}");
            continue;
        };
        match keyword.as_str() {
            "PROXY" | "HTTP" => out.push(UpstreamDirective::Http { host, port }),
            // Plain SOCKS historically means SOCKS4, but every deployment
            // that matters serves SOCKS5 on the same port.
            "SOCKS" | "SOCKS5" => out.push(UpstreamDirective::Socks5 { host, port }),
            "SOCKS4" => out.push(UpstreamDirective::Socks4 { host, port }),
            _ => warn!("skipping unknown PAC keyword: {entry}"),
        }
    }
    out
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Selects the candidates for one request: a single directive for fixed
/// kinds, the PAC evaluation for PAC mode, always with blacklisted entries
/// filtered out. If filtering empties the list the unfiltered list is
/// returned so a fully-blacklisted selection still gets a last-resort try.
pub fn select(
    config: &Config,
    blacklist: &Blacklist,
    pac: Option<&dyn PacEvaluator>,
    url: &str,
    host: &str,
) -> Result<Vec<UpstreamDirective>> {
    let all = candidates(config, pac, url, host)?;
    let usable: Vec<UpstreamDirective> = all
        .iter()
        .filter(|d| !blacklist.is_bad(d))
        .cloned()
        .collect();
    if usable.is_empty() && !all.is_empty() {
        debug!("every candidate upstream is blacklisted, retrying them all");
        return Ok(all);
    }
    Ok(usable)
}

fn candidates(
    config: &Config,
    pac: Option<&dyn PacEvaluator>,
    url: &str,
    host: &str,
) -> Result<Vec<UpstreamDirective>> {
    match config.proxy_kind {
        ProxyKind::Direct => Ok(vec![UpstreamDirective::Direct]),
        ProxyKind::Http | ProxyKind::Socks4 | ProxyKind::Socks5 => {
            let kind = config.proxy_kind;
            let (host, port) = config.upstream_endpoint(kind).ok_or_else(|| {
                ProxyError::Internal(format!("no {kind} upstream host configured"))
            })?;
            Ok(vec![match kind {
                ProxyKind::Http => UpstreamDirective::Http { host, port },
                ProxyKind::Socks4 => UpstreamDirective::Socks4 { host, port },
                ProxyKind::Socks5 => UpstreamDirective::Socks5 { host, port },
                _ => unreachable!(),
            }])
        }
        ProxyKind::Pac => {
            let pac = pac.ok_or_else(|| {
                ProxyError::Internal("PAC mode is configured but no evaluator is available".into())
            })?;
            let list = pac.find_proxy_for_url(url, host)?;
            debug!(%url, %list, "PAC evaluation");
            Ok(parse_pac_directives(&list))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedPac(&'static str);
    impl PacEvaluator for FixedPac {
        fn find_proxy_for_url(&self, _url: &str, _host: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn http(host: &str, port: u16) -> UpstreamDirective {
        UpstreamDirective::Http {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn parses_pac_directive_list_in_order() {
        let out = parse_pac_directives("PROXY gw1:8080; SOCKS gw2:1080; DIRECT");
        assert_eq!(
            out,
            vec![
                http("gw1", 8080),
                UpstreamDirective::Socks5 {
                    host: "gw2".into(),
                    port: 1080
                },
                UpstreamDirective::Direct,
            ]
        );
    }

    #[test]
    fn malformed_pac_entries_are_skipped() {
        let out = parse_pac_directives("PROXY noport; BOGUS x:1; PROXY ok:3128");
        assert_eq!(out, vec![http("ok", 3128)]);
    }

    #[test]
    fn fixed_kind_yields_single_directive() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Http;
        cfg.http_host = Some("gw.corp".into());
        cfg.http_port = 8080;
        let bl = Blacklist::new(Duration::from_secs(60));
        let out = select(&cfg, &bl, None, "http://example.org/", "example.org").unwrap();
        assert_eq!(out, vec![http("gw.corp", 8080)]);
    }

    #[test]
    fn fixed_kind_without_host_is_an_error() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Socks5;
        let bl = Blacklist::new(Duration::from_secs(60));
        assert!(select(&cfg, &bl, None, "http://x/", "x").is_err());
    }

    #[test]
    fn blacklisted_directives_are_filtered() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Pac;
        let bl = Blacklist::new(Duration::from_secs(60));
        bl.mark_bad(&http("dead", 8080));
        let pac = FixedPac("PROXY dead:8080; PROXY live:8080");
        let out = select(&cfg, &bl, Some(&pac), "http://x/", "x").unwrap();
        assert_eq!(out, vec![http("live", 8080)]);
    }

    #[test]
    fn fully_blacklisted_selection_falls_back_to_unfiltered() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Pac;
        let bl = Blacklist::new(Duration::from_secs(60));
        bl.mark_bad(&http("a", 1));
        bl.mark_bad(&http("b", 2));
        let pac = FixedPac("PROXY a:1; PROXY b:2");
        let out = select(&cfg, &bl, Some(&pac), "http://x/", "x").unwrap();
        assert_eq!(out, vec![http("a", 1), http("b", 2)]);
    }

    #[test]
    fn selection_is_pure_given_empty_blacklist() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Pac;
        let bl = Blacklist::new(Duration::from_secs(60));
        let pac = FixedPac("PROXY gw:8080; DIRECT");
        let a = select(&cfg, &bl, Some(&pac), "http://x/", "x").unwrap();
        let b = select(&cfg, &bl, Some(&pac), "http://x/", "x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pac_mode_without_evaluator_errors() {
        let mut cfg = Config::default();
        cfg.proxy_kind = ProxyKind::Pac;
        let bl = Blacklist::new(Duration::from_secs(60));
        assert!(select(&cfg, &bl, None, "http://x/", "x").is_err());
    }
}
