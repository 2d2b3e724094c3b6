//! forelay/src/pac.rs
//! PAC script source loading and the standalone fallback evaluator.

use crate::error::{ProxyError, Result};
use crate::protocol;
use crate::selector::{PacEvaluator, parse_pac_directives};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;
use url::Url;

/// Cap on a fetched PAC script.
const MAX_PAC_BYTES: u64 = 1024 * 1024;

/// Loads the PAC script text from `proxy.pac.fileLocation`: a filesystem
/// path, a `file://` URL, or an `http://` URL fetched with a plain GET.
pub async fn load_source(location: &str) -> Result<String> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "http" => fetch_http(&url).await,
        Ok(url) if url.scheme() == "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| ProxyError::Internal(format!("bad file URL: {location}")))?;
            Ok(std::fs::read_to_string(path)?)
        }
        Ok(url) if url.scheme() == "https" => Err(ProxyError::Internal(format!(
            "https PAC locations are not supported, serve it over http or a file path: {url}"
        ))),
        // Not a URL: treat it as a plain filesystem path.
        _ => Ok(std::fs::read_to_string(location)?),
    }
}

async fn fetch_http(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Internal(format!("PAC URL has no host: {url}")))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let stream = TcpStream::connect((host, port)).await?;
    let mut stream = BufReader::new(stream);

    let origin = match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    };
    let request =
        format!("GET {origin} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let raw = protocol::read_head_bytes(&mut stream, "PAC response").await?;
    let resp = protocol::parse_response_head(&raw)?;
    if !resp.is_success() {
        return Err(ProxyError::Internal(format!(
            "PAC fetch from {url} failed with status {}",
            resp.status
        )));
    }
    let mut body = Vec::new();
    let mut limited = stream.take(MAX_PAC_BYTES);
    limited.read_to_end(&mut body).await?;
    String::from_utf8(body)
        .map_err(|_| ProxyError::Internal(format!("PAC script from {url} is not UTF-8")))
}

/// Degraded evaluator for the standalone binary, which has no script
/// engine: it ignores the PAC logic entirely and returns every directive
/// literal found in the script, in source order. Embedders with a real
/// JavaScript evaluator implement [`PacEvaluator`] themselves.
pub struct FallbackEvaluator {
    result: String,
}

impl FallbackEvaluator {
    pub fn from_source(source: &str) -> Self {
        let mut literals: Vec<String> = Vec::new();
        for lit in string_literals(source) {
            let upper = lit.to_ascii_uppercase();
            if !(upper.contains("PROXY") || upper.contains("SOCKS") || upper.contains("DIRECT")) {
                continue;
            }
            if parse_pac_directives(&lit).is_empty() {
                continue;
            }
            if !literals.contains(&lit) {
                literals.push(lit);
            }
        }
        let result = if literals.is_empty() {
            "DIRECT".to_string()
        } else {
            literals.join("; ")
        };
        info!(%result, "PAC fallback evaluator will return a fixed directive list");
        FallbackEvaluator { result }
    }
}

impl PacEvaluator for FallbackEvaluator {
    fn find_proxy_for_url(&self, _url: &str, _host: &str) -> Result<String> {
        Ok(self.result.clone())
    }
}

fn string_literals(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c != '"' && c != '\'' {
            continue;
        }
        let quote = c;
        let mut lit = String::new();
        for c in chars.by_ref() {
            if c == quote {
                break;
            }
            lit.push(c);
        }
        out.push(lit);
    }
    out
}
