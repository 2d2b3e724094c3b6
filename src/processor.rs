//! forelay/src/processor.rs
//! The three request processors: CONNECT through an HTTP upstream,
//! CONNECT through a SOCKS/direct socket, and plain HTTP forwarding.

use crate::auth::{self, AuthExchange};
use crate::connection::ClientConnection;
use crate::error::{ProxyError, Result};
use crate::protocol::{self, BodyLength, Header, RequestHead, ResponseHead};
use crate::session::Shared;
use crate::types::{BoxedStream, Credentials, TargetEndpoint, UpstreamDirective};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, info};
use url::Url;

/// Maximum challenge-response legs before a 407 is final.
const MAX_AUTH_LEGS: usize = 4;

/// Request bodies up to this size are buffered so an authenticated retry
/// can replay them; larger or chunked bodies stream through once.
const MAX_REPLAY_BODY: u64 = 64 * 1024;

/// TCP connect with the configured timeout. Failures here are what get a
/// directive blacklisted.
pub(crate) async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::ProxyConnect(e)),
        Err(_) => Err(ProxyError::ConnectTimeout(timeout)),
    }
}

/// Opens a raw path to the target: directly, or through a SOCKS upstream.
/// SOCKS5 sends the hostname unresolved; SOCKS4 relies on the 4a extension
/// for names the server resolves itself.
pub(crate) async fn open_socket(
    directive: &UpstreamDirective,
    target: &TargetEndpoint,
    creds: &Credentials,
    timeout: Duration,
) -> Result<TcpStream> {
    let dest = (target.host.as_str(), target.port);
    match directive {
        UpstreamDirective::Direct => connect_tcp(&target.host, target.port, timeout).await,
        UpstreamDirective::Socks5 { host, port } => {
            let proxy = (host.as_str(), *port);
            let attempt = async {
                match creds.basic_pair() {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password(proxy, dest, user, pass).await
                    }
                    None => Socks5Stream::connect(proxy, dest).await,
                }
            };
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(stream)) => Ok(stream.into_inner()),
                Ok(Err(e)) => Err(ProxyError::ProxyConnect(socks_io_error(e))),
                Err(_) => Err(ProxyError::ConnectTimeout(timeout)),
            }
        }
        UpstreamDirective::Socks4 { host, port } => {
            let proxy = (host.as_str(), *port);
            let user_id = creds.username.clone().unwrap_or_default();
            let attempt = async {
                if user_id.is_empty() {
                    Socks4Stream::connect(proxy, dest).await
                } else {
                    Socks4Stream::connect_with_userid(proxy, dest, &user_id).await
                }
            };
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(stream)) => Ok(stream.into_inner()),
                Ok(Err(e)) => Err(ProxyError::ProxyConnect(socks_io_error(e))),
                Err(_) => Err(ProxyError::ConnectTimeout(timeout)),
            }
        }
        UpstreamDirective::Http { .. } => Err(ProxyError::Internal(
            "HTTP directive routed to the socket connector".into(),
        )),
    }
}

fn socks_io_error(e: tokio_socks::Error) -> io::Error {
    match e {
        tokio_socks::Error::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::ConnectionRefused, other),
    }
}

/// CONNECT through an upstream HTTP proxy: CONNECT-over-CONNECT with the
/// 407 handshake on the same connection. On success the upstream's own
/// response head goes to the client verbatim and the opened stream is
/// returned for tunneling; a refusal is relayed verbatim and ends the
/// request.
pub async fn http_connect(
    shared: &Shared,
    conn_id: u64,
    client: &mut ClientConnection,
    proxy_host: &str,
    proxy_port: u16,
    target: &TargetEndpoint,
) -> Result<Option<BoxedStream>> {
    let timeout = shared.config.connect_timeout;
    let mut upstream = BufReader::new(connect_tcp(proxy_host, proxy_port, timeout).await?);
    let authority = target.authority();

    let mut auth_value = shared.auth.preemptive();
    let mut exchange: Option<AuthExchange> = None;
    let mut legs = 0usize;

    loop {
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(value) = &auth_value {
            request.push_str(&format!("Proxy-Authorization: {value}\r\n"));
        }
        request.push_str("\r\n");
        upstream.write_all(request.as_bytes()).await?;
        upstream.flush().await?;

        let raw = protocol::read_head_bytes(&mut upstream, "upstream CONNECT response").await?;
        let resp = protocol::parse_response_head(&raw)?;

        if resp.is_success() {
            debug!(conn = conn_id, status = resp.status, "CONNECT established");
            client.write_raw(&raw).await?;
            return Ok(Some(Box::new(upstream)));
        }

        if resp.status == 407 {
            let challenges = auth::parse_challenges(&resp);
            if exchange.is_none() {
                exchange = shared.auth.begin(&challenges, proxy_host);
            }
            let next = match exchange.as_mut() {
                Some(ex) if legs < MAX_AUTH_LEGS => {
                    let token = challenges
                        .iter()
                        .find(|c| c.scheme.eq_ignore_ascii_case(ex.scheme()))
                        .and_then(|c| c.detail.clone());
                    ex.respond(token.as_deref())?
                }
                _ => None,
            };
            match next {
                Some(value) => {
                    legs += 1;
                    debug!(conn = conn_id, leg = legs, "retrying CONNECT with credentials");
                    auth_value = Some(value);
                    upstream =
                        prepare_for_retry(upstream, &resp, proxy_host, proxy_port, timeout).await?;
                    continue;
                }
                None => {
                    relay_response(client, &mut upstream, "CONNECT", &raw, &resp).await?;
                    return Err(ProxyError::ProxyAuthorization { response_head: raw });
                }
            }
        }

        // Tunnel refused: hand the upstream's answer to the client as-is.
        info!(conn = conn_id, status = resp.status, "upstream refused CONNECT");
        relay_response(client, &mut upstream, "CONNECT", &raw, &resp).await?;
        return Ok(None);
    }
}

/// CONNECT via SOCKS4/SOCKS5/DIRECT: open the raw socket, then tell the
/// client the tunnel is up.
pub async fn socket_connect(
    shared: &Shared,
    conn_id: u64,
    client: &mut ClientConnection,
    directive: &UpstreamDirective,
    target: &TargetEndpoint,
) -> Result<BoxedStream> {
    let stream = open_socket(
        directive,
        target,
        shared.auth.credentials(),
        shared.config.connect_timeout,
    )
    .await?;
    client
        .write_raw(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    info!(conn = conn_id, %directive, dest = %target, "tunnel established");
    Ok(Box::new(stream))
}

/// Non-CONNECT request: rewrite for the upstream, stream the body out,
/// stream the response back. Through an HTTP upstream a 407 is retried
/// transparently with injected credentials when the body can be replayed.
pub async fn forward(
    shared: &Shared,
    conn_id: u64,
    client: &mut ClientConnection,
    head: &RequestHead,
    directive: &UpstreamDirective,
    target: &TargetEndpoint,
) -> Result<()> {
    let timeout = shared.config.connect_timeout;
    let via_http_proxy = matches!(directive, UpstreamDirective::Http { .. });

    let mut outbound = head.clone();
    protocol::strip_hop_by_hop(&mut outbound.headers);
    outbound.target = rewrite_target(&head.target, target, via_http_proxy)?;
    if outbound.header("host").is_none() {
        outbound
            .headers
            .insert(0, Header::new("Host", host_header_value(target)));
    }
    // One request per client connection; no point keeping the upstream open.
    outbound.headers.push(Header::new("Connection", "close"));

    let body_len = protocol::request_body_length(head)?;
    let replayable: Option<Vec<u8>> = match body_len {
        BodyLength::Empty => Some(Vec::new()),
        BodyLength::Length(n) if n <= MAX_REPLAY_BODY => {
            let mut buf = vec![0u8; n as usize];
            client.stream_mut().read_exact(&mut buf).await?;
            Some(buf)
        }
        _ => None,
    };

    let mut upstream = BufReader::new(match directive {
        UpstreamDirective::Http { host, port } => connect_tcp(host, *port, timeout).await?,
        other => open_socket(other, target, shared.auth.credentials(), timeout).await?,
    });

    let mut auth_value = if via_http_proxy {
        shared.auth.preemptive()
    } else {
        None
    };
    let mut exchange: Option<AuthExchange> = None;
    let mut legs = 0usize;

    loop {
        let mut message = outbound.clone();
        if let Some(value) = &auth_value {
            message
                .headers
                .push(Header::new("Proxy-Authorization", value.clone()));
        }
        upstream.write_all(&message.serialize()).await?;
        match &replayable {
            Some(body) => upstream.write_all(body).await?,
            None => {
                protocol::copy_body(client.stream_mut(), &mut upstream, &body_len).await?;
            }
        }
        upstream.flush().await?;

        let raw = protocol::read_head_bytes(&mut upstream, "upstream response").await?;
        let resp = protocol::parse_response_head(&raw)?;

        if via_http_proxy && resp.status == 407 && replayable.is_some() {
            let challenges = auth::parse_challenges(&resp);
            if exchange.is_none() {
                let (proxy_host, _) = directive
                    .endpoint()
                    .ok_or_else(|| ProxyError::Internal("HTTP directive without endpoint".into()))?;
                exchange = shared.auth.begin(&challenges, proxy_host);
            }
            let next = match exchange.as_mut() {
                Some(ex) if legs < MAX_AUTH_LEGS => {
                    let token = challenges
                        .iter()
                        .find(|c| c.scheme.eq_ignore_ascii_case(ex.scheme()))
                        .and_then(|c| c.detail.clone());
                    ex.respond(token.as_deref())?
                }
                _ => None,
            };
            if let Some(value) = next {
                legs += 1;
                debug!(conn = conn_id, leg = legs, "retrying request with credentials");
                auth_value = Some(value);
                let (proxy_host, proxy_port) = directive
                    .endpoint()
                    .map(|(h, p)| (h.to_string(), p))
                    .ok_or_else(|| ProxyError::Internal("HTTP directive without endpoint".into()))?;
                upstream =
                    prepare_for_retry(upstream, &resp, &proxy_host, proxy_port, timeout).await?;
                continue;
            }
        }

        debug!(conn = conn_id, status = resp.status, "relaying upstream response");
        relay_response(client, &mut upstream, &head.method, &raw, &resp).await?;
        if resp.status == 407 && legs > 0 {
            return Err(ProxyError::ProxyAuthorization { response_head: raw });
        }
        return Ok(());
    }
}

/// Streams an upstream response (head already read, body still pending)
/// to the client verbatim.
async fn relay_response(
    client: &mut ClientConnection,
    upstream: &mut BufReader<TcpStream>,
    request_method: &str,
    raw_head: &[u8],
    resp: &ResponseHead,
) -> Result<()> {
    client.write_raw(raw_head).await?;
    let body = protocol::response_body_length(request_method, resp);
    protocol::copy_body(upstream, client.stream_mut(), &body).await?;
    Ok(())
}

/// Makes the upstream connection reusable for the next auth leg: drains
/// the challenge body, or reconnects when the upstream is closing.
async fn prepare_for_retry(
    mut upstream: BufReader<TcpStream>,
    resp: &ResponseHead,
    proxy_host: &str,
    proxy_port: u16,
    timeout: Duration,
) -> Result<BufReader<TcpStream>> {
    let body = protocol::response_body_length("GET", resp);
    if resp.wants_close() || body == BodyLength::UntilClose {
        return Ok(BufReader::new(
            connect_tcp(proxy_host, proxy_port, timeout).await?,
        ));
    }
    protocol::copy_body(&mut upstream, &mut tokio::io::sink(), &body).await?;
    Ok(upstream)
}

/// Absolute-form when the upstream is an HTTP proxy, origin-form when we
/// open the socket ourselves.
fn rewrite_target(original: &str, target: &TargetEndpoint, via_http_proxy: bool) -> Result<String> {
    let is_absolute = original.contains("://");
    if via_http_proxy {
        if is_absolute {
            return Ok(original.to_string());
        }
        return Ok(format!(
            "{}://{}{}",
            target.scheme,
            host_header_value(target),
            original
        ));
    }
    if !is_absolute {
        return Ok(original.to_string());
    }
    let url = Url::parse(original)
        .map_err(|e| ProxyError::Protocol(format!("bad request target {original}: {e}")))?;
    let mut origin = url.path().to_string();
    if origin.is_empty() {
        origin.push('/');
    }
    if let Some(q) = url.query() {
        origin.push('?');
        origin.push_str(q);
    }
    Ok(origin)
}

/// Host header / URI authority: the port is elided when it is the default
/// for the scheme.
fn host_header_value(target: &TargetEndpoint) -> String {
    let default_port = match target.scheme.as_str() {
        "http" => 80,
        "https" => 443,
        _ => 0,
    };
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    if target.port == default_port {
        host
    } else {
        format!("{host}:{}", target.port)
    }
}
