//! forelay/src/connection.rs
//! Per-connection driver: parse the request head, pick upstream candidates,
//! run the matching processor, fall back across directives.

use crate::error::{ProxyError, Result};
use crate::processor;
use crate::protocol::{self, RequestHead};
use crate::selector;
use crate::session::Shared;
use crate::tunnel::{self, DuplexSettings};
use crate::types::{BoxedStream, TargetEndpoint, UpstreamDirective};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// The client side of one proxied request. Owns the socket; tracks whether
/// any response byte has been written, after which error responses are
/// suppressed and failures only close the connection.
pub struct ClientConnection {
    stream: BufReader<TcpStream>,
    committed: bool,
}

impl ClientConnection {
    pub fn new(stream: TcpStream) -> Self {
        ClientConnection {
            stream: BufReader::new(stream),
            committed: false,
        }
    }

    /// Reads and parses one request head. Bytes past the head stay
    /// buffered for the body or the tunnel.
    pub async fn read_request(&mut self) -> Result<RequestHead> {
        let raw = protocol::read_head_bytes(&mut self.stream, "request").await?;
        protocol::parse_request_head(&raw)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.committed = true;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Writes a canned error response unless one was already committed.
    pub async fn write_error_response(&mut self, status: u16, message: &str) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }
        self.write_raw(&protocol::error_response(status, message))
            .await
    }

    pub fn stream_mut(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.stream
    }

    pub fn into_stream(self) -> BufReader<TcpStream> {
        self.stream
    }
}

/// Main connection workflow.
pub async fn handle_conn(shared: Arc<Shared>, conn_id: u64, stream: TcpStream) {
    shared.metrics.conn_opened();
    if let Err(e) = drive(&shared, conn_id, stream).await {
        debug!(conn = conn_id, "connection ended with error: {e}");
    }
    shared.metrics.conn_closed();
}

async fn drive(shared: &Shared, conn_id: u64, stream: TcpStream) -> Result<()> {
    let mut client = ClientConnection::new(stream);

    let head = match client.read_request().await {
        Ok(head) => head,
        Err(e) => {
            warn!(conn = conn_id, "rejecting request: {e}");
            let _ = client.write_error_response(400, "malformed request").await;
            return Ok(());
        }
    };
    let is_connect = head.is_connect();

    let (target, url) = match derive_target(&head) {
        Ok(t) => t,
        Err(e) => {
            warn!(conn = conn_id, "rejecting request: {e}");
            let _ = client.write_error_response(400, "unsupported request target").await;
            return Ok(());
        }
    };
    info!(conn = conn_id, method = %head.method, dest = %target, "handling request");

    let directives = match selector::select(
        &shared.config,
        &shared.blacklist,
        shared.pac.as_deref(),
        &url,
        &target.host,
    ) {
        Ok(d) if !d.is_empty() => d,
        Ok(_) => {
            warn!(conn = conn_id, "no upstream candidates for {url}");
            let _ = client.write_error_response(502, "no upstream available").await;
            return Ok(());
        }
        Err(e) => {
            warn!(conn = conn_id, "upstream selection failed: {e}");
            let _ = client.write_error_response(502, "upstream selection failed").await;
            return Ok(());
        }
    };

    let mut last_err: Option<ProxyError> = None;
    let mut established: Option<BoxedStream> = None;

    for directive in directives {
        debug!(conn = conn_id, %directive, "trying upstream");
        match try_directive(shared, conn_id, &mut client, &head, &directive, &target, is_connect)
            .await
        {
            Ok(Some(upstream)) => {
                established = Some(upstream);
                break;
            }
            Ok(None) => return Ok(()),
            Err(e) if e.is_connect_failure() && !client.is_committed() => {
                warn!(conn = conn_id, %directive, "upstream unreachable: {e}");
                shared.blacklist.mark_bad(&directive);
                last_err = Some(e);
            }
            Err(ProxyError::ProxyAuthorization { .. }) => {
                // The upstream's 407 went to the client verbatim. Never
                // blacklisted.
                debug!(conn = conn_id, %directive, "upstream authorization failed");
                return Ok(());
            }
            Err(e) => {
                warn!(conn = conn_id, %directive, "request failed: {e}");
                if !is_connect || shared.config.connect_error_responses {
                    let _ = client
                        .write_error_response(e.status_code(), &e.to_string())
                        .await;
                }
                return Ok(());
            }
        }
    }

    if let Some(upstream) = established {
        let settings = DuplexSettings {
            read_timeout: shared.config.tunnel_read_timeout,
            grace: shared.config.duplex_grace,
        };
        let outcome = tunnel::run(conn_id, client.into_stream(), upstream, settings).await;
        shared
            .metrics
            .add_transfer(outcome.client_to_upstream, outcome.upstream_to_client);
        info!(
            conn = conn_id,
            sent = outcome.client_to_upstream,
            received = outcome.upstream_to_client,
            "tunnel closed"
        );
        return Ok(());
    }

    // Every candidate failed to connect.
    let status = match &last_err {
        Some(ProxyError::ConnectTimeout(_)) => 504,
        _ => 502,
    };
    if !is_connect || shared.config.connect_error_responses {
        let _ = client
            .write_error_response(status, "no reachable upstream")
            .await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn try_directive(
    shared: &Shared,
    conn_id: u64,
    client: &mut ClientConnection,
    head: &RequestHead,
    directive: &UpstreamDirective,
    target: &TargetEndpoint,
    is_connect: bool,
) -> Result<Option<BoxedStream>> {
    match (is_connect, directive) {
        (true, UpstreamDirective::Http { host, port }) => {
            processor::http_connect(shared, conn_id, client, host, *port, target).await
        }
        (true, _) => processor::socket_connect(shared, conn_id, client, directive, target)
            .await
            .map(Some),
        (false, _) => processor::forward(shared, conn_id, client, head, directive, target)
            .await
            .map(|_| None),
    }
}

/// Works out where the client wants to go, plus the URL handed to the PAC
/// evaluator.
fn derive_target(head: &RequestHead) -> Result<(TargetEndpoint, String)> {
    if head.is_connect() {
        let target = TargetEndpoint::from_authority(&head.target, None, "https")?;
        let url = format!("https://{}/", target.authority());
        return Ok((target, url));
    }
    if head.target.contains("://") {
        let target = TargetEndpoint::from_uri(&head.target)?;
        return Ok((target, head.target.clone()));
    }
    // Origin-form: the Host header names the endpoint.
    let host = head
        .header("host")
        .ok_or_else(|| ProxyError::Protocol("origin-form request without Host".into()))?;
    let target = TargetEndpoint::from_authority(host, Some(80), "http")?;
    let url = format!("http://{host}{}", head.target);
    Ok((target, url))
}
