//! forelay/src/session.rs
//! Session lifecycle: listener, accept loop, bounded worker admission,
//! and teardown. All shared state hangs off the session; nothing is
//! process-global.

use crate::auth::Authenticator;
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::connection;
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::processor;
use crate::protocol;
use crate::selector::{self, PacEvaluator};
use crate::types::{TargetEndpoint, UpstreamDirective};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// State shared by every connection of one session. Config is frozen for
/// the session's lifetime.
pub struct Shared {
    pub config: Config,
    pub blacklist: Blacklist,
    pub auth: Authenticator,
    pub pac: Option<Arc<dyn PacEvaluator>>,
    pub metrics: Metrics,
}

impl Shared {
    pub fn new(config: Config, pac: Option<Arc<dyn PacEvaluator>>) -> Self {
        let blacklist = Blacklist::new(config.blacklist_timeout);
        let auth = Authenticator::new(config.credentials());
        Shared {
            config,
            blacklist,
            auth,
            pac,
            metrics: Metrics::default(),
        }
    }
}

/// A running proxy session, from start to stop.
pub struct Session {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    conns: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl Session {
    /// Binds the loopback listener and spawns the accept loop. Each
    /// connection runs on its own task holding a permit from a bounded
    /// pool; when the pool is exhausted the loop stops accepting until a
    /// slot frees up.
    pub async fn start(config: Config, pac: Option<Arc<dyn PacEvaluator>>) -> Result<Session> {
        let listener = TcpListener::bind(("127.0.0.1", config.local_port)).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared::new(config, pac));
        let conns: Arc<Mutex<HashMap<u64, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let permits = Arc::new(Semaphore::new(shared.config.max_connections));

        let accept_shared = shared.clone();
        let accept_conns = conns.clone();
        let accept_task = tokio::spawn(async move {
            let mut next_id: u64 = 1;
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    return;
                };
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let conn_id = next_id;
                next_id += 1;
                debug!(conn = conn_id, %peer, "accepted connection");

                let shared = accept_shared.clone();
                let cleanup = accept_conns.clone();
                let handle = tokio::spawn(async move {
                    connection::handle_conn(shared, conn_id, stream).await;
                    drop(permit);
                    cleanup.lock().unwrap().remove(&conn_id);
                });
                accept_conns.lock().unwrap().insert(conn_id, handle);
            }
        });

        info!(address = %local_addr, "proxy session started");
        Ok(Session {
            shared,
            local_addr,
            accept_task,
            conns,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn metrics_json(&self) -> String {
        self.shared.metrics.to_json()
    }

    /// Stops accepting, then tears down every in-flight connection by
    /// aborting its task; the dropped sockets unblock any pending I/O.
    /// No graceful drain: all state is per-connection.
    pub async fn stop(self) {
        self.accept_task.abort();
        let handles: Vec<JoinHandle<()>> = {
            let mut map = self.conns.lock().unwrap();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.shared.blacklist.clear();
        info!("proxy session stopped");
    }

    /// Fetches the configured test URL once through the upstream chain and
    /// returns the status line, so the operator can verify the upstream
    /// actually works.
    pub async fn test_upstream(&self) -> Result<String> {
        let config = &self.shared.config;
        let url = config.test_url.clone();
        let target = TargetEndpoint::from_uri(&url)?;
        let directives = selector::select(
            config,
            &self.shared.blacklist,
            self.shared.pac.as_deref(),
            &url,
            &target.host,
        )?;
        let directive = directives
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Internal("no upstream candidates".into()))?;
        let via_http_proxy = matches!(directive, UpstreamDirective::Http { .. });

        let mut upstream = BufReader::new(match &directive {
            UpstreamDirective::Http { host, port } => {
                processor::connect_tcp(host, *port, config.connect_timeout).await?
            }
            other => {
                processor::open_socket(
                    other,
                    &target,
                    self.shared.auth.credentials(),
                    config.connect_timeout,
                )
                .await?
            }
        });

        let request_target = if via_http_proxy {
            url.clone()
        } else {
            let parsed = Url::parse(&url)
                .map_err(|e| ProxyError::Internal(format!("bad test URL {url}: {e}")))?;
            match parsed.query() {
                Some(q) => format!("{}?{q}", parsed.path()),
                None => parsed.path().to_string(),
            }
        };
        let mut request = format!(
            "GET {request_target} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            target.authority()
        );
        if via_http_proxy {
            if let Some(value) = self.shared.auth.preemptive() {
                request.push_str(&format!("Proxy-Authorization: {value}\r\n"));
            }
        }
        request.push_str("\r\n");
        upstream.write_all(request.as_bytes()).await?;
        upstream.flush().await?;

        let raw = protocol::read_head_bytes(&mut upstream, "test response").await?;
        let line_end = raw.iter().position(|&b| b == b'\r').unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..line_end]).into_owned())
    }
}
