//! forelay/src/tunnel.rs
//! Full-duplex byte pump between the client and upstream streams.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DuplexSettings {
    /// Per-direction read timeout; a timeout counts as EOF for that
    /// direction. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// How long to wait for the reverse direction after the forward
    /// direction finished before cancelling it.
    pub grace: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DuplexOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pumps bytes both ways until the tunnel dies. The reverse direction
/// (upstream to client) runs on its own task; the forward direction runs
/// here. On forward EOF the upstream write side is half-closed and the
/// reverse task gets a bounded grace period before it is aborted; on a
/// forward I/O error it is aborted immediately. Both streams are dropped,
/// and therefore closed, on every path out.
pub async fn run<C, U>(conn_id: u64, client: C, upstream: U, settings: DuplexSettings) -> DuplexOutcome
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let read_timeout = settings.read_timeout;
    let mut reverse = tokio::spawn(async move {
        let mut upstream_read = upstream_read;
        let mut client_write = client_write;
        let copied = copy_direction(&mut upstream_read, &mut client_write, read_timeout).await;
        // Signal EOF to the client regardless of how the copy ended.
        let _ = client_write.shutdown().await;
        copied
    });
    // If this task is cancelled, take the reverse task down with it so its
    // stream halves drop and both sockets actually close.
    let _reverse_guard = AbortOnDrop(reverse.abort_handle());

    let mut outcome = DuplexOutcome::default();
    let forward = copy_direction(&mut client_read, &mut upstream_write, read_timeout).await;

    match forward {
        Ok(sent) => {
            outcome.client_to_upstream = sent;
            // Half-close toward the upstream so it sees our EOF.
            let _ = upstream_write.shutdown().await;
            match tokio::time::timeout(settings.grace, &mut reverse).await {
                Ok(Ok(Ok(received))) => outcome.upstream_to_client = received,
                Ok(Ok(Err(e))) => {
                    debug!(conn = conn_id, "reverse direction failed: {e}");
                }
                Ok(Err(join_err)) => {
                    debug!(conn = conn_id, "reverse task died: {join_err}");
                }
                Err(_) => {
                    debug!(conn = conn_id, grace = ?settings.grace, "reverse direction still busy after grace, cancelling");
                    reverse.abort();
                }
            }
        }
        Err(e) => {
            debug!(conn = conn_id, "forward direction failed: {e}");
            reverse.abort();
        }
    }
    outcome
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn copy_direction<R, W>(
    src: &mut R,
    dst: &mut W,
    read_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, src.read(&mut buf)).await {
                Ok(read) => read?,
                // A read timeout terminates this direction like an EOF.
                Err(_) => 0,
            },
            None => src.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::duplex;

    fn settings() -> DuplexSettings {
        DuplexSettings {
            read_timeout: None,
            grace: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (client_side, client_far) = duplex(1024);
        let (upstream_side, upstream_far) = duplex(1024);

        let pump = tokio::spawn(run(1, client_side, upstream_side, settings()));

        let (mut client, mut upstream) = (client_far, upstream_far);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Close both far ends; the pump must terminate.
        drop(client);
        drop(upstream);
        let outcome = pump.await.unwrap();
        assert_eq!(outcome.client_to_upstream, 4);
        assert_eq!(outcome.upstream_to_client, 4);
    }

    #[tokio::test]
    async fn client_eof_half_closes_upstream() {
        let (client_side, client_far) = duplex(1024);
        let (upstream_side, upstream_far) = duplex(1024);

        let pump = tokio::spawn(run(2, client_side, upstream_side, settings()));

        let (client, mut upstream) = (client_far, upstream_far);
        // Client hangs up without sending anything.
        drop(client);

        // The upstream read side must observe EOF.
        let mut buf = [0u8; 1];
        let n = upstream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(upstream);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn read_timeout_counts_as_eof() {
        let (client_side, client_far) = duplex(1024);
        let (upstream_side, upstream_far) = duplex(1024);

        let s = DuplexSettings {
            read_timeout: Some(Duration::from_millis(50)),
            grace: Duration::from_millis(200),
        };
        let started = Instant::now();
        let pump = tokio::spawn(run(3, client_side, upstream_side, s));

        // Neither side ever sends: both directions must time out and the
        // session must wind down within timeout + grace.
        let outcome = pump.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.client_to_upstream, 0);

        drop(client_far);
        drop(upstream_far);
    }

    #[tokio::test]
    async fn stuck_reverse_direction_is_cancelled_after_grace() {
        let (client_side, client_far) = duplex(1024);
        let (upstream_side, upstream_far) = duplex(1024);

        let s = DuplexSettings {
            read_timeout: None,
            grace: Duration::from_millis(100),
        };
        let pump = tokio::spawn(run(4, client_side, upstream_side, s));

        // Client side finishes immediately; upstream never sends and never
        // closes, so the reverse direction has to be cancelled.
        drop(client_far);
        let started = Instant::now();
        pump.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(upstream_far);
    }
}
