//! forelay/src/error.rs
//! Error taxonomy for the proxy pipeline.

use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or oversized client request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The TCP connection to an upstream could not be established.
    #[error("upstream unreachable: {0}")]
    ProxyConnect(#[source] io::Error),

    /// The TCP connection attempt to an upstream timed out.
    #[error("upstream connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The upstream kept answering 407 after the authentication handshake.
    /// Carries the upstream's final response head, forwarded verbatim.
    #[error("upstream proxy authorization failed")]
    ProxyAuthorization { response_head: Vec<u8> },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// True for failures that blacklist the directive and move on to the
    /// next candidate. Auth failures are deliberately excluded.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::ProxyConnect(_) | ProxyError::ConnectTimeout(_)
        )
    }

    /// HTTP status to synthesize when the response is not yet committed.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Protocol(_) => 400,
            ProxyError::ProxyConnect(_) => 502,
            ProxyError::ConnectTimeout(_) => 504,
            ProxyError::ProxyAuthorization { .. } => 407,
            ProxyError::Io(_) | ProxyError::Internal(_) => 500,
        }
    }
}
