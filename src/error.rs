//! Error types shared across the proxy.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced while serving proxy traffic or shutting down.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Outbound connection to the origin failed.
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound connection did not complete in time.
    #[error("dial {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    /// Hostname could not be resolved.
    #[error("resolve {host} failed: {reason}")]
    Resolve { host: String, reason: String },

    /// Forwarded request failed before a response arrived.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// Forwarded request exceeded the round-trip timeout.
    #[error("upstream request timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// Request target cannot be proxied.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// The inbound connection could not be taken over for tunneling.
    #[error("connection upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),

    /// The admission pool was closed.
    #[error("admission controller closed")]
    AdmissionClosed,

    /// In-flight work did not finish before the drain deadline.
    #[error("drain did not complete within {timeout:?} ({in_flight} still in flight)")]
    DrainTimeout { timeout: Duration, in_flight: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Failures to reach the origin, counted in the dial failure metric.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Dial { .. }
                | ProxyError::DialTimeout { .. }
                | ProxyError::Resolve { .. }
                | ProxyError::Upstream(_)
                | ProxyError::UpstreamTimeout(_)
        )
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
