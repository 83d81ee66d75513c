//! Multi-instance TCP reverse-proxy engine.
//!
//! `tcpee-proxy` hosts named proxy instances, each forwarding bytes between
//! a listening front-end address and a fixed back-end address, with
//! optional PROXY protocol v1 header injection and optional Linux
//! transparent-proxy mode.
//!
//! # Architecture
//!
//! ```text
//! TcpProxy::run(src, dst)
//!       |
//!       v
//! pre-flight dial dst ── fails ──> error to caller
//!       |
//!       v
//! bind listener on src
//!       |
//!       v
//! accept loop ──> one session driver per connection
//!                       |
//!                       +-- dial back-end
//!                       +-- PROXY v1 header (optional)
//!                       +-- pump front → back   (client idle budget)
//!                       +-- pump back  → front  (server idle budget)
//! ```
//!
//! # Components
//!
//! - [`TcpProxy`]: instance lifecycle — accept loop, statistics ticker,
//!   graceful drain via [`TcpProxy::close`]
//! - [`ProxyOptions`]: per-instance knobs, immutable after construction
//! - [`KeepAlive`]: keep-alive policy for either side of a session
//! - [`TrafficStats`]: atomic snapshot of the per-instance counters
//!
//! # Usage
//!
//! ```ignore
//! use tcpee_proxy::{ProxyOptions, TcpProxy};
//!
//! let proxy = TcpProxy::new("web", ProxyOptions::default())?;
//! tokio::spawn({
//!     let proxy = proxy.clone();
//!     async move { proxy.run("0.0.0.0:8443", "10.0.0.1:443").await }
//! });
//! // ... later ...
//! proxy.close().await;
//! ```
//!
//! Sessions are fully independent of each other; the only cross-session
//! coordination is the instance's cancellation token and the drain barrier
//! that `close` waits on.

mod header;
mod proxy;
mod session;
mod sock;
mod stats;

pub use proxy::{ProxyOptions, TcpProxy};
pub use sock::KeepAlive;
pub use stats::{format_bytes, TrafficStats};

use std::io;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by a proxy instance.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// `run` was interrupted by `close`. Expected, not a failure.
    #[error("proxy closed")]
    Closed,

    /// Binding the front-side listener failed.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing the back-end failed (pre-flight or per-session).
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The accept loop hit a non-recoverable error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The transparent-socket option could not be enabled.
    #[error("transparent mode unavailable: {0}")]
    Transparent(#[source] io::Error),
}

impl ProxyError {
    /// Whether this is the proxy-closed sentinel callers treat as a clean
    /// shutdown.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProxyError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_sentinel() {
        assert!(ProxyError::Closed.is_closed());
        let dial = ProxyError::Dial {
            addr: "10.0.0.1:443".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(!dial.is_closed());
    }

    #[test]
    fn test_error_display_carries_address() {
        let err = ProxyError::Bind {
            addr: "0.0.0.0:8443".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:8443"));
    }
}
