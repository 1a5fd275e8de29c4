//! Upstream Stratum side of the proxy: line-JSON codec, reconnecting TCP
//! client, and the per-pool session controller.

pub mod client;
pub mod codec;
pub mod session;

pub use client::{UpstreamClient, UpstreamEvent};
pub use session::{IdleWatchdog, SessionController};

use thiserror::Error;

/// Errors surfaced by upstream RPC calls.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("not connected")]
    NotConnected,

    /// The transport dropped while the request was in flight.
    #[error("transport closed")]
    TransportClosed,

    /// The pool answered with a non-null `error` member.
    #[error("remote error: {0}")]
    Remote(String),
}
