use std::io;
use thiserror::Error;

/// Errors produced while executing a transfer through the agent.
///
/// All failures, whatever their origin, reach the caller through the
/// request's response future (or through the body reader once the response
/// head has been published).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was canceled through its
    /// [`CancelSource`](crate::CancelSource).
    #[error("request canceled")]
    Canceled,

    /// The agent was disposed while the request was queued or in flight.
    #[error("agent has been disposed")]
    Disposed,

    /// Cumulative response header size exceeded the configured limit.
    #[error("response headers exceeded length limit of {0} bytes")]
    HeadersTooLarge(usize),

    /// The server response violated the HTTP protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A transfer-level error reported by curl.
    #[error(transparent)]
    Curl(#[from] curl::Error),

    /// A multi-interface error reported by curl.
    #[error(transparent)]
    Multi(#[from] curl::MultiError),

    /// An I/O error from a body stream, a body sink, or the wakeup channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker thread failed, taking this transfer down with it.
    #[error("agent worker error: {0}")]
    Worker(String),

    /// The request was dropped before a response was produced.
    #[error("request dropped before completion")]
    Incomplete,
}
