//! A multi-transfer agent for libcurl: many concurrent HTTP transfers
//! driven on a single background thread.
//!
//! The agent sits between an HTTP client front-end and curl's multi
//! interface. Callers configure an [`Easy2`](curl::easy::Easy2)`<`
//! [`RequestHandler`]`>` handle (the "request builder" role), submit it with
//! [`Agent::submit`], and observe the outcome through the [`ResponseFuture`]
//! handed out when the handler was created. Response body bytes flow through
//! a [`ResponseBodySink`] with backpressure, and request bodies are produced
//! asynchronously through a [`RequestBodyStream`]; both directions pause the
//! underlying transfer when the caller cannot keep up and resume it through
//! the agent's submission queue.
//!
//! # Example
//!
//! ```no_run
//! use courier::{channel_sink, Agent, CancelSource, RequestConfig, RequestHandler};
//!
//! # fn run() -> Result<(), courier::Error> {
//! let agent = Agent::new();
//! let cancel = CancelSource::new();
//! let (sink, body) = channel_sink(8);
//! let (handler, response) =
//!     RequestHandler::new(RequestConfig::default(), None, Box::new(sink), cancel.token());
//!
//! let mut easy = curl::easy::Easy2::new(handler);
//! easy.url("https://example.org")?;
//! agent.submit(easy)?;
//!
//! let response = futures_executor::block_on(response)?;
//! println!("{}", response.status());
//! let body = futures_executor::block_on(body.into_vec())?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod agent;
mod body;
mod cancel;
mod error;
mod handler;
mod headers;
mod response;
mod task;
mod wakeup;

pub use crate::{
    agent::{Agent, AgentBuilder},
    body::{BytesBody, ChannelBody, RequestBodyStream},
    cancel::{CancelSource, CancelToken},
    error::Error,
    handler::{CookieJar, CredentialCache, RequestConfig, RequestHandler},
    response::{
        channel_sink, BodyReader, ChannelSink, RedirectLocation, ResponseBodySink, ResponseFuture,
        ResponseHead,
    },
};

pub use curl;
