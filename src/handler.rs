//! Per-transfer request state and the transport callback bridge.
//!
//! A [`RequestHandler`] travels inside a `curl::easy::Easy2` handle: curl
//! invokes the `Handler` callbacks while the worker runs `Multi::perform`,
//! and the handler translates them into response publication, body staging,
//! and backpressure against the caller's sink and stream. Callbacks never
//! unwind into curl; every failure is recorded on the handler and signaled
//! with the transport's abort convention, then resolved when the transfer's
//! completion message is reaped.

use crate::{
    body::{FillOutcome, RequestBodyStream, SendTransferState},
    cancel::CancelToken,
    error::Error,
    headers,
    response::{ResponseAccumulator, ResponseBodySink, ResponseFuture, ResponseProducer},
};
use curl::easy::{Handler, InfoType, ReadError, SeekResult, WriteError};
use http::{HeaderValue, StatusCode};
use std::{
    fmt, io,
    io::SeekFrom,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// Hook receiving `Set-Cookie` headers so an external cookie store can
/// record them.
pub trait CookieJar: Send + Sync {
    fn record(&self, set_cookie: &HeaderValue);
}

/// Hook receiving the authentication schemes a server advertised, so an
/// external credential cache can pre-authenticate future requests to the
/// same origin.
pub trait CredentialCache: Send + Sync {
    /// `auth_avail` is the transport's `CURLAUTH_*` bitmask of schemes the
    /// server offered.
    fn record(&self, effective_url: &str, auth_avail: u64);
}

/// Per-request settings the agent consults while driving a transfer.
#[derive(Clone, Default)]
pub struct RequestConfig {
    /// Cap on cumulative response header bytes. Zero means the default of
    /// 64 KiB.
    pub max_header_size: usize,
    /// Whether the transport was configured to follow redirects for this
    /// request. Controls redirect bookkeeping in the header callback.
    pub auto_redirect: bool,
    /// Whether authentication schemes discovered on this transfer should be
    /// offered to the credential cache.
    pub preauthenticate: bool,
    pub cookie_jar: Option<Arc<dyn CookieJar>>,
    pub credential_cache: Option<Arc<dyn CredentialCache>>,
}

const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

impl RequestConfig {
    fn header_cap(&self) -> usize {
        match self.max_header_size {
            0 => DEFAULT_MAX_HEADER_SIZE,
            cap => cap,
        }
    }
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("max_header_size", &self.max_header_size)
            .field("auto_redirect", &self.auto_redirect)
            .field("preauthenticate", &self.preauthenticate)
            .finish_non_exhaustive()
    }
}

/// State for a single transfer, owned by its easy handle.
pub struct RequestHandler {
    /// Active-table token, assigned at activation.
    id: Option<usize>,
    config: RequestConfig,
    producer: ResponseProducer,
    accumulator: ResponseAccumulator,
    sink: Option<Box<dyn ResponseBodySink>>,
    body: Option<Box<dyn RequestBodyStream>>,
    send_state: SendTransferState,
    cancel_token: CancelToken,
    /// First failure observed by a callback. Wins over the transport's
    /// generic completion code.
    error: Option<Error>,
    /// Whether the current response head is a redirect the transport was
    /// asked to follow.
    is_redirect: bool,
    /// Wakes the worker through the submission queue to resume a paused
    /// transfer.
    waker: Option<Waker>,
}

impl RequestHandler {
    /// Create a handler and the future through which the caller observes
    /// the response.
    pub fn new(
        config: RequestConfig,
        body: Option<Box<dyn RequestBodyStream>>,
        sink: Box<dyn ResponseBodySink>,
        cancel_token: CancelToken,
    ) -> (Self, ResponseFuture) {
        let (producer, future) = ResponseProducer::new();

        (
            Self {
                id: None,
                config,
                producer,
                accumulator: ResponseAccumulator::default(),
                sink: Some(sink),
                body,
                send_state: SendTransferState::default(),
                cancel_token,
                error: None,
                is_redirect: false,
                waker: None,
            },
            future,
        )
    }

    /// Upload length hint for the request builder (`CURLOPT_INFILESIZE`).
    pub fn body_len(&self) -> Option<u64> {
        self.body.as_ref().and_then(|body| body.len())
    }

    /// Called by the worker when the transfer is added to the transport.
    pub(crate) fn init(&mut self, id: usize, waker: Waker) {
        self.id = Some(id);
        self.waker = Some(waker);
        tracing::debug!(id, "request activated");
    }

    pub(crate) fn producer(&self) -> ResponseProducer {
        self.producer.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel_token.clone()
    }

    pub(crate) fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.accumulator.status()
    }

    /// Fail the transfer: the body sink is closed with the error, and the
    /// caller future completes with it unless the response head already went
    /// out. Both a caller awaiting the head and one draining the body
    /// observe the failure.
    pub(crate) fn fail(&mut self, error: Error) {
        tracing::debug!(id = ?self.id, %error, "request failed");
        if let Some(mut sink) = self.sink.take() {
            sink.finish(Err(io::Error::new(io::ErrorKind::Other, error.to_string())));
        }
        if self.producer.is_pending() {
            self.producer.complete(Err(error));
        }
    }

    /// Release transfer resources: close the body sink normally and drop
    /// the request body stream along with any staged read.
    pub(crate) fn cleanup(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.finish(Ok(()));
        }
        self.body = None;
        self.send_state.reset();
    }

    /// Publish the response head to the caller, exactly once.
    pub(crate) fn ensure_response_published(&mut self) -> Result<(), Error> {
        if !self.producer.is_pending() {
            return Ok(());
        }
        let head = self.accumulator.take_head()?;
        tracing::debug!(id = ?self.id, status = %head.status(), "publishing response");
        self.producer.complete(Ok(head));
        Ok(())
    }

    /// Finish the transfer with the transport's completion result,
    /// publishing or failing the caller future and releasing resources.
    pub(crate) fn complete(&mut self, result: Result<(), curl::Error>) {
        let outcome = match self.error.take() {
            Some(error) => Err(error),
            None => match result {
                Ok(()) => Ok(()),
                Err(e) if e.is_unsupported_protocol() && self.is_redirect => {
                    // The transfer stopped at a redirect whose scheme the
                    // transport cannot speak; the redirect response itself
                    // is complete and usable.
                    tracing::debug!(
                        id = ?self.id,
                        "redirect to unsupported scheme, publishing the redirect response"
                    );
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ensure_response_published() {
                    self.fail(e);
                }
            }
            Err(e) => self.fail(e),
        }

        self.cleanup();
    }

    fn record_failure(&mut self, error: Error) {
        tracing::debug!(id = ?self.id, %error, "transfer callback failed");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn on_header(&mut self, line: &[u8]) -> Result<(), Error> {
        let cap = self.config.header_cap();

        // A status line starts a new head; earlier heads in a redirect
        // chain stop counting against the cap.
        let status_line = headers::parse_status_line(line);
        if let Some(status_line) = status_line {
            self.is_redirect = self.config.auto_redirect
                && matches!(status_line.status.as_u16(), 301 | 302 | 303 | 307);
            self.accumulator.reset(status_line);
        }

        if !self.accumulator.charge(line.len(), cap) {
            return Err(Error::HeadersTooLarge(cap));
        }

        if status_line.is_some() || headers::is_end_of_headers(line) {
            return Ok(());
        }

        match headers::parse_header_line(line) {
            Some((name, value)) => {
                if name == http::header::SET_COOKIE {
                    if let Some(jar) = &self.config.cookie_jar {
                        jar.record(&value);
                    }
                }
                self.accumulator.insert(name, value, self.is_redirect);
            }
            None => tracing::trace!(id = ?self.id, "discarding malformed header line"),
        }

        Ok(())
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("id", &self.id)
            .field("is_redirect", &self.is_redirect)
            .finish_non_exhaustive()
    }
}

// A short write tells the transport to abort the transfer with its generic
// callback error; the recorded failure replaces it at completion.
fn abort_len(len: usize) -> usize {
    len.saturating_sub(1)
}

impl Handler for RequestHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        match self.on_header(data) {
            Ok(()) => true,
            Err(e) => {
                self.record_failure(e);
                false
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.error.is_some() {
            return Ok(abort_len(data.len()));
        }

        // The caller observes the body stream, so the head must be visible
        // before the first byte goes into the sink.
        if let Err(e) = self.ensure_response_published() {
            self.record_failure(e);
            return Ok(abort_len(data.len()));
        }

        if data.is_empty() {
            return Ok(0);
        }

        let (Some(sink), Some(waker)) = (self.sink.as_mut(), self.waker.as_ref()) else {
            return Ok(abort_len(data.len()));
        };

        let mut cx = Context::from_waker(waker);
        match sink.poll_accept(&mut cx, data) {
            Poll::Ready(Ok(())) => Ok(data.len()),
            Poll::Pending => {
                tracing::trace!(id = ?self.id, len = data.len(), "response sink full, pausing");
                Err(WriteError::Pause)
            }
            Poll::Ready(Err(e)) => {
                self.record_failure(e.into());
                Ok(abort_len(data.len()))
            }
        }
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        if self.error.is_some() {
            return Err(ReadError::Abort);
        }

        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        let Some(waker) = self.waker.as_ref() else {
            return Err(ReadError::Abort);
        };

        match self.send_state.fill(body.as_mut(), waker, data) {
            FillOutcome::Filled(n) => Ok(n),
            FillOutcome::Pause => {
                tracing::trace!(id = ?self.id, "request body read pending, pausing");
                Err(ReadError::Pause)
            }
            FillOutcome::Failed(e) => {
                self.record_failure(e.into());
                Err(ReadError::Abort)
            }
        }
    }

    fn seek(&mut self, whence: SeekFrom) -> SeekResult {
        match whence {
            SeekFrom::Start(0) => {
                let resettable = self.body.as_mut().is_some_and(|body| body.try_reset());
                if resettable {
                    tracing::debug!(id = ?self.id, "request body rewound");
                    self.send_state.reset();
                    SeekResult::Ok
                } else {
                    SeekResult::CantSeek
                }
            }
            _ => SeekResult::CantSeek,
        }
    }

    fn debug(&mut self, kind: InfoType, data: &[u8]) {
        match kind {
            InfoType::Text => {
                tracing::trace!(id = ?self.id, "{}", String::from_utf8_lossy(data).trim_end())
            }
            InfoType::HeaderIn => {
                tracing::trace!(id = ?self.id, "< {}", String::from_utf8_lossy(data).trim_end())
            }
            InfoType::HeaderOut => {
                tracing::trace!(id = ?self.id, "> {}", String::from_utf8_lossy(data).trim_end())
            }
            InfoType::DataIn => tracing::trace!(id = ?self.id, "received {} body bytes", data.len()),
            InfoType::DataOut => tracing::trace!(id = ?self.id, "sent {} body bytes", data.len()),
            _ => {}
        }
    }
}
