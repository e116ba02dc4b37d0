//! Response-side plumbing: incremental head accumulation, the caller-visible
//! response future, and a channel-backed body sink.

use crate::{
    error::Error,
    headers::StatusLine,
};
use futures_channel::{mpsc, oneshot};
use futures_util::stream::Stream;
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Response, StatusCode, Uri, Version,
};
use std::{
    future::Future,
    io, mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

/// The response head delivered through a [`ResponseFuture`] once the final
/// headers have arrived. Body bytes flow through the sink supplied when the
/// request was built.
pub type ResponseHead = Response<()>;

type ResponseResult = Result<ResponseHead, Error>;

/// Extension stored on published redirect responses, carrying the parsed
/// `Location` target.
#[derive(Debug, Clone)]
pub struct RedirectLocation(pub Uri);

/// Cloneable at-most-once completion side of a request.
#[derive(Clone)]
pub(crate) struct ResponseProducer(Arc<Mutex<Option<oneshot::Sender<ResponseResult>>>>);

impl ResponseProducer {
    pub(crate) fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), ResponseFuture { inner: rx })
    }

    /// Whether nothing has been published yet.
    pub(crate) fn is_pending(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    /// Resolve the caller future. Returns false if it was already resolved.
    pub(crate) fn complete(&self, result: ResponseResult) -> bool {
        match self.0.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// A future resolving to the response head once the final status line and
/// headers are available, or to the failure that ended the transfer first.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ResponseFuture {
    inner: oneshot::Receiver<ResponseResult>,
}

impl Future for ResponseFuture {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Incomplete)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Accumulates a response head as header callbacks arrive.
///
/// A transfer that is redirected sees several heads back to back; each new
/// status line discards whatever the previous response contributed.
#[derive(Debug, Default)]
pub(crate) struct ResponseAccumulator {
    version: Option<Version>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    header_bytes: usize,
    location: Option<Uri>,
}

impl ResponseAccumulator {
    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Account `len` header bytes against `cap`; false means the cap is
    /// exceeded.
    pub(crate) fn charge(&mut self, len: usize, cap: usize) -> bool {
        self.header_bytes += len;
        self.header_bytes <= cap
    }

    /// Begin a new head from a status line. Headers and header bytes
    /// accumulated so far belong to an earlier response in a redirect chain
    /// and are discarded; the caller charges the status line itself next.
    pub(crate) fn reset(&mut self, line: StatusLine) {
        self.version = Some(line.version);
        self.status = Some(line.status);
        self.headers.clear();
        self.location = None;
        self.header_bytes = 0;
    }

    pub(crate) fn insert(&mut self, name: HeaderName, value: HeaderValue, redirecting: bool) {
        if redirecting && name == http::header::LOCATION {
            self.location = value.to_str().ok().and_then(|s| s.parse().ok());
        }
        self.headers.append(name, value);
    }

    /// Build the head for publication.
    pub(crate) fn take_head(&mut self) -> Result<ResponseHead, Error> {
        let status = self
            .status
            .ok_or(Error::Protocol("transfer produced no status line"))?;

        let mut response = Response::new(());
        *response.status_mut() = status;
        *response.version_mut() = self.version.unwrap_or(Version::HTTP_11);
        *response.headers_mut() = mem::take(&mut self.headers);
        if let Some(location) = self.location.take() {
            response.extensions_mut().insert(RedirectLocation(location));
        }

        Ok(response)
    }
}

/// Destination for response body bytes.
///
/// Implementations apply backpressure by returning `Poll::Pending`; the
/// waker in `cx` is notified when space frees, which resumes the paused
/// transfer through the agent.
pub trait ResponseBodySink: Send {
    /// Attempt to accept `data` in full.
    fn poll_accept(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>>;

    /// Terminate the body, normally or with an error. Called at most once.
    fn finish(&mut self, result: io::Result<()>);
}

/// Create a sink able to buffer `capacity` body chunks, paired with the
/// reader that consumes them.
pub fn channel_sink(capacity: usize) -> (ChannelSink, BodyReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelSink { tx: Some(tx) }, BodyReader { rx })
}

/// Bounded channel sink; pairs with [`BodyReader`].
pub struct ChannelSink {
    tx: Option<mpsc::Sender<io::Result<Vec<u8>>>>,
}

impl ResponseBodySink for ChannelSink {
    fn poll_accept(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let Some(tx) = self.tx.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "body sink already finished",
            )));
        };

        match tx.poll_ready(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) if tx.start_send(Ok(data.to_vec())).is_ok() => {
                Poll::Ready(Ok(()))
            }
            Poll::Ready(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response body reader was dropped",
            ))),
        }
    }

    fn finish(&mut self, result: io::Result<()>) {
        if let Some(mut tx) = self.tx.take() {
            if let Err(error) = result {
                // Best effort: the error is dropped if the buffer is full.
                let _ = tx.try_send(Err(error));
            }
            tx.close_channel();
        }
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            tx.close_channel();
        }
    }
}

/// Streaming reader for a response body fed through a [`ChannelSink`].
///
/// Mid-body transfer failures surface as an `Err` item.
pub struct BodyReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl Stream for BodyReader {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl BodyReader {
    /// Collect the remaining body.
    pub async fn into_vec(mut self) -> io::Result<Vec<u8>> {
        use futures_util::StreamExt;

        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;
    use crate::task::waker_fn;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn accumulator_resets_on_new_status_line() {
        let mut acc = ResponseAccumulator::default();
        let first = headers::parse_status_line(b"HTTP/1.1 301 Moved\r\n").unwrap();
        acc.reset(first);
        acc.insert(
            http::header::LOCATION.clone(),
            HeaderValue::from_static("http://example.org/next"),
            true,
        );

        let second = headers::parse_status_line(b"HTTP/1.1 200 OK\r\n").unwrap();
        acc.reset(second);
        acc.insert(
            http::header::CONTENT_TYPE.clone(),
            HeaderValue::from_static("text/plain"),
            false,
        );

        let head = acc.take_head().unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert!(!head.headers().contains_key(http::header::LOCATION));
        assert!(head.extensions().get::<RedirectLocation>().is_none());
    }

    #[test]
    fn redirect_location_is_published_as_extension() {
        let mut acc = ResponseAccumulator::default();
        let line = headers::parse_status_line(b"HTTP/1.1 301 Moved\r\n").unwrap();
        acc.reset(line);
        acc.insert(
            http::header::LOCATION.clone(),
            HeaderValue::from_static("http://example.org/next"),
            true,
        );

        let head = acc.take_head().unwrap();
        let location = head.extensions().get::<RedirectLocation>().unwrap();
        assert_eq!(location.0, "http://example.org/next");
    }

    #[test]
    fn header_cap_is_cumulative() {
        let mut acc = ResponseAccumulator::default();
        assert!(acc.charge(60, 100));
        assert!(!acc.charge(60, 100));
    }

    #[test]
    fn reset_clears_the_byte_counter() {
        let mut acc = ResponseAccumulator::default();
        assert!(acc.charge(90, 100));

        let line = headers::parse_status_line(b"HTTP/1.1 200 OK\r\n").unwrap();
        acc.reset(line);
        assert!(acc.charge(90, 100));
    }

    #[test]
    fn channel_sink_applies_backpressure_and_wakes() {
        let (mut sink, mut reader) = channel_sink(1);
        let woken = Arc::new(AtomicBool::new(false));
        let waker = {
            let woken = woken.clone();
            waker_fn(move || woken.store(true, Ordering::SeqCst))
        };
        let mut cx = Context::from_waker(&waker);

        // Fill the channel until it pushes back.
        let mut accepted = 0;
        loop {
            match sink.poll_accept(&mut cx, b"chunk") {
                Poll::Ready(Ok(())) => accepted += 1,
                Poll::Pending => break,
                Poll::Ready(Err(e)) => panic!("sink failed: {}", e),
            }
            assert!(accepted < 64, "sink never pushed back");
        }

        // Draining a chunk frees space and wakes the paused transfer.
        let chunk = futures_executor::block_on(reader.next()).unwrap().unwrap();
        assert_eq!(chunk, b"chunk");
        assert!(woken.load(Ordering::SeqCst));
        assert!(matches!(
            sink.poll_accept(&mut cx, b"chunk"),
            Poll::Ready(Ok(()))
        ));
    }

    #[test]
    fn finish_error_reaches_reader() {
        let (mut sink, reader) = channel_sink(4);
        let waker = waker_fn(|| {});
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(
            sink.poll_accept(&mut cx, b"partial"),
            Poll::Ready(Ok(()))
        ));
        sink.finish(Err(io::Error::new(io::ErrorKind::Other, "boom")));

        let result = futures_executor::block_on(reader.into_vec());
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }

    #[test]
    fn dropped_reader_fails_the_sink() {
        let (mut sink, reader) = channel_sink(1);
        drop(reader);

        let waker = waker_fn(|| {});
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(sink.poll_accept(&mut cx, b"x"), Poll::Ready(Err(_))));
    }
}
