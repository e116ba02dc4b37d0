//! Request body streaming: asynchronous read staging for the send callback,
//! plus stock body stream implementations.

use futures_channel::mpsc;
use futures_util::future::{self, BoxFuture};
use std::{
    cmp,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

/// Maximum bytes staged per asynchronous read.
const STAGING_CAP: usize = 16 * 1024;

/// Source of request body bytes.
///
/// Reads are asynchronous: [`read_async`](Self::read_async) starts a read
/// and resolves to the chunk produced, with an empty chunk signaling end of
/// stream. Reads that cannot complete immediately leave the transfer paused;
/// the agent resumes it when the future's waker fires.
pub trait RequestBodyStream: Send + 'static {
    /// Begin reading up to `max` bytes.
    fn read_async(&mut self, max: usize) -> BoxFuture<'static, io::Result<Vec<u8>>>;

    /// Rewind to the beginning of the stream, if supported. The transport
    /// asks for this when it needs to resend the body.
    fn try_reset(&mut self) -> bool {
        false
    }

    /// Total body length, when known up front.
    fn len(&self) -> Option<u64> {
        None
    }
}

/// Outcome of one send-callback pass over [`SendTransferState`].
pub(crate) enum FillOutcome {
    /// Bytes were copied into the destination; 0 means end of body.
    Filled(usize),
    /// A read is in flight; the transfer must pause until it completes.
    Pause,
    /// The body stream failed.
    Failed(io::Error),
}

/// Staging state for one request body transfer.
///
/// `task` is the in-flight read and `buffer[offset..]` holds bytes already
/// produced but not yet handed to the transport. Invariants: a missing task
/// with a non-empty buffer means draining; once `eof` latches, every
/// subsequent fill reports end of body until a reset.
#[derive(Default)]
pub(crate) struct SendTransferState {
    task: Option<BoxFuture<'static, io::Result<Vec<u8>>>>,
    buffer: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl SendTransferState {
    /// Drop staged data and any in-flight read, returning to idle.
    pub(crate) fn reset(&mut self) {
        self.task = None;
        self.buffer.clear();
        self.offset = 0;
        self.eof = false;
    }

    /// Advance the state machine by one transport send callback, copying
    /// into `dest` whatever is available.
    pub(crate) fn fill(
        &mut self,
        stream: &mut dyn RequestBodyStream,
        waker: &Waker,
        dest: &mut [u8],
    ) -> FillOutcome {
        if self.eof || dest.is_empty() {
            return FillOutcome::Filled(0);
        }

        loop {
            // Hand over staged bytes first.
            if self.offset < self.buffer.len() {
                let n = cmp::min(dest.len(), self.buffer.len() - self.offset);
                dest[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
                self.offset += n;
                if self.offset == self.buffer.len() {
                    self.buffer.clear();
                    self.offset = 0;
                }
                return FillOutcome::Filled(n);
            }

            let mut cx = Context::from_waker(waker);
            let max = cmp::min(dest.len(), STAGING_CAP);
            let poll = self
                .task
                .get_or_insert_with(|| stream.read_async(max))
                .as_mut()
                .poll(&mut cx);

            match poll {
                Poll::Pending => return FillOutcome::Pause,
                Poll::Ready(Ok(chunk)) => {
                    self.task = None;
                    if chunk.is_empty() {
                        self.eof = true;
                        return FillOutcome::Filled(0);
                    }
                    self.buffer = chunk;
                    self.offset = 0;
                }
                Poll::Ready(Err(e)) => {
                    self.task = None;
                    return FillOutcome::Failed(e);
                }
            }
        }
    }
}

/// An in-memory request body.
///
/// Reads complete synchronously and the body is resettable, so transfers
/// that must restart (authentication challenges, redirects) can rewind it.
#[derive(Debug, Clone)]
pub struct BytesBody {
    data: Vec<u8>,
    pos: usize,
}

impl BytesBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl RequestBodyStream for BytesBody {
    fn read_async(&mut self, max: usize) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        let end = cmp::min(self.pos + max, self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Box::pin(future::ready(Ok(chunk)))
    }

    fn try_reset(&mut self) -> bool {
        self.pos = 0;
        true
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// A request body produced asynchronously through a channel.
///
/// Reads that find the channel empty leave the transfer paused until the
/// producer sends another chunk; closing the sender ends the body.
pub struct ChannelBody {
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    len: Option<u64>,
}

impl ChannelBody {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, len: Option<u64>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
            len,
        }
    }
}

impl RequestBodyStream for ChannelBody {
    fn read_async(&mut self, _max: usize) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        use futures_util::Stream;

        let rx = Arc::clone(&self.rx);
        Box::pin(future::poll_fn(move |cx| {
            let mut rx = rx.lock().unwrap();
            match Pin::new(&mut *rx).poll_next(cx) {
                Poll::Ready(Some(chunk)) => Poll::Ready(Ok(chunk)),
                Poll::Ready(None) => Poll::Ready(Ok(Vec::new())),
                Poll::Pending => Poll::Pending,
            }
        }))
    }

    fn len(&self) -> Option<u64> {
        self.len
    }
}
