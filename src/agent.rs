//! Curl agent that executes multiple requests simultaneously.
//!
//! The agent owns a single "multi" handle and a worker thread that drives
//! every in-flight transfer through it. Caller threads communicate with the
//! worker by enqueuing submissions (new transfers, cancellations, unpause
//! requests) and kicking a wakeup channel that is part of the transport's
//! wait set.
//!
//! The worker is lazy: it is spawned by the first submission, lingers for a
//! short keep-alive window once it runs out of work, and exits when nothing
//! new arrives. The multi handle is parked in the agent between runs so its
//! connection and DNS pools stay warm across request bursts.

use crate::{
    cancel::CancelGuard,
    error::Error,
    handler::RequestHandler,
    task::waker_fn,
    wakeup,
};
use crossbeam_channel::{Receiver, Sender};
use curl::multi::{Easy2Handle, Multi};
use http::StatusCode;
use slab::Slab;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

/// How long an idle worker lingers for new submissions before exiting.
const KEEP_ALIVE: Duration = Duration::from_millis(50);

/// Upper bound on a single transport wait.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

type EasyHandle = curl::easy::Easy2<RequestHandler>;
type MultiMessage = (usize, Result<(), curl::Error>);

/// Builder for configuring an agent.
#[derive(Debug)]
pub struct AgentBuilder {
    max_host_connections: usize,
    multiplexing: bool,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            max_host_connections: 0,
            multiplexing: true,
        }
    }
}

impl AgentBuilder {
    /// Cap concurrent connections per host, or 0 for the transport default.
    pub fn max_host_connections(mut self, max: usize) -> Self {
        self.max_host_connections = max;
        self
    }

    /// Allow multiplexing transfers over shared connections when the
    /// protocol supports it.
    pub fn multiplexing(mut self, enabled: bool) -> Self {
        self.multiplexing = enabled;
        self
    }

    pub fn build(&self) -> Agent {
        Agent {
            shared: Arc::new(AgentShared {
                max_host_connections: self.max_host_connections,
                multiplexing: self.multiplexing,
                state: Mutex::new(State::default()),
            }),
        }
    }
}

/// Handle to a multi-transfer agent.
///
/// Dropping the agent disposes it: queued and in-flight transfers fail, and
/// the transport context is released once the worker has exited.
pub struct Agent {
    shared: Arc<AgentShared>,
}

impl Agent {
    pub fn new() -> Self {
        AgentBuilder::default().build()
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Submit a configured transfer for execution.
    ///
    /// Fire-and-forget: the caller observes completion through the
    /// [`ResponseFuture`](crate::ResponseFuture) obtained when the
    /// [`RequestHandler`] was created.
    pub fn submit(&self, request: EasyHandle) -> Result<(), Error> {
        self.shared.enqueue(Submission::New(request))
    }

    /// Whether a worker thread currently exists.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().worker.is_some()
    }

    /// Fail queued submissions, wake the worker so it aborts in-flight
    /// transfers, and release the transport context once it has exited.
    /// Called automatically on drop.
    pub fn dispose(&self) {
        let (worker, stale) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.multi = None;
            if let Some(wakeup) = &state.wakeup {
                wakeup.notify();
            }
            let stale: Vec<Submission> = state.queue.drain(..).collect();
            (state.worker.take(), stale)
        };

        for submission in stale {
            fail_submission(submission, Error::Disposed);
        }

        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("running", &self.is_running())
            .finish()
    }
}

/// A unit of work sent to the worker.
enum Submission {
    /// Begin executing a new transfer.
    New(EasyHandle),
    /// Abort the transfer with the given token.
    Cancel(usize),
    /// Resume a transfer paused on body backpressure.
    Unpause(usize),
}

fn fail_submission(submission: Submission, error: Error) {
    if let Submission::New(mut easy) = submission {
        let handler = easy.get_mut();
        handler.fail(error);
        handler.cleanup();
    }
}

struct AgentShared {
    max_host_connections: usize,
    multiplexing: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Submission>,
    /// Join handle for the running worker. Paired with `wakeup`: both are
    /// `Some` exactly while a worker runs, and the pairing only changes
    /// under this lock.
    worker: Option<thread::JoinHandle<()>>,
    wakeup: Option<wakeup::Writer>,
    /// The transport context, parked here between worker runs.
    multi: Option<Multi>,
    disposed: bool,
}

// `Multi` holds raw `curl_multi` pointers that curl's own bindings don't mark
// `Send`. Access is already serialized through `AgentShared::state`'s mutex
// and exclusive worker-thread ownership, so moving it across threads is sound.
#[allow(unsafe_code)]
unsafe impl Send for State {}

impl AgentShared {
    fn enqueue(self: &Arc<Self>, submission: Submission) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if state.disposed {
            drop(state);
            fail_submission(submission, Error::Disposed);
            return Err(Error::Disposed);
        }

        state.queue.push_back(submission);

        if state.worker.is_none() {
            if let Err(e) = self.spawn_worker(&mut state) {
                let submission = state.queue.pop_back();
                drop(state);
                if let Some(submission) = submission {
                    fail_submission(submission, Error::Worker(e.to_string()));
                }
                return Err(e);
            }
        } else if state.queue.len() == 1 {
            // The worker only blocks while the queue is empty, so only the
            // empty-to-non-empty transition needs a wakeup.
            if let Some(wakeup) = &state.wakeup {
                wakeup.notify();
            }
        }

        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }

    /// Start a worker, handing it the (lazily created) transport context and
    /// a fresh wakeup channel. Caller must hold the state lock.
    fn spawn_worker(self: &Arc<Self>, state: &mut State) -> Result<(), Error> {
        let multi = match state.multi.take() {
            Some(multi) => multi,
            None => self.create_multi()?,
        };

        let (reader, writer) = match wakeup::pair() {
            Ok(pair) => pair,
            Err(e) => {
                state.multi = Some(multi);
                return Err(e.into());
            }
        };

        let worker = AgentWorker {
            multi,
            wakeup: reader,
            shared: Arc::clone(self),
            requests: Slab::new(),
            multi_messages: crossbeam_channel::unbounded(),
        };

        let worker_span = tracing::debug_span!("agent_worker");
        worker_span.follows_from(tracing::Span::current());

        let join = thread::Builder::new()
            .name(format!(
                "courier-agent-{}",
                NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst)
            ))
            .spawn(move || {
                let _enter = worker_span.enter();
                worker.run();
            });

        match join {
            Ok(handle) => {
                state.worker = Some(handle);
                state.wakeup = Some(writer);
                Ok(())
            }
            // The unspawned closure owned the multi; it is recreated on the
            // next submission.
            Err(e) => Err(e.into()),
        }
    }

    fn create_multi(&self) -> Result<Multi, Error> {
        let mut multi = Multi::new();
        multi.pipelining(false, self.multiplexing)?;
        if self.max_host_connections > 0 {
            multi.set_max_host_connections(self.max_host_connections)?;
        }
        Ok(multi)
    }
}

/// An activated transfer owned by the worker.
struct ActiveRequest {
    handle: Easy2Handle<RequestHandler>,
    /// Keeps the cancellation subscription alive for the activation.
    _cancel: CancelGuard,
}

/// Worker state driving the transport on its own thread.
struct AgentWorker {
    multi: Multi,
    wakeup: wakeup::Reader,
    shared: Arc<AgentShared>,
    /// Contains all of the active transfers, keyed by token.
    requests: Slab<ActiveRequest>,
    /// Staging queue for completion messages read from the multi handle.
    multi_messages: (Sender<MultiMessage>, Receiver<MultiMessage>),
}

// `Multi` and `Easy2Handle` carry raw curl pointers that aren't `Send` per
// curl's bindings, but `AgentWorker` is only ever moved wholesale into the
// thread that exclusively owns and drives it for its lifetime.
#[allow(unsafe_code)]
unsafe impl Send for AgentWorker {}

impl AgentWorker {
    fn run(mut self) {
        tracing::debug!("agent worker started");

        if let Err(e) = self.run_loop() {
            tracing::error!("agent worker shut down with error: {}", e);
            let message = e.to_string();
            self.fail_all(|| Error::Worker(message.clone()));
        }

        self.shutdown();
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            if self.shared.is_disposed() {
                self.fail_all(|| Error::Disposed);
                return Ok(());
            }

            self.drain_submissions()?;

            if self.requests.is_empty() {
                // Linger for the keep-alive window; exit if nothing arrives.
                if !self.wakeup.wait(KEEP_ALIVE)? {
                    return Ok(());
                }
                self.wakeup.drain();
                continue;
            }

            self.perform()?;
            self.dispatch()?;

            if !self.requests.is_empty() {
                self.wait()?;
            }
        }
    }

    /// Dequeue and handle submissions one at a time, releasing the queue
    /// lock before touching the transport.
    fn drain_submissions(&mut self) -> Result<(), Error> {
        loop {
            let submission = self.shared.state.lock().unwrap().queue.pop_front();
            match submission {
                Some(submission) => self.handle_submission(submission)?,
                None => return Ok(()),
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, submission))]
    fn handle_submission(&mut self, submission: Submission) -> Result<(), Error> {
        match submission {
            Submission::New(request) => self.begin_request(request),
            Submission::Cancel(token) => self.cancel_request(token),
            Submission::Unpause(token) => self.unpause_request(token),
        }
    }

    fn begin_request(&mut self, mut request: EasyHandle) -> Result<(), Error> {
        if request.get_ref().cancel_token().is_canceled() {
            let handler = request.get_mut();
            handler.fail(Error::Canceled);
            handler.cleanup();
            return Ok(());
        }

        // Prepare an entry for storing this request while it executes.
        let entry = self.requests.vacant_entry();
        let id = entry.key();

        // Resuming a paused transfer re-enters the worker through the
        // submission queue; the waker may fire from any thread.
        let shared = Arc::downgrade(&self.shared);
        request.get_mut().init(
            id,
            waker_fn(move || {
                if let Some(shared) = shared.upgrade() {
                    if shared.enqueue(Submission::Unpause(id)).is_err() {
                        tracing::warn!("agent went away while resuming request [id={}]", id);
                    }
                }
            }),
        );

        let cancel_token = request.get_ref().cancel_token();
        let producer = request.get_ref().producer();

        // Register the transfer with curl.
        let mut handle = match self.multi.add2(request) {
            Ok(handle) => handle,
            Err(e) => {
                // The transfer never became active; only this request fails.
                producer.complete(Err(e.into()));
                return Ok(());
            }
        };

        if let Err(e) = handle.set_token(id) {
            let mut easy = self.multi.remove2(handle)?;
            let handler = easy.get_mut();
            handler.fail(e.into());
            handler.cleanup();
            return Ok(());
        }

        let shared = Arc::downgrade(&self.shared);
        let guard = cancel_token.subscribe(move || {
            if let Some(shared) = shared.upgrade() {
                let _ = shared.enqueue(Submission::Cancel(id));
            }
        });

        entry.insert(ActiveRequest {
            handle,
            _cancel: guard,
        });

        Ok(())
    }

    fn cancel_request(&mut self, token: usize) -> Result<(), Error> {
        // A token that is already gone means the transfer completed first.
        let Some(active) = self.requests.try_remove(token) else {
            tracing::trace!(token, "cancellation for inactive transfer ignored");
            return Ok(());
        };

        tracing::debug!(token, "canceling active transfer");
        let mut easy = self.multi.remove2(active.handle)?;
        let handler = easy.get_mut();
        handler.fail(Error::Canceled);
        handler.cleanup();

        Ok(())
    }

    fn unpause_request(&mut self, token: usize) -> Result<(), Error> {
        let Some(active) = self.requests.get(token) else {
            tracing::trace!(token, "unpause for inactive transfer ignored");
            return Ok(());
        };

        let result = active
            .handle
            .unpause_read()
            .and_then(|()| active.handle.unpause_write());

        if let Err(e) = result {
            // Unpausing ran callbacks inline and they failed; the transfer
            // cannot make progress, so deactivate it now.
            tracing::debug!(token, "error unpausing transfer: {}", e);
            if let Some(active) = self.requests.try_remove(token) {
                let mut easy = self.multi.remove2(active.handle)?;
                easy.get_mut().complete(Err(e));
            }
        }

        Ok(())
    }

    /// Advance all active transfers.
    fn perform(&mut self) -> Result<(), Error> {
        loop {
            match self.multi.perform() {
                Ok(_running) => return Ok(()),
                Err(e) if e.is_call_perform() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Collect messages from curl about requests that have completed,
    /// whether successfully or with an error.
    fn dispatch(&mut self) -> Result<(), Error> {
        self.multi.messages(|message| {
            if let Some(result) = message.result() {
                if let Ok(token) = message.token() {
                    let _ = self.multi_messages.0.send((token, result));
                }
            }
        });

        loop {
            match self.multi_messages.1.try_recv() {
                Ok((token, result)) => self.complete_request(token, result)?,
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => unreachable!(),
            }
        }

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, result))]
    fn complete_request(
        &mut self,
        token: usize,
        result: Result<(), curl::Error>,
    ) -> Result<(), Error> {
        let Some(active) = self.requests.try_remove(token) else {
            tracing::warn!(token, "completion message for unknown transfer");
            return Ok(());
        };

        let mut easy = self.multi.remove2(active.handle)?;
        self.transfer_credentials(&mut easy);
        easy.get_mut().complete(result);

        Ok(())
    }

    /// Offer the server's advertised auth schemes to the credential cache so
    /// later requests to this origin can pre-authenticate.
    fn transfer_credentials(&self, easy: &mut EasyHandle) {
        let (preauthenticate, status, cache) = {
            let handler = easy.get_ref();
            (
                handler.config().preauthenticate,
                handler.status(),
                handler.config().credential_cache.clone(),
            )
        };

        if !preauthenticate || status == Some(StatusCode::UNAUTHORIZED) {
            return;
        }
        let Some(cache) = cache else { return };
        let Some(auth) = auth_avail(easy) else { return };

        if let Ok(Some(url)) = easy.effective_url() {
            cache.record(url, auth);
        }
    }

    /// Block until transfer activity, a wakeup, or the wait timeout.
    fn wait(&mut self) -> Result<(), Error> {
        let mut wait_fds = [self.wakeup.wait_fd()];
        self.multi.wait(&mut wait_fds, WAIT_TIMEOUT)?;
        if wait_fds[0].received_read() {
            self.wakeup.drain();
        }
        Ok(())
    }

    /// Fail and deactivate every remaining transfer.
    fn fail_all(&mut self, mut error: impl FnMut() -> Error) {
        for active in self.requests.drain() {
            match self.multi.remove2(active.handle) {
                Ok(mut easy) => {
                    let handler = easy.get_mut();
                    handler.fail(error());
                    handler.cleanup();
                }
                Err(e) => {
                    tracing::error!("failed to remove transfer during worker teardown: {}", e)
                }
            }
        }
    }

    /// Exit teardown: release the wakeup channel and worker handle
    /// atomically, park or drop the transport context, and re-arm a fresh
    /// worker if more work arrived during teardown.
    fn shutdown(self) {
        let AgentWorker {
            multi,
            wakeup,
            shared,
            requests,
            ..
        } = self;
        debug_assert!(requests.is_empty());
        drop(wakeup);

        let mut state = shared.state.lock().unwrap();
        state.wakeup = None;
        state.worker = None;

        if state.disposed {
            drop(multi);
            tracing::debug!("agent worker released the transport context");
            return;
        }

        state.multi = Some(multi);

        if !state.queue.is_empty() {
            if let Err(e) = shared.spawn_worker(&mut state) {
                tracing::error!("failed to restart agent worker: {}", e);
                let stale: Vec<Submission> = state.queue.drain(..).collect();
                drop(state);
                let message = e.to_string();
                for submission in stale {
                    fail_submission(submission, Error::Worker(message.clone()));
                }
                return;
            }
            tracing::debug!("agent worker re-armed for new submissions");
        } else {
            tracing::debug!("agent worker exited");
        }
    }
}

/// Read `CURLINFO_HTTPAUTH_AVAIL`, which the safe multi API does not expose.
#[allow(unsafe_code)]
fn auth_avail(easy: &mut EasyHandle) -> Option<u64> {
    let mut auth: libc::c_long = 0;
    let rc = unsafe {
        curl_sys::curl_easy_getinfo(
            easy.raw(),
            curl_sys::CURLINFO_HTTPAUTH_AVAIL,
            &mut auth as *mut libc::c_long,
        )
    };
    (rc == curl_sys::CURLE_OK && auth != 0).then_some(auth as u64)
}
