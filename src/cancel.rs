//! Cancellation sources and tokens for in-flight requests.
//!
//! Delivery is best-effort and asynchronous: canceling after a transfer has
//! completed is a no-op, and a cancellation during processing is observed at
//! the worker's next submission drain.

use slab::Slab;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    callbacks: Mutex<Slab<Callback>>,
}

/// Owner side of a cancellation signal.
///
/// Hand [`CancelToken`]s to the requests this source should control, then
/// call [`cancel`](CancelSource::cancel) to abort them all.
#[derive(Default)]
pub struct CancelSource {
    inner: Arc<Inner>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fire the cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<Callback> = {
            let mut slab = self.inner.callbacks.lock().unwrap();
            slab.drain().collect()
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("canceled", &self.inner.canceled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Observer side of a cancellation signal, carried by a request.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Register `f` to run when the source fires. If it already fired, `f`
    /// runs immediately. The returned guard unregisters on drop, so a
    /// completed transfer stops being cancelable the moment it deactivates.
    pub(crate) fn subscribe(&self, f: impl FnOnce() + Send + 'static) -> CancelGuard {
        if self.is_canceled() {
            f();
            return CancelGuard::empty();
        }

        let key = self.inner.callbacks.lock().unwrap().insert(Box::new(f));

        // The source may have fired between the check and the insert, in
        // which case its drain missed our callback.
        if self.is_canceled() {
            if let Some(callback) = self.inner.callbacks.lock().unwrap().try_remove(key) {
                callback();
            }
            return CancelGuard::empty();
        }

        CancelGuard {
            inner: Arc::downgrade(&self.inner),
            key,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Unregisters a cancellation subscription on drop.
pub(crate) struct CancelGuard {
    inner: Weak<Inner>,
    key: usize,
}

impl CancelGuard {
    fn empty() -> Self {
        Self {
            inner: Weak::new(),
            key: 0,
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.callbacks.lock().unwrap().try_remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_runs_subscriptions_once() {
        let source = CancelSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = source.token().subscribe(counter_callback(&count));

        source.cancel();
        source.cancel();

        assert!(source.token().is_canceled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_guard_unsubscribes() {
        let source = CancelSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        drop(source.token().subscribe(counter_callback(&count)));

        source.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_after_cancel_fires_immediately() {
        let source = CancelSource::new();
        source.cancel();

        let count = Arc::new(AtomicUsize::new(0));
        let _guard = source.token().subscribe(counter_callback(&count));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
