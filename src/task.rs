//! Helpers for working with tasks and wakers.

use futures_util::task::ArcWake;
use std::{sync::Arc, task::Waker};

/// Create a waker from a closure.
pub(crate) fn waker_fn(f: impl Fn() + Send + Sync + 'static) -> Waker {
    struct Impl<F>(F);

    impl<F: Fn() + Send + Sync + 'static> ArcWake for Impl<F> {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            (&arc_self.0)()
        }
    }

    futures_util::task::waker(Arc::new(Impl(f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waker_invokes_closure_every_wake() {
        let count = Arc::new(AtomicUsize::new(0));
        let waker = {
            let count = count.clone();
            waker_fn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        waker.wake_by_ref();
        waker.wake_by_ref();
        waker.wake();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
