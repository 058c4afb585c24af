//! Cancellation and progress primitives shared by the transfer client and the
//! pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Progress callback receiving a fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every waiter. Returns false if it was already set.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.signal.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until cancelled, whichever comes first.
    /// Returns true if the token was cancelled.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .inner
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.is_cancelled()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Forwards progress to a callback, clamped to `[0, 1]`, never going
/// backwards and silent once the token is cancelled.
pub struct ProgressTracker {
    callback: ProgressFn,
    cancel: CancelToken,
    last: Option<f64>,
}

impl ProgressTracker {
    pub fn new(callback: ProgressFn, cancel: CancelToken) -> Self {
        Self {
            callback,
            cancel,
            last: None,
        }
    }

    pub fn report(&mut self, fraction: f64) {
        if self.cancel.is_cancelled() || fraction.is_nan() {
            return;
        }
        let clamped = fraction.clamp(0.0, 1.0);
        if let Some(last) = self.last {
            if clamped <= last {
                return;
            }
        }
        self.last = Some(clamped);
        (self.callback)(clamped);
    }

    pub fn report_bytes(&mut self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        self.report(done as f64 / total as f64);
    }

    pub fn finish(&mut self) {
        self.report(1.0);
    }
}
