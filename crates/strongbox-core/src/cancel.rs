use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Listener = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation flag shared by every long-running operation.
///
/// The flag only ever goes from `false` to `true`. Clones share state, so the
/// collaborator that owns the UI can keep one clone and hand another to the
/// engine.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Flips the flag and runs every registered listener once.
    /// Calling it again is a no-op.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let listeners = match self.inner.listeners.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for listener in listeners {
            listener();
        }
    }

    /// Registers a callback for the false→true transition. If the token is
    /// already cancelled the callback runs immediately on this thread.
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut guard = match self.inner.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !self.is_cancelled() {
                guard.push(Box::new(listener));
                return;
            }
        }
        listener();
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
