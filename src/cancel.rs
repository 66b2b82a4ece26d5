use indexmap::IndexMap;

use crate::error::{Error, Result};

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type WakeFn = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    // wake callbacks of the waiters currently blocked on this token
    wakers: Mutex<IndexMap<u64, WakeFn>>,
}

/// cooperative cancellation signal
///
/// cloned handles share the same state, cancelling any of them cancels all.
/// blocked gate waits register a wake callback so they return promptly.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CancelToken{{ cancelled: {} }}", self.is_cancelled())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                wakers: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// request cancellation, only the first call runs the registered wakers
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wakers = {
            let mut map = self
                .inner
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *map)
        };
        trace!("cancel token fired, waking {} waiters", wakers.len());
        for (_, wake) in wakers {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// register a callback that runs once when the token is cancelled
    ///
    /// if the token is already cancelled the callback runs right away on the
    /// calling thread. dropping the returned registration removes the callback.
    pub fn on_cancel<F>(&self, f: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut map = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(map);
            f();
            return CancelRegistration {
                token: self.clone(),
                id: None,
            };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        map.insert(id, Box::new(f));
        CancelRegistration {
            token: self.clone(),
            id: Some(id),
        }
    }
}

/// guard returned by `CancelToken::on_cancel`
pub struct CancelRegistration {
    token: CancelToken,
    id: Option<u64>,
}

impl Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CancelRegistration{{ id: {:?} }}", self.id)
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let mut map = self
                .token
                .inner
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.shift_remove(&id);
        }
    }
}
