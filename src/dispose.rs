use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};

/// one shot teardown tracker shared by `Gate` and `Worker`
///
/// `disposing` is raised before the teardown callback runs, so code racing with
/// the teardown can bail out early, while `is_disposed` only turns true after the
/// callback returned.
pub struct Disposal {
    disposing: AtomicBool,
    done: OnceCell<()>,
}

impl Debug for Disposal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Disposal")
            .field("disposing", &self.is_disposing())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Default for Disposal {
    fn default() -> Self {
        Disposal::new()
    }
}

impl Disposal {
    pub const fn new() -> Self {
        Disposal {
            disposing: AtomicBool::new(false),
            done: OnceCell::new(),
        }
    }

    /// true once the teardown started
    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// true once the teardown callback finished
    pub fn is_disposed(&self) -> bool {
        self.done.get().is_some()
    }

    /// run the teardown exactly once, concurrent callers block until it is done
    ///
    /// returns `true` for the caller whose callback actually ran
    pub fn dispose<F: FnOnce()>(&self, f: F) -> bool {
        let mut ran = false;
        self.done.get_or_init(|| {
            self.disposing.store(true, Ordering::Release);
            f();
            ran = true;
        });
        ran
    }

    /// run `f` only if the teardown has not started yet
    pub fn run_if_alive<R, F: FnOnce() -> R>(&self, f: F) -> Option<R> {
        if self.is_disposing() {
            None
        } else {
            Some(f())
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_disposing() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }
}
