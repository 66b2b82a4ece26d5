use indexmap::IndexMap;
use may::sync::{Condvar, Mutex, MutexGuard, RwLock};
use may_waiter::{TokenWaiter, ID};

use crate::cancel::CancelToken;
use crate::dispose::Disposal;
use crate::error::{Error, Result};
use crate::observer::Observers;

use std::fmt::{self, Debug};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

/// how a queued pulse subscriber was released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    Served,
    Abandoned,
    Disposed,
}

// pulse queue, key is the enqueue sequence, `None` marks an entry that was
// already settled out of band (timeout or cancel) and must be skipped
type PulseQueue = IndexMap<u64, Option<ID>>;

struct GateInner {
    value: bool,
    next_pulse: u64,
    pending_on_true: PulseQueue,
    pending_on_false: PulseQueue,
    // observers that run while the gate lock is held
    locked: Observers,
}

// waiter ids are only touched while holding the gate lock
unsafe impl Send for GateInner {}

impl GateInner {
    fn pending_mut(&mut self, value: bool) -> &mut PulseQueue {
        if value {
            &mut self.pending_on_true
        } else {
            &mut self.pending_on_false
        }
    }
}

struct Shared {
    inner: Mutex<GateInner>,
    // mirror of `inner.value` for lock free reads
    value: AtomicBool,
    // wait handles, waiters park here until the value matches
    true_cv: Condvar,
    false_cv: Condvar,
    unlocked: RwLock<Observers>,
    disposal_value: Option<bool>,
    disposal: Disposal,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// change the value, both wait handles and raise the locked observers
    fn transition(&self, inner: &mut GateInner, value: bool) {
        inner.value = value;
        self.value.store(value, Ordering::Release);
        if value {
            self.true_cv.notify_all();
        } else {
            self.false_cv.notify_all();
        }
        inner.locked.raise(value);
    }

    fn raise_unlocked(&self, value: bool) {
        self.unlocked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .raise(value);
    }

    fn wake_all(&self) {
        let _inner = self.lock();
        self.true_cv.notify_all();
        self.false_cv.notify_all();
    }

    fn set(&self, target: bool) -> Result<bool> {
        let mut inner = self.lock();
        // a teardown may have started while we waited for the lock
        self.disposal.check()?;
        if inner.value == target {
            return Ok(false);
        }
        self.transition(&mut inner, target);

        // serve one pulse subscriber per flip until the queue for the
        // current value is empty
        let mut current = target;
        loop {
            let Some((seq, slot)) = inner.pending_mut(current).shift_remove_index(0) else {
                break;
            };
            let Some(id) = slot else {
                trace!("gate skip settled pulse {}", seq);
                continue;
            };
            current = !current;
            self.transition(&mut inner, current);
            trace!("gate served pulse {}, value reset to {}", seq, current);
            TokenWaiter::set_rsp(id, Pulse::Served);
        }
        drop(inner);

        self.raise_unlocked(current);
        Ok(current == target)
    }

    /// settle a still queued pulse subscriber, returns false if it was gone
    fn settle_pulse(&self, value: bool, seq: u64, pulse: Pulse) -> bool {
        let mut inner = self.lock();
        match inner.pending_mut(value).get_mut(&seq).and_then(Option::take) {
            Some(id) => {
                TokenWaiter::set_rsp(id, pulse);
                true
            }
            None => false,
        }
    }

    fn dispose(&self) {
        self.disposal.dispose(|| {
            let mut inner = self.lock();
            let forced = match self.disposal_value {
                Some(v) if v != inner.value => {
                    self.transition(&mut inner, v);
                    Some(v)
                }
                _ => None,
            };
            drop(inner);

            if let Some(v) = forced {
                debug!("gate forced to {} on dispose", v);
                self.raise_unlocked(v);
            }

            let mut guard = self.lock();
            let inner = &mut *guard;
            let pending: Vec<ID> = inner
                .pending_on_true
                .drain(..)
                .chain(inner.pending_on_false.drain(..))
                .filter_map(|(_, id)| id)
                .collect();
            if !pending.is_empty() {
                debug!("gate dispose releases {} pulse waiters", pending.len());
            }
            for id in pending {
                TokenWaiter::set_rsp(id, Pulse::Disposed);
            }
            self.true_cv.notify_all();
            self.false_cv.notify_all();
        });
    }
}

/// thread safe waitable boolean
///
/// A `Gate` can be waited on for either value by any number of threads or
/// coroutines. Each transition is broadcast to two classes of observers:
/// *locked* observers run while the transition still holds the gate lock and
/// always see a consistent value, *unlocked* observers run after the lock is
/// released and may see a stale value. Locked observers must not block on or
/// re-enter the same gate.
///
/// The `*_then_reset` waits queue a one shot pulse subscriber: the next
/// transition to the awaited value releases exactly one queued subscriber and
/// immediately flips the gate back, within the same lock acquisition.
pub struct Gate {
    shared: Arc<Shared>,
}

impl Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Gate{{ value: {}, disposing: {} }}",
            self.is_set(),
            self.shared.disposal.is_disposing()
        )
    }
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new(false)
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl Gate {
    pub fn new(initial: bool) -> Self {
        Gate::build(initial, None)
    }

    /// create a gate that is forced to `forced` right before teardown
    pub fn with_disposal_value(initial: bool, forced: bool) -> Self {
        Gate::build(initial, Some(forced))
    }

    fn build(initial: bool, disposal_value: Option<bool>) -> Self {
        Gate {
            shared: Arc::new(Shared {
                inner: Mutex::new(GateInner {
                    value: initial,
                    next_pulse: 0,
                    pending_on_true: IndexMap::new(),
                    pending_on_false: IndexMap::new(),
                    locked: Observers::default(),
                }),
                value: AtomicBool::new(initial),
                true_cv: Condvar::new(),
                false_cv: Condvar::new(),
                unlocked: RwLock::new(Observers::default()),
                disposal_value,
                disposal: Disposal::new(),
            }),
        }
    }

    /// current value, read without taking the gate lock
    pub fn is_set(&self) -> bool {
        self.shared.value.load(Ordering::Acquire)
    }

    pub fn is_disposing(&self) -> bool {
        self.shared.disposal.is_disposing()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposal.is_disposed()
    }

    /// move the gate to `target`
    ///
    /// returns `Ok(false)` without raising anything when the gate already
    /// holds `target`. Otherwise returns whether the final value equals
    /// `target`, which is not the case when a queued pulse subscriber was
    /// served and the gate flipped back.
    pub fn set(&self, target: bool) -> Result<bool> {
        self.shared.disposal.check()?;
        self.shared.set(target)
    }

    /// like `set` but skips the lock when the value already matches
    pub fn set_if_different(&self, target: bool) -> Result<bool> {
        if self.is_set() == target {
            return Ok(false);
        }
        self.set(target)
    }

    /// number of live pulse subscribers waiting for `value`
    pub fn pending_pulses(&self, value: bool) -> usize {
        let mut inner = self.shared.lock();
        inner
            .pending_mut(value)
            .values()
            .filter(|id| id.is_some())
            .count()
    }

    /// block until the gate holds `target`
    ///
    /// returns `Ok(false)` when `timeout` expires, `Err(Error::Cancelled)` when
    /// `cancel` fires first. A gate that is tearing down never blocks: the
    /// result then tells whether the current value matches `target`.
    pub fn wait_for(
        &self,
        target: bool,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<bool> {
        let shared = &self.shared;
        let _reg = cancel.map(|token| {
            let s = shared.clone();
            token.on_cancel(move || s.wake_all())
        });
        let deadline = timeout.map(|d| Instant::now() + d);
        let cv = if target {
            &shared.true_cv
        } else {
            &shared.false_cv
        };

        let mut inner = shared.lock();
        loop {
            if inner.value == target {
                return Ok(true);
            }
            if shared.disposal.is_disposing() {
                return Ok(false);
            }
            if let Some(token) = cancel {
                token.check()?;
            }
            inner = match deadline {
                None => cv.wait(inner).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    cv.wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn wait_true(&self) -> Result<bool> {
        self.wait_for(true, None, None)
    }

    pub fn wait_false(&self) -> Result<bool> {
        self.wait_for(false, None, None)
    }

    pub fn wait_true_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_for(true, Some(timeout), None)
    }

    pub fn wait_false_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_for(false, Some(timeout), None)
    }

    pub fn wait_true_cancel(&self, cancel: &CancelToken) -> Result<bool> {
        self.wait_for(true, None, Some(cancel))
    }

    pub fn wait_false_cancel(&self, cancel: &CancelToken) -> Result<bool> {
        self.wait_for(false, None, Some(cancel))
    }

    /// queue a pulse subscriber and block until a transition to `target` serves it
    ///
    /// the serving `set` flips the gate back to `!target` before it returns,
    /// so each qualifying transition releases exactly one subscriber, in
    /// enqueue order. Returns `Ok(false)` on timeout or when the gate is torn
    /// down while waiting, `Err(Error::Cancelled)` when `cancel` fires first.
    pub fn wait_then_reset(
        &self,
        target: bool,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<bool> {
        if let Some(token) = cancel {
            token.check()?;
        }
        let shared = &self.shared;
        let waiter = TokenWaiter::<Pulse>::new();
        let seq = {
            let mut inner = shared.lock();
            // checked under the lock so a concurrent dispose can't miss us
            shared.disposal.check()?;
            let seq = inner.next_pulse;
            inner.next_pulse += 1;
            let id = waiter.id().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "pulse waiter has no id")
            })?;
            inner.pending_mut(target).insert(seq, Some(id));
            trace!("gate queued pulse {} waiting for {}", seq, target);
            seq
        };

        let _reg = cancel.map(|token| {
            let s = shared.clone();
            token.on_cancel(move || {
                s.settle_pulse(target, seq, Pulse::Abandoned);
            })
        });

        let pulse = match waiter.wait_rsp(timeout) {
            Ok(pulse) => pulse,
            Err(e) => {
                if shared.settle_pulse(target, seq, Pulse::Abandoned) {
                    trace!("gate pulse {} abandoned: {}", seq, e);
                    return Ok(false);
                }
                // settled concurrently, the response is already posted
                waiter.wait_rsp(None)?
            }
        };

        match pulse {
            Pulse::Served => Ok(true),
            Pulse::Disposed => Ok(false),
            Pulse::Abandoned => match cancel {
                Some(token) if token.is_cancelled() => Err(Error::Cancelled),
                _ => Ok(false),
            },
        }
    }

    pub fn wait_true_then_reset(&self) -> Result<bool> {
        self.wait_then_reset(true, None, None)
    }

    pub fn wait_false_then_reset(&self) -> Result<bool> {
        self.wait_then_reset(false, None, None)
    }

    pub fn wait_true_then_reset_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_then_reset(true, Some(timeout), None)
    }

    pub fn wait_false_then_reset_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_then_reset(false, Some(timeout), None)
    }

    pub fn wait_true_then_reset_cancel(&self, cancel: &CancelToken) -> Result<bool> {
        self.wait_then_reset(true, None, Some(cancel))
    }

    pub fn wait_false_then_reset_cancel(&self, cancel: &CancelToken) -> Result<bool> {
        self.wait_then_reset(false, None, Some(cancel))
    }

    fn add_locked(&self, add: impl FnOnce(&mut Observers)) {
        let mut inner = self.shared.lock();
        add(&mut inner.locked);
    }

    fn add_unlocked(&self, add: impl FnOnce(&mut Observers)) {
        let mut obs = self
            .shared
            .unlocked
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        add(&mut obs);
    }

    /// observe every transition while the gate lock is held
    pub fn on_locked_change<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_locked(|o| o.add_any(Box::new(f)));
    }

    pub fn on_locked_true<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_locked(|o| o.add_true(Box::new(f)));
    }

    pub fn on_locked_false<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_locked(|o| o.add_false(Box::new(f)));
    }

    /// observe the final value of every `set` after the gate lock is released
    pub fn on_change<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_unlocked(|o| o.add_any(Box::new(f)));
    }

    pub fn on_true<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_unlocked(|o| o.add_true(Box::new(f)));
    }

    pub fn on_false<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.add_unlocked(|o| o.add_false(Box::new(f)));
    }

    /// tear the gate down, idempotent
    ///
    /// forces the disposal value (raising observers, not serving pulses) and
    /// releases every blocked waiter.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}
