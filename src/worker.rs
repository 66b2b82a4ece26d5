//! Cancellable background worker built from three gates.
//!
//! * `running` is true while the loop is active, raising it launches the loop
//!   and lowering it cancels and joins the loop.
//! * `working` is true while a unit of work executes.
//! * `work_available` is raised by [`Worker::signal_work`] and consumed by the
//!   loop right before each unit of work.
//!
//! There is no separate state field, `Stopped`, `Idle`, `Working` are just the
//! combinations of the `running` and `working` gates.

use may::go;

use crate::cancel::CancelToken;
use crate::dispose::Disposal;
use crate::error::{BoxError, Result, WorkError};
use crate::gate::Gate;

use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// unit of work executed by a [`Worker`]
///
/// the token is cancelled when the worker stops, long running work should
/// check it, `stop` can't return before `work` does.
pub trait Work: Send + Sync + 'static {
    fn work(&self, cancel: &CancelToken) -> std::result::Result<(), BoxError>;
}

impl<F> Work for F
where
    F: Fn(&CancelToken) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    fn work(&self, cancel: &CancelToken) -> std::result::Result<(), BoxError> {
        self(cancel)
    }
}

/// construction time settings of a [`Worker`]
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// name of the loop thread or coroutine, also used in logs
    pub name: String,
    /// run each unit of work inline on the loop instead of in its own coroutine
    pub sync_work: bool,
    /// host the loop on a dedicated OS thread instead of a coroutine
    pub sync_wait: bool,
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            name: "worker".to_owned(),
            sync_work: true,
            sync_wait: false,
            stack_size: None,
        }
    }
}

impl WorkerConfig {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn sync_work(mut self, sync_work: bool) -> Self {
        self.sync_work = sync_work;
        self
    }

    pub fn sync_wait(mut self, sync_wait: bool) -> Self {
        self.sync_wait = sync_wait;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// diagnostics snapshot of a [`Worker`]
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// units of work executed since the worker was created
    pub work_count: u64,
    /// units of work executed by the current (or last) run
    pub last_run_work_count: u64,
    pub last_start: Option<Instant>,
    pub last_work: Option<Instant>,
    pub last_stop: Option<Instant>,
    pub last_work_duration: Option<Duration>,
}

type ErrorNotify = Box<dyn Fn(&Arc<WorkError>) + Send + Sync>;

enum LoopHandle {
    Thread(thread::JoinHandle<()>),
    Coroutine(may::coroutine::JoinHandle<()>),
}

impl LoopHandle {
    fn join(self) -> thread::Result<()> {
        match self {
            LoopHandle::Thread(h) => h.join(),
            LoopHandle::Coroutine(h) => h.join(),
        }
    }
}

struct WorkerInner {
    config: WorkerConfig,
    work: Arc<dyn Work>,
    running: Gate,
    working: Gate,
    work_available: Gate,
    // live only while a run is active
    cancel: Mutex<Option<CancelToken>>,
    task: Mutex<Option<LoopHandle>>,
    runs: AtomicU64,
    stats: Mutex<WorkerStats>,
    last_error: Mutex<Option<Arc<WorkError>>>,
    on_error: RwLock<Vec<ErrorNotify>>,
    disposal: Disposal,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerInner {
    fn flip(&self, gate: &Gate, value: bool) {
        if let Err(e) = gate.set(value) {
            trace!("worker {} gate flip to {} skipped: {}", self.config.name, value, e);
        }
    }

    fn stop(&self) -> bool {
        self.running.set(false).unwrap_or(false)
    }

    /// runs under the `running` lock when it becomes true
    fn launch(self: &Arc<Self>) {
        let token = CancelToken::new();
        *locked(&self.cancel) = Some(token.clone());
        let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut stats = locked(&self.stats);
            stats.last_start = Some(Instant::now());
            stats.last_run_work_count = 0;
        }

        let inner = self.clone();
        let task = if self.config.sync_wait {
            let mut builder = thread::Builder::new().name(self.config.name.clone());
            if let Some(size) = self.config.stack_size {
                builder = builder.stack_size(size);
            }
            builder
                .spawn(move || inner.run(run, token))
                .map(LoopHandle::Thread)
        } else {
            let mut builder = may::coroutine::Builder::new().name(self.config.name.clone());
            if let Some(size) = self.config.stack_size {
                builder = builder.stack_size(size);
            }
            go!(builder, move || inner.run(run, token)).map(LoopHandle::Coroutine)
        };

        match task {
            Ok(task) => {
                debug!("worker {} launched run {}", self.config.name, run);
                *locked(&self.task) = Some(task);
            }
            Err(e) => {
                error!("worker {} failed to launch: {}", self.config.name, e);
                *locked(&self.last_error) = Some(Arc::new(WorkError::from(e)));
            }
        }
    }

    /// runs under the `running` lock when it becomes false
    fn join_loop(&self) {
        let token = locked(&self.cancel).clone();
        if let Some(token) = token {
            token.cancel();
        }
        let task = locked(&self.task).take();
        if let Some(task) = task {
            if task.join().is_err() {
                error!("worker {} loop panicked", self.config.name);
            }
        }
        locked(&self.cancel).take();
        locked(&self.stats).last_stop = Some(Instant::now());
        debug!("worker {} stopped", self.config.name);
    }

    fn run(self: Arc<Self>, run: u64, token: CancelToken) {
        trace!("worker {} loop {} enter", self.config.name, run);
        let failure = loop {
            match self.work_available.wait_true_cancel(&token) {
                Ok(true) => {}
                // cancelled or torn down
                Ok(false) | Err(_) => break None,
            }
            if token.is_cancelled() {
                break None;
            }
            self.flip(&self.work_available, false);

            let begin = Instant::now();
            {
                let mut stats = locked(&self.stats);
                stats.work_count += 1;
                stats.last_run_work_count += 1;
                stats.last_work = Some(begin);
            }
            self.flip(&self.working, true);
            let result = self.invoke(&token);
            locked(&self.stats).last_work_duration = Some(begin.elapsed());
            self.flip(&self.working, false);

            if let Err(e) = result {
                break Some(e);
            }
        };

        self.flip(&self.working, false);
        if let Some(token) = locked(&self.cancel).take() {
            token.cancel();
        }

        if let Some(err) = failure {
            let err = Arc::new(err);
            warn!("worker {} run {} failed: {}", self.config.name, run, err);
            *locked(&self.last_error) = Some(err.clone());

            // the failed run can't lower `running` itself, stop joins this task.
            // error observers run after that, so they may restart the worker
            let weak = Arc::downgrade(&self);
            go!(move || stop_failed_run(weak, run, err));
        }
        trace!("worker {} loop {} exit", self.config.name, run);
    }

    fn invoke(&self, token: &CancelToken) -> std::result::Result<(), WorkError> {
        let result = if self.config.sync_work {
            panic::catch_unwind(AssertUnwindSafe(|| self.work.work(token)))
        } else {
            let work = self.work.clone();
            let token = token.clone();
            go!(move || work.work(&token)).join()
        };
        match result {
            Ok(r) => r.map_err(WorkError::Failed),
            Err(payload) => Err(WorkError::from_panic(payload)),
        }
    }

    fn notify_error(&self, err: &Arc<WorkError>) {
        let observers = self.on_error.read().unwrap_or_else(PoisonError::into_inner);
        for f in observers.iter() {
            f(err);
        }
    }
}

/// detached from the failed loop, must not block it
fn stop_failed_run(worker: Weak<WorkerInner>, run: u64, err: Arc<WorkError>) {
    let Some(inner) = worker.upgrade() else {
        return;
    };
    if inner.runs.load(Ordering::Acquire) == run {
        inner.stop();
    }
    inner.notify_error(&err);
}

/// cancellable background loop that runs a [`Work`] each time work is signaled
///
/// `start` and `stop` are idempotent. A failing unit of work ends the run, the
/// error is kept as [`Worker::last_error`] and the worker stops, it is only
/// restarted by an explicit `start`.
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.config.name)
            .field("running", &self.is_running())
            .field("working", &self.is_working())
            .field("work_available", &self.is_work_available())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Worker {
    pub fn new<W: Work>(work: W) -> Self {
        Worker::with_config(work, WorkerConfig::default())
    }

    pub fn with_config<W: Work>(work: W, config: WorkerConfig) -> Self {
        let inner = Arc::new(WorkerInner {
            config,
            work: Arc::new(work),
            running: Gate::with_disposal_value(false, false),
            working: Gate::with_disposal_value(false, false),
            work_available: Gate::with_disposal_value(false, false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
            runs: AtomicU64::new(0),
            stats: Mutex::new(WorkerStats::default()),
            last_error: Mutex::new(None),
            on_error: RwLock::new(Vec::new()),
            disposal: Disposal::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.running.on_locked_true(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.launch();
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.running.on_locked_false(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.join_loop();
            }
        });

        Worker { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// start the loop, `Ok(false)` if it was already running
    pub fn start(&self) -> Result<bool> {
        self.inner.disposal.check()?;
        debug!("worker {} start", self.inner.config.name);
        self.inner.running.set(true)
    }

    /// stop the loop and wait until it exited, `false` if it was not running
    ///
    /// must not be called from inside the work itself.
    pub fn stop(&self) -> bool {
        debug!("worker {} stop", self.inner.config.name);
        self.inner.stop()
    }

    /// mark work as available, the loop picks it up once
    pub fn signal_work(&self) -> Result<bool> {
        self.inner.disposal.check()?;
        self.inner.work_available.set(true)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.is_set()
    }

    pub fn is_working(&self) -> bool {
        self.inner.working.is_set()
    }

    pub fn is_work_available(&self) -> bool {
        self.inner.work_available.is_set()
    }

    /// `false` only during an active run whose token is not cancelled
    pub fn is_cancelled(&self) -> bool {
        if self.inner.disposal.is_disposing() {
            return true;
        }
        locked(&self.inner.cancel)
            .as_ref()
            .map_or(true, CancelToken::is_cancelled)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposal.is_disposed()
    }

    pub fn stats(&self) -> WorkerStats {
        locked(&self.inner.stats).clone()
    }

    /// the most recent failure captured from the work
    pub fn last_error(&self) -> Option<Arc<WorkError>> {
        locked(&self.inner.last_error).clone()
    }

    pub fn wait_start(&self) -> Result<bool> {
        self.inner.running.wait_true()
    }

    pub fn wait_start_timeout(&self, timeout: Duration) -> Result<bool> {
        self.inner.running.wait_true_timeout(timeout)
    }

    pub fn wait_stop(&self) -> Result<bool> {
        self.inner.running.wait_false()
    }

    pub fn wait_stop_timeout(&self, timeout: Duration) -> Result<bool> {
        self.inner.running.wait_false_timeout(timeout)
    }

    /// wait until a unit of work is executing
    pub fn wait_busy(&self) -> Result<bool> {
        self.inner.working.wait_true()
    }

    pub fn wait_busy_timeout(&self, timeout: Duration) -> Result<bool> {
        self.inner.working.wait_true_timeout(timeout)
    }

    /// wait until no unit of work is executing
    pub fn wait_boring(&self) -> Result<bool> {
        self.inner.working.wait_false()
    }

    pub fn wait_boring_timeout(&self, timeout: Duration) -> Result<bool> {
        self.inner.working.wait_false_timeout(timeout)
    }

    pub fn on_start<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.running.on_true(move |_| f());
    }

    pub fn on_stop<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.running.on_false(move |_| f());
    }

    pub fn on_work_begin<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.working.on_true(move |_| f());
    }

    pub fn on_work_end<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.working.on_false(move |_| f());
    }

    /// called from a detached coroutine for every captured failure, once the
    /// failed run is stopped, so the callback may `start` the worker again
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Arc<WorkError>) + Send + Sync + 'static,
    {
        self.inner
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// stop the loop and tear down the gates, later `start` calls fail
    pub fn dispose(&self) {
        let inner = &self.inner;
        inner.disposal.dispose(|| {
            debug!("worker {} dispose", inner.config.name);
            inner.stop();
            inner.running.dispose();
            inner.working.dispose();
            inner.work_available.dispose();
        });
    }
}
