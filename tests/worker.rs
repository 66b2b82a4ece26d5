use gate_lock::{BoxError, CancelToken, WorkError, Worker, WorkerConfig};
use once_cell::sync::OnceCell;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(2);

fn init() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
    may::config().set_stack_size(0x8000);
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn start_stop_without_work() {
    init();
    let (calls, work) = counter();
    let worker = Worker::new(move |_: &CancelToken| -> Result<(), BoxError> {
        work();
        Ok(())
    });
    let (starts, on_start) = counter();
    let (stops, on_stop) = counter();
    worker.on_start(on_start);
    worker.on_stop(on_stop);

    assert!(worker.is_cancelled());
    assert!(worker.start().unwrap());
    assert!(!worker.start().unwrap());
    assert!(worker.is_running());
    assert!(!worker.is_cancelled());
    assert!(worker.stop());
    assert!(!worker.stop());

    assert!(!worker.is_running());
    assert!(worker.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    let stats = worker.stats();
    assert_eq!(stats.work_count, 0);
    assert!(stats.last_start.is_some());
    assert!(stats.last_stop.is_some());
}

#[test]
fn one_signal_one_unit() {
    init();
    let holder: Arc<OnceCell<Weak<Worker>>> = Arc::new(OnceCell::new());
    let events = Arc::new(Mutex::new(Vec::new()));

    let (h, e) = (holder.clone(), events.clone());
    let worker = Arc::new(Worker::new(move |_: &CancelToken| -> Result<(), BoxError> {
        let busy = h
            .get()
            .and_then(Weak::upgrade)
            .map_or(false, |w| w.is_working());
        e.lock().unwrap().push(format!("work:{busy}"));
        Ok(())
    }));
    holder.set(Arc::downgrade(&worker)).unwrap();

    let (tx, rx) = mpsc::channel();
    let e = events.clone();
    worker.on_work_begin(move || e.lock().unwrap().push("begin".to_owned()));
    let e = events.clone();
    let tx = Mutex::new(tx);
    worker.on_work_end(move || {
        e.lock().unwrap().push("end".to_owned());
        let _ = tx.lock().unwrap().send(());
    });

    worker.start().unwrap();
    assert!(worker.signal_work().unwrap());
    rx.recv_timeout(TIMEOUT).unwrap();
    assert!(worker.wait_boring_timeout(TIMEOUT).unwrap());
    assert!(!worker.is_work_available());

    worker.stop();
    assert_eq!(*events.lock().unwrap(), vec!["begin", "work:true", "end"]);
    let stats = worker.stats();
    assert_eq!(stats.work_count, 1);
    assert_eq!(stats.last_run_work_count, 1);
    assert!(stats.last_work_duration.is_some());
}

#[test]
fn failing_work_stops_the_worker() {
    init();
    let (calls, work) = counter();
    let worker = Worker::new(move |_: &CancelToken| -> Result<(), BoxError> {
        work();
        Err("boom".into())
    });
    let (begins, on_begin) = counter();
    worker.on_work_begin(on_begin);
    let (stops, on_stop) = counter();
    worker.on_stop(on_stop);
    let (tx, rx) = mpsc::channel::<String>();
    let tx = Mutex::new(tx);
    worker.on_error(move |e: &Arc<WorkError>| {
        let _ = tx.lock().unwrap().send(e.to_string());
    });

    worker.start().unwrap();
    worker.signal_work().unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "work failed: boom");
    assert!(worker.wait_stop_timeout(TIMEOUT).unwrap());
    assert!(wait_until(|| stops.load(Ordering::SeqCst) == 1));

    // no further work once failed
    worker.signal_work().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(begins.load(Ordering::SeqCst), 1);
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    assert!(!worker.is_working());
    assert!(worker.is_cancelled());
    let err = worker.last_error().unwrap();
    assert!(matches!(*err, WorkError::Failed(_)));

    // an explicit start picks up the pending signal again
    assert!(worker.start().unwrap());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "work failed: boom");
    assert!(worker.wait_stop_timeout(TIMEOUT).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(worker.stats().work_count, 2);
}

#[test]
fn panicking_work_is_captured() {
    init();
    let worker = Worker::with_config(
        |_: &CancelToken| -> Result<(), BoxError> { panic!("bad unit") },
        WorkerConfig::default().name("panicky").sync_work(false),
    );
    assert_eq!(worker.name(), "panicky");
    worker.start().unwrap();
    worker.signal_work().unwrap();
    assert!(worker.wait_stop_timeout(TIMEOUT).unwrap());
    assert!(wait_until(|| worker.last_error().is_some()));
    match &*worker.last_error().unwrap() {
        WorkError::Panicked(msg) => assert_eq!(msg, "bad unit"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn thread_hosted_loop() {
    init();
    let (calls, work) = counter();
    let worker = Worker::with_config(
        move |_: &CancelToken| -> Result<(), BoxError> {
            work();
            Ok(())
        },
        WorkerConfig::default()
            .name("threaded")
            .sync_wait(true)
            .sync_work(false),
    );
    worker.start().unwrap();
    for _ in 0..3 {
        worker.signal_work().unwrap();
        assert!(wait_until(|| !worker.is_work_available() && !worker.is_working()));
    }
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 3));
    assert!(worker.stop());
    assert!(worker.wait_stop_timeout(Duration::ZERO).unwrap());
}

#[test]
fn stop_waits_for_running_work() {
    init();
    let (done, finish) = counter();
    let worker = Worker::new(move |cancel: &CancelToken| -> Result<(), BoxError> {
        while !cancel.is_cancelled() {
            may::coroutine::sleep(Duration::from_millis(5));
        }
        finish();
        Ok(())
    });
    let (ends, on_end) = counter();
    worker.on_work_end(on_end);

    worker.start().unwrap();
    worker.signal_work().unwrap();
    assert!(worker.wait_busy_timeout(TIMEOUT).unwrap());
    assert!(worker.stop());
    // stop only returns after the unit observed the cancel and finished
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
    assert!(!worker.is_working());
}

#[test]
fn dispose_stops_and_forbids_start() {
    init();
    let worker = Worker::new(|_: &CancelToken| -> Result<(), BoxError> { Ok(()) });
    let (stops, on_stop) = counter();
    worker.on_stop(on_stop);
    worker.start().unwrap();
    assert!(worker.wait_start_timeout(TIMEOUT).unwrap());

    worker.dispose();
    worker.dispose();
    assert!(worker.is_disposed());
    assert!(!worker.is_running());
    assert!(worker.is_cancelled());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(worker.start().unwrap_err().is_disposed());
    // waits return instead of blocking on a torn down worker
    assert!(!worker.wait_start().unwrap());
    assert!(worker.wait_stop().unwrap());
}

#[test]
fn restart_from_error_handler() {
    init();
    let fail = Arc::new(AtomicBool::new(true));
    let (calls, work) = counter();
    let f = fail.clone();
    let worker = Arc::new(Worker::new(move |_: &CancelToken| -> Result<(), BoxError> {
        work();
        if f.swap(false, Ordering::SeqCst) {
            Err("first unit fails".into())
        } else {
            Ok(())
        }
    }));

    let holder: Arc<OnceCell<Weak<Worker>>> = Arc::new(OnceCell::new());
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let h = holder.clone();
    worker.on_error(move |_: &Arc<WorkError>| {
        let restarted = h
            .get()
            .and_then(Weak::upgrade)
            .map(|w| w.start().unwrap_or(false));
        let _ = tx.lock().unwrap().send(restarted);
    });
    holder.set(Arc::downgrade(&worker)).unwrap();

    worker.start().unwrap();
    worker.signal_work().unwrap();
    // the failed run is already stopped when the handler runs
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(true));
    std::thread::sleep(Duration::from_millis(50));
    assert!(worker.is_running());
    assert!(!worker.is_cancelled());

    worker.signal_work().unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
    assert!(worker.wait_boring_timeout(TIMEOUT).unwrap());
    assert!(worker.is_running());
    assert!(worker.stop());
    assert_eq!(worker.stats().work_count, 2);
    assert_eq!(worker.stats().last_run_work_count, 1);
}

#[test]
fn thread_hosted_inline_work() {
    init();
    let (calls, work) = counter();
    let worker = Worker::with_config(
        move |_: &CancelToken| -> Result<(), BoxError> {
            std::thread::sleep(Duration::from_millis(5));
            work();
            Ok(())
        },
        WorkerConfig::default()
            .name("threaded-inline")
            .sync_wait(true)
            .sync_work(true),
    );
    assert!(worker.start().unwrap());
    assert!(worker.wait_start_timeout(Duration::ZERO).unwrap());

    worker.signal_work().unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    assert!(worker.wait_boring_timeout(TIMEOUT).unwrap());
    assert!(!worker.is_work_available());

    assert!(worker.stop());
    assert!(worker.is_cancelled());
    assert_eq!(worker.stats().work_count, 1);
    assert!(worker.last_error().is_none());
}
