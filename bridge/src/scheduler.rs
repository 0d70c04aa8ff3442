//! Polling scheduler
//!
//! A bounded-concurrency executor shared by every adapter. Task bodies run on
//! the runtime under a semaphore permit; completion callbacks are funnelled
//! through one dispatcher task so that handlers touching a device's state
//! never run concurrently with each other.
//!
//! The scheduler is constructed explicitly from a runtime [`Handle`] and passed
//! to whoever needs it; there is no global instance.

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::AbortHandle;

/// Default number of concurrently executing tasks
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped_polls: u64,
    /// Session listeners currently running outside the worker budget
    pub listeners: u64,
    pub max_workers: usize,
    pub idle_workers: usize,
}

type Callback = Box<dyn FnOnce() + Send>;

enum Dispatch {
    Run(Callback),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    handle: Handle,
    workers: Arc<Semaphore>,
    max_workers: usize,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    next_id: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    skipped: AtomicU64,
    listeners: Arc<AtomicU64>,
}

impl Inner {
    fn record<T>(&self, result: &BridgeResult<T>) {
        match result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(BridgeError::Cancelled(_)) => self.cancelled.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn deliver(&self, callback: Callback) {
        if let Err(err) = self.dispatch.send(Dispatch::Run(callback)) {
            // dispatcher is gone (runtime shutting down); run in place
            if let Dispatch::Run(callback) = err.0 {
                run_guarded(callback);
            }
        }
    }
}

/// Shared bounded executor for poll and command tasks
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<Inner>,
}

impl PollingScheduler {
    pub fn new(config: SchedulerConfig, handle: Handle) -> Self {
        let max_workers = config.max_workers.max(1);
        let (dispatch, rx) = mpsc::unbounded_channel();
        handle.spawn(dispatch_loop(rx));

        tracing::debug!("Polling scheduler started with {} workers", max_workers);

        Self {
            inner: Arc::new(Inner {
                handle,
                workers: Arc::new(Semaphore::new(max_workers)),
                max_workers,
                dispatch,
                next_id: AtomicU64::new(1),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                listeners: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Scheduler on the runtime of the caller
    pub fn current(config: SchedulerConfig) -> Self {
        Self::new(config, Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Run `task` on the pool and hand its outcome to `on_done` on the dispatcher.
    ///
    /// `on_done` always runs exactly once: with the task's result, with
    /// `Cancelled` when the task was aborted, or with `TaskPanicked`.
    pub fn submit<T, F, C>(&self, name: &str, task: F, on_done: C) -> TaskHandle
    where
        T: Send + 'static,
        F: Future<Output = BridgeResult<T>> + Send + 'static,
        C: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Submitting task #{} '{}'", id, name);

        let workers = Arc::clone(&self.inner.workers);
        let work = self.inner.handle.spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| BridgeError::Cancelled("scheduler closed".to_string()))?;
            task.await
        });
        let abort = work.abort_handle();

        let (done_tx, done_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task_name = name.to_string();
        self.inner.handle.spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(BridgeError::Cancelled(task_name.clone())),
                Err(e) => {
                    let msg = panic_message(e.into_panic());
                    tracing::error!("Task '{}' panicked: {}", task_name, msg);
                    Err(BridgeError::TaskPanicked(format!("{}: {}", task_name, msg)))
                }
            };
            inner.record(&result);

            let guard = DoneGuard(done_tx);
            inner.deliver(Box::new(move || {
                let _guard = guard;
                on_done(result);
            }));
        });

        TaskHandle {
            id,
            name: name.to_string(),
            abort,
            done: done_rx,
        }
    }

    /// Run a long-lived event listener on the scheduler's runtime.
    ///
    /// Listeners live for a whole session, so they hold no worker permit and
    /// have no completion callback; abort them through the returned handle.
    pub fn spawn_listener<F>(&self, name: &str, listener: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("Starting listener '{}'", name);
        let running = ListenerGuard::enter(&self.inner.listeners);
        self.inner
            .handle
            .spawn(async move {
                let _running = running;
                listener.await;
            })
            .abort_handle()
    }

    /// Wait until every callback queued so far has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.dispatch.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Count a poll that was not submitted because the previous one was running
    pub fn record_skipped(&self) {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            skipped_polls: self.inner.skipped.load(Ordering::Relaxed),
            listeners: self.inner.listeners.load(Ordering::Relaxed),
            max_workers: self.inner.max_workers,
            idle_workers: self.inner.workers.available_permits(),
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Run(callback) => run_guarded(callback),
            Dispatch::Flush(tx) => {
                let _ = tx.send(());
            }
        }
    }
    tracing::debug!("Polling scheduler dispatcher stopped");
}

fn run_guarded(callback: Callback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!("Completion callback panicked: {}", panic_message(payload));
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

struct DoneGuard(watch::Sender<bool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

struct ListenerGuard(Arc<AtomicU64>);

impl ListenerGuard {
    fn enter(count: &Arc<AtomicU64>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(count))
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to a submitted task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    name: String,
    abort: AbortHandle,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Abort the task body. The callback still runs, with `Cancelled`.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// True once the completion callback has run
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the completion callback to have run
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Single-slot guard allowing one in-flight poll per device
#[derive(Debug, Clone, Default)]
pub struct PollGuard {
    busy: Arc<AtomicBool>,
}

impl PollGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<PollPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Released when dropped
#[derive(Debug)]
pub struct PollPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for PollPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn scheduler(max_workers: usize) -> PollingScheduler {
        PollingScheduler::current(SchedulerConfig { max_workers })
    }

    #[tokio::test]
    async fn test_result_delivered_to_callback() {
        let sched = scheduler(2);
        let (tx, rx) = oneshot::channel();
        let handle = sched.submit("answer", async { Ok(42) }, move |r| {
            let _ = tx.send(r);
        });
        assert_eq!(rx.await.unwrap().unwrap(), 42);
        handle.wait().await;
        assert!(handle.is_finished());
        assert_eq!(sched.stats().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bounded_by_workers() {
        let sched = scheduler(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                sched.submit(
                    &format!("t{}", i),
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    |_| {},
                )
            })
            .collect();

        for h in &handles {
            h.wait().await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sched.stats().completed, 6);
        assert_eq!(sched.stats().idle_workers, 2);
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let sched = scheduler(1);
        let (tx, rx) = oneshot::channel();
        let handle = sched.submit(
            "hang",
            async {
                std::future::pending::<()>().await;
                Ok(())
            },
            move |r: BridgeResult<()>| {
                let _ = tx.send(r);
            },
        );
        handle.cancel();
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Cancelled(_))));
        assert_eq!(sched.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_listener_holds_no_worker() {
        let sched = scheduler(1);
        let listener = sched.spawn_listener("events", std::future::pending());
        tokio::task::yield_now().await;
        assert_eq!(sched.stats().listeners, 1);

        // the only worker is still free for polls
        let (tx, rx) = oneshot::channel();
        sched.submit("poll", async { Ok(7) }, move |r| {
            let _ = tx.send(r);
        });
        assert_eq!(rx.await.unwrap().unwrap(), 7);
        assert_eq!(sched.stats().idle_workers, 1);

        listener.abort();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sched.stats().listeners, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_reported() {
        let sched = scheduler(1);
        let (tx, rx) = oneshot::channel();
        sched.submit(
            "boom",
            async {
                if true {
                    panic!("driver exploded");
                }
                Ok(())
            },
            move |r: BridgeResult<()>| {
                let _ = tx.send(r);
            },
        );
        match rx.await.unwrap() {
            Err(BridgeError::TaskPanicked(msg)) => assert!(msg.contains("driver exploded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_dispatcher() {
        let sched = scheduler(1);
        let first = sched.submit("first", async { Ok(()) }, |_| panic!("bad handler"));
        first.wait().await;

        let seen = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&seen);
        let second = sched.submit("second", async { Ok(()) }, move |_| {
            *flag.lock().unwrap() = true;
        });
        second.wait().await;
        sched.flush().await;
        assert!(*seen.lock().unwrap());
    }

    #[test]
    fn test_poll_guard_single_slot() {
        let guard = PollGuard::new();
        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.is_busy());
        assert!(guard.try_acquire().is_none());
        drop(permit);
        assert!(!guard.is_busy());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_skipped_polls_counted() {
        let sched = scheduler(1);
        sched.record_skipped();
        sched.record_skipped();
        assert_eq!(sched.stats().skipped_polls, 2);
    }
}
