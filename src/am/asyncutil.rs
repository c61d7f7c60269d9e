use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Tracks in-flight async work so the server can converge on "everything is
/// done": process exit waiters, fanned-out start/stop tasks, reloads and the
/// long-lived service loops (which exit once shutdown is flagged).
#[derive(Debug, Clone)]
pub struct TaskTracker {
    active: Arc<AtomicUsize>,
    spawned_total: Arc<AtomicUsize>,
    active_blocking: Arc<AtomicUsize>,
    spawned_blocking_total: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            spawned_total: Arc::new(AtomicUsize::new(0)),
            active_blocking: Arc::new(AtomicUsize::new(0)),
            spawned_blocking_total: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Current number of tasks that are alive (running or pending).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst) + self.active_blocking.load(Ordering::SeqCst)
    }

    /// Total number of tasks ever spawned via this tracker.
    pub fn total_spawned(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst) + self.spawned_blocking_total.load(Ordering::SeqCst)
    }

    /// Spawn a Tokio task and track its lifetime using an RAII guard.
    ///
    /// When the task ends (normal completion, panic, or cancellation), the
    /// guard is dropped, the active count is decremented and any `wait_idle`
    /// callers are woken to re-check.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let guard = TaskGuard {
            counter: Arc::clone(&self.active),
            idle: Arc::clone(&self.idle),
        };

        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Spawn a Tokio *blocking* task and track its lifetime using an RAII guard.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawned_blocking_total.fetch_add(1, Ordering::SeqCst);
        self.active_blocking.fetch_add(1, Ordering::SeqCst);

        let guard = TaskGuard {
            counter: Arc::clone(&self.active_blocking),
            idle: Arc::clone(&self.idle),
        };

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
    }

    /// Block until every tracked task has finished.
    ///
    /// Tasks spawned while the wait is in progress are included: the barrier
    /// re-checks the live counters on every wake rather than snapshotting the
    /// tracked set once. This is the convergence primitive behind shutdown
    /// ("wait for proxy+workers to fully stop") and the run-forever loop.
    pub async fn wait_idle(&self) {
        let notified = self.idle.notified();
        tokio::pin!(notified);
        loop {
            // Register interest before checking, so a guard dropped between
            // the check and the await still wakes us.
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.idle.notified());
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}
