//! Task executor for subscriber handler invocations.
//!
//! Every handler invocation is submitted as its own task. A panic inside a
//! task is caught at the task boundary, counted and logged; it never reaches
//! the submitter or sibling tasks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tracing::warn;

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    panicked: AtomicU64,
    in_flight: AtomicUsize,
}

/// Fire-and-forget task scheduler backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    handle: Handle,
    counters: Arc<Counters>,
}

impl TaskExecutor {
    /// Create an executor spawning onto the given runtime
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create an executor for the runtime the caller is running on
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Submit a task; returns immediately
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let counters = self.counters.clone();
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        counters.in_flight.fetch_add(1, Ordering::AcqRel);

        self.handle.spawn(async move {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                warn!("Subscriber task panicked; panic discarded");
            }
            counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Total tasks submitted
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    /// Tasks that ended in a panic
    pub fn panicked(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }

    /// Tasks submitted but not yet finished
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_submit_runs_task() {
        let executor = TaskExecutor::current();
        let (tx, rx) = oneshot::channel();

        executor.submit(async move {
            let _ = tx.send(42);
        });

        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(executor.submitted(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let executor = TaskExecutor::current();
        executor.submit(async {
            panic!("handler blew up");
        });

        let (tx, rx) = oneshot::channel();
        executor.submit(async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(executor.panicked(), 1);
        assert_eq!(executor.submitted(), 2);
    }
}
