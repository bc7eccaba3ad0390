use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};

/// A long-lived asynchronous work queue with bounded concurrency.
///
/// Submitted tasks run on the tokio runtime the queue was created on, in an
/// unspecified but eventually-progressing order, with at most
/// `max_concurrency` of them executing at once. Submission never blocks.
///
/// Tasks are not cancellable: once submitted, a task runs to completion.
/// This is what lets the filesystem tier promise that an accepted write is
/// eventually persisted (absent process crash).
#[derive(Clone)]
pub struct TaskQueue {
    name: &'static str,
    handle: Handle,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl TaskQueue {
    /// Creates a queue running at most `max_concurrency` tasks at once.
    ///
    /// `None` leaves parallelism effectively unbounded (limited only by the
    /// runtime's worker pool).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(name: &'static str, max_concurrency: Option<usize>) -> Self {
        let permits = max_concurrency.unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            name,
            handle: Handle::current(),
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Enqueues `task` for execution and returns immediately.
    pub fn submit(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let name = self.name;
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let drained = Arc::clone(&self.drained);

        self.handle.spawn(async move {
            // The semaphore is never closed, so this cannot fail.
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("task queue semaphore closed");
            tracing::trace!(queue = name, "Running queued task");

            task.await;

            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });
    }

    /// The number of tasks submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every task submitted so far has finished.
    ///
    /// Tasks submitted concurrently with the flush may or may not be waited
    /// for. Used by callers that need writes on disk before proceeding, and
    /// for draining the queue on shutdown.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// The pair of queues backing a filesystem cache's disk I/O.
///
/// Reads and writes get independent queues so that a backlog of writes can
/// never starve reads, and vice versa. Construct one pair per process at
/// startup and hand it to every cache instance; the queues are cheap to
/// clone and long-lived.
#[derive(Debug, Clone)]
pub struct TaskQueues {
    pub read: TaskQueue,
    pub write: TaskQueue,
}

impl TaskQueues {
    /// Creates the read/write queue pair.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(max_concurrent_reads: Option<usize>, max_concurrent_writes: Option<usize>) -> Self {
        Self {
            read: TaskQueue::new("cache-read", max_concurrent_reads),
            write: TaskQueue::new("cache-write", max_concurrent_writes),
        }
    }
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_submit_and_flush() {
        let queue = TaskQueue::new("test", None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            queue.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let queue = TaskQueue::new("test", Some(2));
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            queue.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        queue.flush().await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_flush_idles_immediately_when_empty() {
        let queue = TaskQueue::new("test", Some(1));
        queue.flush().await;
    }
}
