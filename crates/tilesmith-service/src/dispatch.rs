//! Bounded concurrency for single-tile and meta computations.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::QueueFull;
use crate::utils::defer::defer;

/// The default number of computations running at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 32;

/// The default number of computations waiting for a slot.
pub const DEFAULT_QUEUE_LENGTH: usize = 256 * 8;

#[derive(Clone, Copy, Debug)]
struct Limits {
    max_concurrent: usize,
    max_backlog: usize,
}

struct QueueInner {
    /// Queue identifier used for metric tags.
    name: String,
    /// One permit per computation allowed to run.
    slots: Semaphore,
    /// Submissions currently running or waiting for a slot.
    pending: AtomicUsize,
    limits: Mutex<Limits>,
    /// Serializes changes to the number of slots.
    resize: tokio::sync::Mutex<()>,
}

/// A pool of admission slots with a hard backlog ceiling.
///
/// At most `max_concurrent` submissions run at once, and at most `max_backlog` more wait for a
/// slot. Submissions beyond that are rejected with [`QueueFull`] right away instead of being
/// queued. Waiting submissions are admitted as slots free up, without further ordering
/// guarantees.
///
/// Both limits can be changed while the queue is in use.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    pub fn new(name: impl Into<String>, max_concurrent: usize, max_backlog: usize) -> Self {
        let inner = QueueInner {
            name: name.into(),
            slots: Semaphore::new(max_concurrent),
            pending: AtomicUsize::new(0),
            limits: Mutex::new(Limits {
                max_concurrent,
                max_backlog,
            }),
            resize: tokio::sync::Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Runs `work` once a slot is available.
    ///
    /// Fails immediately if the queue already holds `max_concurrent + max_backlog` submissions.
    /// Dropping the returned future gives up the submission's place in the queue.
    pub async fn submit<F>(&self, work: F) -> Result<F::Output, QueueFull>
    where
        F: Future,
    {
        let inner = &*self.inner;
        let limits = *inner.limits.lock();
        let ceiling = limits.max_concurrent.saturating_add(limits.max_backlog);

        let admitted = inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < ceiling).then_some(pending + 1)
            });
        let Ok(previous) = admitted else {
            metric!(counter("dispatch.rejected") += 1, "queue" => &inner.name);
            tracing::warn!(queue = %inner.name, "dispatch queue is full, rejecting request");
            return Err(QueueFull(limits.max_backlog));
        };

        metric!(counter("dispatch.admitted") += 1, "queue" => &inner.name);
        metric!(gauge("dispatch.pending") = (previous + 1) as u64, "queue" => &inner.name);

        let _pending = defer(|| {
            let pending = inner.pending.fetch_sub(1, Ordering::AcqRel) - 1;
            metric!(gauge("dispatch.pending") = pending as u64, "queue" => &inner.name);
        });

        let queued_at = Instant::now();
        let Ok(_slot) = inner.slots.acquire().await else {
            // The semaphore is owned by this queue and never closed.
            return Err(QueueFull(limits.max_backlog));
        };
        metric!(timer("dispatch.wait") = queued_at.elapsed(), "queue" => &inner.name);

        Ok(work.await)
    }

    /// Changes the number of computations allowed to run at once.
    ///
    /// Raising the limit admits waiting submissions right away. Lowering it takes effect as
    /// running computations finish: this resolves once enough slots were reclaimed, and never
    /// interrupts submissions that already hold a slot. The reported limit only changes once the
    /// slots were added or reclaimed, so dropping this future leaves the previous limit in place.
    ///
    /// The limit is clamped to `1..=Semaphore::MAX_PERMITS`.
    pub async fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        let _resize = self.inner.resize.lock().await;
        let current = self.inner.limits.lock().max_concurrent;

        match max_concurrent.cmp(&current) {
            CmpOrdering::Greater => self.inner.slots.add_permits(max_concurrent - current),
            CmpOrdering::Less => {
                let surplus = u32::try_from(current - max_concurrent).unwrap_or(u32::MAX);
                // The semaphore is fair, so this reclaims the slots of running computations as
                // they finish, ahead of submissions that start waiting afterwards. Slots
                // assigned to a dropped acquisition go back to the semaphore.
                match self.inner.slots.acquire_many(surplus).await {
                    Ok(permits) => permits.forget(),
                    Err(_) => return,
                }
            }
            CmpOrdering::Equal => return,
        }
        self.inner.limits.lock().max_concurrent = max_concurrent;

        tracing::debug!(
            queue = %self.inner.name,
            max_concurrent,
            "changed dispatch concurrency"
        );
    }

    /// Changes the number of submissions allowed to wait for a slot.
    ///
    /// Submissions already waiting are not affected.
    pub fn set_queue_length(&self, max_backlog: usize) {
        self.inner.limits.lock().max_backlog = max_backlog;
    }

    /// The number of submissions currently running or waiting.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.limits.lock().max_concurrent
    }

    pub fn queue_length(&self) -> usize {
        self.inner.limits.lock().max_backlog
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limits = *self.inner.limits.lock();
        f.debug_struct("DispatchQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .field("max_concurrent", &limits.max_concurrent)
            .field("max_backlog", &limits.max_backlog)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Work that blocks on a gate, recording how many instances run at once.
    #[derive(Default)]
    struct Tracker {
        running: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    impl Tracker {
        async fn work(&self, gate: &Semaphore) {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            gate.acquire().await.unwrap().forget();
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_work(
        queue: &DispatchQueue,
        tracker: &Arc<Tracker>,
        gate: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<Result<(), QueueFull>> {
        let queue = queue.clone();
        let tracker = Arc::clone(tracker);
        let gate = Arc::clone(gate);
        tokio::spawn(async move { queue.submit(tracker.work(&gate)).await })
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition was not reached in time");
    }

    #[tokio::test]
    async fn test_backlog_ceiling() {
        tilesmith_test::setup();

        let queue = DispatchQueue::new("test", 1, 2);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| spawn_work(&queue, &tracker, &gate))
            .collect();
        wait_until(|| queue.pending() == 3 && tracker.running.load(Ordering::SeqCst) == 1).await;

        // one running, two waiting, so the fourth is rejected
        let rejected = queue.submit(async {}).await;
        assert_eq!(rejected, Err(QueueFull(2)));
        assert_eq!(tracker.running.load(Ordering::SeqCst), 1);

        gate.add_permits(3);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);

        // the queue accepts work again once drained
        assert_eq!(queue.submit(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancelled_submission_leaves_queue() {
        let queue = DispatchQueue::new("test", 1, 1);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let running = spawn_work(&queue, &tracker, &gate);
        let waiting = spawn_work(&queue, &tracker, &gate);
        wait_until(|| queue.pending() == 2).await;
        assert_eq!(queue.submit(async {}).await, Err(QueueFull(1)));

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(queue.pending(), 1);

        let admitted = spawn_work(&queue, &tracker, &gate);
        wait_until(|| queue.pending() == 2).await;

        gate.add_permits(2);
        assert_eq!(running.await.unwrap(), Ok(()));
        assert_eq!(admitted.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_raise_concurrency() {
        let queue = DispatchQueue::new("test", 1, 8);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| spawn_work(&queue, &tracker, &gate))
            .collect();
        wait_until(|| queue.pending() == 3).await;
        assert_eq!(tracker.running.load(Ordering::SeqCst), 1);

        queue.set_max_concurrent(3).await;
        assert_eq!(queue.max_concurrent(), 3);
        wait_until(|| tracker.running.load(Ordering::SeqCst) == 3).await;

        gate.add_permits(3);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_lower_concurrency_while_busy() {
        tilesmith_test::setup();

        let queue = DispatchQueue::new("test", 8, 16);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let in_flight: Vec<_> = (0..5)
            .map(|_| spawn_work(&queue, &tracker, &gate))
            .collect();
        wait_until(|| tracker.running.load(Ordering::SeqCst) == 5).await;

        let reducer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.set_max_concurrent(2).await }
        });
        // every free slot is claimed by the reduction before the running work finishes
        wait_until(|| queue.inner.slots.available_permits() == 0).await;
        assert_eq!(queue.max_concurrent(), 8);

        // all admitted work completes, and the reduction resolves once their slots are back
        gate.add_permits(5);
        for handle in in_flight {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        tokio::time::timeout(Duration::from_secs(5), reducer)
            .await
            .expect("lowering the concurrency deadlocked")
            .unwrap();
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 5);
        assert_eq!(queue.max_concurrent(), 2);

        let tracker = Arc::new(Tracker::default());
        let handles: Vec<_> = (0..6)
            .map(|_| spawn_work(&queue, &tracker, &gate))
            .collect();
        wait_until(|| queue.pending() == 6 && tracker.running.load(Ordering::SeqCst) == 2).await;
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.running.load(Ordering::SeqCst), 2);

        gate.add_permits(6);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_set_queue_length() {
        let queue = DispatchQueue::new("test", 1, 0);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let running = spawn_work(&queue, &tracker, &gate);
        wait_until(|| queue.pending() == 1).await;
        assert_eq!(queue.submit(async {}).await, Err(QueueFull(0)));

        queue.set_queue_length(1);
        assert_eq!(queue.queue_length(), 1);
        let waiting = spawn_work(&queue, &tracker, &gate);
        wait_until(|| queue.pending() == 2).await;

        gate.add_permits(2);
        assert_eq!(running.await.unwrap(), Ok(()));
        assert_eq!(waiting.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_abandoned_reduction_keeps_slots() {
        tilesmith_test::setup();

        let queue = DispatchQueue::new("test", 8, 16);
        let tracker = Arc::new(Tracker::default());
        let gate = Arc::new(Semaphore::new(0));

        let in_flight: Vec<_> = (0..5)
            .map(|_| spawn_work(&queue, &tracker, &gate))
            .collect();
        wait_until(|| tracker.running.load(Ordering::SeqCst) == 5).await;

        // the reduction cannot finish while all five computations hold their slot
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), queue.set_max_concurrent(2)).await;
        assert!(abandoned.is_err());
        assert_eq!(queue.max_concurrent(), 8);
        assert_eq!(queue.inner.slots.available_permits(), 3);

        queue.set_max_concurrent(10).await;
        assert_eq!(queue.max_concurrent(), 10);
        assert_eq!(queue.inner.slots.available_permits(), 5);

        gate.add_permits(5);
        for handle in in_flight {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(
            queue.inner.slots.available_permits(),
            queue.max_concurrent()
        );
    }

    #[tokio::test]
    async fn test_concurrency_never_drops_to_zero() {
        let queue = DispatchQueue::new("test", 2, 4);

        queue.set_max_concurrent(0).await;
        assert_eq!(queue.max_concurrent(), 1);
        assert_eq!(queue.inner.slots.available_permits(), 1);
        assert_eq!(queue.submit(async { 42 }).await, Ok(42));
    }
}
