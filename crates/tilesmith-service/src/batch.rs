//! Batch collection for tile types generated by a [`TileFactory`](crate::registry::TileFactory).
//!
//! Requests accumulate in a single shared pool, each with its own maximum wait. A ticker
//! periodically checks the pool, and as soon as *any* queued request is due, the *whole* pool is
//! cut into a batch. The batch is grouped by factory id, and every group is handed to a freshly
//! constructed factory on its own task.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::error::{TileError, TileResult};
use crate::registry::Registry;
use crate::types::TileRequest;

/// A tile request waiting in the batch pool.
pub struct BatchedRequest {
    request: TileRequest,
    /// The time the request must be dispatched by.
    due: Instant,
    /// The batch this request was dispatched with, stamped when the batch is cut.
    batch: Option<u64>,
    responder: oneshot::Sender<TileResult>,
}

impl BatchedRequest {
    pub fn request(&self) -> &TileRequest {
        &self.request
    }

    pub fn batch(&self) -> Option<u64> {
        self.batch
    }
}

impl fmt::Debug for BatchedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedRequest")
            .field("uri", &self.request.uri)
            .field("coord", &self.request.coord)
            .field("batch", &self.batch)
            .finish()
    }
}

/// A set of requests cut from the pool at once, grouped by factory id.
#[derive(Debug)]
pub struct Batch {
    number: u64,
    groups: BTreeMap<String, Vec<BatchedRequest>>,
}

impl Batch {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Returns the factory ids in this batch with the size of their groups.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[BatchedRequest])> {
        self.groups
            .iter()
            .map(|(id, requests)| (id.as_str(), requests.as_slice()))
    }

    /// Returns the total number of requests in this batch.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Default)]
struct BatchPool {
    last_batch: u64,
    /// The earliest due time of all pooled requests.
    next_due: Option<Instant>,
    groups: BTreeMap<String, Vec<BatchedRequest>>,
}

struct CollectorInner {
    registry: Arc<Registry>,
    pool: Mutex<BatchPool>,
}

/// Pools tile requests and dispatches them to batch factories.
#[derive(Clone)]
pub struct BatchCollector {
    inner: Arc<CollectorInner>,
}

impl BatchCollector {
    pub fn new(registry: Arc<Registry>) -> Self {
        let inner = CollectorInner {
            registry,
            pool: Mutex::new(BatchPool::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Adds `request` to the pool and returns a future resolving to its tile.
    ///
    /// The request is pooled immediately, not when the returned future is first polled. It is
    /// dispatched no later than `max_wait` from now, give or take one poll interval, but possibly
    /// much earlier if another pooled request falls due first.
    pub fn enqueue(
        &self,
        request: TileRequest,
        max_wait: Duration,
    ) -> impl Future<Output = TileResult> + Send + 'static {
        let receiver = self.push(request, max_wait);
        async move {
            match receiver?.await {
                Ok(result) => result,
                Err(_) => Err(TileError::Abandoned),
            }
        }
    }

    fn push(
        &self,
        request: TileRequest,
        max_wait: Duration,
    ) -> TileResult<oneshot::Receiver<TileResult>> {
        let factory_id = request.tile.id.clone();
        if !self.inner.registry.is_batched(&factory_id) {
            return Err(TileError::UnrecognizedType {
                kind: "tile factory",
                id: factory_id,
            });
        }

        let (responder, receiver) = oneshot::channel();
        let due = Instant::now() + max_wait;
        let batched = BatchedRequest {
            request,
            due,
            batch: None,
            responder,
        };

        let mut pool = self.inner.pool.lock();
        pool.next_due = Some(pool.next_due.map_or(due, |next| next.min(due)));
        pool.groups.entry(factory_id).or_default().push(batched);
        Ok(receiver)
    }

    /// Returns the number of pooled requests.
    pub fn len(&self) -> usize {
        self.inner.pool.lock().groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pool.lock().groups.is_empty()
    }

    /// Whether any pooled request is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.inner
            .pool
            .lock()
            .next_due
            .is_some_and(|due| due <= now)
    }

    /// Takes all pooled requests as a new batch, or `None` if the pool is empty.
    pub fn cut_batch(&self) -> Option<Batch> {
        let mut pool = self.inner.pool.lock();
        Self::cut(&mut pool)
    }

    fn cut(pool: &mut BatchPool) -> Option<Batch> {
        if pool.groups.is_empty() {
            return None;
        }

        pool.last_batch += 1;
        pool.next_due = None;
        let number = pool.last_batch;

        let mut groups = std::mem::take(&mut pool.groups);
        for request in groups.values_mut().flatten() {
            request.batch = Some(number);
        }
        Some(Batch { number, groups })
    }

    /// Cuts and dispatches a batch if any pooled request is due at `now`.
    ///
    /// Returns the number of the dispatched batch.
    pub fn flush(&self, now: Instant) -> Option<u64> {
        let batch = {
            let mut pool = self.inner.pool.lock();
            if !pool.next_due.is_some_and(|due| due <= now) {
                return None;
            }
            Self::cut(&mut pool)?
        };

        let number = batch.number;
        self.dispatch(batch);
        Some(number)
    }

    /// Hands every group of `batch` to a fresh factory, each on its own task.
    pub fn dispatch(&self, batch: Batch) {
        metric!(histogram("batch.size") = batch.len() as u64);
        metric!(histogram("batch.groups") = batch.groups.len() as u64);

        let number = batch.number;
        for (factory_id, requests) in batch.groups {
            let span = tracing::info_span!("batch", number, factory = %factory_id);
            let registry = Arc::clone(&self.inner.registry);
            tokio::spawn(process_group(registry, factory_id, requests).instrument(span));
        }
    }

    /// Spawns the ticker checking the pool every `poll_interval`.
    ///
    /// The ticker stops once every handle to this collector is dropped.
    pub fn start(&self, poll_interval: Duration) -> JoinHandle<()> {
        let collector = Arc::downgrade(&self.inner);
        tokio::spawn(run_ticker(collector, poll_interval))
    }
}

impl fmt::Debug for BatchCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCollector")
            .field("pooled", &self.len())
            .finish()
    }
}

async fn run_ticker(collector: Weak<CollectorInner>, poll_interval: Duration) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = collector.upgrade() else {
            break;
        };
        if let Some(number) = (BatchCollector { inner }).flush(Instant::now()) {
            tracing::trace!(number, "dispatched batch");
        }
    }
}

async fn process_group(registry: Arc<Registry>, factory_id: String, requests: Vec<BatchedRequest>) {
    metric!(counter("batch.requests") += requests.len() as i64, "factory" => &factory_id);

    let factory = match registry.factory(&factory_id) {
        Ok(factory) => factory,
        Err(err) => {
            tracing::error!(error = %err, "failed to construct tile factory");
            for request in requests {
                let _ = request.responder.send(Err(err.clone()));
            }
            return;
        }
    };

    let (requests, responders): (Vec<_>, Vec<_>) = requests
        .into_iter()
        .map(|batched| (batched.request, batched.responder))
        .unzip();

    let started = Instant::now();
    let mut results = factory.create_tiles(&requests).await.into_iter();
    metric!(timer("batch.duration") = started.elapsed(), "factory" => &factory_id);

    for responder in responders {
        let result = results.next().unwrap_or_else(|| {
            Err(TileError::Generation(format!(
                "tile factory `{factory_id}` returned no result"
            )))
        });
        // The requester may have gone away.
        let _ = responder.send(result);
    }
}
