//! Request coalescing.
//!
//! A [`PromiseRegistry`] maps request keys to pending computations. The first caller asking for
//! a key receives a [`Resolver`] next to its [`Promise`] and is responsible for computing the
//! result. Every other caller only receives a [`Promise`] and waits for the shared outcome.
//!
//! The key is removed from the registry as soon as the computation is resolved, so the registry
//! only ever holds computations that are still in flight. Durable caching is the job of the
//! cache store, not of this registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

pub use futures::channel::oneshot::Canceled;

type PromiseChannel<T> = Shared<oneshot::Receiver<T>>;

struct Registered<T> {
    /// Distinguishes computations registered for the same key over time.
    id: u64,
    channel: PromiseChannel<T>,
}

struct RegistryState<K, T> {
    next_id: u64,
    promises: BTreeMap<K, Registered<T>>,
}

type SharedState<K, T> = Arc<Mutex<RegistryState<K, T>>>;

/// A map of in-flight computations, guaranteeing a single computation per key.
pub struct PromiseRegistry<K, T> {
    /// Registry identifier used for metric tags.
    name: &'static str,
    state: SharedState<K, T>,
}

impl<K, T> PromiseRegistry<K, T>
where
    K: Ord + Clone,
    T: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 0,
                promises: BTreeMap::new(),
            })),
        }
    }

    /// Returns the computation registered for `key`, creating it if there is none.
    ///
    /// The returned [`Resolver`] is `Some` only for the caller that created the computation.
    /// That caller must compute the result and pass it to [`Resolver::resolve`]. Dropping the
    /// resolver without resolving it unregisters the computation and fails all waiters with
    /// [`Canceled`].
    pub fn get_or_create(&self, key: K) -> (Promise<T>, Option<Resolver<K, T>>) {
        let mut state = self.state.lock();

        if let Some(registered) = state.promises.get(&key) {
            // A concurrent request was deduplicated.
            metric!(counter("coalesce.hit") += 1, "registry" => self.name);
            let promise = Promise {
                channel: registered.channel.clone(),
            };
            return (promise, None);
        }

        metric!(counter("coalesce.miss") += 1, "registry" => self.name);

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        state.next_id += 1;
        let id = state.next_id;
        state.promises.insert(
            key.clone(),
            Registered {
                id,
                channel: channel.clone(),
            },
        );

        let resolver = Resolver {
            key,
            id,
            sender: Mutex::new(Some(sender)),
            state: Arc::clone(&self.state),
        };
        (Promise { channel }, Some(resolver))
    }

    /// Unregisters the computation for `key`.
    ///
    /// Waiters already holding a [`Promise`] still receive its result, but the next request for
    /// `key` starts a fresh computation.
    pub fn remove(&self, key: &K) -> bool {
        self.state.lock().promises.remove(key).is_some()
    }

    /// Returns the number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.state.lock().promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> fmt::Debug for PromiseRegistry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .state
            .try_lock()
            .map(|state| state.promises.len())
            .unwrap_or_default();
        f.debug_struct("PromiseRegistry")
            .field("name", &self.name)
            .field("in_flight", &in_flight)
            .finish()
    }
}

/// A shareable handle to the outcome of a computation.
#[derive(Clone)]
pub struct Promise<T> {
    channel: PromiseChannel<T>,
}

impl<T: Clone> Promise<T> {
    /// Suspends until the computation is resolved and returns its result.
    ///
    /// Every waiter, including those that start waiting after resolution, receives the same
    /// result. Fails with [`Canceled`] if the computation was abandoned.
    pub async fn wait(&self) -> Result<T, Canceled> {
        self.channel.clone().await
    }

    /// Returns the result if the computation is already resolved.
    pub fn peek(&self) -> Option<T> {
        match self.channel.peek() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// The exclusive right to resolve a computation.
pub struct Resolver<K: Ord, T> {
    key: K,
    id: u64,
    sender: Mutex<Option<oneshot::Sender<T>>>,
    state: SharedState<K, T>,
}

impl<K: Ord, T> Resolver<K, T> {
    /// Resolves the computation with `value`.
    ///
    /// The computation is unregistered before the value is published. Only the first call has an
    /// effect; later calls return `false` and leave the published value untouched.
    pub fn resolve(&self, value: T) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        // Unregister first.  This ensures that callers either get a promise that will receive
        // the value, or they create a new computation.
        self.unregister();
        // Nobody waiting is fine, the value is simply dropped.
        let _ = sender.send(value);
        true
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    fn unregister(&self) {
        let mut state = self.state.lock();
        if state
            .promises
            .get(&self.key)
            .is_some_and(|registered| registered.id == self.id)
        {
            state.promises.remove(&self.key);
        }
    }
}

impl<K: Ord, T> Drop for Resolver<K, T> {
    fn drop(&mut self) {
        if self.sender.get_mut().is_some() {
            tracing::warn!("computation dropped without being resolved");
            self.unregister();
        }
    }
}

impl<K: Ord + fmt::Debug, T> fmt::Debug for Resolver<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    type Registry = PromiseRegistry<&'static str, Result<String, String>>;

    #[tokio::test]
    async fn test_coalescing() {
        tilesmith_test::setup();

        let registry = &Registry::new("test");
        let computations = &AtomicUsize::new(0);

        let requests = (0..16).map(|_| async move {
            let (promise, resolver) = registry.get_or_create("0/0/0");
            if let Some(resolver) = resolver {
                computations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                resolver.resolve(Ok("tile".into()));
            }
            promise.wait().await
        });
        let results = futures::future::join_all(requests).await;

        assert_eq!(computations.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Ok(Ok("tile".to_owned())));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let registry = Registry::new("test");

        let (first, resolver) = registry.get_or_create("0/0/0");
        let (second, none) = registry.get_or_create("0/0/0");
        assert!(none.is_none());

        resolver.unwrap().resolve(Err("backend down".into()));

        assert_eq!(first.wait().await, Ok(Err("backend down".to_owned())));
        assert_eq!(second.wait().await, Ok(Err("backend down".to_owned())));
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = Registry::new("test");

        let (promise, resolver) = registry.get_or_create("0/0/0");
        let resolver = resolver.unwrap();
        let waiter = tokio::spawn({
            let promise = promise.clone();
            async move { promise.wait().await }
        });

        assert!(resolver.resolve(Ok("first".into())));
        assert!(!resolver.resolve(Ok("second".into())));

        assert_eq!(waiter.await.unwrap(), Ok(Ok("first".to_owned())));
        // observers attaching after resolution see the same value
        assert_eq!(promise.wait().await, Ok(Ok("first".to_owned())));
        assert_eq!(promise.peek(), Some(Ok("first".to_owned())));
    }

    #[tokio::test]
    async fn test_key_is_fresh_after_resolution() {
        let registry = Registry::new("test");

        let (_, resolver) = registry.get_or_create("0/0/0");
        assert_eq!(registry.len(), 1);
        resolver.unwrap().resolve(Ok("old".into()));
        assert!(registry.is_empty());

        let (promise, resolver) = registry.get_or_create("0/0/0");
        let resolver = resolver.expect("a new computation");
        resolver.resolve(Ok("new".into()));
        assert_eq!(promise.wait().await, Ok(Ok("new".to_owned())));
    }

    #[tokio::test]
    async fn test_abandoned_computation() {
        tilesmith_test::setup();

        let registry = Registry::new("test");

        let (promise, resolver) = registry.get_or_create("0/0/0");
        drop(resolver);

        assert_eq!(promise.wait().await, Err(Canceled));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_resolver_keeps_new_registration() {
        let registry = Registry::new("test");

        let (old_promise, old_resolver) = registry.get_or_create("0/0/0");
        assert!(registry.remove(&"0/0/0"));

        let (_, new_resolver) = registry.get_or_create("0/0/0");
        assert!(new_resolver.is_some());

        // resolving the removed computation must not unregister its successor
        old_resolver.unwrap().resolve(Ok("old".into()));
        assert_eq!(registry.len(), 1);
        assert_eq!(old_promise.wait().await, Ok(Ok("old".to_owned())));

        let (_, none) = registry.get_or_create("0/0/0");
        assert!(none.is_none());
    }
}
