//! Adaptive backpressure for bulk ingestion.
//!
//! Producers generate bulk payloads and hand them to an [`Equalizer`], which forwards them to a
//! [`BulkSink`]. The equalizer keeps a moving window of how long the sink took to process recent
//! payloads. When the sink is slower than the producer, every payload is held back by the
//! difference between the two, so producers settle on the pace the sink can sustain.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;

/// The number of processing durations the moving average is computed over.
pub const MAX_SAMPLES: usize = 64;

/// A bounded window of recent processing durations.
#[derive(Clone, Debug, Default)]
pub struct RateWindow {
    samples: VecDeque<Duration>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a processing duration, evicting the oldest one if the window is full.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the mean of the recorded durations, or `None` if nothing was recorded yet.
    pub fn average(&self) -> Option<Duration> {
        let total: Duration = self.samples.iter().sum();
        let count = u32::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
        Some(total / count)
    }

    /// Returns how long to hold back a payload that took `took` to generate.
    pub fn delay_for(&self, took: Duration) -> Duration {
        self.average()
            .map(|average| average.saturating_sub(took))
            .unwrap_or_default()
    }
}

/// The downstream consumer of bulk payloads.
#[async_trait]
pub trait BulkSink: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn send(&self, item: Self::Item) -> anyhow::Result<()>;
}

/// Returned by [`Equalizer::ready`] once the equalizer was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("equalizer is closed")]
pub struct EqualizerClosed;

/// Permission to send a single payload through an [`Equalizer`].
///
/// The token is held until the sink has processed the payload.
#[derive(Debug)]
pub struct ReadyToken(OwnedSemaphorePermit);

/// Throttles bulk payloads on their way to a [`BulkSink`].
///
/// At most `size` payloads are in flight at once. Producers first wait for a [`ReadyToken`]
/// and then [`send`](Self::send) a payload together with the time it took to generate it.
pub struct Equalizer<S> {
    sink: Arc<S>,
    size: usize,
    tokens: Arc<Semaphore>,
    window: Arc<Mutex<RateWindow>>,
}

impl<S> Clone for Equalizer<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            size: self.size,
            tokens: Arc::clone(&self.tokens),
            window: Arc::clone(&self.window),
        }
    }
}

impl<S: BulkSink> Equalizer<S> {
    /// Starts an equalizer with `size` ready tokens in front of `sink`.
    pub fn listen(sink: S, size: usize) -> Self {
        let size = size.max(1);
        Self {
            sink: Arc::new(sink),
            size,
            tokens: Arc::new(Semaphore::new(size)),
            window: Arc::new(Mutex::new(RateWindow::new())),
        }
    }

    /// Suspends until a payload may be sent.
    pub async fn ready(&self) -> Result<ReadyToken, EqualizerClosed> {
        let permit = Arc::clone(&self.tokens)
            .acquire_owned()
            .await
            .map_err(|_| EqualizerClosed)?;
        Ok(ReadyToken(permit))
    }

    /// Forwards `item` to the sink, holding it back if the sink is slower than the producer.
    ///
    /// `took` is the time it took to generate the payload. The payload is forwarded on its own
    /// task, and the returned future resolves to the sink's result. Failures are not retried.
    pub fn send(
        &self,
        token: ReadyToken,
        item: S::Item,
        took: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        let sink = Arc::clone(&self.sink);
        let window = Arc::clone(&self.window);

        tokio::spawn(async move {
            let delay = window.lock().delay_for(took);
            if !delay.is_zero() {
                metric!(timer("equalizer.delay") = delay);
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = sink.send(item).await;
            window.lock().record(started.elapsed());

            drop(token);
            let _ = sender.send(result);
        });

        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("bulk request was dropped")))
        }
    }

    /// Returns the current moving average of the sink's processing time.
    pub fn average(&self) -> Option<Duration> {
        self.window.lock().average()
    }

    /// Stops handing out ready tokens and waits for all outstanding sends to finish.
    pub async fn close(&self) {
        let size = u32::try_from(self.size).unwrap_or(u32::MAX);
        // Every outstanding send holds a token until the sink is done with it.
        if let Ok(drained) = self.tokens.acquire_many(size).await {
            drained.forget();
        }
        self.tokens.close();
    }
}

impl<S> fmt::Debug for Equalizer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Equalizer")
            .field("size", &self.size)
            .field("available", &self.tokens.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_delay_follows_average() {
        let mut window = RateWindow::new();
        assert_eq!(window.average(), None);
        assert_eq!(window.delay_for(ms(10)), Duration::ZERO);

        // the sink gets slower
        let mut delays = vec![];
        for sample in [20, 40, 60, 80] {
            window.record(ms(sample));
            delays.push(window.delay_for(ms(10)));
        }
        assert_eq!(delays, [ms(10), ms(20), ms(30), ms(40)]);

        // and recovers again
        let mut delays = vec![];
        for _ in 0..4 {
            window.record(ms(0));
            delays.push(window.delay_for(ms(10)));
        }
        assert!(delays.windows(2).all(|pair| pair[0] > pair[1]), "{delays:?}");
        assert_eq!(delays.last(), Some(&ms(15)));

        // producers slower than the sink are never held back
        assert_eq!(window.delay_for(ms(1000)), Duration::ZERO);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = RateWindow::new();
        for _ in 0..MAX_SAMPLES {
            window.record(ms(100));
        }
        assert_eq!(window.average(), Some(ms(100)));

        for _ in 0..MAX_SAMPLES * 2 {
            window.record(ms(10));
            assert!(window.len() <= MAX_SAMPLES);
        }
        assert_eq!(window.len(), MAX_SAMPLES);
        // all of the slow samples were evicted
        assert_eq!(window.average(), Some(ms(10)));
    }

    struct SlowSink {
        latency: Duration,
        received: AtomicUsize,
    }

    #[async_trait]
    impl BulkSink for SlowSink {
        type Item = &'static str;

        async fn send(&self, item: Self::Item) -> anyhow::Result<()> {
            tokio::time::sleep(self.latency).await;
            anyhow::ensure!(item != "malformed", "failed to parse bulk payload");
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sink(latency: Duration) -> SlowSink {
        SlowSink {
            latency,
            received: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_token_pool() {
        tokio::time::pause();
        let equalizer = Equalizer::listen(sink(ms(50)), 2);

        let first = equalizer.ready().await.unwrap();
        let _second = equalizer.ready().await.unwrap();
        assert!(equalizer.ready().now_or_never().is_none());

        let sent = equalizer.send(first, "payload", ms(0));
        sent.await.unwrap();

        // the token is released once the sink is done
        let third = equalizer.ready().now_or_never();
        assert!(matches!(third, Some(Ok(_))));
        assert_eq!(equalizer.average(), Some(ms(50)));
    }

    #[tokio::test]
    async fn test_errors_reach_the_producer() {
        tokio::time::pause();
        let equalizer = Equalizer::listen(sink(ms(5)), 1);

        let token = equalizer.ready().await.unwrap();
        let err = equalizer
            .send(token, "malformed", ms(0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to parse bulk payload");

        // the failed send still gave its token back
        let token = equalizer.ready().await.unwrap();
        equalizer.send(token, "payload", ms(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_sink_holds_back_payloads() {
        tokio::time::pause();
        let equalizer = Equalizer::listen(sink(ms(100)), 1);

        let token = equalizer.ready().await.unwrap();
        equalizer.send(token, "payload", ms(0)).await.unwrap();

        let started = tokio::time::Instant::now();
        let token = equalizer.ready().await.unwrap();
        equalizer.send(token, "payload", ms(30)).await.unwrap();

        // 70ms of throttling on top of 100ms of processing
        assert_eq!(started.elapsed(), ms(170));
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding_sends() {
        tokio::time::pause();
        let equalizer = Equalizer::listen(sink(ms(100)), 3);

        let mut pending = vec![];
        for _ in 0..3 {
            let token = equalizer.ready().await.unwrap();
            pending.push(equalizer.send(token, "payload", ms(0)));
        }

        equalizer.close().await;
        assert_eq!(equalizer.sink.received.load(Ordering::SeqCst), 3);
        assert_eq!(equalizer.ready().await.unwrap_err(), EqualizerClosed);

        for sent in pending {
            sent.await.unwrap();
        }
    }
}
