//! Sentiment enrichment: jittered retry around the provider and the bounded
//! pool that runs enrichment detached from observation persistence.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hnsync_adapters::SentimentProvider;
use hnsync_core::{Observation, Sentiment};
use hnsync_storage::RetryDisposition;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::upsert::UpsertPolicy;

/// Retry `n` (0-based) waits `floor(uniform(low, high) ^ n)` units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterBackoff {
    pub max_retries: u32,
    pub base_low: f64,
    pub base_high: f64,
    pub unit: Duration,
}

impl Default for JitterBackoff {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_low: 2.0,
            base_high: 4.0,
            unit: Duration::from_secs(1),
        }
    }
}

impl JitterBackoff {
    pub fn delay_for_retry<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = if self.base_high > self.base_low {
            rng.random_range(self.base_low..self.base_high)
        } else {
            self.base_low
        };
        let units = base.powi(retry as i32).floor();
        self.unit.mul_f64(units)
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or `policy.max_retries`
/// retries have been spent. The last error is returned as-is.
pub async fn retry_with_jitter<T, E, F, Fut, C>(
    policy: &JitterBackoff,
    mut op: F,
    classify: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: std::fmt::Display,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if retry >= policy.max_retries || classify(&err) == RetryDisposition::NonRetryable {
                    return Err(err);
                }
                let delay = policy.delay_for_retry(retry, &mut rand::rng());
                debug!(retry, ?delay, error = %err, "retrying after jittered backoff");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}

/// Classification call that never fails: terminal provider errors become the label.
pub struct RetryingEnricher {
    provider: Arc<dyn SentimentProvider>,
    policy: JitterBackoff,
}

impl RetryingEnricher {
    pub fn new(provider: Arc<dyn SentimentProvider>, policy: JitterBackoff) -> Self {
        Self { provider, policy }
    }

    pub async fn enrich(&self, observation: &Observation) -> Sentiment {
        let result = retry_with_jitter(
            &self.policy,
            || self.provider.classify(&observation.url),
            |err| err.disposition(),
        )
        .await;
        match result {
            Ok(reading) => Sentiment {
                score: Some(reading.score),
                label: reading.label,
            },
            Err(err) => {
                warn!(post_id = observation.id, error = %err, "sentiment retries exhausted");
                Sentiment::failed(err.to_string())
            }
        }
    }
}

/// Fire-and-forget enrichment tasks, at most `width` classifying at once.
pub struct EnrichmentPool {
    enricher: Arc<RetryingEnricher>,
    upserts: UpsertPolicy,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl EnrichmentPool {
    pub fn new(enricher: RetryingEnricher, upserts: UpsertPolicy, width: usize) -> Self {
        Self {
            enricher: Arc::new(enricher),
            upserts,
            permits: Arc::new(Semaphore::new(width.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Schedules classification for `observation` and returns immediately.
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, observation: Observation) {
        let enricher = Arc::clone(&self.enricher);
        let upserts = self.upserts.clone();
        let permits = Arc::clone(&self.permits);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(done) = tasks.try_join_next() {
            if let Err(err) = done {
                warn!(error = %err, "enrichment task panicked");
            }
        }
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let sentiment = enricher.enrich(&observation).await;
            match upserts.upsert_sentiment(&observation, sentiment).await {
                Ok(outcome) => debug!(post_id = observation.id, ?outcome, "sentiment stored"),
                Err(err) => warn!(post_id = observation.id, error = %err, "storing sentiment failed"),
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits until every submitted task, including ones submitted meanwhile, has finished.
    pub async fn settle(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            info!(pending = batch.len(), "waiting for enrichment to settle");
            while let Some(done) = batch.join_next().await {
                if let Err(err) = done {
                    warn!(error = %err, "enrichment task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hnsync_adapters::{ProviderError, SentimentReading};
    use hnsync_storage::{MemoryPostStore, PostStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SentimentProvider for FlakyProvider {
        async fn classify(&self, _url: &str) -> Result<SentimentReading, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(ProviderError::RateLimited("rate limit exceeded".into()))
            } else {
                Ok(SentimentReading {
                    score: 0.61,
                    label: "positive".into(),
                })
            }
        }
    }

    fn fast() -> JitterBackoff {
        JitterBackoff {
            unit: Duration::from_millis(1),
            ..JitterBackoff::default()
        }
    }

    fn observation() -> Observation {
        Observation {
            id: 1,
            rank: 1,
            subject: "s".into(),
            url: "https://example.com".into(),
            age: "now".into(),
            score: None,
            submitted_by: None,
            num_comments: None,
        }
    }

    #[test]
    fn delays_follow_jittered_powers() {
        let policy = JitterBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(policy.delay_for_retry(0, &mut rng), Duration::from_secs(1));
            let second = policy.delay_for_retry(1, &mut rng);
            assert!(second >= Duration::from_secs(2) && second <= Duration::from_secs(3));
            let third = policy.delay_for_retry(2, &mut rng);
            assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(15));
        }
    }

    #[tokio::test]
    async fn recovers_within_retry_budget() {
        let provider = Arc::new(FlakyProvider {
            failures_before_success: 2,
            calls: AtomicUsize::new(0),
        });
        let enricher = RetryingEnricher::new(provider.clone(), fast());
        let sentiment = enricher.enrich(&observation()).await;
        assert_eq!(sentiment.label, "positive");
        assert_eq!(sentiment.score, Some(0.61));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_to_error_label() {
        let provider = Arc::new(FlakyProvider {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let enricher = RetryingEnricher::new(provider.clone(), fast());
        let sentiment = enricher.enrich(&observation()).await;
        assert_eq!(sentiment.score, None);
        assert_eq!(sentiment.label, "rate limit exceeded");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let enricher = RetryingEnricher::new(Arc::new(hnsync_adapters::UnconfiguredProvider), fast());
        let sentiment = enricher.enrich(&observation()).await;
        assert_eq!(sentiment.score, None);
        assert_eq!(sentiment.label, "sentiment provider is not configured");
    }

    #[tokio::test]
    async fn pool_writes_sentiment_and_settles() {
        let store = Arc::new(MemoryPostStore::new());
        let upserts = UpsertPolicy::new(store.clone());
        upserts.upsert_observation(&observation()).await.unwrap();
        let provider = Arc::new(FlakyProvider {
            failures_before_success: 1,
            calls: AtomicUsize::new(0),
        });
        let pool = EnrichmentPool::new(RetryingEnricher::new(provider, fast()), upserts, 2);

        pool.submit(observation());
        pool.settle().await;

        assert_eq!(pool.in_flight(), 0);
        let post = store.get(1).await.unwrap().unwrap();
        assert_eq!(post.sentiment_label, "positive");
    }
}
