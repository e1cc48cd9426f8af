//! Idempotent create-or-update policy over the post store.
//!
//! The store only offers per-key atomic `insert` (refuses duplicates) and
//! `update` (refuses missing rows). Each upsert alternates between the two until
//! one of them lands, which makes concurrent writers for the same id converge
//! without a global lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use hnsync_core::{Observation, Post, PostId, Sentiment};
use hnsync_storage::{PostPatch, PostStore, StoreError};
use tracing::{debug, warn};

/// Upper bound on insert/update alternations when a row keeps appearing and disappearing.
const CONTENTION_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    Created,
    Updated { sentiment_pending: bool },
    /// Lost every race against concurrent inserts/deletes; nothing was written.
    Contended,
}

impl ObservationOutcome {
    pub fn needs_enrichment(self) -> bool {
        matches!(
            self,
            ObservationOutcome::Created
                | ObservationOutcome::Updated {
                    sentiment_pending: true
                }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentimentOutcome {
    Updated,
    Created,
    Contended,
}

#[derive(Clone)]
pub struct UpsertPolicy {
    store: Arc<dyn PostStore>,
}

impl UpsertPolicy {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    /// Creates the row on first sight, otherwise overwrites rank and listing metadata.
    pub async fn upsert_observation(
        &self,
        observation: &Observation,
    ) -> Result<ObservationOutcome, StoreError> {
        let patch = PostPatch::Observation(observation.clone());
        for _ in 0..CONTENTION_ATTEMPTS {
            match self.store.get(observation.id).await? {
                Some(existing) => {
                    if self.store.update(observation.id, &patch).await? {
                        debug!(post_id = observation.id, rank = observation.rank, "updated post");
                        return Ok(ObservationOutcome::Updated {
                            sentiment_pending: existing.sentiment().is_pending(),
                        });
                    }
                }
                None => {
                    let post = Post::new(observation.clone(), Sentiment::pending());
                    if self.store.insert(post).await? {
                        debug!(post_id = observation.id, rank = observation.rank, "created post");
                        return Ok(ObservationOutcome::Created);
                    }
                }
            }
        }
        warn!(post_id = observation.id, "observation upsert kept racing; skipped");
        Ok(ObservationOutcome::Contended)
    }

    /// Writes sentiment onto the row, creating it from `observation` if it is not there yet.
    pub async fn upsert_sentiment(
        &self,
        observation: &Observation,
        sentiment: Sentiment,
    ) -> Result<SentimentOutcome, StoreError> {
        let patch = PostPatch::Sentiment(sentiment.clone());
        for _ in 0..CONTENTION_ATTEMPTS {
            if self.store.update(observation.id, &patch).await? {
                return Ok(SentimentOutcome::Updated);
            }
            let post = Post::new(observation.clone(), sentiment.clone());
            if self.store.insert(post).await? {
                return Ok(SentimentOutcome::Created);
            }
        }
        warn!(post_id = observation.id, "sentiment upsert kept racing; skipped");
        Ok(SentimentOutcome::Contended)
    }

    /// Deletes every post absent from `surviving`.
    pub async fn reconcile(&self, surviving: &BTreeSet<PostId>) -> Result<u64, StoreError> {
        self.store.delete_excluding(surviving).await
    }
}
