//! One ingestion run per source: activate, fan out, join, reconcile, settle state.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use hnsync_adapters::{ItemApi, Normalizer, PageSource, RawItem};
use hnsync_core::{PostId, RunState, SourceKind};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::enrich::EnrichmentPool;
use crate::fanout::{FanOutCoordinator, JoinPolicy};
use crate::tracker::RunTracker;
use crate::upsert::UpsertPolicy;
use crate::SyncError;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_pages_in_parallel: usize,
    pub item_parallelism: usize,
    /// Pagination stops here even if no empty page was seen.
    pub max_pages: u32,
    pub join: JoinPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_pages_in_parallel: 2,
            item_parallelism: 16,
            max_pages: 40,
            join: JoinPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub observed: usize,
    pub removed: u64,
    /// Listing pages fetched; zero for the API source.
    pub pages: u32,
}

/// Ids already handed to enrichment during the current run.
type Submitted = Arc<Mutex<BTreeSet<PostId>>>;

#[derive(Debug)]
struct PageOutcome {
    page: u32,
    fetched: usize,
    ids: Vec<PostId>,
}

/// Marks the run Failed if it is dropped before reaching a terminal state
/// (panic inside the run, or the run future being cancelled).
struct RunGuard {
    tracker: Arc<RunTracker>,
    source: SourceKind,
    armed: bool,
}

impl RunGuard {
    fn new(tracker: Arc<RunTracker>, source: SourceKind) -> Self {
        Self {
            tracker,
            source,
            armed: true,
        }
    }

    fn finish(mut self) -> RunState {
        self.armed = false;
        self.tracker.finish(self.source)
    }

    fn fail(mut self) -> RunState {
        self.armed = false;
        self.tracker.fail(self.source)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(source = %self.source, "run ended without settling; marking failed");
            self.tracker.fail(self.source);
        }
    }
}

#[derive(Clone)]
pub struct IngestionOrchestrator {
    tracker: Arc<RunTracker>,
    pages: Arc<dyn PageSource>,
    items: Arc<dyn ItemApi>,
    normalizer: Arc<Normalizer>,
    upserts: UpsertPolicy,
    enrichment: Arc<EnrichmentPool>,
    settings: OrchestratorSettings,
}

impl IngestionOrchestrator {
    pub fn new(
        pages: Arc<dyn PageSource>,
        items: Arc<dyn ItemApi>,
        upserts: UpsertPolicy,
        enrichment: Arc<EnrichmentPool>,
    ) -> Self {
        Self {
            tracker: Arc::new(RunTracker::new()),
            pages,
            items,
            normalizer: Arc::new(Normalizer::default()),
            upserts,
            enrichment,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn enrichment(&self) -> &Arc<EnrichmentPool> {
        &self.enrichment
    }

    pub fn status(&self, source: SourceKind) -> RunState {
        self.tracker.status(source)
    }

    pub fn any_active(&self) -> bool {
        self.tracker.any_active()
    }

    /// Runs one ingestion to completion on the caller's task.
    pub async fn run(&self, source: SourceKind) -> Result<RunReport, SyncError> {
        let state = self.tracker.activate(source)?;
        self.run_activated(source, state).await
    }

    /// Activates `source` and starts the run in the background.
    /// Fails with `AlreadyActive` without side effects when a run is in progress.
    pub fn trigger(&self, source: SourceKind) -> Result<RunState, SyncError> {
        let state = self.tracker.activate(source)?;
        let this = self.clone();
        let activated = state.clone();
        tokio::spawn(async move {
            // Outcome is already recorded in the tracker and logged by the run.
            let _ = this.run_activated(source, activated).await;
        });
        Ok(state)
    }

    async fn run_activated(&self, source: SourceKind, state: RunState) -> Result<RunReport, SyncError> {
        let guard = RunGuard::new(Arc::clone(&self.tracker), source);
        let run_id = Uuid::new_v4();
        let started_at = state.last_run_at.unwrap_or_else(Utc::now);
        let span = info_span!("ingestion_run", %run_id, %source);
        let submitted = Submitted::default();

        let result = async {
            info!("run started");
            let (observed, pages) = match source {
                SourceKind::Scraper => self.paginate(&submitted).await?,
                SourceKind::Api => (self.enumerate_ids(&submitted).await?, 0),
            };
            let removed = self.upserts.reconcile(&observed).await?;
            Ok::<_, SyncError>((observed.len(), pages, removed))
        }
        .instrument(span)
        .await;

        match result {
            Ok((observed, pages, removed)) => {
                let settled = guard.finish();
                let report = RunReport {
                    run_id,
                    source,
                    started_at,
                    finished_at: settled.last_run_finish_at.unwrap_or_else(Utc::now),
                    observed,
                    removed,
                    pages,
                };
                info!(%run_id, %source, observed, removed, pages, "run finished");
                Ok(report)
            }
            Err(err) => {
                guard.fail();
                warn!(%run_id, %source, error = %err, "run failed");
                Err(err)
            }
        }
    }

    /// Page-source path. Dispatches windows of `max_pages_in_parallel` pages until a
    /// window contains an empty page.
    async fn paginate(&self, submitted: &Submitted) -> Result<(BTreeSet<PostId>, u32), SyncError> {
        let coordinator = FanOutCoordinator::new(self.settings.max_pages_in_parallel, self.settings.join);
        let window = coordinator.width() as u32;
        let mut observed = BTreeSet::new();
        let mut next_page = 1u32;
        let mut pages_fetched = 0u32;

        loop {
            if next_page > self.settings.max_pages {
                warn!(max_pages = self.settings.max_pages, "page cap reached before an empty page");
                break;
            }
            let last_page = next_page
                .saturating_add(window - 1)
                .min(self.settings.max_pages);
            let this = self.clone();
            let submitted = Arc::clone(submitted);
            let outcomes = coordinator
                .dispatch(next_page..=last_page, move |page| {
                    let this = this.clone();
                    let submitted = Arc::clone(&submitted);
                    async move { this.observe_page(page, &submitted).await }
                })
                .join()
                .await?;

            let mut exhausted = false;
            for outcome in outcomes {
                pages_fetched += 1;
                if outcome.fetched == 0 {
                    debug!(page = outcome.page, "empty page; end of listing");
                    exhausted = true;
                }
                observed.extend(outcome.ids);
            }
            if exhausted {
                break;
            }
            next_page = last_page + 1;
        }
        Ok((observed, pages_fetched))
    }

    /// Id-list path. One work unit per (id, rank) in a single batch.
    async fn enumerate_ids(&self, submitted: &Submitted) -> Result<BTreeSet<PostId>, SyncError> {
        let ids = self.items.fetch_top_ids().await?;
        info!(count = ids.len(), "fetched top ids");
        let units = ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index as u32 + 1))
            .collect::<Vec<_>>();

        let coordinator = FanOutCoordinator::new(self.settings.item_parallelism, self.settings.join);
        let this = self.clone();
        let submitted = Arc::clone(submitted);
        coordinator
            .dispatch(units, move |(id, rank)| {
                let this = this.clone();
                let submitted = Arc::clone(&submitted);
                async move { this.observe_item(id, rank, &submitted).await }
            })
            .join()
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn observe_page(&self, page: u32, submitted: &Submitted) -> Result<PageOutcome, SyncError> {
        let raw_items = self.pages.fetch_page(page).await?;
        let mut ids = Vec::with_capacity(raw_items.len());
        for raw in &raw_items {
            if let Some(id) = self.observe(raw, submitted).await? {
                ids.push(id);
            }
        }
        debug!(page, fetched = raw_items.len(), "page observed");
        Ok(PageOutcome {
            page,
            fetched: raw_items.len(),
            ids,
        })
    }

    async fn observe_item(&self, id: PostId, rank: u32, submitted: &Submitted) -> Result<(), SyncError> {
        match self.items.fetch_item(id, rank).await? {
            Some(raw) => {
                self.observe(&raw, submitted).await?;
            }
            None => debug!(post_id = id, "no payload for item; skipped"),
        }
        Ok(())
    }

    /// Normalize, persist, and hand off to enrichment when the row still needs a label.
    ///
    /// A malformed item is not written, but its id still counts as observed when it
    /// can be read, so reconciliation keeps the existing row.
    async fn observe(&self, raw: &RawItem, submitted: &Submitted) -> Result<Option<PostId>, SyncError> {
        let observation = match self.normalizer.normalize(raw, Utc::now()) {
            Ok(observation) => observation,
            Err(err) => {
                let id = raw.id();
                warn!(error = %err, post_id = ?id, "skipping malformed item");
                return Ok(id);
            }
        };
        let outcome = self.upserts.upsert_observation(&observation).await?;
        let id = observation.id;
        if outcome.needs_enrichment() && first_submission(submitted, id) {
            self.enrichment.submit(observation);
        }
        Ok(Some(id))
    }
}

fn first_submission(submitted: &Submitted, id: PostId) -> bool {
    submitted
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id)
}
