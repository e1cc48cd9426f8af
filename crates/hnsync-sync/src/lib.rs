//! Ingestion core: per-source run tracking, bounded fan-out of fetch work,
//! jittered sentiment enrichment, and reconciliation of the post table.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hnsync_adapters::{
    HackerNewsApi, HackerNewsWeb, Normalizer, SentimentProvider, SourceError, UnconfiguredProvider,
    WatsonNluConfig, WatsonNluProvider, DEFAULT_API_URL, DEFAULT_SITE_URL,
};
use hnsync_core::SourceKind;
use hnsync_storage::{HttpClientConfig, HttpFetcher, MemoryPostStore, PgPostStore, PostStore, StoreError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod enrich;
mod fanout;
mod orchestrator;
mod tracker;
mod upsert;

pub use enrich::{retry_with_jitter, EnrichmentPool, JitterBackoff, RetryingEnricher};
pub use fanout::{FanOutCoordinator, FanOutHandle, JoinPolicy};
pub use orchestrator::{IngestionOrchestrator, OrchestratorSettings, RunReport};
pub use tracker::RunTracker;
pub use upsert::{ObservationOutcome, SentimentOutcome, UpsertPolicy};

pub const CRATE_NAME: &str = "hnsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a {0} run is already active")]
    AlreadyActive(SourceKind),
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),
    #[error("fan-in timed out after {waited:?} with {completed}/{total} units complete")]
    JoinTimeout {
        completed: usize,
        total: usize,
        waited: Duration,
    },
    #[error("record store failure: {0}")]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub site_url: String,
    pub api_url: String,
    pub max_pages_in_parallel: usize,
    pub item_parallelism: usize,
    pub enrich_parallelism: usize,
    pub max_pages: u32,
    pub join_poll_step_secs: u64,
    pub join_max_polls: u32,
    pub ibm_api_key: Option<String>,
    pub ibm_service_url: Option<String>,
    pub ibm_version: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub api_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            site_url: DEFAULT_SITE_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            max_pages_in_parallel: 2,
            item_parallelism: 16,
            enrich_parallelism: 8,
            max_pages: 40,
            join_poll_step_secs: 5,
            join_max_polls: 10,
            ibm_api_key: None,
            ibm_service_url: None,
            ibm_version: "2021-08-01".to_string(),
            user_agent: "hnsync-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            scrape_cron: "0 0 * * * *".to_string(),
            api_cron: "0 30 * * * *".to_string(),
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            site_url: std::env::var("HN_SITE_URL").unwrap_or(defaults.site_url),
            api_url: std::env::var("HN_API_URL").unwrap_or(defaults.api_url),
            max_pages_in_parallel: env_parse("MAX_PAGES_IN_PARALLEL", defaults.max_pages_in_parallel),
            item_parallelism: env_parse("HN_ITEM_PARALLELISM", defaults.item_parallelism),
            enrich_parallelism: env_parse("HNSYNC_ENRICH_PARALLELISM", defaults.enrich_parallelism),
            max_pages: env_parse("HN_MAX_PAGES", defaults.max_pages),
            join_poll_step_secs: env_parse("HN_JOIN_POLL_STEP_SECS", defaults.join_poll_step_secs),
            join_max_polls: env_parse("HN_JOIN_MAX_POLLS", defaults.join_max_polls),
            ibm_api_key: env_opt("IBM_API_KEY"),
            ibm_service_url: env_opt("IBM_SERVICE_URL"),
            ibm_version: std::env::var("IBM_VERSION").unwrap_or(defaults.ibm_version),
            user_agent: std::env::var("HNSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("HNSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("HNSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
            api_cron: std::env::var("API_CRON").unwrap_or(defaults.api_cron),
            web_port: env_parse("HNSYNC_WEB_PORT", defaults.web_port),
        }
    }

    pub fn join_policy(&self) -> JoinPolicy {
        JoinPolicy {
            max_polls: self.join_max_polls,
            poll_step: Duration::from_secs(self.join_poll_step_secs),
        }
    }

    pub fn enrich_policy(&self) -> JitterBackoff {
        JitterBackoff::default()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_pages_in_parallel: self.max_pages_in_parallel,
            item_parallelism: self.item_parallelism,
            max_pages: self.max_pages,
            join: self.join_policy(),
        }
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Everything a process needs to ingest and serve: the store and the orchestrator over it.
#[derive(Clone)]
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn PostStore>,
    orchestrator: IngestionOrchestrator,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn PostStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgPostStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            ),
            None => {
                warn!("DATABASE_URL not set; posts are kept in memory");
                Arc::new(MemoryPostStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Wires the HTTP collaborators and the sentiment provider around an existing store.
    pub fn with_store(config: SyncConfig, store: Arc<dyn PostStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let pages = Arc::new(HackerNewsWeb::new(Arc::clone(&http), config.site_url.clone()));
        let items = Arc::new(HackerNewsApi::new(http, config.api_url.clone()));

        let upserts = UpsertPolicy::new(Arc::clone(&store));
        let enricher = RetryingEnricher::new(build_provider(&config)?, config.enrich_policy());
        let enrichment = Arc::new(EnrichmentPool::new(
            enricher,
            upserts.clone(),
            config.enrich_parallelism,
        ));

        let orchestrator = IngestionOrchestrator::new(pages, items, upserts, enrichment)
            .with_normalizer(Normalizer::new(config.site_url.clone()))
            .with_settings(config.orchestrator_settings());

        Ok(Self {
            config,
            store,
            orchestrator,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &IngestionOrchestrator {
        &self.orchestrator
    }

    /// One synchronous run followed by waiting for its enrichment to land.
    pub async fn run_once(&self, source: SourceKind) -> Result<RunReport> {
        let report = self
            .orchestrator
            .run(source)
            .await
            .with_context(|| format!("running {source} ingestion"))?;
        self.orchestrator.enrichment().settle().await;
        Ok(report)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (source, cron) in [
            (SourceKind::Scraper, &self.config.scrape_cron),
            (SourceKind::Api, &self.config.api_cron),
        ] {
            let orchestrator = self.orchestrator.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    match orchestrator.trigger(source) {
                        Ok(_) => info!(%source, "scheduled run started"),
                        Err(SyncError::AlreadyActive(_)) => {
                            info!(%source, "scheduled run skipped; source already active")
                        }
                        Err(err) => warn!(%source, error = %err, "scheduled run not started"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

fn build_provider(config: &SyncConfig) -> Result<Arc<dyn SentimentProvider>> {
    match (&config.ibm_api_key, &config.ibm_service_url) {
        (Some(api_key), Some(service_url)) => {
            let provider = WatsonNluProvider::new(WatsonNluConfig {
                api_key: api_key.clone(),
                service_url: service_url.clone(),
                version: config.ibm_version.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
            })
            .context("building sentiment client")?;
            Ok(Arc::new(provider))
        }
        _ => {
            warn!("IBM_API_KEY/IBM_SERVICE_URL not set; sentiment labels will record the missing provider");
            Ok(Arc::new(UnconfiguredProvider))
        }
    }
}

pub async fn run_sync_once_from_env(source: SourceKind) -> Result<RunReport> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once(source).await
}
