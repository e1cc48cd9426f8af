//! Core domain model for hnsync: posts, observations and per-source run state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hnsync-core";

/// Label carried by a post until enrichment completes or terminally fails.
pub const NOT_READY_LABEL: &str = "Not Ready";

/// Source-assigned item id. Stable across runs.
pub type PostId = i64;

/// One of the two independent ingestion strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Paginated scrape of the public listing pages.
    Scraper,
    /// Top-id list plus per-item detail from the JSON API.
    Api,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Scraper, SourceKind::Api];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Scraper => "scraper",
            SourceKind::Api => "api",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}` (expected `scraper` or `api`)")]
pub struct UnknownSource(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scraper" | "web" => Ok(SourceKind::Scraper),
            "api" => Ok(SourceKind::Api),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Active,
    Failed,
}

/// Snapshot of a source's single run-state row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_finish_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }
}

/// One normalized appearance of an item in a given run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: PostId,
    pub rank: u32,
    pub subject: String,
    pub url: String,
    pub age: String,
    pub score: Option<i64>,
    pub submitted_by: Option<String>,
    pub num_comments: Option<i64>,
}

/// Derived classification of a post's linked document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub score: Option<f64>,
    pub label: String,
}

impl Sentiment {
    pub fn pending() -> Self {
        Self {
            score: None,
            label: NOT_READY_LABEL.to_string(),
        }
    }

    /// Terminal enrichment failure: no score, the provider's message as label.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            score: None,
            label: message.into(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.score.is_none() && self.label == NOT_READY_LABEL
    }
}

/// Canonical persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub rank: u32,
    pub subject: String,
    pub url: String,
    pub age: String,
    pub score: Option<i64>,
    pub submitted_by: Option<String>,
    pub num_comments: Option<i64>,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: String,
}

impl Post {
    pub fn new(observation: Observation, sentiment: Sentiment) -> Self {
        Self {
            id: observation.id,
            rank: observation.rank,
            subject: observation.subject,
            url: observation.url,
            age: observation.age,
            score: observation.score,
            submitted_by: observation.submitted_by,
            num_comments: observation.num_comments,
            sentiment_score: sentiment.score,
            sentiment_label: sentiment.label,
        }
    }

    pub fn sentiment(&self) -> Sentiment {
        Sentiment {
            score: self.sentiment_score,
            label: self.sentiment_label.clone(),
        }
    }

    /// Overwrites the fields a re-observation owns. Subject, url and sentiment are untouched.
    pub fn apply_observation(&mut self, observation: &Observation) {
        self.rank = observation.rank;
        self.age = observation.age.clone();
        self.score = observation.score;
        self.submitted_by = observation.submitted_by.clone();
        self.num_comments = observation.num_comments;
    }

    pub fn apply_sentiment(&mut self, sentiment: &Sentiment) {
        self.sentiment_score = sentiment.score;
        self.sentiment_label = sentiment.label.clone();
    }
}
