//! Source adapters: listing-page scraper, JSON API client and the item normalizer
//! that turns either raw shape into an [`Observation`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hnsync_core::{Observation, PostId};
use hnsync_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

mod sentiment;

pub use sentiment::{
    ProviderError, SentimentProvider, SentimentReading, UnconfiguredProvider, WatsonNluConfig,
    WatsonNluProvider,
};

pub const CRATE_NAME: &str = "hnsync-adapters";

pub const DEFAULT_SITE_URL: &str = "https://news.ycombinator.com/";
pub const DEFAULT_API_URL: &str = "https://hacker-news.firebaseio.com/v0/";

#[derive(Debug, Error)]
pub enum SourceError {
    /// Network/HTTP failure talking to the source.
    #[error("source unavailable: {0}")]
    Unavailable(#[from] FetchError),
    #[error("malformed source payload: {0}")]
    Malformed(String),
}

/// One `tr.athing` row of a listing page plus its subtext row, as raw strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: String,
    pub rank: String,
    pub title: String,
    pub href: String,
    pub age: Option<String>,
    pub score: Option<String>,
    pub user: Option<String>,
    pub comments: Option<String>,
}

/// Item payload as served by the JSON API. Deleted/dead items come back with most fields absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiItem {
    pub id: PostId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub kids: Vec<PostId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawItem {
    Listing(ListingRow),
    Api { item: ApiItem, rank: u32 },
}

impl RawItem {
    /// The post id when it can be read, even if the rest of the item is malformed.
    pub fn id(&self) -> Option<PostId> {
        match self {
            RawItem::Listing(row) => row.id.trim().parse().ok(),
            RawItem::Api { item, .. } => Some(item.id),
        }
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Items on listing page `page` (1-based). An empty vec marks the end of pagination.
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawItem>, SourceError>;
}

#[async_trait]
pub trait ItemApi: Send + Sync {
    /// Current ranking, best first.
    async fn fetch_top_ids(&self) -> Result<Vec<PostId>, SourceError>;

    /// `None` when the API has no payload for the id (deleted or not yet visible).
    async fn fetch_item(&self, id: PostId, rank: u32) -> Result<Option<RawItem>, SourceError>;
}

/// Maps raw source items onto canonical observations.
#[derive(Debug, Clone)]
pub struct Normalizer {
    site_url: String,
}

impl Normalizer {
    pub fn new(site_url: impl Into<String>) -> Self {
        Self {
            site_url: with_trailing_slash(site_url.into()),
        }
    }

    pub fn normalize(&self, raw: &RawItem, now: DateTime<Utc>) -> Result<Observation, SourceError> {
        match raw {
            RawItem::Listing(row) => self.normalize_listing_row(row),
            RawItem::Api { item, rank } => self.normalize_api_item(item, *rank, now),
        }
    }

    fn normalize_listing_row(&self, row: &ListingRow) -> Result<Observation, SourceError> {
        let id = row
            .id
            .trim()
            .parse::<PostId>()
            .map_err(|_| SourceError::Malformed(format!("row id `{}`", row.id)))?;
        let rank = row
            .rank
            .trim()
            .trim_end_matches('.')
            .parse::<u32>()
            .map_err(|_| SourceError::Malformed(format!("rank `{}` for item {id}", row.rank)))?;
        let url = if row.href.starts_with("http") {
            row.href.clone()
        } else {
            format!("{}{}", self.site_url, row.href.trim_start_matches('/'))
        };

        // Score, author and comment count only exist together; job posts carry none of them.
        let score = row.score.as_deref().and_then(parse_points);
        let (submitted_by, num_comments) = if score.is_some() {
            (
                row.user.clone(),
                row.comments.as_deref().and_then(parse_comment_count),
            )
        } else {
            (None, None)
        };

        Ok(Observation {
            id,
            rank,
            subject: row.title.clone(),
            url,
            age: row.age.clone().unwrap_or_default(),
            score,
            submitted_by,
            num_comments,
        })
    }

    fn normalize_api_item(
        &self,
        item: &ApiItem,
        rank: u32,
        now: DateTime<Utc>,
    ) -> Result<Observation, SourceError> {
        let subject = item
            .title
            .clone()
            .ok_or_else(|| SourceError::Malformed(format!("item {} has no title", item.id)))?;
        let url = item
            .url
            .clone()
            .unwrap_or_else(|| format!("{}item?id={}", self.site_url, item.id));
        let age = item
            .time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
            .map(|then| relative_age(then, now))
            .unwrap_or_default();

        Ok(Observation {
            id: item.id,
            rank,
            subject,
            url,
            age,
            score: item.score,
            submitted_by: item.by.clone(),
            num_comments: Some(item.kids.len() as i64),
        })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_SITE_URL)
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

fn parse_points(text: &str) -> Option<i64> {
    text.split_whitespace().next()?.parse().ok()
}

fn parse_comment_count(text: &str) -> Option<i64> {
    let normalized = text.replace('\u{a0}', " ");
    let mut parts = normalized.split_whitespace();
    let count = parts.next()?.parse().ok()?;
    parts
        .next()
        .filter(|word| word.starts_with("comment"))
        .map(|_| count)
}

/// Human-relative age in the listing's own style, e.g. `3 hours ago`.
pub fn relative_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    let (n, unit) = match secs {
        0..=9 => return "just now".to_string(),
        10..=59 => (secs, "second"),
        60..=3_599 => (secs / 60, "minute"),
        3_600..=86_399 => (secs / 3_600, "hour"),
        86_400..=2_591_999 => (secs / 86_400, "day"),
        2_592_000..=31_535_999 => (secs / 2_592_000, "month"),
        _ => (secs / 31_536_000, "year"),
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Malformed(format!("selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extracts listing rows from a news page. Rows that lack an id or title link are skipped.
pub fn parse_listing_page(html: &str) -> Result<Vec<ListingRow>, SourceError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr.athing")?;
    let rank_sel = selector(".rank")?;
    let title_sel = selector("span.titleline > a, a.storylink")?;
    let age_sel = selector(".age > a, .age")?;
    let score_sel = selector(".score")?;
    let user_sel = selector("a.hnuser")?;
    let link_sel = selector(".subtext a")?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(id) = row.value().attr("id").map(str::to_string) else {
            continue;
        };
        let Some(link) = row.select(&title_sel).next() else {
            warn!(id = %id, "listing row without title link");
            continue;
        };

        let mut out = ListingRow {
            id,
            rank: first_text(&row, &rank_sel).unwrap_or_default(),
            title: link.text().collect::<String>().trim().to_string(),
            href: link.value().attr("href").unwrap_or_default().to_string(),
            ..ListingRow::default()
        };

        let footer = row.next_siblings().filter_map(ElementRef::wrap).next();
        if let Some(footer) = footer {
            out.age = first_text(&footer, &age_sel);
            out.score = first_text(&footer, &score_sel);
            let links = footer
                .select(&link_sel)
                .filter_map(|a| text_or_none(a.text().collect::<String>()))
                .collect::<Vec<_>>();
            out.user = first_text(&footer, &user_sel).or_else(|| links.first().cloned());
            out.comments = links.last().cloned();
        }
        rows.push(out);
    }
    Ok(rows)
}

/// Paginated scrape of the public listing.
#[derive(Debug, Clone)]
pub struct HackerNewsWeb {
    http: Arc<HttpFetcher>,
    site_url: String,
}

impl HackerNewsWeb {
    pub fn new(http: Arc<HttpFetcher>, site_url: impl Into<String>) -> Self {
        Self {
            http,
            site_url: with_trailing_slash(site_url.into()),
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        format!("{}news?p={page}", self.site_url)
    }
}

#[async_trait]
impl PageSource for HackerNewsWeb {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawItem>, SourceError> {
        let resp = self.http.get_bytes("scraper", &self.page_url(page)).await?;
        let html = String::from_utf8_lossy(&resp.body);
        Ok(parse_listing_page(&html)?
            .into_iter()
            .map(RawItem::Listing)
            .collect())
    }
}

/// Top-stories id list plus per-item detail over the JSON API.
#[derive(Debug, Clone)]
pub struct HackerNewsApi {
    http: Arc<HttpFetcher>,
    api_url: String,
}

impl HackerNewsApi {
    pub fn new(http: Arc<HttpFetcher>, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: with_trailing_slash(api_url.into()),
        }
    }
}

#[async_trait]
impl ItemApi for HackerNewsApi {
    async fn fetch_top_ids(&self) -> Result<Vec<PostId>, SourceError> {
        let url = format!("{}topstories.json", self.api_url);
        Ok(self.http.get_json("api", &url).await?)
    }

    async fn fetch_item(&self, id: PostId, rank: u32) -> Result<Option<RawItem>, SourceError> {
        let url = format!("{}item/{id}.json", self.api_url);
        let item: Option<ApiItem> = self.http.get_json("api", &url).await?;
        Ok(item.map(|item| RawItem::Api { item, rank }))
    }
}
