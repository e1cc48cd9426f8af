//! Keyed post table: an in-memory implementation for tests and single-process
//! runs, and a Postgres implementation for durable deployments.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use hnsync_core::{Observation, Post, PostId, Sentiment};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row for post {id}: {reason}")]
    CorruptRow { id: PostId, reason: String },
}

/// Field-level update applied to an existing row.
#[derive(Debug, Clone, PartialEq)]
pub enum PostPatch {
    /// Rank and listing metadata from a re-observation.
    Observation(Observation),
    /// Sentiment fields only.
    Sentiment(Sentiment),
}

impl PostPatch {
    fn apply(&self, post: &mut Post) {
        match self {
            PostPatch::Observation(observation) => post.apply_observation(observation),
            PostPatch::Sentiment(sentiment) => post.apply_sentiment(sentiment),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostQuery {
    pub search: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for PostQuery {
    fn default() -> Self {
        Self {
            search: None,
            offset: 0,
            limit: 30,
        }
    }
}

/// Record store contract. Every operation is atomic per key.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get(&self, id: PostId) -> Result<Option<Post>, StoreError>;

    /// Creates the row. Returns `false` without touching anything if the id already exists.
    async fn insert(&self, post: Post) -> Result<bool, StoreError>;

    /// Patches an existing row. Returns `false` if the id is absent.
    async fn update(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError>;

    /// Deletes every row whose id is not in `keep`, returning the number removed.
    async fn delete_excluding(&self, keep: &BTreeSet<PostId>) -> Result<u64, StoreError>;

    /// Rows ordered by rank, optionally filtered by a case-insensitive subject search.
    async fn list(&self, query: &PostQuery) -> Result<Vec<Post>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryPostStore {
    rows: RwLock<BTreeMap<PostId, Post>>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn ids(&self) -> BTreeSet<PostId> {
        self.rows.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn get(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn insert(&self, post: Post) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&post.id) {
            return Ok(false);
        }
        rows.insert(post.id, post);
        Ok(true)
    }

    async fn update(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(post) => {
                patch.apply(post);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_excluding(&self, keep: &BTreeSet<PostId>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|id, _| keep.contains(id));
        Ok((before - rows.len()) as u64)
    }

    async fn list(&self, query: &PostQuery) -> Result<Vec<Post>, StoreError> {
        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let mut out = self
            .rows
            .read()
            .await
            .values()
            .filter(|p| match &needle {
                Some(n) => p.subject.to_lowercase().contains(n),
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|p| (p.rank, p.id));
        Ok(out.into_iter().skip(query.offset).take(query.limit).collect())
    }
}

#[derive(Debug, Clone)]
pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_post(row: &PgRow) -> Result<Post, StoreError> {
        let id: i64 = row.try_get("id")?;
        let rank: i32 = row.try_get("rank")?;
        let rank = u32::try_from(rank).map_err(|_| StoreError::CorruptRow {
            id,
            reason: format!("negative rank {rank}"),
        })?;
        Ok(Post {
            id,
            rank,
            subject: row.try_get("subject")?,
            url: row.try_get("url")?,
            age: row.try_get("age")?,
            score: row.try_get("score")?,
            submitted_by: row.try_get("submitted_by")?,
            num_comments: row.try_get("num_comments")?,
            sentiment_score: row.try_get("sentiment_score")?,
            sentiment_label: row.try_get("sentiment_label")?,
        })
    }
}

fn rank_param(rank: u32) -> i32 {
    i32::try_from(rank).unwrap_or(i32::MAX)
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn get(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, rank, subject, url, age, score, submitted_by, num_comments,
                   sentiment_score, sentiment_label
              FROM posts
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_post).transpose()
    }

    async fn insert(&self, post: Post) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (id, rank, subject, url, age, score, submitted_by, num_comments,
                               sentiment_score, sentiment_label)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(post.id)
        .bind(rank_param(post.rank))
        .bind(&post.subject)
        .bind(&post.url)
        .bind(&post.age)
        .bind(post.score)
        .bind(&post.submitted_by)
        .bind(post.num_comments)
        .bind(post.sentiment_score)
        .bind(&post.sentiment_label)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError> {
        let result = match patch {
            PostPatch::Observation(observation) => {
                sqlx::query(
                    r#"
                    UPDATE posts
                       SET rank = $2,
                           age = $3,
                           score = $4,
                           submitted_by = $5,
                           num_comments = $6
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(rank_param(observation.rank))
                .bind(&observation.age)
                .bind(observation.score)
                .bind(&observation.submitted_by)
                .bind(observation.num_comments)
                .execute(&self.pool)
                .await?
            }
            PostPatch::Sentiment(sentiment) => {
                sqlx::query(
                    r#"
                    UPDATE posts
                       SET sentiment_score = $2,
                           sentiment_label = $3
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(sentiment.score)
                .bind(&sentiment.label)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn delete_excluding(&self, keep: &BTreeSet<PostId>) -> Result<u64, StoreError> {
        let keep = keep.iter().copied().collect::<Vec<_>>();
        let result = sqlx::query("DELETE FROM posts WHERE NOT (id = ANY($1))")
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, query: &PostQuery) -> Result<Vec<Post>, StoreError> {
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let rows = sqlx::query(
            r#"
            SELECT id, rank, subject, url, age, score, submitted_by, num_comments,
                   sentiment_score, sentiment_label
              FROM posts
             WHERE $1::text IS NULL OR subject ILIKE '%' || $1 || '%'
             ORDER BY rank, id
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(search)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_post).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hnsync_core::NOT_READY_LABEL;

    fn observation(id: PostId, rank: u32, subject: &str) -> Observation {
        Observation {
            id,
            rank,
            subject: subject.to_string(),
            url: format!("https://example.com/{id}"),
            age: "1 hour ago".into(),
            score: Some(10),
            submitted_by: Some("dang".into()),
            num_comments: Some(2),
        }
    }

    fn post(id: PostId, rank: u32, subject: &str) -> Post {
        Post::new(observation(id, rank, subject), Sentiment::pending())
    }

    #[tokio::test]
    async fn insert_refuses_existing_id() {
        let store = MemoryPostStore::new();
        assert!(store.insert(post(1, 1, "first")).await.unwrap());
        assert!(!store.insert(post(1, 9, "dupe")).await.unwrap());
        let stored = store.get(1).await.unwrap().unwrap();
        assert_eq!(stored.rank, 1);
        assert_eq!(stored.subject, "first");
    }

    #[tokio::test]
    async fn update_reports_missing_rows() {
        let store = MemoryPostStore::new();
        let patch = PostPatch::Sentiment(Sentiment {
            score: Some(0.9),
            label: "positive".into(),
        });
        assert!(!store.update(7, &patch).await.unwrap());

        store.insert(post(7, 2, "seven")).await.unwrap();
        assert!(store.update(7, &patch).await.unwrap());
        let stored = store.get(7).await.unwrap().unwrap();
        assert_eq!(stored.sentiment_label, "positive");
        assert_eq!(stored.rank, 2);
    }

    #[tokio::test]
    async fn observation_patch_leaves_sentiment_alone() {
        let store = MemoryPostStore::new();
        store.insert(post(3, 4, "three")).await.unwrap();
        store
            .update(3, &PostPatch::Observation(observation(3, 1, "ignored")))
            .await
            .unwrap();
        let stored = store.get(3).await.unwrap().unwrap();
        assert_eq!(stored.rank, 1);
        assert_eq!(stored.subject, "three");
        assert_eq!(stored.sentiment_label, NOT_READY_LABEL);
    }

    #[tokio::test]
    async fn delete_excluding_keeps_only_survivors() {
        let store = MemoryPostStore::new();
        for id in 1..=5 {
            store.insert(post(id, id as u32, "x")).await.unwrap();
        }
        let keep = BTreeSet::from([2, 4, 99]);
        let removed = store.delete_excluding(&keep).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.ids().await, BTreeSet::from([2, 4]));
    }

    #[tokio::test]
    async fn list_orders_by_rank_and_filters_subject() {
        let store = MemoryPostStore::new();
        store.insert(post(10, 3, "Rust 2.0 released")).await.unwrap();
        store.insert(post(11, 1, "Ask HN: hiring?")).await.unwrap();
        store.insert(post(12, 2, "Why rust is fun")).await.unwrap();

        let all = store.list(&PostQuery::default()).await.unwrap();
        assert_eq!(all.iter().map(|p| p.id).collect::<Vec<_>>(), vec![11, 12, 10]);

        let rusty = store
            .list(&PostQuery {
                search: Some("RUST".into()),
                ..PostQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rusty.iter().map(|p| p.id).collect::<Vec<_>>(), vec![12, 10]);

        let paged = store
            .list(&PostQuery {
                search: None,
                offset: 1,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, 12);
    }
}
