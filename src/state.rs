//! Crawl watermarks, run leases and the image ledger.
//!
//! A [`WatermarkRecord`] is read once at the start of a crawl, passed by
//! reference to the page workers, and replaced once at the end by
//! [`merge`], the single writer. Workers never touch it; they report a
//! [`PageOutcome`] each.
//!
//! The merge keeps the record safe against partial failure: the space's
//! `last_crawl_time` never moves past the oldest failed page, so that page
//! is listed again on the next run. Successful pages newer than the merged
//! time are remembered by version in `pages`, so they are not processed
//! twice.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{KbError, Result};
use crate::models::{PageSummary, StoredImage};
use crate::traits::{ImageLedger, WatermarkStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMark {
    pub version: i64,
    pub modified: DateTime<Utc>,
}

/// Versioned per-space crawl progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkRecord {
    pub space: String,
    pub last_crawl_time: Option<DateTime<Utc>>,
    /// Committed pages modified after `last_crawl_time`.
    pub pages: BTreeMap<String, PageMark>,
    /// Bumped on every write; used for compare-and-set.
    pub revision: i64,
}

impl WatermarkRecord {
    pub fn empty(space: &str) -> Self {
        Self {
            space: space.to_string(),
            last_crawl_time: None,
            pages: BTreeMap::new(),
            revision: 0,
        }
    }

    /// Same progress, revision aside.
    pub fn same_progress(&self, other: &WatermarkRecord) -> bool {
        self.last_crawl_time == other.last_crawl_time && self.pages == other.pages
    }

    /// True when `page` was already committed at this version or later.
    pub fn is_current(&self, page: &PageSummary) -> bool {
        self.pages
            .get(&page.id)
            .is_some_and(|mark| mark.version >= page.version)
    }
}

/// Result of processing one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Upserted to the index.
    Committed {
        page_id: String,
        version: i64,
        modified: DateTime<Utc>,
    },
    Failed {
        page_id: String,
        modified: DateTime<Utc>,
    },
}

impl PageOutcome {
    fn modified(&self) -> DateTime<Utc> {
        match self {
            PageOutcome::Committed { modified, .. } | PageOutcome::Failed { modified, .. } => {
                *modified
            }
        }
    }
}

/// Fold one run's page outcomes into the previous record.
///
/// The returned record's revision is `prev.revision + 1` when progress
/// changed and `prev.revision` otherwise.
pub fn merge(prev: &WatermarkRecord, outcomes: &[PageOutcome]) -> WatermarkRecord {
    let oldest_failure = outcomes
        .iter()
        .filter(|o| matches!(o, PageOutcome::Failed { .. }))
        .map(PageOutcome::modified)
        .min();

    let newest_safe_success = outcomes
        .iter()
        .filter(|o| matches!(o, PageOutcome::Committed { .. }))
        .map(PageOutcome::modified)
        .filter(|m| oldest_failure.map_or(true, |f| *m < f))
        .max();

    let last_crawl_time = match (prev.last_crawl_time, newest_safe_success) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    let mut pages = prev.pages.clone();
    for outcome in outcomes {
        if let PageOutcome::Committed {
            page_id,
            version,
            modified,
        } = outcome
        {
            pages.insert(
                page_id.clone(),
                PageMark {
                    version: *version,
                    modified: *modified,
                },
            );
        }
    }
    if let Some(t) = last_crawl_time {
        pages.retain(|_, mark| mark.modified > t);
    }

    let mut next = WatermarkRecord {
        space: prev.space.clone(),
        last_crawl_time,
        pages,
        revision: prev.revision,
    };
    if !next.same_progress(prev) {
        next.revision += 1;
    }
    next
}

// ============ SQLite store ============

/// Watermarks, leases and the image ledger in the local database.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Watermarks for every space that has been crawled.
    pub async fn all_watermarks(&self) -> Result<Vec<WatermarkRecord>> {
        let rows = sqlx::query(
            "SELECT space, last_crawl_time, pages_json, revision FROM watermarks ORDER BY space",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WatermarkRecord> {
    let last: Option<i64> = row.get("last_crawl_time");
    let pages_json: String = row.get("pages_json");
    Ok(WatermarkRecord {
        space: row.get("space"),
        last_crawl_time: last.and_then(from_millis),
        pages: serde_json::from_str(&pages_json)
            .map_err(|e| KbError::Storage(format!("corrupt watermark pages: {}", e)))?,
        revision: row.get("revision"),
    })
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl WatermarkStore for SqliteStateStore {
    async fn read(&self, space: &str) -> Result<WatermarkRecord> {
        let row = sqlx::query(
            "SELECT space, last_crawl_time, pages_json, revision FROM watermarks WHERE space = ?",
        )
        .bind(space)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => record_from_row(&row),
            None => Ok(WatermarkRecord::empty(space)),
        }
    }

    async fn compare_and_set(
        &self,
        record: &WatermarkRecord,
        expected_revision: i64,
    ) -> Result<()> {
        let pages_json = serde_json::to_string(&record.pages)
            .map_err(|e| KbError::Storage(e.to_string()))?;
        let last = record.last_crawl_time.map(|t| t.timestamp_millis());
        let now = Utc::now().timestamp();

        let result = if expected_revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO watermarks (space, last_crawl_time, pages_json, revision, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(space) DO UPDATE SET
                    last_crawl_time = excluded.last_crawl_time,
                    pages_json = excluded.pages_json,
                    revision = excluded.revision,
                    updated_at = excluded.updated_at
                WHERE watermarks.revision = 0
                "#,
            )
            .bind(&record.space)
            .bind(last)
            .bind(&pages_json)
            .bind(record.revision)
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE watermarks
                SET last_crawl_time = ?, pages_json = ?, revision = ?, updated_at = ?
                WHERE space = ? AND revision = ?
                "#,
            )
            .bind(last)
            .bind(&pages_json)
            .bind(record.revision)
            .bind(now)
            .bind(&record.space)
            .bind(expected_revision)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() != 1 {
            return Err(KbError::Conflict(format!(
                "watermark for space '{}' changed since revision {}",
                record.space, expected_revision
            )));
        }
        Ok(())
    }

    async fn try_acquire_lease(&self, space: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_leases (space, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(space) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE crawl_leases.expires_at <= ?
            "#,
        )
        .bind(space)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, space: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM crawl_leases WHERE space = ? AND holder = ?")
            .bind(space)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ImageLedger for SqliteStateStore {
    async fn lookup(&self, page_id: &str, attachment_id: &str) -> Result<Option<StoredImage>> {
        let row = sqlx::query(
            r#"
            SELECT page_id, attachment_id, attachment_version, content_hash, key
            FROM stored_images WHERE page_id = ? AND attachment_id = ?
            "#,
        )
        .bind(page_id)
        .bind(attachment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredImage {
            key: row.get("key"),
            content_hash: row.get("content_hash"),
            page_id: row.get("page_id"),
            attachment_id: row.get("attachment_id"),
            attachment_version: row.get("attachment_version"),
        }))
    }

    async fn record(&self, image: &StoredImage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stored_images (page_id, attachment_id, attachment_version, content_hash, key, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(page_id, attachment_id) DO UPDATE SET
                attachment_version = excluded.attachment_version,
                content_hash = excluded.content_hash,
                key = excluded.key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&image.page_id)
        .bind(&image.attachment_id)
        .bind(image.attachment_version)
        .bind(&image.content_hash)
        .bind(&image.key)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
