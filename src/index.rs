//! SQLite FTS5 knowledge index.
//!
//! Documents live in `documents`; their title and body are mirrored into the
//! `documents_fts` virtual table. Both writes happen in one transaction so a
//! reader never sees a document without its search entry.
//!
//! Query text is split into alphanumeric terms, each quoted and joined with
//! `OR`, then ranked by FTS5's BM25 `rank` (negated so higher is better).
//! Quoting keeps user punctuation from being parsed as FTS5 syntax.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, Result};
use crate::models::{ImageBinding, NormalizedDocument, SearchHit};
use crate::traits::KnowledgeIndex;

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of documents indexed for `space`.
    pub async fn count(&self, space: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE space = ?")
            .bind(space)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// `"term1" OR "term2" ...`, or `None` when the text has no searchable terms.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl KnowledgeIndex for SqliteIndex {
    async fn upsert(&self, doc: &NormalizedDocument) -> Result<()> {
        let images_json = serde_json::to_string(&doc.images)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, space, page_id, title, url, body, images_json,
                                   version, last_modified, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                space = excluded.space,
                page_id = excluded.page_id,
                title = excluded.title,
                url = excluded.url,
                body = excluded.body,
                images_json = excluded.images_json,
                version = excluded.version,
                last_modified = excluded.last_modified,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.space_key)
        .bind(&doc.page_id)
        .bind(&doc.title)
        .bind(&doc.url)
        .bind(&doc.text)
        .bind(&images_json)
        .bind(doc.version)
        .bind(doc.last_modified.timestamp_millis())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO documents_fts (doc_id, title, body) VALUES (?, ?, ?)")
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts) = fts_query(text) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT documents.id AS id,
                   documents.title AS title,
                   documents.body AS body,
                   documents.images_json AS images_json,
                   documents_fts.rank AS rank
            FROM documents_fts
            JOIN documents ON documents.id = documents_fts.doc_id
            WHERE documents_fts MATCH ?
            ORDER BY documents_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let images_json: String = row.get("images_json");
                let images: Vec<ImageBinding> =
                    serde_json::from_str(&images_json).map_err(|e| {
                        KbError::Storage(format!("corrupt images_json for document: {}", e))
                    })?;
                let rank: f64 = row.get("rank");
                Ok(SearchHit {
                    id: row.get("id"),
                    title: row.get("title"),
                    text: row.get("body"),
                    image_keys: images.into_iter().map(|b| b.key).collect(),
                    score: -rank,
                })
            })
            .collect()
    }

    async fn document_ids(&self, space: &str) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE space = ? ORDER BY id")
                .bind(space)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}
