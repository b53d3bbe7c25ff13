use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Normalized documents, one row per wiki page
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            space TEXT NOT NULL,
            page_id TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            body TEXT NOT NULL,
            images_json TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-space crawl watermark
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watermarks (
            space TEXT PRIMARY KEY,
            last_crawl_time INTEGER,
            pages_json TEXT NOT NULL DEFAULT '{}',
            revision INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One in-flight crawl per space
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_leases (
            space TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Relocated image ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stored_images (
            page_id TEXT NOT NULL,
            attachment_id TEXT NOT NULL,
            attachment_version INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            key TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (page_id, attachment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Conversation memory
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                doc_id UNINDEXED,
                title,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_space ON documents(space)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, id)")
        .execute(pool)
        .await?;

    Ok(())
}
