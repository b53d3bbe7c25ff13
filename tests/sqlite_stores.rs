//! SQLite-backed state, index and memory working together.

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiki_kb::crawler::{CrawlOptions, CrawlSettings, CrawlerService};
use wiki_kb::db;
use wiki_kb::error::KbError;
use wiki_kb::images::ImageRelocator;
use wiki_kb::in_memory::{InMemoryObjectStore, InMemorySource};
use wiki_kb::index::SqliteIndex;
use wiki_kb::migrate;
use wiki_kb::models::{AttachmentRef, Page, StoredImage};
use wiki_kb::state::{PageMark, SqliteStateStore, WatermarkRecord};
use wiki_kb::traits::{ImageLedger, KnowledgeIndex, WatermarkStore};

async fn pool() -> (TempDir, sqlx::SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect_path(&dir.path().join("data").join("kb.sqlite"))
        .await
        .unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (dir, pool)
}

fn record(space: &str, minute: i64, revision: i64) -> WatermarkRecord {
    WatermarkRecord {
        space: space.to_string(),
        last_crawl_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, minute as u32, 0).unwrap()),
        pages: BTreeMap::new(),
        revision,
    }
}

#[tokio::test]
async fn test_schema_is_idempotent() {
    let (_dir, pool) = pool().await;
    migrate::apply_schema(&pool).await.unwrap();
}

#[tokio::test]
async fn test_watermark_compare_and_set() {
    let (_dir, pool) = pool().await;
    let store = SqliteStateStore::new(pool);

    let empty = store.read("DOCS").await.unwrap();
    assert_eq!(empty, WatermarkRecord::empty("DOCS"));

    let mut first = record("DOCS", 5, 1);
    first.pages.insert(
        "7".to_string(),
        PageMark {
            version: 3,
            modified: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
        },
    );
    store.compare_and_set(&first, 0).await.unwrap();
    assert_eq!(store.read("DOCS").await.unwrap(), first);

    // A second writer that read revision 0 loses.
    let stale = record("DOCS", 9, 1);
    let err = store.compare_and_set(&stale, 0).await.unwrap_err();
    assert!(matches!(err, KbError::Conflict(_)));

    store.compare_and_set(&record("DOCS", 10, 2), 1).await.unwrap();
    let err = store
        .compare_and_set(&record("DOCS", 11, 3), 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(store.read("DOCS").await.unwrap().revision, 2);
}

#[tokio::test]
async fn test_all_watermarks_lists_spaces_in_order() {
    let (_dir, pool) = pool().await;
    let store = SqliteStateStore::new(pool);
    store.compare_and_set(&record("OPS", 1, 1), 0).await.unwrap();
    store.compare_and_set(&record("DOCS", 2, 1), 0).await.unwrap();

    let all = store.all_watermarks().await.unwrap();
    let spaces: Vec<&str> = all.iter().map(|r| r.space.as_str()).collect();
    assert_eq!(spaces, vec!["DOCS", "OPS"]);
}

#[tokio::test]
async fn test_lease_is_exclusive_until_released_or_expired() {
    let (_dir, pool) = pool().await;
    let store = SqliteStateStore::new(pool);
    let ttl = Duration::from_secs(60);

    assert!(store.try_acquire_lease("DOCS", "a", ttl).await.unwrap());
    assert!(!store.try_acquire_lease("DOCS", "b", ttl).await.unwrap());
    // Other spaces are independent.
    assert!(store.try_acquire_lease("OPS", "b", ttl).await.unwrap());

    // Only the holder can release.
    store.release_lease("DOCS", "b").await.unwrap();
    assert!(!store.try_acquire_lease("DOCS", "b", ttl).await.unwrap());
    store.release_lease("DOCS", "a").await.unwrap();
    assert!(store.try_acquire_lease("DOCS", "b", ttl).await.unwrap());

    // An expired lease can be taken over.
    assert!(store.try_acquire_lease("TMP", "a", Duration::ZERO).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(store.try_acquire_lease("TMP", "b", ttl).await.unwrap());
}

#[tokio::test]
async fn test_image_ledger_overwrites_per_attachment() {
    let (_dir, pool) = pool().await;
    let store = SqliteStateStore::new(pool);
    assert!(store.lookup("1", "att1").await.unwrap().is_none());

    let mut image = StoredImage {
        key: "imgs/1/att1/aaaa-arch.png".to_string(),
        content_hash: "aaaa".to_string(),
        page_id: "1".to_string(),
        attachment_id: "att1".to_string(),
        attachment_version: 1,
    };
    store.record(&image).await.unwrap();
    image.attachment_version = 2;
    store.record(&image).await.unwrap();

    let found = store.lookup("1", "att1").await.unwrap().unwrap();
    assert_eq!(found, image);
}

#[tokio::test]
async fn test_crawl_into_sqlite_index() {
    let (_dir, pool) = pool().await;
    let state = Arc::new(SqliteStateStore::new(pool.clone()));
    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let source = Arc::new(InMemorySource::new());
    let store = Arc::new(InMemoryObjectStore::new());

    source.put_page(Page {
        id: "1".to_string(),
        space_key: "DOCS".to_string(),
        title: "Key rotation".to_string(),
        version: 1,
        last_modified: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        body: r#"<h2>Schedule</h2><p>Rotate signing keys every quarter.</p><ac:image ac:alt="Flow"><ri:attachment ri:filename="flow.png"/></ac:image>"#.to_string(),
        attachments: vec![AttachmentRef {
            id: "att1".to_string(),
            page_id: "1".to_string(),
            filename: "flow.png".to_string(),
            media_type: "image/png".to_string(),
            version: 1,
        }],
    });
    source.put_attachment_bytes("att1", b"flow".to_vec());

    let relocator = Arc::new(ImageRelocator::new(
        source.clone(),
        store.clone(),
        state.clone(),
        "imgs/",
        Duration::from_secs(5),
    ));
    let crawler = CrawlerService::new(
        source,
        index.clone(),
        state.clone(),
        relocator,
        CrawlSettings {
            concurrency: 4,
            call_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(60),
            detect_deletions: true,
            base_url: "https://wiki.test".to_string(),
        },
    );

    let report = crawler.run("DOCS", CrawlOptions::default()).await.unwrap();
    assert_eq!(report.pages_updated, 1);
    assert_eq!(report.images_relocated, 1);
    assert_eq!(index.count("DOCS").await.unwrap(), 1);

    let hits = index.query("signing keys", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Key rotation");
    assert_eq!(hits[0].image_keys.len(), 1);
    assert!(store.contains(&hits[0].image_keys[0]));

    let wm = state.read("DOCS").await.unwrap();
    assert_eq!(wm.revision, 1);
    assert!(wm.last_crawl_time.is_some());

    // The lease was released, so an immediate rerun proceeds and is a no-op.
    let again = crawler.run("DOCS", CrawlOptions::default()).await.unwrap();
    assert!(!again.skipped);
    assert_eq!(again.pages_scanned, 0);
    assert_eq!(state.read("DOCS").await.unwrap().revision, 1);
}
