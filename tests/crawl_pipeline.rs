//! End-to-end crawl behaviour against the in-memory collaborators.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use wiki_kb::crawler::{CrawlOptions, CrawlSettings, CrawlerService};
use wiki_kb::images::ImageRelocator;
use wiki_kb::in_memory::{
    InMemoryIndex, InMemoryLedger, InMemoryObjectStore, InMemorySource, InMemoryWatermarks,
};
use wiki_kb::models::{AttachmentRef, Page};
use wiki_kb::traits::WatermarkStore;

struct Harness {
    source: Arc<InMemorySource>,
    index: Arc<InMemoryIndex>,
    store: Arc<InMemoryObjectStore>,
    watermarks: Arc<InMemoryWatermarks>,
    crawler: Arc<CrawlerService>,
}

fn harness() -> Harness {
    let source = Arc::new(InMemorySource::new());
    let index = Arc::new(InMemoryIndex::new());
    let store = Arc::new(InMemoryObjectStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let watermarks = Arc::new(InMemoryWatermarks::new());

    let relocator = Arc::new(ImageRelocator::new(
        source.clone(),
        store.clone(),
        ledger,
        "imgs/",
        Duration::from_secs(5),
    ));
    let crawler = Arc::new(CrawlerService::new(
        source.clone(),
        index.clone(),
        watermarks.clone(),
        relocator,
        CrawlSettings {
            concurrency: 2,
            call_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(60),
            detect_deletions: true,
            base_url: "https://wiki.test".to_string(),
        },
    ));

    Harness {
        source,
        index,
        store,
        watermarks,
        crawler,
    }
}

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

fn page(id: &str, version: i64, minute: i64, body: &str) -> Page {
    Page {
        id: id.to_string(),
        space_key: "DOCS".to_string(),
        title: format!("Page {}", id),
        version,
        last_modified: at(minute),
        body: body.to_string(),
        attachments: Vec::new(),
    }
}

fn png(page_id: &str, id: &str, filename: &str, version: i64) -> AttachmentRef {
    AttachmentRef {
        id: id.to_string(),
        page_id: page_id.to_string(),
        filename: filename.to_string(),
        media_type: "image/png".to_string(),
        version,
    }
}

const DIAGRAM_BODY: &str = r#"<p>Rotate keys quarterly.</p><p><ac:image ac:alt="Architecture"><ri:attachment ri:filename="arch.png"/></ac:image></p>"#;

fn diagram_page(version: i64, minute: i64, attachment_version: i64) -> Page {
    let mut p = page("1", version, minute, DIAGRAM_BODY);
    p.title = "Key rotation".to_string();
    p.attachments = vec![png("1", "att1", "arch.png", attachment_version)];
    p
}

async fn crawl(h: &Harness) -> wiki_kb::models::CrawlReport {
    h.crawler
        .run("DOCS", CrawlOptions::default())
        .await
        .expect("crawl should succeed")
}

#[tokio::test]
async fn test_new_page_is_indexed_with_relocated_image() {
    let h = harness();
    h.source.put_page(diagram_page(1, 0, 1));
    h.source.put_attachment_bytes("att1", b"png-bytes-v1".to_vec());

    let report = crawl(&h).await;
    assert_eq!(report.pages_scanned, 1);
    assert_eq!(report.pages_updated, 1);
    assert_eq!(report.images_relocated, 1);
    assert_eq!(report.pages_failed, 0);

    let doc = h.index.get("confluence-1").expect("document indexed");
    assert_eq!(doc.title, "Key rotation");
    assert_eq!(doc.url, "https://wiki.test/wiki/spaces/DOCS/pages/1");
    assert_eq!(doc.version, 1);
    assert!(doc.text.contains("Rotate keys quarterly."));
    assert_eq!(doc.images.len(), 1);
    let key = &doc.images[0].key;
    assert!(key.starts_with("imgs/1/att1/"));
    assert!(key.ends_with("-arch.png"));
    assert!(doc.text.contains(&format!("![Architecture](kb-image:{})", key)));
    assert!(h.store.contains(key));

    let wm = h.watermarks.read("DOCS").await.unwrap();
    assert_eq!(wm.last_crawl_time, Some(at(0)));
    assert!(wm.pages.is_empty());
}

#[tokio::test]
async fn test_rerun_without_changes_does_nothing() {
    let h = harness();
    h.source.put_page(diagram_page(1, 0, 1));
    h.source.put_attachment_bytes("att1", b"png-bytes-v1".to_vec());
    crawl(&h).await;

    let upserts = h.index.upsert_count();
    let puts = h.store.put_count();
    let writes = h.watermarks.write_count();
    let fetches = h.source.attachment_fetches();

    let report = crawl(&h).await;
    assert_eq!(report.pages_scanned, 0);
    assert_eq!(report.pages_updated, 0);
    assert_eq!(h.index.upsert_count(), upserts);
    assert_eq!(h.store.put_count(), puts);
    assert_eq!(h.watermarks.write_count(), writes);
    assert_eq!(h.source.attachment_fetches(), fetches);
}

#[tokio::test]
async fn test_edited_page_reuses_unchanged_image() {
    let h = harness();
    h.source.put_page(diagram_page(1, 0, 1));
    h.source.put_attachment_bytes("att1", b"png-bytes-v1".to_vec());
    crawl(&h).await;
    let key_before = h.index.get("confluence-1").unwrap().images[0].key.clone();

    h.source.put_page(diagram_page(2, 10, 1));
    let report = crawl(&h).await;

    assert_eq!(report.pages_updated, 1);
    assert_eq!(report.images_relocated, 0);
    assert_eq!(h.source.attachment_fetches(), 1);
    assert_eq!(h.store.put_count(), 1);
    let doc = h.index.get("confluence-1").unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.images[0].key, key_before);
}

#[tokio::test]
async fn test_new_attachment_version_uploads_only_when_bytes_change() {
    let h = harness();
    h.source.put_page(diagram_page(1, 0, 1));
    h.source.put_attachment_bytes("att1", b"png-bytes-v1".to_vec());
    crawl(&h).await;
    let first_key = h.index.get("confluence-1").unwrap().images[0].key.clone();

    // Version bump, identical bytes: downloaded and hashed, not re-uploaded.
    h.source.put_page(diagram_page(2, 10, 2));
    let report = crawl(&h).await;
    assert_eq!(report.images_relocated, 0);
    assert_eq!(h.source.attachment_fetches(), 2);
    assert_eq!(h.store.put_count(), 1);
    assert_eq!(h.index.get("confluence-1").unwrap().images[0].key, first_key);

    // New bytes: a new key, the old object left in place.
    h.source.put_page(diagram_page(3, 20, 3));
    h.source.put_attachment_bytes("att1", b"png-bytes-v3".to_vec());
    let report = crawl(&h).await;
    assert_eq!(report.images_relocated, 1);
    assert_eq!(h.store.put_count(), 2);
    let new_key = h.index.get("confluence-1").unwrap().images[0].key.clone();
    assert_ne!(new_key, first_key);
    assert!(h.store.contains(&first_key));
    assert!(h.store.contains(&new_key));
}

#[tokio::test]
async fn test_failed_page_holds_watermark_and_is_retried() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>one</p>"));
    h.source.put_page(page("2", 1, 5, "<p>two</p>"));
    h.source.put_page(page("3", 1, 10, "<p>three</p>"));
    h.index.fail_upserts_for("confluence-2");

    let report = crawl(&h).await;
    assert_eq!(report.pages_updated, 2);
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.errors[0].page_id, "2");
    assert_eq!(report.errors[0].kind, "transient_io");

    let wm = h.watermarks.read("DOCS").await.unwrap();
    assert_eq!(wm.last_crawl_time, Some(at(0)));
    assert!(wm.pages.contains_key("3"));
    assert!(!wm.pages.contains_key("2"));

    h.index.heal();
    let upserts = h.index.upsert_count();
    let report = crawl(&h).await;
    assert_eq!(report.pages_scanned, 2);
    assert_eq!(report.pages_unchanged, 1);
    assert_eq!(report.pages_updated, 1);
    assert_eq!(h.index.upsert_count(), upserts + 1);
    assert!(h.index.get("confluence-2").is_some());

    let wm = h.watermarks.read("DOCS").await.unwrap();
    assert_eq!(wm.last_crawl_time, Some(at(10)));
    assert!(wm.pages.is_empty());
}

#[tokio::test]
async fn test_missing_attachment_falls_back_to_alt_text() {
    let h = harness();
    let mut p = page(
        "1",
        1,
        0,
        r#"<p>See <ac:image ac:alt="Old chart"><ri:attachment ri:filename="gone.png"/></ac:image> below.</p>"#,
    );
    p.attachments = Vec::new();
    h.source.put_page(p);

    let report = crawl(&h).await;
    assert_eq!(report.pages_updated, 1);
    let doc = h.index.get("confluence-1").unwrap();
    assert!(doc.images.is_empty());
    assert!(doc.text.contains("Old chart"));
    assert!(!doc.text.contains("kb-image:"));
    assert!(!doc.text.contains('\u{E000}'));
}

#[tokio::test]
async fn test_placeholder_lookalike_text_is_kept_verbatim() {
    let h = harness();
    let mut p = page(
        "1",
        1,
        0,
        r#"<p>Write {{image:1}} in a template.</p><ac:image ac:alt="Pic"><ri:attachment ri:filename="a.png"/></ac:image>"#,
    );
    p.attachments = vec![png("1", "att1", "a.png", 1)];
    h.source.put_page(p);
    h.source.put_attachment_bytes("att1", b"pic".to_vec());

    crawl(&h).await;
    let doc = h.index.get("confluence-1").unwrap();
    let key = &doc.images[0].key;
    assert_eq!(
        doc.text,
        format!("Write {{{{image:1}}}} in a template.\n\n![Pic](kb-image:{})", key)
    );
    assert_eq!(doc.text.matches("kb-image:").count(), 1);
}

#[tokio::test]
async fn test_unfetchable_attachment_fails_only_that_page() {
    let h = harness();
    h.source.put_page(diagram_page(1, 0, 1));
    h.source.break_attachment("att1");
    h.source.put_page(page("2", 1, 5, "<p>plain</p>"));

    let report = crawl(&h).await;
    assert_eq!(report.pages_updated, 1);
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.errors[0].page_id, "1");
    assert_eq!(report.errors[0].kind, "fetch");
    assert!(h.index.get("confluence-1").is_none());
    assert!(h.index.get("confluence-2").is_some());

    let wm = h.watermarks.read("DOCS").await.unwrap();
    assert_eq!(wm.last_crawl_time, None);
    assert!(wm.pages.contains_key("2"));
}

#[tokio::test]
async fn test_malformed_page_is_reported() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>unclosed <b>bold</p>"));
    h.source.put_page(page("2", 1, 5, "<p>fine</p>"));

    let report = crawl(&h).await;
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.errors[0].kind, "malformed_content");
    assert!(h.index.get("confluence-2").is_some());
}

#[tokio::test]
async fn test_deleted_pages_are_removed_from_index() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>one</p>"));
    h.source.put_page(page("2", 1, 5, "<p>two</p>"));
    crawl(&h).await;
    assert!(h.index.get("confluence-2").is_some());

    h.source.remove_page("2");
    let report = crawl(&h).await;
    assert_eq!(report.pages_deleted, 1);
    assert!(h.index.get("confluence-1").is_some());
    assert!(h.index.get("confluence-2").is_none());
}

#[tokio::test]
async fn test_empty_source_listing_does_not_wipe_index() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>one</p>"));
    crawl(&h).await;

    h.source.remove_page("1");
    let report = crawl(&h).await;
    assert_eq!(report.pages_deleted, 0);
    assert!(h.index.get("confluence-1").is_some());
}

#[tokio::test]
async fn test_held_lease_skips_run() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>one</p>"));
    h.watermarks.hold_lease("DOCS", "another-worker");

    let report = crawl(&h).await;
    assert!(report.skipped);
    assert_eq!(h.index.upsert_count(), 0);
    assert_eq!(h.watermarks.write_count(), 0);
}

#[tokio::test]
async fn test_reset_reprocesses_every_page() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>one</p>"));
    h.source.put_page(page("2", 1, 5, "<p>two</p>"));
    crawl(&h).await;
    assert_eq!(h.index.upsert_count(), 2);

    let report = h
        .crawler
        .run("DOCS", CrawlOptions { reset: true })
        .await
        .unwrap();
    assert_eq!(report.pages_scanned, 2);
    assert_eq!(report.pages_updated, 2);
    assert_eq!(h.index.upsert_count(), 4);

    let wm = h.watermarks.read("DOCS").await.unwrap();
    assert_eq!(wm.last_crawl_time, Some(at(5)));
}

#[tokio::test]
async fn test_run_many_keeps_space_order() {
    let h = harness();
    h.source.put_page(page("1", 1, 0, "<p>docs</p>"));
    let mut ops = page("9", 1, 0, "<p>ops</p>");
    ops.space_key = "OPS".to_string();
    h.source.put_page(ops);

    let results = h
        .crawler
        .run_many(
            vec!["OPS".to_string(), "DOCS".to_string()],
            CrawlOptions::default(),
        )
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "OPS");
    assert_eq!(results[1].0, "DOCS");
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap().pages_updated, 1);
    }
    assert_eq!(h.index.get("confluence-9").unwrap().space_key, "OPS");
}
