//! Crawling through the Confluence REST client against a mock wiki.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wiki_kb::config::SourceConfig;
use wiki_kb::confluence::ConfluenceSource;
use wiki_kb::crawler::{CrawlOptions, CrawlSettings, CrawlerService};
use wiki_kb::images::ImageRelocator;
use wiki_kb::in_memory::{InMemoryIndex, InMemoryLedger, InMemoryObjectStore, InMemoryWatermarks};
use wiki_kb::retry::RetryPolicy;
use wiki_kb::traits::WatermarkStore;

const PAGES: usize = 8;

fn modified(i: usize) -> String {
    format!("2024-03-01T09:{:02}:00.000Z", i)
}

fn listed(i: usize) -> Value {
    json!({"id": i.to_string(), "title": format!("Page {}", i),
           "version": {"number": 1, "when": modified(i)}})
}

async fn mock_wiki(server: &MockServer) {
    // One page per listing request, then an empty page to end pagination.
    for start in 0..=PAGES {
        let results = if start < PAGES {
            vec![listed(start + 1)]
        } else {
            Vec::new()
        };
        Mock::given(method("GET"))
            .and(path("/wiki/rest/api/content"))
            .and(query_param("start", start.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
            .mount(server)
            .await;
    }
    // A rate limit mid-listing; its back-off must not count against the call timeout.
    Mock::given(method("GET"))
        .and(path("/wiki/rest/api/content"))
        .and(query_param("start", "3"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    for i in 1..=PAGES {
        Mock::given(method("GET"))
            .and(path(format!("/wiki/rest/api/content/{}", i)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": i.to_string(),
                "title": format!("Page {}", i),
                "space": {"key": "DOCS"},
                "version": {"number": 1, "when": modified(i)},
                "body": {"storage": {"value": format!("<p>Body of page {}.</p>", i)}}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/wiki/rest/api/content/{}/child/attachment", i)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_paced_listing_outlasts_call_timeout() {
    let server = MockServer::start().await;
    mock_wiki(&server).await;

    let source = Arc::new(
        ConfluenceSource::with_token(
            &SourceConfig {
                base_url: server.uri(),
                email: None,
                token_secret: "TOKEN".into(),
                timeout_secs: 5,
                page_size: 1,
                requests_per_second: 20.0,
            },
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(200),
            },
            "secret-token",
        )
        .unwrap(),
    );
    let index = Arc::new(InMemoryIndex::new());
    let watermarks = Arc::new(InMemoryWatermarks::new());
    let relocator = Arc::new(ImageRelocator::new(
        source.clone(),
        Arc::new(InMemoryObjectStore::new()),
        Arc::new(InMemoryLedger::new()),
        "imgs/",
        Duration::from_secs(5),
    ));
    let call_timeout = Duration::from_millis(100);
    let crawler = CrawlerService::new(
        source,
        index.clone(),
        watermarks.clone(),
        relocator,
        CrawlSettings {
            concurrency: 2,
            call_timeout,
            lease_ttl: Duration::from_secs(60),
            detect_deletions: false,
            base_url: server.uri(),
        },
    );

    let started = Instant::now();
    let report = crawler
        .run("DOCS", CrawlOptions::default())
        .await
        .expect("paced listing should not time out");
    assert!(started.elapsed() > call_timeout * 5);

    assert_eq!(report.pages_scanned, PAGES);
    assert_eq!(report.pages_updated, PAGES);
    assert_eq!(report.pages_failed, 0);
    let doc = index.get("confluence-8").expect("last page indexed");
    assert_eq!(doc.text, "Body of page 8.");

    let wm = watermarks.read("DOCS").await.unwrap();
    assert_eq!(
        wm.last_crawl_time,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 8, 0).unwrap())
    );
}
