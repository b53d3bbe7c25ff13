//! Incremental crawl of one wiki space into the knowledge index.
//!
//! # Flow
//!
//! ```text
//! lease ─▶ read watermark ─▶ list changed pages ─▶ ┌ page worker ┐ ─▶ merge ─▶ CAS write ─▶ deletions ─▶ release
//!                                                  │ fetch       │
//!                                                  │ transform   │  (bounded by
//!                                                  │ relocate    │   crawl.concurrency)
//!                                                  │ upsert      │
//!                                                  └─────────────┘
//! ```
//!
//! Each page is committed to the index independently. The watermark is
//! written once, after all workers finish, by [`state::merge`], so a crash
//! mid-run re-processes pages instead of losing them.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::content::{self, image_reference, markdown_label};
use crate::error::{KbError, Result};
use crate::images::ImageRelocator;
use crate::models::{CrawlReport, ImageBinding, NormalizedDocument, PageError, PageSummary};
use crate::retry::with_timeout;
use crate::state::{self, PageOutcome, WatermarkRecord};
use crate::traits::{ContentSource, KnowledgeIndex, WatermarkStore};

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub lease_ttl: Duration,
    pub detect_deletions: bool,
    /// Wiki base URL used to build page links.
    pub base_url: String,
}

impl CrawlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.crawl.concurrency.max(1),
            call_timeout: config.crawl.call_timeout(),
            lease_ttl: Duration::from_secs(config.crawl.lease_ttl_secs),
            detect_deletions: config.crawl.detect_deletions,
            base_url: config.source.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOptions {
    /// Ignore the stored watermark and re-list every page.
    pub reset: bool,
}

pub struct CrawlerService {
    worker: Arc<PageWorker>,
    watermarks: Arc<dyn WatermarkStore>,
    settings: CrawlSettings,
}

impl CrawlerService {
    pub fn new(
        source: Arc<dyn ContentSource>,
        index: Arc<dyn KnowledgeIndex>,
        watermarks: Arc<dyn WatermarkStore>,
        relocator: Arc<ImageRelocator>,
        settings: CrawlSettings,
    ) -> Self {
        let worker = Arc::new(PageWorker {
            source,
            index,
            relocator,
            call_timeout: settings.call_timeout,
            base_url: settings.base_url.clone(),
        });
        Self {
            worker,
            watermarks,
            settings,
        }
    }

    /// Crawl several spaces concurrently. Results keep the input order.
    pub async fn run_many(
        self: &Arc<Self>,
        spaces: Vec<String>,
        opts: CrawlOptions,
    ) -> Vec<(String, Result<CrawlReport>)> {
        let mut set = JoinSet::new();
        for (i, space) in spaces.iter().cloned().enumerate() {
            let svc = Arc::clone(self);
            set.spawn(async move {
                let result = svc.run(&space, opts).await;
                (i, space, result)
            });
        }

        let mut results: Vec<Option<(String, Result<CrawlReport>)>> =
            spaces.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, space, result)) => results[i] = Some((space, result)),
                Err(e) => warn!(error = %e, "crawl task panicked"),
            }
        }
        results
            .into_iter()
            .zip(spaces)
            .map(|(r, space)| {
                r.unwrap_or_else(|| {
                    let err = KbError::Storage(format!("crawl task for '{}' aborted", space));
                    (space, Err(err))
                })
            })
            .collect()
    }

    /// Crawl one space. Returns a `skipped` report when another run holds
    /// the space's lease.
    #[instrument(skip_all, fields(space = %space, reset = opts.reset))]
    pub async fn run(&self, space: &str, opts: CrawlOptions) -> Result<CrawlReport> {
        let holder = Uuid::new_v4().to_string();
        let acquired = self.call("acquire lease", self.watermarks.try_acquire_lease(
            space,
            &holder,
            self.settings.lease_ttl,
        ))
        .await?;
        if !acquired {
            info!("another crawl holds the lease, skipping");
            return Ok(CrawlReport {
                space: space.to_string(),
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.run_locked(space, opts).await;

        if let Err(e) = self
            .call("release lease", self.watermarks.release_lease(space, &holder))
            .await
        {
            warn!(error = %e, "failed to release crawl lease");
        }
        result
    }

    async fn run_locked(&self, space: &str, opts: CrawlOptions) -> Result<CrawlReport> {
        let mut prev = self.call("read watermark", self.watermarks.read(space)).await?;
        if opts.reset {
            prev = WatermarkRecord {
                revision: prev.revision,
                ..WatermarkRecord::empty(space)
            };
        }

        // Source calls span many paced requests; the source bounds each one.
        let listed = self
            .worker
            .source
            .list_changed_pages(space, prev.last_crawl_time)
            .await?;

        let mut report = CrawlReport {
            space: space.to_string(),
            pages_scanned: listed.len(),
            ..Default::default()
        };

        let (unchanged, mut pending): (Vec<_>, Vec<_>) =
            listed.into_iter().partition(|p| prev.is_current(p));
        report.pages_unchanged = unchanged.len();
        pending.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));

        info!(
            since = ?prev.last_crawl_time,
            pending = pending.len(),
            unchanged = report.pages_unchanged,
            "starting crawl"
        );

        // Pages already committed at this version still let the watermark move past them.
        let mut outcomes: Vec<PageOutcome> = unchanged
            .iter()
            .map(|p| PageOutcome::Committed {
                page_id: p.id.clone(),
                version: p.version,
                modified: p.last_modified,
            })
            .collect();
        let (processed, fatal) = self.process_pages(space, pending, &mut report).await;
        outcomes.extend(processed);

        let next = state::merge(&prev, &outcomes);
        if next.same_progress(&prev) {
            debug!("watermark unchanged");
        } else {
            self.call(
                "write watermark",
                self.watermarks.compare_and_set(&next, prev.revision),
            )
            .await?;
            info!(watermark = ?next.last_crawl_time, remembered = next.pages.len(), "watermark advanced");
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        if self.settings.detect_deletions {
            report.pages_deleted = self.remove_deleted(space).await;
        }

        info!(
            scanned = report.pages_scanned,
            updated = report.pages_updated,
            failed = report.pages_failed,
            images = report.images_relocated,
            deleted = report.pages_deleted,
            "crawl finished"
        );
        Ok(report)
    }

    /// Run page workers with bounded concurrency. Returns each page's
    /// outcome and the first run-fatal error, if any.
    async fn process_pages(
        &self,
        space: &str,
        pending: Vec<PageSummary>,
        report: &mut CrawlReport,
    ) -> (Vec<PageOutcome>, Option<KbError>) {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let abort = Arc::new(AtomicBool::new(false));
        let mut set = JoinSet::new();
        let mut modified_by_id: HashMap<String, DateTime<Utc>> = HashMap::new();

        for page in pending {
            modified_by_id.insert(page.id.clone(), page.last_modified);
            let worker = Arc::clone(&self.worker);
            let semaphore = Arc::clone(&semaphore);
            let abort = Arc::clone(&abort);
            let space = space.to_string();
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) if !abort.load(Ordering::SeqCst) => {
                        let result = worker.process(&space, &page).await;
                        if matches!(result, Err(KbError::Auth(_))) {
                            abort.store(true, Ordering::SeqCst);
                        }
                        result
                    }
                    Ok(_) => Err(KbError::Auth(
                        "run aborted after credential failure".to_string(),
                    )),
                    Err(e) => Err(KbError::Storage(e.to_string())),
                };
                (page, result)
            });
        }

        let mut outcomes = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            let (page, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "page task panicked");
                    continue;
                }
            };
            match result {
                Ok(uploaded) => {
                    report.pages_updated += 1;
                    report.images_relocated += uploaded;
                    outcomes.push(PageOutcome::Committed {
                        page_id: page.id.clone(),
                        version: page.version,
                        modified: page.last_modified,
                    });
                }
                Err(err) => {
                    warn!(page_id = %page.id, title = %page.title, error = %err, "page failed");
                    report.pages_failed += 1;
                    report.errors.push(PageError {
                        page_id: page.id.clone(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                    outcomes.push(PageOutcome::Failed {
                        page_id: page.id.clone(),
                        modified: page.last_modified,
                    });
                    if matches!(err, KbError::Auth(_)) && fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
            modified_by_id.remove(&page.id);
        }

        // A panicked task never reported; hold the watermark before it.
        for (page_id, modified) in modified_by_id {
            report.pages_failed += 1;
            report.errors.push(PageError {
                page_id: page_id.clone(),
                kind: "panic".to_string(),
                message: "page worker panicked".to_string(),
            });
            outcomes.push(PageOutcome::Failed { page_id, modified });
        }

        report.errors.sort_by(|a, b| a.page_id.cmp(&b.page_id));
        (outcomes, fatal)
    }

    /// Best-effort: delete indexed documents whose page no longer exists.
    async fn remove_deleted(&self, space: &str) -> usize {
        let live = match self.worker.source.list_page_ids(space).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "deletion check skipped: listing failed");
                return 0;
            }
        };
        let indexed = match self
            .call("list indexed ids", self.worker.index.document_ids(space))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "deletion check skipped: index listing failed");
                return 0;
            }
        };

        if live.is_empty() && !indexed.is_empty() {
            warn!(
                indexed = indexed.len(),
                "deletion check skipped: source listed no pages"
            );
            return 0;
        }

        let live: HashSet<String> = live
            .iter()
            .map(|id| NormalizedDocument::id_for_page(id))
            .collect();
        let mut deleted = 0;
        for doc_id in indexed.into_iter().filter(|id| !live.contains(id)) {
            match self
                .call("delete document", self.worker.index.delete(&doc_id))
                .await
            {
                Ok(()) => {
                    info!(doc_id = %doc_id, "removed deleted page");
                    deleted += 1;
                }
                Err(e) => warn!(doc_id = %doc_id, error = %e, "failed to remove deleted page"),
            }
        }
        deleted
    }

    async fn call<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(self.settings.call_timeout, what, fut).await
    }
}

/// The per-page transform → relocate → upsert sequence.
struct PageWorker {
    source: Arc<dyn ContentSource>,
    index: Arc<dyn KnowledgeIndex>,
    relocator: Arc<ImageRelocator>,
    call_timeout: Duration,
    base_url: String,
}

impl PageWorker {
    /// Returns the number of images uploaded for this page.
    #[instrument(skip_all, fields(page_id = %summary.id))]
    async fn process(&self, space: &str, summary: &PageSummary) -> Result<usize> {
        let page = self.source.fetch_page(&summary.id).await?;

        let transformed = content::transform(&page.body)?;

        let by_filename: HashMap<&str, _> = page
            .attachments
            .iter()
            .map(|a| (a.filename.as_str(), a))
            .collect();

        let mut text = transformed.text;
        let mut images = Vec::new();
        let mut uploaded = 0;
        for placeholder in &transformed.placeholders {
            let alt = if placeholder.alt.is_empty() {
                &placeholder.filename
            } else {
                &placeholder.alt
            };
            let replacement = match by_filename.get(placeholder.filename.as_str()) {
                Some(attachment) if attachment.is_image() => {
                    let relocated = self.relocator.relocate(&page.id, attachment).await?;
                    if relocated.uploaded {
                        uploaded += 1;
                    }
                    images.push(ImageBinding {
                        token: placeholder.token.clone(),
                        key: relocated.image.key.clone(),
                    });
                    image_reference(alt, &relocated.image.key)
                }
                Some(attachment) => {
                    debug!(filename = %attachment.filename, media_type = %attachment.media_type, "not an image");
                    markdown_label(alt)
                }
                None => {
                    warn!(filename = %placeholder.filename, "image attachment missing from page");
                    markdown_label(alt)
                }
            };
            text = text.replacen(&placeholder.token, &replacement, 1);
        }

        let doc = NormalizedDocument {
            id: NormalizedDocument::id_for_page(&page.id),
            space_key: space.to_string(),
            page_id: page.id.clone(),
            title: page.title.clone(),
            url: format!("{}/wiki/spaces/{}/pages/{}", self.base_url, space, page.id),
            text,
            images,
            version: page.version,
            last_modified: page.last_modified,
        };

        with_timeout(self.call_timeout, "index upsert", self.index.upsert(&doc)).await?;
        debug!(version = page.version, images = doc.images.len(), "page committed");
        Ok(uploaded)
    }
}
