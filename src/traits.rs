//! Collaborator seams for the ingestion and retrieval pipelines.
//!
//! Every external system the core talks to sits behind one of these
//! traits. Production implementations live in [`crate::confluence`],
//! [`crate::s3`], [`crate::index`], [`crate::state`], [`crate::memory`],
//! [`crate::llm`] and [`crate::secrets`]; in-process fakes live in
//! `in_memory`, built for tests and the `test-support` feature.
//!
//! # Architecture
//!
//! ```text
//!  ContentSource ──▶ CrawlerService ──▶ KnowledgeIndex ◀── RetrievalAgent
//!                      │      │                              │      │
//!                      ▼      ▼                              ▼      ▼
//!              ObjectStore  WatermarkStore        ConversationMemory LanguageModel
//!              ImageLedger
//! ```
//!
//! All traits are `Send + Sync` and object-safe so collaborators can be
//! shared as `Arc<dyn Trait>` across spawned tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::models::{
    AttachmentRef, ConversationTurn, NormalizedDocument, Page, PageSummary, Prompt, SearchHit,
    StoredImage,
};
use crate::state::WatermarkRecord;

// ═══════════════════════════════════════════════════════════════════════
// Ingestion side
// ═══════════════════════════════════════════════════════════════════════

/// Read-only access to the wiki.
///
/// Implementations bound every underlying request with their own timeout.
/// A listing may span many paced requests, so callers do not wrap these
/// methods in a single deadline.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Pages in `space` modified strictly after `since` (all pages when
    /// `since` is `None`), ordered by last-modified ascending.
    async fn list_changed_pages(
        &self,
        space: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageSummary>>;

    /// Fetch a page's raw markup and attachment list.
    async fn fetch_page(&self, page_id: &str) -> Result<Page>;

    /// Fetch an attachment's binary content.
    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>>;

    /// Identifiers of every current page in `space`. Used for deletion detection.
    async fn list_page_ids(&self, space: &str) -> Result<Vec<String>>;
}

/// Durable object storage for relocated images.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// A time-limited signed read link. Generated fresh on every call.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// Last known stored image per `(page, attachment)`.
#[async_trait]
pub trait ImageLedger: Send + Sync {
    async fn lookup(&self, page_id: &str, attachment_id: &str) -> Result<Option<StoredImage>>;
    async fn record(&self, image: &StoredImage) -> Result<()>;
}

/// Per-space crawl progress with conditional writes and a run lease.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Current record, or an empty record at revision 0.
    async fn read(&self, space: &str) -> Result<WatermarkRecord>;

    /// Write `record` only if the stored revision still equals
    /// `expected_revision`. Fails with [`KbError::Conflict`](crate::error::KbError::Conflict)
    /// otherwise.
    async fn compare_and_set(&self, record: &WatermarkRecord, expected_revision: i64)
        -> Result<()>;

    /// Take the crawl lease for `space`. Returns `false` when another
    /// unexpired holder owns it.
    async fn try_acquire_lease(&self, space: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, space: &str, holder: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Shared
// ═══════════════════════════════════════════════════════════════════════

/// Searchable store of normalized documents.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    /// Insert or overwrite by document id.
    async fn upsert(&self, doc: &NormalizedDocument) -> Result<()>;

    async fn delete(&self, doc_id: &str) -> Result<()>;

    /// Top-`limit` matches, best first.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Ids of all documents indexed for `space`.
    async fn document_ids(&self, space: &str) -> Result<Vec<String>>;
}

/// Read-only credential lookup.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval side
// ═══════════════════════════════════════════════════════════════════════

/// Append-only conversation log keyed by session.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Append `turns` atomically: either all are stored or none are.
    async fn append(&self, session_id: &str, turns: &[ConversationTurn]) -> Result<()>;

    /// The last `k` turns, oldest first.
    async fn last_turns(&self, session_id: &str, k: usize) -> Result<Vec<ConversationTurn>>;
}

/// Single request/response model inference.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}
