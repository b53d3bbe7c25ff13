//! In-process implementations of every collaborator trait.
//!
//! Compiled for unit tests and behind the `test-support` feature, which
//! the integration tests enable. All state sits behind `std::sync::Mutex`;
//! no lock is held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{KbError, Result};
use crate::models::{
    AttachmentRef, ConversationTurn, NormalizedDocument, Page, PageSummary, Prompt, SearchHit,
    StoredImage,
};
use crate::state::WatermarkRecord;
use crate::traits::{
    ContentSource, ConversationMemory, ImageLedger, KnowledgeIndex, LanguageModel, ObjectStore,
    SecretStore, WatermarkStore,
};

fn poisoned<T>(_: T) -> KbError {
    KbError::Storage("in-memory lock poisoned".to_string())
}

// ============ Content source ============

/// A wiki held in memory. Pages and attachments can be edited between runs.
#[derive(Default)]
pub struct InMemorySource {
    pages: Mutex<BTreeMap<String, Page>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    missing_attachments: Mutex<HashSet<String>>,
    attachment_fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a page.
    pub fn put_page(&self, page: Page) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(page.id.clone(), page);
        }
    }

    pub fn remove_page(&self, page_id: &str) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(page_id);
        }
    }

    pub fn put_attachment_bytes(&self, attachment_id: &str, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(attachment_id.to_string(), bytes);
        }
    }

    /// Make downloads of `attachment_id` fail with `NotFound`.
    pub fn break_attachment(&self, attachment_id: &str) {
        if let Ok(mut missing) = self.missing_attachments.lock() {
            missing.insert(attachment_id.to_string());
        }
    }

    pub fn attachment_fetches(&self) -> usize {
        self.attachment_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for InMemorySource {
    async fn list_changed_pages(
        &self,
        space: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageSummary>> {
        let pages = self.pages.lock().map_err(poisoned)?;
        let mut out: Vec<PageSummary> = pages
            .values()
            .filter(|p| p.space_key == space)
            .filter(|p| since.map_or(true, |s| p.last_modified > s))
            .map(|p| PageSummary {
                id: p.id.clone(),
                space_key: p.space_key.clone(),
                title: p.title.clone(),
                version: p.version,
                last_modified: p.last_modified,
            })
            .collect();
        out.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(out)
    }

    async fn fetch_page(&self, page_id: &str) -> Result<Page> {
        let pages = self.pages.lock().map_err(poisoned)?;
        pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| KbError::NotFound(format!("page {}", page_id)))
    }

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        self.attachment_fetches.fetch_add(1, Ordering::SeqCst);
        if self
            .missing_attachments
            .lock()
            .map_err(poisoned)?
            .contains(&attachment.id)
        {
            return Err(KbError::NotFound(format!("attachment {}", attachment.id)));
        }
        let blobs = self.blobs.lock().map_err(poisoned)?;
        blobs
            .get(&attachment.id)
            .cloned()
            .ok_or_else(|| KbError::NotFound(format!("attachment {}", attachment.id)))
    }

    async fn list_page_ids(&self, space: &str) -> Result<Vec<String>> {
        let pages = self.pages.lock().map_err(poisoned)?;
        Ok(pages
            .values()
            .filter(|p| p.space_key == space)
            .map(|p| p.id.clone())
            .collect())
    }
}

// ============ Object store ============

/// Stores objects in a map and signs links with a per-call nonce.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    signatures: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let nonce = self.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "https://objects.test/{}?expires={}&sig={}-{}",
            key,
            expires_in.as_secs(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            nonce
        ))
    }
}

// ============ Image ledger ============

#[derive(Default)]
pub struct InMemoryLedger {
    images: Mutex<HashMap<(String, String), StoredImage>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageLedger for InMemoryLedger {
    async fn lookup(&self, page_id: &str, attachment_id: &str) -> Result<Option<StoredImage>> {
        let images = self.images.lock().map_err(poisoned)?;
        Ok(images
            .get(&(page_id.to_string(), attachment_id.to_string()))
            .cloned())
    }

    async fn record(&self, image: &StoredImage) -> Result<()> {
        self.images.lock().map_err(poisoned)?.insert(
            (image.page_id.clone(), image.attachment_id.clone()),
            image.clone(),
        );
        Ok(())
    }
}

// ============ Watermarks ============

#[derive(Default)]
pub struct InMemoryWatermarks {
    records: Mutex<HashMap<String, WatermarkRecord>>,
    leases: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl InMemoryWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Hold the lease for `space` as some other crawler.
    pub fn hold_lease(&self, space: &str, holder: &str) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.insert(space.to_string(), holder.to_string());
        }
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarks {
    async fn read(&self, space: &str) -> Result<WatermarkRecord> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records
            .get(space)
            .cloned()
            .unwrap_or_else(|| WatermarkRecord::empty(space)))
    }

    async fn compare_and_set(
        &self,
        record: &WatermarkRecord,
        expected_revision: i64,
    ) -> Result<()> {
        let mut records = self.records.lock().map_err(poisoned)?;
        let current = records.get(&record.space).map_or(0, |r| r.revision);
        if current != expected_revision {
            return Err(KbError::Conflict(format!(
                "watermark for '{}' is at revision {}, expected {}",
                record.space, current, expected_revision
            )));
        }
        records.insert(record.space.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn try_acquire_lease(&self, space: &str, holder: &str, _ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        if leases.contains_key(space) {
            return Ok(false);
        }
        leases.insert(space.to_string(), holder.to_string());
        Ok(true)
    }

    async fn release_lease(&self, space: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        if leases.get(space).is_some_and(|h| h == holder) {
            leases.remove(space);
        }
        Ok(())
    }
}

// ============ Knowledge index ============

/// Documents in a map; queries rank by the number of matching terms.
#[derive(Default)]
pub struct InMemoryIndex {
    docs: Mutex<BTreeMap<String, NormalizedDocument>>,
    failing: Mutex<HashSet<String>>,
    upserts: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make upserts of `doc_id` fail with a transient error.
    pub fn fail_upserts_for(&self, doc_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(doc_id.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Every query text received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn get(&self, doc_id: &str) -> Option<NormalizedDocument> {
        self.docs.lock().ok().and_then(|docs| docs.get(doc_id).cloned())
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryIndex {
    async fn upsert(&self, doc: &NormalizedDocument) -> Result<()> {
        if self.failing.lock().map_err(poisoned)?.contains(&doc.id) {
            return Err(KbError::TransientIo(format!("index unavailable for {}", doc.id)));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .map_err(poisoned)?
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<()> {
        self.docs.lock().map_err(poisoned)?.remove(doc_id);
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.queries.lock().map_err(poisoned)?.push(text.to_string());
        let terms: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let docs = self.docs.lock().map_err(poisoned)?;
        let mut hits: Vec<SearchHit> = docs
            .values()
            .filter_map(|doc| {
                let haystack = format!("{} {}", doc.title, doc.text).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then(|| SearchHit {
                    id: doc.id.clone(),
                    title: doc.title.clone(),
                    text: doc.text.clone(),
                    image_keys: doc.images.iter().map(|i| i.key.clone()).collect(),
                    score: score as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn document_ids(&self, space: &str) -> Result<Vec<String>> {
        let docs = self.docs.lock().map_err(poisoned)?;
        Ok(docs
            .values()
            .filter(|d| d.space_key == space)
            .map(|d| d.id.clone())
            .collect())
    }
}

// ============ Conversation memory ============

#[derive(Default)]
pub struct InMemoryMemory {
    sessions: Mutex<HashMap<String, Vec<ConversationTurn>>>,
    fail_reads: std::sync::atomic::AtomicBool,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `last_turns` call fail with a transient error.
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn turns(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(session_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationMemory for InMemoryMemory {
    async fn append(&self, session_id: &str, turns: &[ConversationTurn]) -> Result<()> {
        self.sessions
            .lock()
            .map_err(poisoned)?
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(turns);
        Ok(())
    }

    async fn last_turns(&self, session_id: &str, k: usize) -> Result<Vec<ConversationTurn>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(KbError::TransientIo("memory service unavailable".to_string()));
        }
        let sessions = self.sessions.lock().map_err(poisoned)?;
        let turns = sessions.get(session_id).cloned().unwrap_or_default();
        let skip = turns.len().saturating_sub(k);
        Ok(turns.into_iter().skip(skip).collect())
    }
}

// ============ Language model ============

/// Replays queued replies and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failing reply.
    pub fn push_error(&self, err: KbError) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(err));
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        self.prompts.lock().map_err(poisoned)?.push(prompt.clone());
        self.replies
            .lock()
            .map_err(poisoned)?
            .pop_front()
            .unwrap_or_else(|| Err(KbError::InvalidResponse("no scripted reply left".to_string())))
    }
}

// ============ Secrets ============

#[derive(Default)]
pub struct InMemorySecrets {
    values: HashMap<String, String>,
}

impl InMemorySecrets {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl SecretStore for InMemorySecrets {
    async fn get_secret(&self, name: &str) -> Result<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| KbError::NotFound(format!("secret '{}'", name)))
    }
}
