//! Core data models used throughout the knowledge base.
//!
//! These types represent the pages, documents, images, and conversation
//! turns that flow through the ingestion and retrieval pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named collection of pages; the unit of crawl scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub key: String,
    #[serde(default)]
    pub name: String,
}

/// Listing entry for a page, as returned by the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub id: String,
    pub space_key: String,
    pub title: String,
    pub version: i64,
    pub last_modified: DateTime<Utc>,
}

/// A fully fetched page with its raw storage markup.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: String,
    pub space_key: String,
    pub title: String,
    pub version: i64,
    pub last_modified: DateTime<Utc>,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
}

/// A binary asset attached to a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: String,
    pub page_id: String,
    pub filename: String,
    pub media_type: String,
    pub version: i64,
}

impl AttachmentRef {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// An embedded image found by the content processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlaceholder {
    /// Token left in the normalized text; see [`crate::content::placeholder_token`].
    pub token: String,
    pub filename: String,
    pub alt: String,
}

/// A placeholder resolved to a stored image key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBinding {
    pub token: String,
    pub key: String,
}

/// Normalized document pushed to the knowledge index.
///
/// `id` is stable across re-ingestion of the same page, so repeated
/// upserts overwrite rather than append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDocument {
    pub id: String,
    pub space_key: String,
    pub page_id: String,
    pub title: String,
    pub url: String,
    pub text: String,
    pub images: Vec<ImageBinding>,
    pub version: i64,
    pub last_modified: DateTime<Utc>,
}

impl NormalizedDocument {
    /// Document identifier for a wiki page.
    pub fn id_for_page(page_id: &str) -> String {
        format!("confluence-{}", page_id)
    }
}

/// An image relocated to durable storage. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub key: String,
    pub content_hash: String,
    pub page_id: String,
    pub attachment_id: String,
    pub attachment_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One entry of a session's append-only conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A ranked match returned by the knowledge index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub text: String,
    pub image_keys: Vec<String>,
    pub score: f64,
}

/// A search hit bound to its 1-based citation rank for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub rank: usize,
    pub id: String,
    pub title: String,
    pub text: String,
    pub image_keys: Vec<String>,
}

/// Raw model output, possibly containing citation markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedAnswer {
    pub text: String,
}

/// Final sanitized markup for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedAnswer {
    pub markup: String,
    /// Number of unsafe fragments the sanitizer removed.
    pub dropped_fragments: usize,
}

/// A single message in a model prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Instructions plus conversation sent to the language model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(PromptMessage {
            role: role.as_str().to_string(),
            content: content.into(),
        });
    }
}

/// A page that could not be ingested during a crawl run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageError {
    pub page_id: String,
    pub kind: String,
    pub message: String,
}

/// Summary of one crawl run over a space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub space: String,
    pub pages_scanned: usize,
    pub pages_updated: usize,
    pub pages_unchanged: usize,
    pub pages_failed: usize,
    pub pages_deleted: usize,
    pub images_relocated: usize,
    /// True when another run held the space lease and nothing was done.
    pub skipped: bool,
    pub errors: Vec<PageError>,
}
