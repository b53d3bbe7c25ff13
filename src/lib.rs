//! # Wiki Knowledge Base
//!
//! Keeps a searchable knowledge base synchronized with a Confluence wiki
//! and answers questions with cited, sanitized markup.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Confluence │──▶│   Crawler    │──▶│ SQLite FTS5  │
//! │   (REST)   │   │ xform+images │   │    index     │
//! └────────────┘   └──────┬───────┘   └──────┬───────┘
//!                         ▼                  ▼
//!                    ┌─────────┐      ┌─────────────┐   ┌──────────┐
//!                    │   S3    │◀─────│ Agent+Render│◀──│ CLI/HTTP │
//!                    └─────────┘      └─────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wkb init                         # create database
//! wkb crawl all                    # ingest every configured space
//! wkb ask --session me "How do we rotate signing keys?"
//! wkb serve                        # POST /ask
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | Collaborator seams |
//! | [`retry`] | Timeouts, backoff, request pacing |
//! | [`content`] | Wiki markup → normalized text |
//! | [`images`] | Attachment relocation to object storage |
//! | [`state`] | Watermarks, leases, image ledger |
//! | [`crawler`] | Incremental per-space ingestion |
//! | [`confluence`] | Confluence REST content source |
//! | [`s3`] | S3 object store (SigV4) |
//! | [`secrets`] | Env / file secret stores |
//! | [`index`] | SQLite FTS5 knowledge index |
//! | [`memory`] | Conversation memory |
//! | [`llm`] | OpenAI-compatible model client |
//! | [`agent`] | Retrieval agent state machine |
//! | [`render`] | Citation expansion and rendering |
//! | [`sanitize`] | Allow-list HTML sanitizer |
//! | [`server`] | HTTP agent server |
//! | [`app`] | Production wiring |
//! | `in_memory` | In-process collaborators for tests (`test-support` feature) |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent;
pub mod app;
pub mod config;
pub mod confluence;
pub mod content;
pub mod crawler;
pub mod db;
pub mod error;
pub mod images;
#[cfg(any(test, feature = "test-support"))]
pub mod in_memory;
pub mod index;
pub mod llm;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod render;
pub mod retry;
pub mod s3;
pub mod sanitize;
pub mod secrets;
pub mod server;
pub mod state;
pub mod traits;
