//! Confluence REST content source.
//!
//! Implements [`ContentSource`] over the Confluence Cloud/Server REST API.
//!
//! # Endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | list pages | `GET /wiki/rest/api/content?spaceKey=K&type=page&status=current&expand=version&limit=N&start=S` |
//! | fetch page | `GET /wiki/rest/api/content/{id}?expand=version,space,body.storage` |
//! | attachments | `GET /wiki/rest/api/content/{id}/child/attachment?expand=version,metadata,extensions` |
//! | download | `GET /wiki/download/attachments/{page_id}/{filename}` (up to 5 redirects) |
//!
//! Listings are paginated until a short page is returned. The REST listing
//! has no modified-since filter, so pages at or before the watermark are
//! dropped client-side.
//!
//! # Authentication
//!
//! The API token is read from the secret store under `source.token_secret`.
//! With `source.email` set the client sends HTTP Basic `email:token`
//! (Atlassian Cloud); otherwise `Bearer token` (Server/Data Center PAT).
//!
//! # Rate limiting
//!
//! Requests are paced at `source.requests_per_second`. A `429` is retried
//! after its `Retry-After` delay, other transient failures with capped
//! exponential backoff (see [`crate::retry`]).
//!
//! Each request, body included, is bounded by `source.timeout_secs`.
//! Pacing delays and backoff sleeps fall outside that bound, so a long
//! listing never times out as a whole.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::SourceConfig;
use crate::error::{KbError, Result};
use crate::models::{AttachmentRef, Page, PageSummary};
use crate::retry::{RequestPacer, RetryPolicy};
use crate::traits::{ContentSource, SecretStore};

pub struct ConfluenceSource {
    client: reqwest::Client,
    base_url: Url,
    page_size: usize,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

impl ConfluenceSource {
    /// Build a client, reading the API token from `secrets`.
    pub async fn connect(
        config: &SourceConfig,
        retry: RetryPolicy,
        secrets: &dyn SecretStore,
    ) -> Result<Self> {
        let token = secrets.get_secret(&config.token_secret).await?;
        Self::with_token(config, retry, &token)
    }

    pub fn with_token(config: &SourceConfig, retry: RetryPolicy, token: &str) -> Result<Self> {
        let auth = match &config.email {
            Some(email) => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", email, token))
            ),
            None => format!("Bearer {}", token),
        };
        let mut auth_value = HeaderValue::from_str(&auth)
            .map_err(|_| KbError::config("content source token contains invalid characters"))?;
        auth_value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| KbError::config(format!("failed to build HTTP client: {}", e)))?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| KbError::config(format!("invalid source.base_url: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size.max(1),
            pacer: RequestPacer::per_second(config.requests_per_second),
            retry,
        })
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| KbError::config("source.base_url cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// One paced, retried GET returning a successful response.
    async fn get(&self, url: &Url, what: &str) -> Result<reqwest::Response> {
        self.retry
            .run(what, || async {
                self.pacer.wait().await;
                debug!(%url, "GET");
                let resp = self.client.get(url.clone()).send().await?;
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                match KbError::from_status(status, what) {
                    KbError::RateLimited { message, .. } => Err(KbError::RateLimited {
                        message,
                        retry_after,
                    }),
                    other => Err(other),
                }
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &Url, what: &str) -> Result<T> {
        let resp = self.get(url, what).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| KbError::InvalidResponse(format!("{}: {}", what, e)))
    }

    /// Follow `start`/`limit` pagination until a short page.
    async fn paginate<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut start = 0;
        loop {
            let mut q = query.to_vec();
            q.push(("limit", self.page_size.to_string()));
            q.push(("start", start.to_string()));
            let url = self.endpoint(segments, &q)?;
            let page: Listing<T> = self.get_json(&url, what).await?;
            let n = page.results.len();
            out.extend(page.results);
            if n < self.page_size {
                break;
            }
            start += n;
        }
        Ok(out)
    }

    async fn list_space(&self, space: &str) -> Result<Vec<ContentItem>> {
        self.paginate(
            &["wiki", "rest", "api", "content"],
            &[
                ("spaceKey", space.to_string()),
                ("type", "page".to_string()),
                ("status", "current".to_string()),
                ("expand", "version".to_string()),
            ],
            "list pages",
        )
        .await
    }

    async fn list_attachments(&self, page_id: &str) -> Result<Vec<AttachmentRef>> {
        let items: Vec<AttachmentItem> = self
            .paginate(
                &["wiki", "rest", "api", "content", page_id, "child", "attachment"],
                &[("expand", "version,metadata,extensions".to_string())],
                "list attachments",
            )
            .await?;
        Ok(items
            .into_iter()
            .map(|a| AttachmentRef {
                media_type: a.media_type(),
                version: a.version.map_or(1, |v| v.number),
                id: a.id,
                page_id: page_id.to_string(),
                filename: a.title,
            })
            .collect())
    }
}

#[async_trait]
impl ContentSource for ConfluenceSource {
    async fn list_changed_pages(
        &self,
        space: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageSummary>> {
        let mut pages = Vec::new();
        for item in self.list_space(space).await? {
            let summary = item.into_summary(space)?;
            if since.map_or(true, |s| summary.last_modified > s) {
                pages.push(summary);
            }
        }
        pages.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(pages)
    }

    async fn fetch_page(&self, page_id: &str) -> Result<Page> {
        let url = self.endpoint(
            &["wiki", "rest", "api", "content", page_id],
            &[("expand", "version,space,body.storage".to_string())],
        )?;
        let item: ContentItem = self.get_json(&url, "fetch page").await?;
        let body = item
            .body
            .as_ref()
            .and_then(|b| b.storage.as_ref())
            .map(|s| s.value.clone())
            .unwrap_or_default();
        let space_key = item.space.as_ref().map(|s| s.key.clone()).unwrap_or_default();
        let summary = item.into_summary(&space_key)?;
        let attachments = self.list_attachments(page_id).await?;

        Ok(Page {
            id: summary.id,
            space_key: summary.space_key,
            title: summary.title,
            version: summary.version,
            last_modified: summary.last_modified,
            body,
            attachments,
        })
    }

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        let url = self.endpoint(
            &[
                "wiki",
                "download",
                "attachments",
                &attachment.page_id,
                &attachment.filename,
            ],
            &[],
        )?;
        let resp = self.get(&url, "download attachment").await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_page_ids(&self, space: &str) -> Result<Vec<String>> {
        Ok(self
            .list_space(space)
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect())
    }
}

// ============ REST payloads ============

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    space: Option<SpaceInfo>,
    #[serde(default)]
    body: Option<BodyInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: i64,
    #[serde(default)]
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpaceInfo {
    key: String,
}

#[derive(Debug, Deserialize)]
struct BodyInfo {
    #[serde(default)]
    storage: Option<StorageBody>,
}

#[derive(Debug, Deserialize)]
struct StorageBody {
    value: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    id: String,
    title: String,
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    extensions: Option<MediaInfo>,
    #[serde(default)]
    metadata: Option<MediaInfo>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

impl AttachmentItem {
    fn media_type(&self) -> String {
        self.extensions
            .as_ref()
            .and_then(|m| m.media_type.clone())
            .or_else(|| self.metadata.as_ref().and_then(|m| m.media_type.clone()))
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }
}

impl ContentItem {
    fn into_summary(self, space: &str) -> Result<PageSummary> {
        let version = self.version.ok_or_else(|| {
            KbError::InvalidResponse(format!("page {} has no version info", self.id))
        })?;
        let when = version.when.as_deref().ok_or_else(|| {
            KbError::InvalidResponse(format!("page {} has no modification time", self.id))
        })?;
        let last_modified = DateTime::parse_from_rfc3339(when)
            .map_err(|e| {
                KbError::InvalidResponse(format!("page {} bad timestamp '{}': {}", self.id, when, e))
            })?
            .with_timezone(&Utc);
        Ok(PageSummary {
            id: self.id,
            space_key: space.to_string(),
            title: self.title,
            version: version.number,
            last_modified,
        })
    }
}
