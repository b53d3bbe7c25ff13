//! Wiring: builds the production collaborators from configuration.
//!
//! [`AppContext`] owns the SQLite pool and the secret store; crawl and
//! agent services are assembled on demand so a command only reads the
//! credentials it needs (`wkb status` needs none).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::agent::{AgentSettings, RetrievalAgent};
use crate::config::Config;
use crate::confluence::ConfluenceSource;
use crate::crawler::{CrawlSettings, CrawlerService};
use crate::db;
use crate::error::Result;
use crate::images::ImageRelocator;
use crate::index::SqliteIndex;
use crate::llm::OpenAiCompatibleModel;
use crate::memory::SqliteMemory;
use crate::migrate;
use crate::render::CitationRenderer;
use crate::retry::RetryPolicy;
use crate::s3::{AwsCredentials, S3ObjectStore};
use crate::secrets::create_secret_store;
use crate::state::SqliteStateStore;
use crate::traits::{SecretStore, WatermarkStore};

/// Sync progress for one configured space.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceStatus {
    pub space: String,
    /// Display name from configuration; empty when unset.
    pub name: String,
    pub last_crawl_time: Option<DateTime<Utc>>,
    /// Pages committed past the watermark, waiting on an earlier failure.
    pub pending_pages: usize,
    pub documents: i64,
}

pub struct AppContext {
    config: Config,
    pool: SqlitePool,
    secrets: Arc<dyn SecretStore>,
}

impl AppContext {
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        let secrets = create_secret_store(&config.secrets)?;
        Ok(Self {
            config: config.clone(),
            pool,
            secrets,
        })
    }

    async fn object_store(&self) -> Result<Arc<S3ObjectStore>> {
        let creds = AwsCredentials::load(self.secrets.as_ref()).await?;
        Ok(Arc::new(S3ObjectStore::new(
            &self.config.storage,
            creds,
            RetryPolicy::from_crawl(&self.config.crawl),
        )?))
    }

    pub async fn crawler(&self) -> Result<Arc<CrawlerService>> {
        let retry = RetryPolicy::from_crawl(&self.config.crawl);
        let source = Arc::new(
            ConfluenceSource::connect(&self.config.source, retry, self.secrets.as_ref()).await?,
        );
        let store = self.object_store().await?;
        let state = Arc::new(SqliteStateStore::new(self.pool.clone()));
        let index = Arc::new(SqliteIndex::new(self.pool.clone()));

        let relocator = Arc::new(ImageRelocator::new(
            source.clone(),
            store,
            state.clone(),
            self.config.storage.prefix.clone(),
            self.config.crawl.call_timeout(),
        ));
        Ok(Arc::new(CrawlerService::new(
            source,
            index,
            state,
            relocator,
            CrawlSettings::from_config(&self.config),
        )))
    }

    pub async fn agent(&self) -> Result<RetrievalAgent> {
        let settings = AgentSettings::from_config(&self.config.retrieval);
        let model =
            Arc::new(OpenAiCompatibleModel::connect(&self.config.llm, self.secrets.as_ref()).await?);
        let renderer = CitationRenderer::new(
            self.object_store().await?,
            self.config.storage.link_expiry(),
            settings.call_timeout,
        );
        Ok(RetrievalAgent::new(
            Arc::new(SqliteIndex::new(self.pool.clone())),
            Arc::new(SqliteMemory::new(self.pool.clone())),
            model,
            renderer,
            settings,
        ))
    }

    /// Watermark and document count for each configured space.
    pub async fn status(&self) -> Result<Vec<SpaceStatus>> {
        let state = SqliteStateStore::new(self.pool.clone());
        let index = SqliteIndex::new(self.pool.clone());
        let mut out = Vec::with_capacity(self.config.spaces.len());
        for space in &self.config.spaces {
            let record = state.read(&space.key).await?;
            out.push(SpaceStatus {
                space: space.key.clone(),
                name: space.name.clone(),
                last_crawl_time: record.last_crawl_time,
                pending_pages: record.pages.len(),
                documents: index.count(&space.key).await?,
            });
        }
        Ok(out)
    }

    pub fn spaces(&self) -> Vec<String> {
        self.config.spaces.iter().map(|s| s.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    #[tokio::test]
    async fn status_lists_configured_spaces_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kb.sqlite");
        let config_path = dir.path().join("wkb.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[db]
path = "{}"

[source]
base_url = "https://example.atlassian.net"

[[spaces]]
key = "DOCS"
name = "Engineering docs"

[[spaces]]
key = "OPS"

[storage]
bucket = "kb-images"
"#,
                db_path.display()
            ),
        )
        .unwrap();
        let config = load_config(&config_path).unwrap();

        let ctx = AppContext::open(&config).await.unwrap();
        let status = ctx.status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].space, "DOCS");
        assert_eq!(status[0].name, "Engineering docs");
        assert_eq!(status[0].documents, 0);
        assert!(status[0].last_crawl_time.is_none());
        assert_eq!(status[1].name, "");
        assert_eq!(ctx.spaces(), vec!["DOCS".to_string(), "OPS".to_string()]);
    }
}
