use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Space;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    pub spaces: Vec<Space>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    /// Account email. Basic auth is used when set, bearer auth otherwise.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_token_secret")]
    pub token_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
}

fn default_token_secret() -> String {
    "CONFLUENCE_API_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_size() -> usize {
    100
}
fn default_requests_per_second() -> f64 {
    5.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_link_expiry_secs")]
    pub link_expiry_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_prefix() -> String {
    "confluence-images/".to_string()
}
fn default_link_expiry_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_crawl_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub detect_deletions: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            call_timeout_secs: default_crawl_call_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            detect_deletions: true,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_crawl_call_timeout_secs() -> u64 {
    60
}
fn default_lease_ttl_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Covers one model call including its retries, so it exceeds `llm.timeout_secs`.
    #[serde(default = "default_turn_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            history_turns: default_history_turns(),
            call_timeout_secs: default_turn_call_timeout_secs(),
        }
    }
}

fn default_turn_call_timeout_secs() -> u64 {
    120
}
fn default_top_n() -> usize {
    3
}
fn default_history_turns() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_secret")]
    pub api_key_secret: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_secret: default_api_key_secret(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_secret() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_provider")]
    pub provider: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: default_secrets_provider(),
            dir: None,
        }
    }
}

fn default_secrets_provider() -> String {
    "env".to_string()
}

impl CrawlConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl StorageConfig {
    pub fn link_expiry(&self) -> Duration {
        Duration::from_secs(self.link_expiry_secs)
    }
}

impl Config {
    /// Look up a configured space by key.
    pub fn space(&self, key: &str) -> Option<&Space> {
        self.spaces.iter().find(|s| s.key == key)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.spaces.is_empty() {
        anyhow::bail!("at least one [[spaces]] entry is required");
    }
    let mut seen = HashSet::new();
    for space in &config.spaces {
        if space.key.trim().is_empty() {
            anyhow::bail!("spaces.key must not be empty");
        }
        if !seen.insert(space.key.as_str()) {
            anyhow::bail!("duplicate space key: '{}'", space.key);
        }
    }

    url::Url::parse(&config.source.base_url)
        .with_context(|| format!("source.base_url is not a URL: {}", config.source.base_url))?;
    if config.source.page_size == 0 {
        anyhow::bail!("source.page_size must be >= 1");
    }
    let rps = config.source.requests_per_second;
    if rps.is_nan() || rps <= 0.0 {
        anyhow::bail!("source.requests_per_second must be > 0");
    }

    if config.storage.bucket.trim().is_empty() {
        anyhow::bail!("storage.bucket must not be empty");
    }
    if !(1..=604_800).contains(&config.storage.link_expiry_secs) {
        anyhow::bail!("storage.link_expiry_secs must be in [1, 604800]");
    }

    if config.crawl.concurrency == 0 {
        anyhow::bail!("crawl.concurrency must be >= 1");
    }
    if config.retrieval.top_n == 0 {
        anyhow::bail!("retrieval.top_n must be >= 1");
    }

    match config.secrets.provider.as_str() {
        "env" => {}
        "file" => {
            if config.secrets.dir.is_none() {
                anyhow::bail!("secrets.dir is required when provider is 'file'");
            }
        }
        other => anyhow::bail!(
            "Unknown secrets provider: '{}'. Must be env or file.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[db]
path = "./data/wkb.sqlite"

[source]
base_url = "https://example.atlassian.net"

[[spaces]]
key = "DOCS"

[storage]
bucket = "kb-images"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.retrieval.top_n, 3);
        assert_eq!(config.storage.link_expiry_secs, 3600);
        assert_eq!(config.storage.prefix, "confluence-images/");
        assert_eq!(config.crawl.concurrency, 4);
        assert_eq!(config.crawl.call_timeout_secs, 60);
        assert_eq!(config.retrieval.call_timeout_secs, 120);
        assert_eq!(config.server.bind, "127.0.0.1:7331");
        assert_eq!(config.secrets.provider, "env");
        assert!(config.space("DOCS").is_some());
    }

    #[test]
    fn example_config_is_valid() {
        let file = write_config(include_str!("../config/wkb.example.toml"));
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.spaces.len(), 2);
        assert_eq!(config.source.email.as_deref(), Some("bot@example.com"));
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.crawl.call_timeout_secs, 60);
        assert_eq!(config.spaces[0].name, "Engineering docs");
    }

    #[test]
    fn duplicate_space_keys_rejected() {
        let content = format!("{}\n[[spaces]]\nkey = \"DOCS\"\n", MINIMAL);
        let file = write_config(&content);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate space key"));
    }

    #[test]
    fn zero_top_n_rejected() {
        let content = format!("{}\n[retrieval]\ntop_n = 0\n", MINIMAL);
        let file = write_config(&content);
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn file_secrets_require_dir() {
        let content = format!("{}\n[secrets]\nprovider = \"file\"\n", MINIMAL);
        let file = write_config(&content);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("secrets.dir"));
    }
}
