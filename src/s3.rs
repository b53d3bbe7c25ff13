//! S3-compatible object store for relocated images.
//!
//! Uploads with signed `PUT` requests and hands out time-limited download
//! links as SigV4 presigned `GET` URLs. Signing uses only `hmac` + `sha2`,
//! no AWS SDK.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! bucket = "kb-images"
//! region = "us-east-1"
//! prefix = "confluence-images/"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style
//! link_expiry_secs = 3600
//! ```
//!
//! # Credentials
//!
//! Read through the configured secret store:
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional
//!
//! # Addressing
//!
//! Without `endpoint_url` requests go to
//! `https://{bucket}.s3.{region}.amazonaws.com/{key}`. With it, path-style
//! `{endpoint}/{bucket}/{key}` is used.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::StorageConfig;
use crate::error::{KbError, Result};
use crate::images::hex_sha256;
use crate::retry::RetryPolicy;
use crate::traits::{ObjectStore, SecretStore};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

// ============ Credentials ============

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub async fn load(secrets: &dyn SecretStore) -> Result<Self> {
        Ok(Self {
            access_key_id: secrets.get_secret("AWS_ACCESS_KEY_ID").await?,
            secret_access_key: secrets.get_secret("AWS_SECRET_ACCESS_KEY").await?,
            session_token: secrets.get_secret("AWS_SESSION_TOKEN").await.ok(),
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

// ============ Store ============

pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint: Option<Url>,
    creds: AwsCredentials,
    retry: RetryPolicy,
}

/// Where one object lives, in the three forms signing needs.
struct Target {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig, creds: AwsCredentials, retry: RetryPolicy) -> Result<Self> {
        let endpoint = config
            .endpoint_url
            .as_deref()
            .map(|e| {
                Url::parse(e)
                    .map_err(|err| KbError::config(format!("invalid storage.endpoint_url: {}", err)))
            })
            .transpose()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| KbError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint,
            creds,
            retry,
        })
    }

    fn target(&self, key: &str) -> Target {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint {
            Some(endpoint) => {
                let host = match (endpoint.host_str(), endpoint.port()) {
                    (Some(h), Some(p)) => format!("{}:{}", h, p),
                    (Some(h), None) => h.to_string(),
                    (None, _) => String::new(),
                };
                let canonical_uri = format!("/{}/{}", uri_encode(&self.bucket), encoded_key);
                Target {
                    url: format!("{}://{}{}", endpoint.scheme(), host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                Target {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    fn scope(&self, date_stamp: &str) -> String {
        format!("{}/{}/s3/aws4_request", date_stamp, self.region)
    }

    fn sign(&self, date_stamp: &str, amz_date: &str, canonical_request: &str) -> String {
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            self.scope(date_stamp),
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            date_stamp,
            &self.region,
            "s3",
        );
        hex_hmac_sha256(&signing_key, string_to_sign.as_bytes())
    }

    /// Presigned `GET` URL for `key`, valid for `expires_in` from `now`.
    ///
    /// `X-Amz-Date` has one-second resolution, so two links for the same
    /// key signed within one second are identical. Each still expires
    /// `expires_in` after the render that produced it.
    pub fn presign_at(&self, key: &str, expires_in: Duration, now: DateTime<Utc>) -> String {
        let target = self.target(key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.creds.access_key_id, self.scope(&date_stamp)),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_in.as_secs().to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
            target.canonical_uri, canonical_querystring, target.host, UNSIGNED_PAYLOAD
        );
        let signature = self.sign(&date_stamp, &amz_date, &canonical_request);

        format!(
            "{}?{}&X-Amz-Signature={}",
            target.url, canonical_querystring, signature
        )
    }

    async fn put_once(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let target = self.target(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(bytes);

        let mut headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            target.canonical_uri, canonical_headers, signed_headers, payload_hash
        );
        let signature = self.sign(&date_stamp, &amz_date, &canonical_request);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id,
            self.scope(&date_stamp),
            signed_headers,
            signature
        );

        let mut req = self
            .client
            .put(&target.url)
            .header("Authorization", authorization)
            .header("Content-Type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .body(bytes.to_vec());
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KbError::from_status(
                status,
                format!("S3 PutObject s3://{}/{}", self.bucket, key),
            ));
        }
        debug!(bucket = %self.bucket, key, "object stored");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.retry
            .run("object upload", || self.put_once(key, &bytes, content_type))
            .await
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(self.presign_at(key, expires_in, Utc::now()))
    }
}

// ============ AWS SigV4 Helpers ============

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}
