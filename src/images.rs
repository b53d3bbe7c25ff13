//! Relocates page attachments into durable object storage.
//!
//! Stored objects are write-once: the key embeds a prefix of the content
//! hash, so a changed attachment lands under a new key and an unchanged
//! one is never uploaded again.
//!
//! # Key layout
//!
//! ```text
//! {prefix}{page_id}/{attachment_id}/{sha256[..16]}-{filename}
//! ```

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{KbError, Result};
use crate::models::{AttachmentRef, StoredImage};
use crate::retry::with_timeout;
use crate::traits::{ContentSource, ImageLedger, ObjectStore};

/// A relocated image and whether this call uploaded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocated {
    pub image: StoredImage,
    pub uploaded: bool,
}

pub struct ImageRelocator {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn ImageLedger>,
    prefix: String,
    call_timeout: Duration,
}

impl ImageRelocator {
    pub fn new(
        source: Arc<dyn ContentSource>,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn ImageLedger>,
        prefix: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            ledger,
            prefix: prefix.into(),
            call_timeout,
        }
    }

    /// Make `attachment` available in object storage.
    ///
    /// Short-circuits without downloading when the ledger already holds
    /// this attachment version, and without uploading when the downloaded
    /// bytes hash to the recorded value. A source asset that cannot be
    /// fetched yields [`KbError::Fetch`]; credential failures stay
    /// [`KbError::Auth`] so the caller can stop the run.
    pub async fn relocate(&self, page_id: &str, attachment: &AttachmentRef) -> Result<Relocated> {
        let previous = with_timeout(
            self.call_timeout,
            "image ledger lookup",
            self.ledger.lookup(page_id, &attachment.id),
        )
        .await?;

        if let Some(prev) = &previous {
            if prev.attachment_version == attachment.version {
                debug!(page_id, attachment = %attachment.filename, "attachment unchanged");
                return Ok(Relocated {
                    image: prev.clone(),
                    uploaded: false,
                });
            }
        }

        let bytes = with_timeout(
            self.call_timeout,
            "attachment download",
            self.source.fetch_attachment(attachment),
        )
        .await
        .map_err(|e| match e {
            KbError::Auth(_) => e,
            other => KbError::Fetch(format!(
                "attachment '{}' on page {}: {}",
                attachment.filename, page_id, other
            )),
        })?;

        let content_hash = hex_sha256(&bytes);

        if let Some(prev) = previous {
            if prev.content_hash == content_hash {
                let image = StoredImage {
                    attachment_version: attachment.version,
                    ..prev
                };
                with_timeout(
                    self.call_timeout,
                    "image ledger record",
                    self.ledger.record(&image),
                )
                .await?;
                return Ok(Relocated {
                    image,
                    uploaded: false,
                });
            }
        }

        let key = image_key(
            &self.prefix,
            page_id,
            &attachment.id,
            &content_hash,
            &attachment.filename,
        );
        with_timeout(
            self.call_timeout,
            "image upload",
            self.store
                .put_object(&key, bytes, &attachment.media_type),
        )
        .await?;

        let image = StoredImage {
            key,
            content_hash,
            page_id: page_id.to_string(),
            attachment_id: attachment.id.clone(),
            attachment_version: attachment.version,
        };
        with_timeout(
            self.call_timeout,
            "image ledger record",
            self.ledger.record(&image),
        )
        .await?;

        debug!(page_id, key = %image.key, "image uploaded");
        Ok(Relocated {
            image,
            uploaded: true,
        })
    }
}

pub fn image_key(
    prefix: &str,
    page_id: &str,
    attachment_id: &str,
    content_hash: &str,
    filename: &str,
) -> String {
    let short = &content_hash[..content_hash.len().min(16)];
    format!(
        "{}{}/{}/{}-{}",
        prefix,
        safe_segment(page_id),
        safe_segment(attachment_id),
        short,
        safe_segment(filename)
    )
}

/// Keep `[A-Za-z0-9._-]`; everything else becomes `_`.
fn safe_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let hash = hex_sha256(b"png-bytes");
        let key = image_key("imgs/", "123", "att9", &hash, "my diagram (v2).png");
        assert_eq!(
            key,
            format!("imgs/123/att9/{}-my_diagram__v2_.png", &hash[..16])
        );
    }
}
