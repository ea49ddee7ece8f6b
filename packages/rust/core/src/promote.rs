//! Promotion of an approved staging record into the public catalog.
//!
//! 1. Skip if the published record already exists.
//! 2. Build the published record.
//! 3. Copy the word list blob into the published namespace.
//! 4. Poll until the copy is visible.
//! 5. Insert the published record, only if it does not exist yet.
//! 6. If the insert fails, delete the copied blob again.
//!
//! Safe to repeat for the same record: a second run stops at step 1, and a
//! concurrent run that loses the race at step 5 leaves the winner's blob
//! alone.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lexiforge_shared::{
    LexiforgeError, PromotionConfig, PublishedRecord, Result, ResultExt, StagingRecord,
};
use lexiforge_storage::{BlobStore, Condition, KeyValueStore, blob_path, published_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted,
    AlreadyPublished,
}

#[derive(Clone)]
pub struct Promoter {
    published: Arc<dyn KeyValueStore<PublishedRecord>>,
    blobs: Arc<dyn BlobStore>,
    config: PromotionConfig,
}

impl Promoter {
    pub fn new(
        published: Arc<dyn KeyValueStore<PublishedRecord>>,
        blobs: Arc<dyn BlobStore>,
        config: PromotionConfig,
    ) -> Self {
        Self {
            published,
            blobs,
            config,
        }
    }

    #[instrument(skip_all, fields(id = %record.id, subcategory = %record.subcategory))]
    pub async fn promote(
        &self,
        cancel: &CancellationToken,
        record: &StagingRecord,
    ) -> Result<PromotionOutcome> {
        let key = published_key(record.id.as_str(), &record.subcategory);
        if self
            .published
            .get(&key)
            .await
            .with_context(|| format!("look up published {key}"))?
            .is_some()
        {
            debug!(%key, "already published");
            return Ok(PromotionOutcome::AlreadyPublished);
        }

        let published = PublishedRecord::from_staging(record, Utc::now());
        let blob_key = record.blob_key();
        let dst = &self.config.published_namespace;

        if cancel.is_cancelled() {
            return Err(LexiforgeError::Cancelled);
        }
        self.blobs
            .copy(&self.config.staging_namespace, &blob_key, dst, &blob_key)
            .await
            .with_context(|| format!("copy blob {blob_key}"))?;

        self.wait_for_visibility(cancel, dst, &blob_key).await?;

        match self.published.put(&published, Condition::NotExists).await {
            Ok(()) => {
                info!(%key, "promoted");
                Ok(PromotionOutcome::Promoted)
            }
            Err(e) if e.is_condition_failed() => {
                // Another promotion won; the blob is now its blob.
                debug!(%key, "lost promotion race");
                Ok(PromotionOutcome::AlreadyPublished)
            }
            Err(insert_err) => {
                warn!(%key, error = %insert_err, "insert failed, rolling back blob");
                match self.blobs.delete(dst, &blob_key).await {
                    Ok(()) => Err(insert_err.context(format!("insert {key} (blob rolled back)"))),
                    Err(rollback_err) => {
                        warn!(
                            %key,
                            path = %blob_path(dst, &blob_key),
                            error = %rollback_err,
                            "blob rollback failed, manual cleanup needed"
                        );
                        Err(LexiforgeError::Compensation {
                            original: Box::new(insert_err.context(format!("insert {key}"))),
                            rollback: Box::new(
                                rollback_err.context(format!("delete {}", blob_path(dst, &blob_key))),
                            ),
                        })
                    }
                }
            }
        }
    }

    /// Poll until `key` exists in `namespace`: one check plus up to
    /// `visibility_retries` more, `visibility_backoff` apart.
    async fn wait_for_visibility(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        key: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            if self.blobs.exists(namespace, key).await? {
                return Ok(());
            }
            if attempt >= self.config.visibility_retries {
                return Err(LexiforgeError::not_found(blob_path(namespace, key))
                    .context(format!("copied blob not visible after {} checks", attempt + 1)));
            }
            attempt += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LexiforgeError::Cancelled),
                _ = tokio::time::sleep(self.config.visibility_backoff) => {}
            }
        }
    }
}
