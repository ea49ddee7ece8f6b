//! Blob cleanup for removed staging records.

use std::sync::Arc;

use tracing::{debug, instrument};

use lexiforge_shared::{DictionaryId, Result, ResultExt};
use lexiforge_storage::BlobStore;

#[derive(Clone)]
pub struct Cleanup {
    blobs: Arc<dyn BlobStore>,
    staging_namespace: String,
}

impl Cleanup {
    pub fn new(blobs: Arc<dyn BlobStore>, staging_namespace: impl Into<String>) -> Self {
        Self {
            blobs,
            staging_namespace: staging_namespace.into(),
        }
    }

    /// Delete the staged word list of `id`. Already gone is fine.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn remove(&self, id: &DictionaryId) -> Result<()> {
        let key = id.blob_key();
        self.blobs
            .delete(&self.staging_namespace, &key)
            .await
            .with_context(|| format!("delete blob {key}"))?;
        debug!(%key, "staged blob deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lexiforge_storage::MemoryBlobStore;

    #[tokio::test]
    async fn removes_blob_and_tolerates_absence() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let id = DictionaryId::derive("gone", "lexiforge");
        blobs
            .put("staging", &id.blob_key(), Bytes::from_static(b"[]"), "application/json")
            .await
            .unwrap();
        let cleanup = Cleanup::new(blobs.clone(), "staging");

        cleanup.remove(&id).await.unwrap();
        assert!(!blobs.exists("staging", &id.blob_key()).await.unwrap());
        cleanup.remove(&id).await.unwrap();
    }
}
