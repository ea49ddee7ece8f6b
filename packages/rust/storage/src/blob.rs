//! Blob store contract.
//!
//! Blobs live under `(namespace, key)`. Deletes are idempotent; a read of a
//! missing blob is [`LexiforgeError::NotFound`].

use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;

use lexiforge_shared::{LexiforgeError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Bytes>;

    async fn put(&self, namespace: &str, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Copy (not move) a blob between namespaces.
    async fn copy(
        &self,
        src_namespace: &str,
        src_key: &str,
        dst_namespace: &str,
        dst_key: &str,
    ) -> Result<()>;

    /// Delete a blob. Deleting a missing key succeeds.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Keys in `namespace` starting with `prefix`, sorted.
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>>;

    /// A uniformly random key under `prefix`.
    async fn random_key_with_prefix(&self, namespace: &str, prefix: &str) -> Result<String> {
        let keys = self.list(namespace, prefix).await?;
        keys.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| LexiforgeError::not_found(format!("{namespace}/{prefix}*")))
    }
}

/// Human-readable blob location for errors and logs.
pub fn blob_path(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}
