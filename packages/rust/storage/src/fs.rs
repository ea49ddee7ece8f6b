//! Filesystem blob store: `<root>/<namespace>/<key>`.
//!
//! Writes go to a sibling temp file and are renamed into place, so readers
//! never see a partial blob. Content types are not persisted.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use lexiforge_shared::{LexiforgeError, Result};

use crate::blob::{BlobStore, blob_path};

const PARTIAL_SUFFIX: &str = ".partial";

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        check_segment(namespace, "namespace")?;
        Ok(self.root.join(namespace))
    }

    fn resolve(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        let dir = self.namespace_dir(namespace)?;
        if key.is_empty() || key.contains('\\') || key.ends_with(PARTIAL_SUFFIX) {
            return Err(invalid_key(key));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid_key(key));
        }
        Ok(dir.join(relative))
    }
}

fn invalid_key(key: &str) -> LexiforgeError {
    LexiforgeError::validation(format!("invalid blob key {key:?}"))
}

fn check_segment(value: &str, what: &str) -> Result<()> {
    if value.is_empty() || value.contains(['/', '\\']) || value == "." || value == ".." {
        return Err(LexiforgeError::validation(format!("invalid {what} {value:?}")));
    }
    Ok(())
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| LexiforgeError::io(parent, e))?;
    }
    let tmp = path.with_file_name(format!(
        "{}.{:016x}{PARTIAL_SUFFIX}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob"),
        rand::random::<u64>()
    ));
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| LexiforgeError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(LexiforgeError::io(path, e));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Bytes> {
        let path = self.resolve(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LexiforgeError::not_found(blob_path(namespace, key)))
            }
            Err(e) => Err(LexiforgeError::io(path, e)),
        }
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let path = self.resolve(namespace, key)?;
        debug!(path = %path.display(), content_type, bytes = data.len(), "writing blob");
        write_atomic(&path, &data).await
    }

    async fn copy(
        &self,
        src_namespace: &str,
        src_key: &str,
        dst_namespace: &str,
        dst_key: &str,
    ) -> Result<()> {
        let data = self.get(src_namespace, src_key).await?;
        let dst = self.resolve(dst_namespace, dst_key)?;
        write_atomic(&dst, &data).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let path = self.resolve(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LexiforgeError::io(path, e)),
        }
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.resolve(namespace, key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| LexiforgeError::io(path, e))
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.namespace_dir(namespace)?;
        let mut keys = Vec::new();
        let mut pending = vec![(base.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LexiforgeError::io(dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| LexiforgeError::io(&dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| LexiforgeError::io(entry.path(), e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if !name.ends_with(PARTIAL_SUFFIX) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
