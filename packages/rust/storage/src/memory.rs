//! In-memory store bindings.
//!
//! Thread-safe via `Mutex`; each operation holds the lock for its whole
//! read-check-write so conditions are atomic. Used by tests and dry runs.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use lexiforge_shared::{LexiforgeError, Result};

use crate::blob::{BlobStore, blob_path};
use crate::changes::{ChangeFeed, ChangeRecord, EVENT_INSERT, EVENT_MODIFY, EVENT_REMOVE};
use crate::kv::{
    Condition, Filter, KeyValueStore, Mutation, Page, PageRequest, Record, apply_mutation,
    index_matches, to_value, validate_index,
};

fn poisoned() -> LexiforgeError {
    LexiforgeError::Storage("lock poisoned".into())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

struct TableState<R> {
    rows: BTreeMap<String, R>,
    changes: Vec<ChangeRecord>,
    next_seq: i64,
    acked: i64,
}

/// In-memory key-value table. Captures changes when `R::CAPTURE_CHANGES`.
pub struct MemoryStore<R: Record> {
    state: Mutex<TableState<R>>,
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            state: Mutex::new(TableState {
                rows: BTreeMap::new(),
                changes: Vec::new(),
                next_seq: 1,
                acked: 0,
            }),
        }
    }
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableState<R>>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every captured change, acknowledged or not.
    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.state
            .lock()
            .map(|s| s.changes.clone())
            .unwrap_or_default()
    }
}

impl<R: Record> TableState<R> {
    fn capture(&mut self, event_name: &str, item: &R, old: Option<&R>, new: Option<&R>) -> Result<()> {
        if !R::CAPTURE_CHANGES {
            return Ok(());
        }
        let record = ChangeRecord {
            seq: self.next_seq,
            table: R::TABLE.to_string(),
            event_name: event_name.to_string(),
            keys: item.key_attributes(),
            old_image: old.map(to_value).transpose()?,
            new_image: new.map(to_value).transpose()?,
        };
        self.next_seq += 1;
        self.changes.push(record);
        Ok(())
    }

    fn page_after(&self, start_after: &Option<String>) -> impl Iterator<Item = (&String, &R)> {
        let lower = match start_after {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };
        self.rows.range((lower, Bound::Unbounded))
    }
}

#[async_trait]
impl<R: Record> KeyValueStore<R> for MemoryStore<R> {
    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.lock()?.rows.get(key).cloned())
    }

    async fn put(&self, record: &R, condition: Condition) -> Result<()> {
        let mut state = self.lock()?;
        let key = record.key();
        let current = state.rows.get(&key).cloned();
        if !condition.evaluate(current.as_ref())? {
            return Err(LexiforgeError::condition_failed(key));
        }
        let event = if current.is_some() { EVENT_MODIFY } else { EVENT_INSERT };
        state.capture(event, record, current.as_ref(), Some(record))?;
        state.rows.insert(key, record.clone());
        Ok(())
    }

    async fn update(&self, key: &str, mutation: Mutation<R>, condition: Condition) -> Result<R> {
        let mut state = self.lock()?;
        let current = state.rows.get(key).cloned();
        if !condition.evaluate(current.as_ref())? {
            return Err(LexiforgeError::condition_failed(key));
        }
        let current = current.ok_or_else(|| LexiforgeError::not_found(key))?;
        let updated = apply_mutation(current.clone(), mutation)?;
        state.capture(EVENT_MODIFY, &updated, Some(&current), Some(&updated))?;
        state.rows.insert(key.to_string(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(old) = state.rows.remove(key) {
            state.capture(EVENT_REMOVE, &old, Some(&old), None)?;
        }
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        value: &str,
        filter: Option<Filter<R>>,
        page: PageRequest,
    ) -> Result<Page<R>> {
        validate_index(index)?;
        let state = self.lock()?;
        let mut evaluated = Vec::new();
        for (_, item) in state.page_after(&page.start_after) {
            if index_matches(item, index, value)? {
                evaluated.push(item.clone());
                if evaluated.len() == page.limit {
                    break;
                }
            }
        }
        let next = (evaluated.len() == page.limit)
            .then(|| evaluated.last().map(Record::key))
            .flatten();
        let items = match filter {
            Some(f) => evaluated.into_iter().filter(|r| f(r)).collect(),
            None => evaluated,
        };
        Ok(Page { items, next })
    }

    async fn scan(&self, page: PageRequest) -> Result<Page<R>> {
        let state = self.lock()?;
        let items: Vec<R> = state
            .page_after(&page.start_after)
            .take(page.limit)
            .map(|(_, r)| r.clone())
            .collect();
        let next = (items.len() == page.limit)
            .then(|| items.last().map(Record::key))
            .flatten();
        Ok(Page { items, next })
    }
}

#[async_trait]
impl<R: Record> ChangeFeed for MemoryStore<R> {
    async fn read_batch(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let state = self.lock()?;
        Ok(state
            .changes
            .iter()
            .filter(|c| c.seq > state.acked)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ack(&self, seq: i64) -> Result<()> {
        let mut state = self.lock()?;
        state.acked = state.acked.max(seq);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: String,
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, String), StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, String), StoredBlob>>> {
        self.blobs.lock().map_err(|_| poisoned())
    }

    /// Content type recorded at `put`, if the blob exists.
    pub fn content_type(&self, namespace: &str, key: &str) -> Option<String> {
        self.blobs.lock().ok().and_then(|b| {
            b.get(&(namespace.to_string(), key.to_string()))
                .map(|s| s.content_type.clone())
        })
    }

    /// Number of blobs in `namespace`.
    pub fn count(&self, namespace: &str) -> usize {
        self.blobs
            .lock()
            .map(|b| b.keys().filter(|(ns, _)| ns == namespace).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Bytes> {
        self.lock()?
            .get(&(namespace.to_string(), key.to_string()))
            .map(|b| b.data.clone())
            .ok_or_else(|| LexiforgeError::not_found(blob_path(namespace, key)))
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.lock()?.insert(
            (namespace.to_string(), key.to_string()),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn copy(
        &self,
        src_namespace: &str,
        src_key: &str,
        dst_namespace: &str,
        dst_key: &str,
    ) -> Result<()> {
        let mut blobs = self.lock()?;
        let blob = blobs
            .get(&(src_namespace.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| LexiforgeError::not_found(blob_path(src_namespace, src_key)))?;
        blobs.insert((dst_namespace.to_string(), dst_key.to_string()), blob);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.lock()?
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .contains_key(&(namespace.to_string(), key.to_string())))
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(ns, key)| ns == namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::published_key;
    use chrono::Utc;
    use serde_json::Value;
    use lexiforge_shared::{DictionaryId, Language, Level, PublishedRecord, StagingRecord};

    fn staging(name: &str) -> StagingRecord {
        StagingRecord {
            id: DictionaryId::derive(name, "tester"),
            name: name.into(),
            author: "tester".into(),
            source_language: Language::En,
            target_language: Language::De,
            level: Level::A1,
            subcategory: "101".into(),
            word_count: 55,
            overview: "o".into(),
            topic: "Travel".into(),
            description: "d".into(),
            prompt: "craft/basic.hbs".into(),
            model: "m".into(),
            score: None,
            reason: None,
            upload: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_respects_not_exists() {
        let store = MemoryStore::<StagingRecord>::new();
        let r = staging("one");
        store.put(&r, Condition::NotExists).await.unwrap();
        let err = store.put(&r, Condition::NotExists).await.unwrap_err();
        assert!(err.is_condition_failed());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_requires_existence() {
        let store = MemoryStore::<StagingRecord>::new();
        let r = staging("one");
        let err = store
            .update(&r.key(), Box::new(|r| r.score = Some(1)), Condition::Exists)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        let err = store
            .update(&r.key(), Box::new(|r| r.score = Some(1)), Condition::Always)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn staging_writes_are_captured_in_order() {
        let store = MemoryStore::<StagingRecord>::new();
        let r = staging("one");
        store.put(&r, Condition::NotExists).await.unwrap();
        store
            .update(
                &r.key(),
                Box::new(|r| {
                    r.score = Some(92);
                    r.reason = Some(String::new());
                }),
                Condition::Exists,
            )
            .await
            .unwrap();
        store.delete(&r.key()).await.unwrap();
        store.delete(&r.key()).await.unwrap();

        let changes = store.changes();
        let kinds: Vec<_> = changes.iter().map(|c| c.event_name.as_str()).collect();
        assert_eq!(kinds, vec![EVENT_INSERT, EVENT_MODIFY, EVENT_REMOVE]);
        assert_eq!(changes[1].old_image.as_ref().unwrap().get("score"), None);
        assert_eq!(changes[1].new_image.as_ref().unwrap()["score"], 92);
        assert_eq!(changes[2].keys["id"], r.id.to_string());
        assert!(changes[2].new_image.is_none());
    }

    #[tokio::test]
    async fn feed_redelivers_until_acked() {
        let store = MemoryStore::<StagingRecord>::new();
        store.put(&staging("a"), Condition::Always).await.unwrap();
        store.put(&staging("b"), Condition::Always).await.unwrap();

        let first = store.read_batch(10).await.unwrap();
        assert_eq!(first.len(), 2);
        let again = store.read_batch(10).await.unwrap();
        assert_eq!(first, again);

        store.ack(first[0].seq).await.unwrap();
        let rest = store.read_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seq, first[1].seq);
    }

    #[tokio::test]
    async fn published_writes_are_not_captured() {
        let store = MemoryStore::<PublishedRecord>::new();
        let p = PublishedRecord::from_staging(&staging("a"), Utc::now());
        store.put(&p, Condition::NotExists).await.unwrap();
        assert!(store.changes().is_empty());
        let found = store
            .get(&published_key(p.id.as_str(), "101"))
            .await
            .unwrap();
        assert_eq!(found, Some(p));
    }

    #[tokio::test]
    async fn query_pages_through_index() {
        let store = MemoryStore::<PublishedRecord>::new();
        for name in ["a", "b", "c", "d", "e"] {
            let mut s = staging(name);
            if name == "c" {
                s.level = Level::C1;
            }
            let p = PublishedRecord::from_staging(&s, Utc::now());
            store.put(&p, Condition::NotExists).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut page = PageRequest::first(2);
        loop {
            let result = store.query("level_public", "A1#true", None, page).await.unwrap();
            seen.extend(result.items.into_iter().map(|p| p.name));
            match result.next {
                Some(token) => page = PageRequest::after(2, token),
                None => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "d", "e"]);
    }

    #[tokio::test]
    async fn query_filter_applies_after_limit() {
        let store = MemoryStore::<PublishedRecord>::new();
        for name in ["a", "b", "c"] {
            let p = PublishedRecord::from_staging(&staging(name), Utc::now());
            store.put(&p, Condition::NotExists).await.unwrap();
        }
        let filter: Filter<PublishedRecord> = std::sync::Arc::new(|p| p.name == "zzz");
        let page = store
            .query("subcategory_public", "101#true", Some(filter), PageRequest::first(2))
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.next.is_some());
    }

    #[tokio::test]
    async fn blob_delete_is_idempotent() {
        let blobs = MemoryBlobStore::new();
        blobs.delete("ns", "missing.json").await.unwrap();
        blobs
            .put("ns", "k.json", Bytes::from_static(b"[]"), "application/json")
            .await
            .unwrap();
        blobs.delete("ns", "k.json").await.unwrap();
        assert!(!blobs.exists("ns", "k.json").await.unwrap());
    }

    #[tokio::test]
    async fn blob_copy_keeps_source() {
        let blobs = MemoryBlobStore::new();
        blobs
            .put("src", "k.json", Bytes::from_static(b"[1]"), "application/json")
            .await
            .unwrap();
        blobs.copy("src", "k.json", "dst", "k.json").await.unwrap();
        assert!(blobs.exists("src", "k.json").await.unwrap());
        assert_eq!(&blobs.get("dst", "k.json").await.unwrap()[..], b"[1]");
        assert_eq!(
            blobs.content_type("dst", "k.json").as_deref(),
            Some("application/json")
        );

        let err = blobs.copy("src", "nope", "dst", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn random_key_respects_prefix() {
        let blobs = MemoryBlobStore::new();
        for key in ["craft/a.hbs", "craft/b.hbs", "check/default.hbs"] {
            blobs
                .put("prompts", key, Bytes::from_static(b"x"), "text/plain")
                .await
                .unwrap();
        }
        for _ in 0..10 {
            let key = blobs.random_key_with_prefix("prompts", "craft/").await.unwrap();
            assert!(key.starts_with("craft/"));
        }
        let err = blobs
            .random_key_with_prefix("prompts", "missing/")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn value_helpers() {
        assert_eq!(to_value(&1).unwrap(), Value::from(1));
    }
}
