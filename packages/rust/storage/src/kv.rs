//! Key-value store contract.
//!
//! Records are addressed by a string key and written with a [`Condition`]
//! that is evaluated atomically with the write. A rejected condition is
//! reported as [`LexiforgeError::ConditionFailed`]; callers decide whether
//! that is a race to tolerate or a failure to surface.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use lexiforge_shared::{LexiforgeError, PublishedRecord, Result, StagingRecord};

/// A type stored in a [`KeyValueStore`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name.
    const TABLE: &'static str;

    /// Whether writes to this table are published on the change feed.
    const CAPTURE_CHANGES: bool = false;

    /// Primary key.
    fn key(&self) -> String;

    /// Key attributes as they appear in change records.
    fn key_attributes(&self) -> Map<String, Value>;
}

impl Record for StagingRecord {
    const TABLE: &'static str = "staging";
    const CAPTURE_CHANGES: bool = true;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn key_attributes(&self) -> Map<String, Value> {
        let mut keys = Map::new();
        keys.insert("id".into(), Value::String(self.id.to_string()));
        keys
    }
}

impl Record for PublishedRecord {
    const TABLE: &'static str = "published";

    fn key(&self) -> String {
        published_key(self.id.as_str(), &self.subcategory)
    }

    fn key_attributes(&self) -> Map<String, Value> {
        let mut keys = Map::new();
        keys.insert("id".into(), Value::String(self.id.to_string()));
        keys.insert("subcategory".into(), Value::String(self.subcategory.clone()));
        keys
    }
}

/// Composite key of a published record.
pub fn published_key(id: &str, subcategory: &str) -> String {
    format!("{id}#{subcategory}")
}

/// Predicate over the current item, evaluated atomically with a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Write unconditionally.
    Always,
    /// Write only if an item with the key exists.
    Exists,
    /// Write only if no item with the key exists.
    NotExists,
    /// Write only if the item exists and `attribute` equals `value`.
    AttributeEquals { attribute: String, value: Value },
}

impl Condition {
    /// Evaluate against the current item (if any).
    pub fn evaluate<R: Serialize>(&self, current: Option<&R>) -> Result<bool> {
        Ok(match (self, current) {
            (Self::Always, _) => true,
            (Self::Exists, current) => current.is_some(),
            (Self::NotExists, current) => current.is_none(),
            (Self::AttributeEquals { .. }, None) => false,
            (Self::AttributeEquals { attribute, value }, Some(item)) => {
                let item = to_value(item)?;
                item.get(attribute) == Some(value)
            }
        })
    }
}

/// In-place change applied by [`KeyValueStore::update`].
pub type Mutation<R> = Box<dyn FnOnce(&mut R) + Send>;

/// Post-read predicate applied to query results.
pub type Filter<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Page selector: items strictly after `start_after`, at most `limit`.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub limit: usize,
    pub start_after: Option<String>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            start_after: None,
        }
    }

    pub fn after(limit: usize, token: impl Into<String>) -> Self {
        Self {
            limit: limit.max(1),
            start_after: Some(token.into()),
        }
    }
}

/// One page of results. `next` is the token for the following page.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub items: Vec<R>,
    pub next: Option<String>,
}

/// Single-key conditional record store.
#[async_trait]
pub trait KeyValueStore<R: Record>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<R>>;

    /// Insert or replace `record` if `condition` holds for the current item.
    async fn put(&self, record: &R, condition: Condition) -> Result<()>;

    /// Apply `mutation` to the current item if `condition` holds.
    /// A missing item is [`LexiforgeError::NotFound`] once the condition passes.
    async fn update(&self, key: &str, mutation: Mutation<R>, condition: Condition) -> Result<R>;

    /// Delete the item. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Items whose string attribute `index` equals `value`, in key order.
    /// The page limit applies before `filter`, so a page may hold fewer items.
    async fn query(
        &self,
        index: &str,
        value: &str,
        filter: Option<Filter<R>>,
        page: PageRequest,
    ) -> Result<Page<R>>;

    /// All items in key order.
    async fn scan(&self, page: PageRequest) -> Result<Page<R>>;
}

/// Serialize a record for attribute inspection.
pub(crate) fn to_value<R: Serialize>(record: &R) -> Result<Value> {
    serde_json::to_value(record)
        .map_err(|e| LexiforgeError::Storage(format!("failed to encode record: {e}")))
}

/// Whether `record`'s string attribute `index` equals `value`.
pub(crate) fn index_matches<R: Serialize>(record: &R, index: &str, value: &str) -> Result<bool> {
    Ok(to_value(record)?.get(index).and_then(Value::as_str) == Some(value))
}

/// Only plain attribute names may be used as indexes.
pub(crate) fn validate_index(index: &str) -> Result<()> {
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(LexiforgeError::validation(format!(
            "invalid index name {index:?}"
        )));
    }
    Ok(())
}

/// Apply a mutation and make sure it left the key alone.
pub(crate) fn apply_mutation<R: Record>(mut item: R, mutation: Mutation<R>) -> Result<R> {
    let key = item.key();
    mutation(&mut item);
    if item.key() != key {
        return Err(LexiforgeError::validation(format!(
            "mutation changed the key of {key}"
        )));
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lexiforge_shared::{DictionaryId, Language, Level};

    fn record() -> StagingRecord {
        StagingRecord {
            id: DictionaryId::derive("n", "a"),
            name: "n".into(),
            author: "a".into(),
            source_language: Language::En,
            target_language: Language::Fr,
            level: Level::B1,
            subcategory: "101".into(),
            word_count: 51,
            overview: "o".into(),
            topic: "Travel".into(),
            description: "d".into(),
            prompt: "craft/basic.hbs".into(),
            model: "m".into(),
            score: Some(80),
            reason: None,
            upload: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn conditions_over_existence() {
        let r = record();
        assert!(Condition::Exists.evaluate(Some(&r)).unwrap());
        assert!(!Condition::Exists.evaluate::<StagingRecord>(None).unwrap());
        assert!(Condition::NotExists.evaluate::<StagingRecord>(None).unwrap());
        assert!(!Condition::NotExists.evaluate(Some(&r)).unwrap());
        assert!(Condition::Always.evaluate::<StagingRecord>(None).unwrap());
    }

    #[test]
    fn attribute_equality_condition() {
        let r = record();
        let cond = Condition::AttributeEquals {
            attribute: "score".into(),
            value: Value::from(80),
        };
        assert!(cond.evaluate(Some(&r)).unwrap());
        assert!(!cond.evaluate::<StagingRecord>(None).unwrap());

        let cond = Condition::AttributeEquals {
            attribute: "upload".into(),
            value: Value::Bool(true),
        };
        assert!(!cond.evaluate(Some(&r)).unwrap());
    }

    #[test]
    fn mutation_cannot_rekey() {
        let r = record();
        let err = apply_mutation(
            r,
            Box::new(|r: &mut StagingRecord| r.id = DictionaryId::derive("x", "y")),
        )
        .unwrap_err();
        assert!(matches!(err, LexiforgeError::Validation { .. }));
    }

    #[test]
    fn published_key_is_composite() {
        assert_eq!(published_key("abc", "101"), "abc#101");
    }

    #[test]
    fn index_names_are_validated() {
        assert!(validate_index("level_public").is_ok());
        assert!(validate_index("level'); DROP TABLE records; --").is_err());
    }
}
