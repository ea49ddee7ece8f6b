//! Test doubles shared by the core unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use lexiforge_ai::{ChatChoice, ChatMessage, ChatModel, ChatRequest, ChatResponse, Role};
use lexiforge_shared::{LexiforgeError, PublishedRecord, Result};
use lexiforge_storage::{
    BlobStore, Condition, Filter, KeyValueStore, MemoryBlobStore, MemoryStore, Mutation, Page,
    PageRequest,
};

use crate::prompts::PromptLibrary;

pub(crate) const CRAFT_TEMPLATE: &str = "Write {{words}} {{source_language_name}} words with \
{{target_language_name}} translations for level {{level}} learners about {{topic}}. \
Style: {{overview}}. Answer with a JSON object holding meta and words.";

pub(crate) const CHECK_TEMPLATE: &str = "Review the {{level}} dictionary \"{{name}}\" about \
{{topic}} ({{source_language}} to {{target_language}}, {{word_count}} words). \
Reply with JSON holding score and reason.";

/// A prompt library holding one craft and one check template.
pub(crate) async fn seeded_prompts(blobs: Arc<dyn BlobStore>) -> PromptLibrary {
    let prompts = PromptLibrary::new(blobs, "prompts");
    prompts.put("craft/basic.hbs", CRAFT_TEMPLATE).await.unwrap();
    prompts.put("check/default.hbs", CHECK_TEMPLATE).await.unwrap();
    prompts
}

/// Model output for a generation with `words` entries.
pub(crate) fn generation_json(name: &str, author: &str, words: usize) -> String {
    let words: Vec<_> = (0..words)
        .map(|i| {
            json!({
                "term": format!("term{i}"),
                "translation": format!("translation{i}"),
                "hint": "",
                "note": ""
            })
        })
        .collect();
    json!({
        "meta": {"name": name, "author": author, "description": "generated"},
        "words": words
    })
    .to_string()
}

type Responder = Box<dyn Fn(usize, &ChatRequest) -> Result<String> + Send + Sync>;

/// `ChatModel` answering from a script. Calls past the end of a
/// [`ScriptedModel::replying`] script fail with `EmptyResponse`.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedModel {
    pub(crate) fn replying(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answer call `n` (zero-based) with `f(n, request)`.
    pub(crate) fn with(f: impl Fn(usize, &ChatRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Box::new(f)),
            ..Self::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn send_message(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        if cancel.is_cancelled() {
            return Err(LexiforgeError::Cancelled);
        }
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        let content = match &self.responder {
            Some(f) => f(call, request)?,
            None => self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LexiforgeError::EmptyResponse))?,
        };
        Ok(ChatResponse {
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        })
    }
}

/// Blob store that can be told to fail deletes or to hide copied blobs.
#[derive(Default)]
pub(crate) struct FlakyBlobStore {
    pub(crate) inner: MemoryBlobStore,
    pub(crate) fail_delete: std::sync::atomic::AtomicBool,
    pub(crate) hide_namespace: Mutex<Option<String>>,
    pub(crate) copies: std::sync::atomic::AtomicUsize,
    pub(crate) exists_checks: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Bytes> {
        self.inner.get(namespace, key).await
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.inner.put(namespace, key, data, content_type).await
    }

    async fn copy(&self, sn: &str, sk: &str, dn: &str, dk: &str) -> Result<()> {
        self.copies.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.copy(sn, sk, dn, dk).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        if self.fail_delete.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LexiforgeError::Storage("delete refused".into()));
        }
        self.inner.delete(namespace, key).await
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        self.exists_checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let hidden = self.hide_namespace.lock().unwrap().as_deref() == Some(namespace);
        if hidden {
            return Ok(false);
        }
        self.inner.exists(namespace, key).await
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(namespace, prefix).await
    }
}

/// Published store whose inserts always fail: with a storage error, or
/// with a rejected condition when `lose_race` is set.
#[derive(Default)]
pub(crate) struct RejectingPublished {
    pub(crate) inner: MemoryStore<PublishedRecord>,
    pub(crate) lose_race: bool,
}

#[async_trait]
impl KeyValueStore<PublishedRecord> for RejectingPublished {
    async fn get(&self, key: &str) -> Result<Option<PublishedRecord>> {
        self.inner.get(key).await
    }

    async fn put(&self, record: &PublishedRecord, _condition: Condition) -> Result<()> {
        if self.lose_race {
            return Err(LexiforgeError::condition_failed(record.id.to_string()));
        }
        Err(LexiforgeError::Storage("insert rejected".into()))
    }

    async fn update(
        &self,
        key: &str,
        mutation: Mutation<PublishedRecord>,
        condition: Condition,
    ) -> Result<PublishedRecord> {
        self.inner.update(key, mutation, condition).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn query(
        &self,
        index: &str,
        value: &str,
        filter: Option<Filter<PublishedRecord>>,
        page: PageRequest,
    ) -> Result<Page<PublishedRecord>> {
        self.inner.query(index, value, filter, page).await
    }

    async fn scan(&self, page: PageRequest) -> Result<Page<PublishedRecord>> {
        self.inner.scan(page).await
    }
}
