//! Dictionary review ("check").
//!
//! The review prompt is the rendered template followed by a blank line and
//! the stored word list blob. The model answers with `{score, reason}`.
//! Nothing is written back here; the caller persists the review.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use lexiforge_ai::{ChatModel, ChatRequest, parse_json_content};
use lexiforge_shared::{
    CheckConfig, LexiforgeError, Result, ResultExt, Review, StagingRecord, WordEntry,
    decode_word_list,
};
use lexiforge_storage::BlobStore;

use crate::prompts::PromptLibrary;

/// Review request. Every `None` is filled in by [`Checker::setup`].
#[derive(Debug, Clone, Default)]
pub struct CheckRequest {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckParams {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
}

/// Template context: the record's descriptive fields.
#[derive(Serialize)]
struct ReviewContext<'a> {
    id: &'a str,
    name: &'a str,
    author: &'a str,
    description: &'a str,
    overview: &'a str,
    topic: &'a str,
    subcategory: &'a str,
    level: String,
    source_language: &'static str,
    target_language: &'static str,
    word_count: u32,
}

impl<'a> ReviewContext<'a> {
    fn new(record: &'a StagingRecord) -> Self {
        Self {
            id: record.id.as_str(),
            name: &record.name,
            author: &record.author,
            description: &record.description,
            overview: &record.overview,
            topic: &record.topic,
            subcategory: &record.subcategory,
            level: record.level.to_string(),
            source_language: record.source_language.name(),
            target_language: record.target_language.name(),
            word_count: record.word_count,
        }
    }
}

#[derive(Clone)]
pub struct Checker {
    model: Arc<dyn ChatModel>,
    prompts: PromptLibrary,
    blobs: Arc<dyn BlobStore>,
    staging_namespace: String,
    config: CheckConfig,
}

impl Checker {
    pub fn new(
        model: Arc<dyn ChatModel>,
        prompts: PromptLibrary,
        blobs: Arc<dyn BlobStore>,
        staging_namespace: impl Into<String>,
        config: CheckConfig,
    ) -> Self {
        Self {
            model,
            prompts,
            blobs,
            staging_namespace: staging_namespace.into(),
            config,
        }
    }

    pub async fn setup(&self, request: &CheckRequest) -> Result<CheckParams> {
        let (prompt, model, temperature) = tokio::join!(
            async {
                match &request.prompt {
                    Some(p) if p.trim().is_empty() => {
                        Err(LexiforgeError::validation("prompt: must not be empty"))
                    }
                    Some(p) => Ok(p.clone()),
                    None => Ok(self.config.prompt.clone()),
                }
            },
            async {
                match &request.model {
                    Some(m) if m.trim().is_empty() => {
                        Err(LexiforgeError::validation("model: must not be empty"))
                    }
                    Some(m) => Ok(m.clone()),
                    None => Ok(self.config.model.clone()),
                }
            },
            async {
                let t = request.temperature.unwrap_or(self.config.temperature);
                if (0.0..=2.0).contains(&t) {
                    Ok(t)
                } else {
                    Err(LexiforgeError::validation(format!(
                        "temperature: {t} is outside 0..=2"
                    )))
                }
            },
        );
        match (prompt, model, temperature) {
            (Ok(prompt), Ok(model), Ok(temperature)) => Ok(CheckParams {
                prompt,
                model,
                temperature,
            }),
            (prompt, model, temperature) => {
                let errors: Vec<_> = [prompt.err(), model.err(), temperature.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                Err(LexiforgeError::aggregate(errors).context("check setup"))
            }
        }
    }

    /// Word list stored for `record`.
    pub async fn load_content(&self, record: &StagingRecord) -> Result<Vec<WordEntry>> {
        let data = self
            .blobs
            .get(&self.staging_namespace, &record.blob_key())
            .await?;
        decode_word_list(&data)
    }

    /// Prompt body for reviewing `record`.
    pub async fn render(&self, params: &CheckParams, record: &StagingRecord) -> Result<String> {
        let blob_key = record.blob_key();
        let (template, blob) = tokio::join!(
            self.prompts.fetch(&params.prompt),
            self.blobs.get(&self.staging_namespace, &blob_key),
        );
        let header = self
            .prompts
            .render(&template?, &ReviewContext::new(record))
            .with_context(|| format!("render prompt {}", params.prompt))?;
        let blob = blob.with_context(|| format!("load word list {blob_key}"))?;
        // Reject blobs the loader would not accept before paying for a call.
        decode_word_list(&blob)?;
        let blob = String::from_utf8_lossy(&blob);
        Ok(format!("{header}\n\n{blob}"))
    }

    #[instrument(skip_all, fields(id = %record.id))]
    pub async fn review(
        &self,
        cancel: &CancellationToken,
        request: &CheckRequest,
        record: &StagingRecord,
    ) -> Result<Review> {
        let params = self.setup(request).await?;
        let body = self.render(&params, record).await?;
        debug!(prompt = %params.prompt, model = %params.model, "sending review request");

        let chat = ChatRequest::single(&params.model, body, params.temperature);
        let response = self.model.send_message(cancel, &chat).await?;
        parse_json_content(response.content()?)
            .with_context(|| format!("parse review for {}", record.id))
    }
}
