//! Dictionary generation ("craft").
//!
//! A [`CraftRequest`] leaves any field unset; [`Crafter::setup`] resolves
//! each one from the fixed enumerations, the configured defaults, or a fresh
//! identifier, then the prompt template is rendered with the result and sent
//! to the model. Persisting the output is the caller's job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use lexiforge_ai::{ChatModel, ChatRequest, parse_json_content};
use lexiforge_shared::{
    CraftConfig, DictionaryId, DictionaryMeta, GenerationResponse, Language, Level,
    LexiforgeError, OVERVIEWS, Result, ResultExt, StagingRecord, TOPICS, Topic, WordEntry,
    find_topic,
};

use crate::prompts::PromptLibrary;

/// Largest word count a caller may ask for.
pub const MAX_WORDS: u32 = 500;

/// Generation request. Every `None` is filled in by [`Crafter::setup`].
#[derive(Debug, Clone, Default)]
pub struct CraftRequest {
    /// Dictionary name; the identifier is derived from it.
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    /// Topic name or subcategory code.
    pub topic: Option<String>,
    /// Style description used as the record overview.
    pub overview: Option<String>,
    pub level: Option<Level>,
    pub source_language: Option<Language>,
    pub target_language: Option<Language>,
    pub words: Option<u32>,
    pub temperature: Option<f32>,
}

/// Fully resolved generation parameters; also the template context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CraftParams {
    pub name: String,
    pub prompt: String,
    pub model: String,
    pub topic: String,
    pub subcategory: String,
    pub overview: String,
    pub level: Level,
    pub source_language: Language,
    pub source_language_name: String,
    pub target_language: Language,
    pub target_language_name: String,
    pub words: u32,
    pub temperature: f32,
}

/// A generated dictionary, not yet persisted.
#[derive(Debug, Clone)]
pub struct Dictionary {
    pub id: DictionaryId,
    pub author: String,
    pub params: CraftParams,
    pub meta: DictionaryMeta,
    pub words: Vec<WordEntry>,
    pub created_at: DateTime<Utc>,
}

impl Dictionary {
    /// The staging record describing this dictionary. Review fields unset.
    pub fn staging_record(&self) -> StagingRecord {
        StagingRecord {
            id: self.id.clone(),
            name: self.meta.name.clone(),
            author: self.author.clone(),
            source_language: self.params.source_language,
            target_language: self.params.target_language,
            level: self.params.level,
            subcategory: self.params.subcategory.clone(),
            word_count: u32::try_from(self.words.len()).unwrap_or(u32::MAX),
            overview: self.params.overview.clone(),
            topic: self.params.topic.clone(),
            description: self.meta.description.clone(),
            prompt: self.params.prompt.clone(),
            model: self.params.model.clone(),
            score: None,
            reason: None,
            upload: false,
            created_at: self.created_at,
        }
    }
}

#[derive(Clone)]
pub struct Crafter {
    model: Arc<dyn ChatModel>,
    prompts: PromptLibrary,
    config: CraftConfig,
}

impl Crafter {
    pub fn new(model: Arc<dyn ChatModel>, prompts: PromptLibrary, config: CraftConfig) -> Self {
        Self {
            model,
            prompts,
            config,
        }
    }

    /// Resolve every unset field. Fill-ins run concurrently; all failures
    /// are reported together, each tagged with its field.
    pub async fn setup(&self, request: &CraftRequest) -> Result<CraftParams> {
        let (prompt, model, name, topic, overview, level, languages, words, temperature) = tokio::join!(
            self.resolve_prompt(request.prompt.as_deref()),
            async { resolve_model(request.model.as_deref(), &self.config.model) },
            async { resolve_name(request.name.as_deref()) },
            async { resolve_topic(request.topic.as_deref()) },
            async { resolve_overview(request.overview.as_deref()) },
            async { resolve_level(request.level) },
            async { resolve_languages(request.source_language, request.target_language) },
            async { self.resolve_words(request.words) },
            async { resolve_temperature(request.temperature, self.config.temperature) },
        );
        match (prompt, model, name, topic, overview, level, languages, words, temperature) {
            (
                Ok(prompt),
                Ok(model),
                Ok(name),
                Ok(topic),
                Ok(overview),
                Ok(level),
                Ok((source, target)),
                Ok(words),
                Ok(temperature),
            ) => Ok(CraftParams {
                name,
                prompt,
                model,
                topic: topic.name.to_string(),
                subcategory: topic.code.to_string(),
                overview,
                level,
                source_language: source,
                source_language_name: source.name().to_string(),
                target_language: target,
                target_language_name: target.name().to_string(),
                words,
                temperature,
            }),
            (prompt, model, name, topic, overview, level, languages, words, temperature) => {
                let errors: Vec<_> = [
                    prompt.err(),
                    model.err(),
                    name.err(),
                    topic.err(),
                    overview.err(),
                    level.err(),
                    languages.err(),
                    words.err(),
                    temperature.err(),
                ]
                .into_iter()
                .flatten()
                .collect();
                Err(LexiforgeError::aggregate(errors).context("craft setup"))
            }
        }
    }

    /// Render the prompt template for resolved parameters.
    pub async fn render(&self, params: &CraftParams) -> Result<String> {
        let template = self.prompts.fetch(&params.prompt).await?;
        self.prompts
            .render(&template, params)
            .with_context(|| format!("render prompt {}", params.prompt))
    }

    /// Generate one dictionary.
    #[instrument(skip_all, fields(name = request.name.as_deref().unwrap_or("")))]
    pub async fn craft(
        &self,
        cancel: &CancellationToken,
        request: &CraftRequest,
    ) -> Result<Dictionary> {
        let params = self.setup(request).await?;
        let body = self.render(&params).await?;
        debug!(prompt = %params.prompt, model = %params.model, "sending generation request");

        let chat = ChatRequest::single(&params.model, body, params.temperature);
        let response = self.model.send_message(cancel, &chat).await?;
        let generation: GenerationResponse = parse_json_content(response.content()?)
            .with_context(|| format!("parse generation for {}", params.name))?;
        if generation.words.is_empty() {
            return Err(LexiforgeError::EmptyDictionary);
        }

        let author = if generation.meta.author.trim().is_empty() {
            self.config.author.clone()
        } else {
            generation.meta.author.clone()
        };
        Ok(Dictionary {
            id: DictionaryId::derive(&params.name, &author),
            author,
            params,
            meta: generation.meta,
            words: generation.words,
            created_at: Utc::now(),
        })
    }

    async fn resolve_prompt(&self, prompt: Option<&str>) -> Result<String> {
        match prompt {
            Some(p) if p.trim().is_empty() => {
                Err(LexiforgeError::validation("prompt: must not be empty"))
            }
            Some(p) => Ok(p.to_string()),
            None => self
                .prompts
                .random_name(&self.config.prompt_prefix)
                .await
                .context("prompt"),
        }
    }

    fn resolve_words(&self, words: Option<u32>) -> Result<u32> {
        match words {
            Some(0) => Err(LexiforgeError::validation("words: must be positive")),
            Some(n) if n > MAX_WORDS => Err(LexiforgeError::validation(format!(
                "words: {n} is above the limit of {MAX_WORDS}"
            ))),
            Some(n) => Ok(n),
            None if self.config.min_words > self.config.max_words => {
                Err(LexiforgeError::validation(format!(
                    "words: empty range {}..={}",
                    self.config.min_words, self.config.max_words
                )))
            }
            None => Ok(rand::thread_rng().gen_range(self.config.min_words..=self.config.max_words)),
        }
    }
}

fn resolve_model(model: Option<&str>, default: &str) -> Result<String> {
    match model {
        Some(m) if m.trim().is_empty() => Err(LexiforgeError::validation("model: must not be empty")),
        Some(m) => Ok(m.to_string()),
        None => Ok(default.to_string()),
    }
}

fn resolve_name(name: Option<&str>) -> Result<String> {
    match name {
        Some(n) if n.trim().is_empty() => Err(LexiforgeError::validation("name: must not be empty")),
        Some(n) => Ok(n.trim().to_string()),
        None => Ok(Uuid::now_v7().to_string()),
    }
}

fn resolve_topic(topic: Option<&str>) -> Result<Topic> {
    match topic {
        Some(t) => find_topic(t)
            .ok_or_else(|| LexiforgeError::validation(format!("topic: unknown topic {t:?}"))),
        None => TOPICS
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| LexiforgeError::validation("topic: no topics defined")),
    }
}

fn resolve_overview(overview: Option<&str>) -> Result<String> {
    match overview {
        Some(o) => Ok(o.to_string()),
        None => OVERVIEWS
            .choose(&mut rand::thread_rng())
            .map(|o| o.to_string())
            .ok_or_else(|| LexiforgeError::validation("overview: no overviews defined")),
    }
}

fn resolve_level(level: Option<Level>) -> Result<Level> {
    match level {
        Some(l) => Ok(l),
        None => Level::ALL
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| LexiforgeError::validation("level: no levels defined")),
    }
}

/// Source and target languages; never the same language twice.
fn resolve_languages(
    source: Option<Language>,
    target: Option<Language>,
) -> Result<(Language, Language)> {
    let mut rng = rand::thread_rng();
    let pick_other = |other: Language, rng: &mut rand::rngs::ThreadRng| {
        let candidates: Vec<Language> = Language::ALL
            .iter()
            .copied()
            .filter(|l| *l != other)
            .collect();
        candidates.choose(rng).copied()
    };
    let pair = match (source, target) {
        (Some(s), Some(t)) if s == t => {
            return Err(LexiforgeError::validation(format!(
                "language: source and target are both {s}"
            )));
        }
        (Some(s), Some(t)) => Some((s, t)),
        (Some(s), None) => pick_other(s, &mut rng).map(|t| (s, t)),
        (None, Some(t)) => pick_other(t, &mut rng).map(|s| (s, t)),
        (None, None) => {
            let picked: Vec<Language> = Language::ALL.choose_multiple(&mut rng, 2).copied().collect();
            match picked.as_slice() {
                [s, t] => Some((*s, *t)),
                _ => None,
            }
        }
    };
    pair.ok_or_else(|| LexiforgeError::validation("language: not enough languages defined"))
}

fn resolve_temperature(temperature: Option<f32>, default: f32) -> Result<f32> {
    let t = temperature.unwrap_or(default);
    if !(0.0..=2.0).contains(&t) {
        return Err(LexiforgeError::validation(format!(
            "temperature: {t} is outside 0..=2"
        )));
    }
    Ok(t)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{ScriptedModel, generation_json, seeded_prompts};
    use lexiforge_storage::MemoryBlobStore;

    pub(crate) fn config() -> CraftConfig {
        CraftConfig {
            prompt_prefix: "craft/".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.9,
            min_words: 51,
            max_words: 91,
            author: "lexiforge".into(),
        }
    }

    async fn crafter(model: Arc<ScriptedModel>) -> Crafter {
        let prompts = seeded_prompts(Arc::new(MemoryBlobStore::new())).await;
        Crafter::new(model, prompts, config())
    }

    #[tokio::test]
    async fn setup_fills_every_field() {
        let crafter = crafter(Arc::new(ScriptedModel::default())).await;
        for _ in 0..20 {
            let params = crafter.setup(&CraftRequest::default()).await.unwrap();
            assert!(params.prompt.starts_with("craft/"));
            assert!((51..=91).contains(&params.words));
            assert_ne!(params.source_language, params.target_language);
            assert!(find_topic(&params.subcategory).is_some());
            assert!(OVERVIEWS.contains(&params.overview.as_str()));
            assert_eq!(params.model, "gpt-4o-mini");
            assert!(Uuid::parse_str(&params.name).is_ok());
        }
    }

    #[tokio::test]
    async fn setup_keeps_caller_values() {
        let crafter = crafter(Arc::new(ScriptedModel::default())).await;
        let request = CraftRequest {
            name: Some("Kitchen".into()),
            prompt: Some("craft/basic.hbs".into()),
            model: Some("gpt-4o".into()),
            topic: Some("102".into()),
            overview: Some("Custom".into()),
            level: Some(Level::C1),
            source_language: Some(Language::Fr),
            target_language: None,
            words: Some(12),
            temperature: Some(0.5),
        };
        let params = crafter.setup(&request).await.unwrap();
        assert_eq!(params.name, "Kitchen");
        assert_eq!(params.topic, "Food and Cooking");
        assert_eq!(params.subcategory, "102");
        assert_eq!(params.level, Level::C1);
        assert_eq!(params.source_language, Language::Fr);
        assert_ne!(params.target_language, Language::Fr);
        assert_eq!(params.words, 12);
        assert_eq!(params.model, "gpt-4o");
    }

    #[tokio::test]
    async fn setup_joins_field_errors() {
        let crafter = crafter(Arc::new(ScriptedModel::default())).await;
        let request = CraftRequest {
            topic: Some("Astrophysics".into()),
            source_language: Some(Language::De),
            target_language: Some(Language::De),
            temperature: Some(3.0),
            ..Default::default()
        };
        let err = crafter.setup(&request).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("topic:"), "{msg}");
        assert!(msg.contains("language:"), "{msg}");
        assert!(msg.contains("temperature:"), "{msg}");
        assert!(matches!(err.root(), LexiforgeError::Multiple(errors) if errors.len() == 3));
    }

    #[tokio::test]
    async fn setup_rejects_blank_model_and_oversized_word_count() {
        let crafter = crafter(Arc::new(ScriptedModel::default())).await;
        let request = CraftRequest {
            model: Some("  ".into()),
            words: Some(u32::MAX),
            ..Default::default()
        };
        let err = crafter.setup(&request).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("model: must not be empty"), "{msg}");
        assert!(msg.contains("words:"), "{msg}");
        assert!(matches!(err.root(), LexiforgeError::Multiple(errors) if errors.len() == 2));

        let at_limit = CraftRequest {
            words: Some(MAX_WORDS),
            ..Default::default()
        };
        assert_eq!(crafter.setup(&at_limit).await.unwrap().words, MAX_WORDS);
    }

    #[tokio::test]
    async fn setup_fails_without_prompts() {
        let prompts = PromptLibrary::new(Arc::new(MemoryBlobStore::new()), "prompts");
        let crafter = Crafter::new(Arc::new(ScriptedModel::default()), prompts, config());
        let err = crafter.setup(&CraftRequest::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn render_interpolates_params() {
        let crafter = crafter(Arc::new(ScriptedModel::default())).await;
        let request = CraftRequest {
            prompt: Some("craft/basic.hbs".into()),
            topic: Some("Travel".into()),
            level: Some(Level::A2),
            source_language: Some(Language::En),
            target_language: Some(Language::Ja),
            words: Some(60),
            ..Default::default()
        };
        let params = crafter.setup(&request).await.unwrap();
        let body = crafter.render(&params).await.unwrap();
        assert!(body.contains("60 English words"), "{body}");
        assert!(body.contains("Japanese"), "{body}");
        assert!(body.contains("level A2"), "{body}");
        assert!(body.contains("Travel"), "{body}");
    }

    #[tokio::test]
    async fn craft_parses_generation() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(generation_json(
            "Trip Words",
            "",
            3,
        ))]));
        let crafter = crafter(model.clone()).await;
        let request = CraftRequest {
            name: Some("trip".into()),
            ..Default::default()
        };
        let dictionary = crafter
            .craft(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert_eq!(dictionary.words.len(), 3);
        assert_eq!(dictionary.author, "lexiforge");
        assert_eq!(dictionary.id, DictionaryId::derive("trip", "lexiforge"));

        let record = dictionary.staging_record();
        assert_eq!(record.name, "Trip Words");
        assert_eq!(record.word_count, 3);
        assert!(record.score.is_none());
        assert!(!record.upload);

        let sent = model.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].temperature, Some(0.9));
    }

    #[tokio::test]
    async fn craft_rejects_empty_word_list() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(generation_json("Empty", "x", 0))]));
        let crafter = crafter(model).await;
        let err = crafter
            .craft(&CancellationToken::new(), &CraftRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LexiforgeError::EmptyDictionary));
    }

    #[tokio::test]
    async fn craft_accepts_fenced_output() {
        let fenced = format!("Here you go:\n```json\n{}\n```", generation_json("Fenced", "ann", 2));
        let model = Arc::new(ScriptedModel::replying(vec![Ok(fenced)]));
        let crafter = crafter(model).await;
        let dictionary = crafter
            .craft(&CancellationToken::new(), &CraftRequest::default())
            .await
            .unwrap();
        assert_eq!(dictionary.author, "ann");
        assert_eq!(dictionary.words.len(), 2);
    }
}
