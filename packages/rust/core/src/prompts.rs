//! Prompt templates stored in the blob store.
//!
//! The prompt name is the blob key inside the prompt namespace. Templates are
//! Handlebars documents rendered in strict mode (a missing variable is an
//! error) without HTML escaping.

use std::sync::Arc;

use bytes::Bytes;
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use lexiforge_shared::{LexiforgeError, Result, ResultExt};
use lexiforge_storage::BlobStore;

const TEMPLATE_CONTENT_TYPE: &str = "text/x-handlebars-template";

#[derive(Clone)]
pub struct PromptLibrary {
    blobs: Arc<dyn BlobStore>,
    namespace: String,
    handlebars: Arc<Handlebars<'static>>,
}

impl PromptLibrary {
    pub fn new(blobs: Arc<dyn BlobStore>, namespace: impl Into<String>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            blobs,
            namespace: namespace.into(),
            handlebars: Arc::new(handlebars),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Template source for `name`.
    pub async fn fetch(&self, name: &str) -> Result<String> {
        let data = self
            .blobs
            .get(&self.namespace, name)
            .await
            .with_context(|| format!("load prompt {name}"))?;
        String::from_utf8(data.to_vec())
            .map_err(|_| LexiforgeError::Template(format!("prompt {name} is not valid UTF-8")))
    }

    /// A uniformly random prompt name under `prefix`.
    pub async fn random_name(&self, prefix: &str) -> Result<String> {
        self.blobs
            .random_key_with_prefix(&self.namespace, prefix)
            .await
            .with_context(|| format!("pick prompt under {prefix}"))
    }

    /// Store a template, after checking that it parses.
    pub async fn put(&self, name: &str, source: &str) -> Result<()> {
        handlebars::Template::compile(source)
            .map_err(|e| LexiforgeError::Template(format!("prompt {name}: {e}")))?;
        debug!(name, bytes = source.len(), "storing prompt");
        self.blobs
            .put(
                &self.namespace,
                name,
                Bytes::from(source.to_owned()),
                TEMPLATE_CONTENT_TYPE,
            )
            .await
    }

    /// Names of all stored prompts under `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.blobs.list(&self.namespace, prefix).await
    }

    pub fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String> {
        self.handlebars
            .render_template(template, data)
            .map_err(|e| LexiforgeError::Template(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexiforge_storage::MemoryBlobStore;
    use serde_json::json;

    fn library() -> PromptLibrary {
        PromptLibrary::new(Arc::new(MemoryBlobStore::new()), "prompts")
    }

    #[tokio::test]
    async fn put_then_fetch() {
        let prompts = library();
        prompts.put("craft/basic.hbs", "Words about {{topic}}").await.unwrap();
        assert_eq!(
            prompts.fetch("craft/basic.hbs").await.unwrap(),
            "Words about {{topic}}"
        );
        assert_eq!(prompts.random_name("craft/").await.unwrap(), "craft/basic.hbs");
    }

    #[tokio::test]
    async fn missing_prompt_is_not_found() {
        let err = library().fetch("craft/none.hbs").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("load prompt craft/none.hbs"));
    }

    #[tokio::test]
    async fn rejects_unparseable_template() {
        let err = library().put("craft/bad.hbs", "{{#if}}").await.unwrap_err();
        assert!(matches!(err, LexiforgeError::Template(_)));
    }

    #[test]
    fn render_is_strict_and_unescaped() {
        let prompts = library();
        let out = prompts
            .render("{{a}} & {{b}}", &json!({"a": "<x>", "b": "\"y\""}))
            .unwrap();
        assert_eq!(out, "<x> & \"y\"");

        let err = prompts.render("{{missing}}", &json!({})).unwrap_err();
        assert!(matches!(err, LexiforgeError::Template(_)));
    }
}
