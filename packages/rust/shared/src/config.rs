//! Application configuration for lexiforge.
//!
//! User config lives at `~/.lexiforge/lexiforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{LexiforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "lexiforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".lexiforge";

// ---------------------------------------------------------------------------
// Config structs (matching lexiforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// AI text service settings.
    #[serde(default)]
    pub ai: AiConfig,

    /// Generation defaults.
    #[serde(default)]
    pub craft: CraftSection,

    /// Review defaults.
    #[serde(default)]
    pub check: CheckSection,

    /// Change-event dispatch.
    #[serde(default)]
    pub trigger: TriggerSection,

    /// Promotion workflow.
    #[serde(default)]
    pub promotion: PromotionSection,

    /// Local store bindings.
    #[serde(default)]
    pub stores: StoresSection,
}

/// `[ai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the chat completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Default model.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-call deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient statuses.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed wait between retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}

/// `[craft]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CraftSection {
    /// Prompt key prefix a random generation template is picked from.
    #[serde(default = "default_craft_prefix")]
    pub prompt_prefix: String,

    #[serde(default = "default_craft_temperature")]
    pub temperature: f32,

    #[serde(default = "default_min_words")]
    pub min_words: u32,

    #[serde(default = "default_max_words")]
    pub max_words: u32,

    /// Author recorded when the model does not name one.
    #[serde(default = "default_author")]
    pub author: String,

    /// Concurrent generation calls during a forge run.
    #[serde(default = "default_craft_concurrency")]
    pub concurrency: usize,
}

impl Default for CraftSection {
    fn default() -> Self {
        Self {
            prompt_prefix: default_craft_prefix(),
            temperature: default_craft_temperature(),
            min_words: default_min_words(),
            max_words: default_max_words(),
            author: default_author(),
            concurrency: default_craft_concurrency(),
        }
    }
}

fn default_craft_prefix() -> String {
    "craft/".into()
}
fn default_craft_temperature() -> f32 {
    0.9
}
fn default_min_words() -> u32 {
    51
}
fn default_max_words() -> u32 {
    91
}
fn default_author() -> String {
    "lexiforge".into()
}
fn default_craft_concurrency() -> usize {
    4
}

/// `[check]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSection {
    /// Review prompt template key.
    #[serde(default = "default_check_prompt")]
    pub prompt: String,

    /// Model override for reviews; falls back to `[ai].model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_check_temperature")]
    pub temperature: f32,
}

impl Default for CheckSection {
    fn default() -> Self {
        Self {
            prompt: default_check_prompt(),
            model: None,
            temperature: default_check_temperature(),
        }
    }
}

fn default_check_prompt() -> String {
    "check/default.hbs".into()
}
fn default_check_temperature() -> f32 {
    0.2
}

/// `[trigger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSection {
    /// Concurrent event handlers per batch.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Minimum review score that promotes a dictionary.
    #[serde(default = "default_threshold")]
    pub promotion_threshold: i64,

    /// Change records read per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            promotion_threshold: default_threshold(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_workers() -> usize {
    8
}
fn default_threshold() -> i64 {
    90
}
fn default_batch_size() -> usize {
    25
}

/// `[promotion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSection {
    /// Polls of the published blob namespace before giving up.
    #[serde(default = "default_visibility_retries")]
    pub visibility_retries: u32,

    #[serde(default = "default_visibility_backoff_ms")]
    pub visibility_backoff_ms: u64,
}

impl Default for PromotionSection {
    fn default() -> Self {
        Self {
            visibility_retries: default_visibility_retries(),
            visibility_backoff_ms: default_visibility_backoff_ms(),
        }
    }
}

fn default_visibility_retries() -> u32 {
    5
}
fn default_visibility_backoff_ms() -> u64 {
    200
}

/// `[stores]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresSection {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_blob_root")]
    pub blob_root: String,

    #[serde(default = "default_staging_namespace")]
    pub staging_namespace: String,

    #[serde(default = "default_published_namespace")]
    pub published_namespace: String,

    #[serde(default = "default_prompt_namespace")]
    pub prompt_namespace: String,
}

impl Default for StoresSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_root: default_blob_root(),
            staging_namespace: default_staging_namespace(),
            published_namespace: default_published_namespace(),
            prompt_namespace: default_prompt_namespace(),
        }
    }
}

fn default_database_path() -> String {
    "~/.lexiforge/lexiforge.db".into()
}
fn default_blob_root() -> String {
    "~/.lexiforge/blobs".into()
}
fn default_staging_namespace() -> String {
    "dictionaries-staging".into()
}
fn default_published_namespace() -> String {
    "dictionaries".into()
}
fn default_prompt_namespace() -> String {
    "prompts".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig, passed to constructors)
// ---------------------------------------------------------------------------

/// Retrying HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl From<&AppConfig> for HttpConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.ai.timeout_secs),
            max_retries: config.ai.max_retries,
            backoff: Duration::from_millis(config.ai.retry_backoff_ms),
        }
    }
}

/// Generation defaults applied during request resolution.
#[derive(Debug, Clone)]
pub struct CraftConfig {
    pub prompt_prefix: String,
    pub model: String,
    pub temperature: f32,
    pub min_words: u32,
    pub max_words: u32,
    pub author: String,
}

impl From<&AppConfig> for CraftConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            prompt_prefix: config.craft.prompt_prefix.clone(),
            model: config.ai.model.clone(),
            temperature: config.craft.temperature,
            min_words: config.craft.min_words,
            max_words: config.craft.max_words,
            author: config.craft.author.clone(),
        }
    }
}

/// Review defaults applied during request resolution.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
}

impl From<&AppConfig> for CheckConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            prompt: config.check.prompt.clone(),
            model: config
                .check
                .model
                .clone()
                .unwrap_or_else(|| config.ai.model.clone()),
            temperature: config.check.temperature,
        }
    }
}

/// Change-event dispatcher settings.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub workers: usize,
    pub promotion_threshold: i64,
    pub batch_size: usize,
}

impl From<&AppConfig> for TriggerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.trigger.workers,
            promotion_threshold: config.trigger.promotion_threshold,
            batch_size: config.trigger.batch_size,
        }
    }
}

/// Promotion workflow settings.
#[derive(Debug, Clone)]
pub struct PromotionConfig {
    pub staging_namespace: String,
    pub published_namespace: String,
    pub visibility_retries: u32,
    pub visibility_backoff: Duration,
}

impl From<&AppConfig> for PromotionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            staging_namespace: config.stores.staging_namespace.clone(),
            published_namespace: config.stores.published_namespace.clone(),
            visibility_retries: config.promotion.visibility_retries,
            visibility_backoff: Duration::from_millis(config.promotion.visibility_backoff_ms),
        }
    }
}

/// Resolved locations of the local store bindings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub blob_root: PathBuf,
    pub staging_namespace: String,
    pub published_namespace: String,
    pub prompt_namespace: String,
}

impl From<&AppConfig> for StoreConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            database_path: expand_home(&config.stores.database_path),
            blob_root: expand_home(&config.stores.blob_root),
            staging_namespace: config.stores.staging_namespace.clone(),
            published_namespace: config.stores.published_namespace.clone(),
            prompt_namespace: config.stores.prompt_namespace.clone(),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.lexiforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LexiforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.lexiforge/lexiforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LexiforgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        LexiforgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LexiforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LexiforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LexiforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject configurations no component could run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    Url::parse(&config.ai.base_url).map_err(|e| {
        LexiforgeError::config(format!("ai.base_url {:?} is invalid: {e}", config.ai.base_url))
    })?;
    if config.craft.min_words == 0 || config.craft.min_words > config.craft.max_words {
        return Err(LexiforgeError::config(format!(
            "craft word range [{}, {}] is empty",
            config.craft.min_words, config.craft.max_words
        )));
    }
    if config.trigger.workers == 0 || config.trigger.batch_size == 0 {
        return Err(LexiforgeError::config(
            "trigger.workers and trigger.batch_size must be at least 1",
        ));
    }
    Ok(())
}

/// Read the AI service API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.ai.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(LexiforgeError::config(format!(
            "AI service API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("staging_namespace"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.craft.min_words, 51);
        assert_eq!(parsed.craft.max_words, 91);
        assert_eq!(parsed.trigger.promotion_threshold, 90);
        validate_config(&parsed).expect("defaults are valid");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[ai]
model = "gpt-4o"

[check]
temperature = 0.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        let check = CheckConfig::from(&config);
        assert_eq!(check.model, "gpt-4o");
        assert_eq!(check.prompt, "check/default.hbs");
        assert_eq!(config.ai.max_retries, 3);
    }

    #[test]
    fn check_model_override() {
        let mut config = AppConfig::default();
        config.check.model = Some("gpt-4o".into());
        assert_eq!(CheckConfig::from(&config).model, "gpt-4o");
        assert_eq!(CraftConfig::from(&config).model, "gpt-4o-mini");
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let http = HttpConfig::from(&app);
        assert_eq!(http.timeout, Duration::from_secs(60));
        assert_eq!(http.max_retries, 3);
        assert_eq!(http.backoff, Duration::from_millis(2_000));

        let promotion = PromotionConfig::from(&app);
        assert_eq!(promotion.visibility_retries, 5);
        assert_eq!(promotion.published_namespace, "dictionaries");
    }

    #[test]
    fn invalid_word_range_rejected() {
        let mut config = AppConfig::default();
        config.craft.min_words = 100;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.ai.api_key_env = "LEXIFORGE_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
