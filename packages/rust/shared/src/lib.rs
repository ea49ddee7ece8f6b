//! Shared types, error model, and configuration for lexiforge.
//!
//! This crate is the foundation depended on by all other lexiforge crates.
//! It provides:
//! - [`LexiforgeError`]: the unified error type
//! - Domain types ([`StagingRecord`], [`PublishedRecord`], [`DictionaryId`], word lists)
//! - Configuration ([`AppConfig`] and the per-component runtime configs)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AiConfig, AppConfig, CheckConfig, CraftConfig, HttpConfig, PromotionConfig, StoreConfig,
    TriggerConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key, validate_config,
};
pub use error::{ApiError, ApiErrorKind, LexiforgeError, Result, ResultExt};
pub use types::{
    DictionaryId, DictionaryMeta, GenerationResponse, INDEX_LEVEL_PUBLIC,
    INDEX_LEVEL_SUBCATEGORY_PUBLIC, INDEX_SUBCATEGORY_PUBLIC, Language, Level, OVERVIEWS,
    PublishedRecord, Review, StagingRecord, TOPICS, Topic, WORD_LIST_CONTENT_TYPE, WordEntry,
    catalog_index_keys, decode_word_list, encode_word_list, find_topic,
};
