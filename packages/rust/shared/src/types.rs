//! Core domain types for lexiforge dictionaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LexiforgeError, Result};

/// Content type of a stored word list blob.
pub const WORD_LIST_CONTENT_TYPE: &str = "application/json";

// ---------------------------------------------------------------------------
// DictionaryId
// ---------------------------------------------------------------------------

/// Identifier of a generated dictionary, derived deterministically from
/// its name and author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DictionaryId(String);

impl DictionaryId {
    /// Derive the identifier for `name` + `author` (32 hex chars of SHA-256).
    pub fn derive(name: &str, author: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b"#");
        hasher.update(author.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the word list blob for this dictionary.
    pub fn blob_key(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DictionaryId {
    type Err = LexiforgeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LexiforgeError::validation(format!(
                "dictionary id must be non-empty hex, got {s:?}"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// CEFR proficiency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::A1,
        Level::A2,
        Level::B1,
        Level::B2,
        Level::C1,
        Level::C2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::C1 => "C1",
            Self::C2 => "C2",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = LexiforgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LexiforgeError::validation(format!("{s:?} is not a CEFR level")))
    }
}

/// Supported dictionary language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
    Ja,
    Ko,
    Zh,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::En,
        Language::Es,
        Language::Fr,
        Language::De,
        Language::It,
        Language::Pt,
        Language::Ja,
        Language::Ko,
        Language::Zh,
    ];

    /// ISO 639-1 code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Ja => "ja",
            Self::Ko => "ko",
            Self::Zh => "zh",
        }
    }

    /// English display name, used in prompts.
    pub fn name(&self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Es => "Spanish",
            Self::Fr => "French",
            Self::De => "German",
            Self::It => "Italian",
            Self::Pt => "Portuguese",
            Self::Ja => "Japanese",
            Self::Ko => "Korean",
            Self::Zh => "Chinese",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = LexiforgeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|l| l.code().eq_ignore_ascii_case(s) || l.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| LexiforgeError::validation(format!("unsupported language {s:?}")))
    }
}

/// A dictionary topic and the catalog subcategory it files under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic {
    pub code: &'static str,
    pub name: &'static str,
}

/// Fixed topic enumeration.
pub const TOPICS: &[Topic] = &[
    Topic { code: "101", name: "Travel" },
    Topic { code: "102", name: "Food and Cooking" },
    Topic { code: "103", name: "Work and Office" },
    Topic { code: "104", name: "Health and Body" },
    Topic { code: "105", name: "Nature and Weather" },
    Topic { code: "106", name: "Family and Relationships" },
    Topic { code: "107", name: "Shopping and Money" },
    Topic { code: "108", name: "Technology" },
    Topic { code: "109", name: "Sports and Hobbies" },
    Topic { code: "110", name: "Home and Housing" },
    Topic { code: "111", name: "Education" },
    Topic { code: "112", name: "Arts and Culture" },
];

/// Look up a topic by name or subcategory code (case-insensitive).
pub fn find_topic(query: &str) -> Option<Topic> {
    let query = query.trim();
    TOPICS
        .iter()
        .copied()
        .find(|t| t.code == query || t.name.eq_ignore_ascii_case(query))
}

/// Fixed enumeration of dictionary styles, used as the record overview.
pub const OVERVIEWS: &[&str] = &[
    "Essential everyday words for getting by",
    "Phrases a traveler needs in the first week",
    "Vocabulary for reading news headlines",
    "Words for small talk with colleagues",
    "Expressions heard in films and series",
    "Terms for describing feelings and opinions",
    "Idioms and set phrases with literal glosses",
    "Verbs that unlock the most sentences",
];

// ---------------------------------------------------------------------------
// Generated content
// ---------------------------------------------------------------------------

/// One entry of a generated word list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordEntry {
    pub term: String,
    pub translation: String,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub note: String,
}

/// Metadata the model returns alongside the word list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryMeta {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
}

/// Parsed generation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub meta: DictionaryMeta,
    pub words: Vec<WordEntry>,
}

/// Parsed review output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub score: i64,
    #[serde(default)]
    pub reason: String,
}

/// Serialize a word list into the blob format.
pub fn encode_word_list(words: &[WordEntry]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(words)
        .map_err(|e| LexiforgeError::parse(format!("failed to encode word list: {e}")))
}

/// Parse a word list blob.
pub fn decode_word_list(bytes: &[u8]) -> Result<Vec<WordEntry>> {
    serde_json::from_slice(bytes)
        .map_err(|e| LexiforgeError::parse(format!("invalid word list blob: {e}")))
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A generated dictionary awaiting review/promotion, in the staging store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: DictionaryId,
    pub name: String,
    pub author: String,
    pub source_language: Language,
    pub target_language: Language,
    pub level: Level,
    pub subcategory: String,
    pub word_count: u32,
    pub overview: String,
    pub topic: String,
    pub description: String,
    /// Prompt template the dictionary was generated from.
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set by an operator to request publication regardless of score.
    #[serde(default)]
    pub upload: bool,
    pub created_at: DateTime<Utc>,
}

impl StagingRecord {
    pub fn blob_key(&self) -> String {
        self.id.blob_key()
    }
}

/// Index on `{level}#{subcategory}#{public}`.
pub const INDEX_LEVEL_SUBCATEGORY_PUBLIC: &str = "level_subcategory_public";
/// Index on `{subcategory}#{public}`.
pub const INDEX_SUBCATEGORY_PUBLIC: &str = "subcategory_public";
/// Index on `{level}#{public}`.
pub const INDEX_LEVEL_PUBLIC: &str = "level_public";

/// An approved dictionary in the public catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub id: DictionaryId,
    pub subcategory: String,
    pub name: String,
    pub author: String,
    pub topic: String,
    pub level: Level,
    pub description: String,
    pub word_count: u32,
    pub public: bool,
    pub rating: i64,
    pub downloads: i64,
    pub created_at: DateTime<Utc>,
    pub level_subcategory_public: String,
    pub subcategory_public: String,
    pub level_public: String,
}

impl PublishedRecord {
    /// Build the public record for an approved staging record.
    pub fn from_staging(record: &StagingRecord, now: DateTime<Utc>) -> Self {
        let public = true;
        let (level_subcategory_public, subcategory_public, level_public) =
            catalog_index_keys(record.level, &record.subcategory, public);
        Self {
            id: record.id.clone(),
            subcategory: record.subcategory.clone(),
            name: record.name.clone(),
            author: record.author.clone(),
            topic: record.topic.clone(),
            level: record.level,
            description: record.description.clone(),
            word_count: record.word_count,
            public,
            rating: 0,
            downloads: 0,
            created_at: now,
            level_subcategory_public,
            subcategory_public,
            level_public,
        }
    }
}

/// Composite catalog index keys: `(level#subcategory#public, subcategory#public, level#public)`.
pub fn catalog_index_keys(level: Level, subcategory: &str, public: bool) -> (String, String, String) {
    (
        format!("{level}#{subcategory}#{public}"),
        format!("{subcategory}#{public}"),
        format!("{level}#{public}"),
    )
}
