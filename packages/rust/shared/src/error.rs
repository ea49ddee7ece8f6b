//! Error types for lexiforge.
//!
//! Library crates use [`LexiforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

/// Top-level error type for all lexiforge operations.
#[derive(Debug, thiserror::Error)]
pub enum LexiforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Missing or invalid request field. Never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Transport-level failure (connect, timeout, body read).
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status that the retry policy gave up on (or never retried).
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Error payload returned by the AI text service.
    #[error("AI service error: {0}")]
    Api(ApiError),

    /// The AI text service answered with zero choices.
    #[error("AI service returned an empty response")]
    EmptyResponse,

    /// A generation parsed successfully but contained no words.
    #[error("generated dictionary has no words")]
    EmptyDictionary,

    /// Response or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Prompt template lookup or rendering error.
    #[error("template error: {0}")]
    Template(String),

    /// Key-value or blob store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The addressed record or blob does not exist.
    #[error("not found: {key}")]
    NotFound { key: String },

    /// A conditional write was rejected by its condition.
    #[error("condition failed for {key}")]
    ConditionFailed { key: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A spawned worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Task(String),

    /// The surrounding operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A compensating rollback failed after the original operation failed.
    /// Both failures must be reconciled by an operator.
    #[error("{original}; compensating rollback also failed: {rollback}")]
    Compensation {
        #[source]
        original: Box<LexiforgeError>,
        rollback: Box<LexiforgeError>,
    },

    /// An error annotated with the operation and key that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<LexiforgeError>,
    },

    /// Several independent failures from one batch.
    #[error("{}", join_messages(.0))]
    Multiple(Vec<LexiforgeError>),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LexiforgeError>;

/// Category tag of an AI service error body (`error.type`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimit,
    InsufficientQuota,
    Server,
    Other(String),
}

impl ApiErrorKind {
    /// Map the provider's `error.type` string to a category.
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "invalid_request_error" => Self::InvalidRequest,
            "authentication_error" | "invalid_api_key" => Self::Authentication,
            "permission_error" => Self::PermissionDenied,
            "not_found_error" => Self::NotFound,
            "rate_limit_error" | "requests" | "tokens" => Self::RateLimit,
            "insufficient_quota" => Self::InsufficientQuota,
            "server_error" | "api_error" => Self::Server,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => f.write_str("invalid_request"),
            Self::Authentication => f.write_str("authentication"),
            Self::PermissionDenied => f.write_str("permission_denied"),
            Self::NotFound => f.write_str("not_found"),
            Self::RateLimit => f.write_str("rate_limit"),
            Self::InsufficientQuota => f.write_str("insufficient_quota"),
            Self::Server => f.write_str("server"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// Typed provider error, carrying the HTTP status and category tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub kind: ApiErrorKind,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (HTTP {}): {}", self.kind, self.status, self.message)
    }
}

fn join_messages(errors: &[LexiforgeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl LexiforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a not-found error for `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a condition-failed error for `key`.
    pub fn condition_failed(key: impl Into<String>) -> Self {
        Self::ConditionFailed { key: key.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Annotate this error with the operation/key that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Collapse a set of independent failures: none is `Ok`, one is itself.
    pub fn join(errors: Vec<LexiforgeError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::aggregate(errors))
        }
    }

    /// One error standing for a non-empty set of failures.
    pub fn aggregate(mut errors: Vec<LexiforgeError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Multiple(errors)
        }
    }

    /// The innermost error, looking through `Context` wrappers.
    pub fn root(&self) -> &LexiforgeError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a conditional write was rejected.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self.root(), Self::ConditionFailed { .. })
    }

    /// Whether the addressed record/blob was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    /// Whether the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Whether the failure is a server-side error that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Api(api) => api.status >= 500 || api.kind == ApiErrorKind::Server,
            _ => false,
        }
    }
}

/// Attach context to the error side of a [`Result`].
pub trait ResultExt<T> {
    /// Wrap the error with a static or computed context string.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily computed context string.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}
