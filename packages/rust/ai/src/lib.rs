//! AI text service access for lexiforge.
//!
//! - [`RetryClient`]: POST with a deadline and fixed-backoff retries on transient statuses
//! - [`ChatClient`] / [`ChatModel`]: chat-completions adapter with typed provider errors
//! - [`parse_json_content`]: tolerant parsing of structured model output

pub mod chat;
pub mod http;
pub mod structured;

pub use chat::{ChatChoice, ChatClient, ChatMessage, ChatModel, ChatRequest, ChatResponse, Role, Usage};
pub use http::{RetryClient, RetryPredicate, retry_on_server_error};
pub use structured::parse_json_content;
