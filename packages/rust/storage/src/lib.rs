//! Storage for lexiforge: keyed record tables, blobs, and the change feed.
//!
//! Each concern is a trait with an in-memory binding for tests and a
//! durable binding for the CLI:
//!
//! | Contract            | Durable           | In-memory          |
//! |---------------------|-------------------|--------------------|
//! | [`KeyValueStore`]   | [`SqlStore`]      | [`MemoryStore`]    |
//! | [`ChangeFeed`]      | [`SqlStore`]      | [`MemoryStore`]    |
//! | [`BlobStore`]       | [`FsBlobStore`]   | [`MemoryBlobStore`]|

pub mod blob;
pub mod changes;
pub mod fs;
pub mod kv;
pub mod memory;
mod migrations;
pub mod sql;

pub use blob::{BlobStore, blob_path};
pub use changes::{ChangeFeed, ChangeRecord, EVENT_INSERT, EVENT_MODIFY, EVENT_REMOVE};
pub use fs::FsBlobStore;
pub use kv::{Condition, Filter, KeyValueStore, Mutation, Page, PageRequest, Record, published_key};
pub use memory::{MemoryBlobStore, MemoryStore};
pub use sql::{DEFAULT_CONSUMER, SqlStore};
