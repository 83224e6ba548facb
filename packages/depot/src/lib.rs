//! depot: content-addressed file storage gateway.
//!
//! Uploads are hashed with BLAKE3 while they stream in, deduplicated by
//! digest, and written once to a pluggable object store. Metadata lives in
//! SQLite; deleted content is reclaimed in the background after a grace
//! period.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod hash;
pub mod http;
pub mod mime;
pub mod models;
pub mod pipeline;
pub mod reclaim;
pub mod service;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Depot;
pub use config::Config;
pub use error::{DepotError, Result};
pub use hash::Digest;
pub use models::{FileRecord, FileState, ObjectState, StoredObject};
