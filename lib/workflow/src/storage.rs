//! Object storage abstraction consumed by actions that produce output files.
//!
//! No concrete implementation lives in this crate; actions receive a
//! `&dyn StorageService` through [`crate::registry::RunContext`] and persist
//! bytes through it without this crate knowing which object store backs it.

use async_trait::async_trait;
use std::fmt;

/// Errors surfaced by a storage service implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    WriteFailed { reason: String },
    Unavailable,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed { reason } => write!(f, "storage write failed: {reason}"),
            Self::Unavailable => write!(f, "storage service unavailable"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Persists action output files. Concrete automation is out of scope for
/// this crate; this trait exists so actions can write output without
/// depending on a specific object store.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Persists `bytes` under the given content type and returns the URI at
    /// which they were stored.
    async fn put(&self, content_type: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

/// A [`StorageService`] that accepts writes without persisting them. Useful
/// in tests and as a placeholder until a concrete object store is wired in.
pub struct NullStorageService;

#[async_trait]
impl StorageService for NullStorageService {
    async fn put(&self, _content_type: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        Ok(String::new())
    }
}
