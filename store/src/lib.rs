mod fs;
mod memory;
mod sql;

pub use fs::FileSystemDatabase;
pub use memory::MemoryDatabase;
pub use sql::SqlDatabase;

use async_trait::async_trait;
use common::{DocId, KeyBuilder};
use std::collections::HashSet;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, DataStoreError>;

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("key {0:?} was not found in the store")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("key decomposition error: {0}")]
    Key(#[from] common::KeyError),
}

/// Where a seek offset is measured from. Mirrors `std::io::SeekFrom` but
/// kept local so the `Database` trait doesn't force a particular stream
/// implementation on callers.
#[derive(Clone, Copy, Debug)]
pub enum SeekPos {
    Start(u64),
    Current(i64),
    End(i64),
}

/// A scoped writer returned by [`Database::write_stream`]. Bytes written are
/// visible under the target key only once `close` succeeds; a writer that is
/// dropped without being closed must leave no trace.
#[async_trait]
pub trait WriteStream: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A readable handle returned by [`Database::read_stream`]. Supports a full
/// read and, for backends that can do better than "read it all", seeking.
#[async_trait]
pub trait ReadStream: Send {
    async fn read_all(&mut self) -> Result<Vec<u8>>;
    async fn seek(&mut self, pos: SeekPos) -> Result<u64>;
}

/// Opaque byte-blob key/value store. Keys are the composed
/// `(DocId, FeatureName, FeatureVersion)` strings produced by a
/// [`KeyBuilder`]; values are whatever bytes an `Encoder` produced.
///
/// The engine issues at most one writer per key per `process()` run and
/// never overlaps writers on the same key, so implementations only need to
/// serialize their own internal bookkeeping. Concurrent readers/writers on
/// distinct keys may proceed independently if the backend allows it.
#[async_trait]
pub trait Database: Send + Sync {
    async fn write_stream(&self, key: &str, content_type: &str) -> Result<Box<dyn WriteStream>>;

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ReadStream>>;

    async fn size(&self, key: &str) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Idempotent on absent keys: callers performing best-effort rollback
    /// may call this on a key that was never written.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every distinct `DocId` with at least one stored key, deduplicated via
    /// `key_builder.decompose`.
    async fn iter_ids(&self, key_builder: &dyn KeyBuilder) -> Result<Vec<DocId>>;
}

/// Shared helper for `iter_ids` implementations: dedupe a stream of raw
/// composed keys down to distinct document ids.
pub(crate) fn dedupe_doc_ids(
    keys: impl Iterator<Item = String>,
    key_builder: &dyn KeyBuilder,
) -> Result<Vec<DocId>> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for key in keys {
        let (doc_id, _, _) = key_builder.decompose(&key)?;
        if seen.insert(doc_id.clone()) {
            ids.push(doc_id);
        }
    }
    Ok(ids)
}
