use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use engine::{Advance, ByteStreamSource, Chunk, EngineError, NodeLogic, Source, UpstreamHandle};
use log::warn;
use store::Database;
use tempfile::NamedTempFile;

use crate::FeatureError;

/// Bytes read back from a stage file per [`Database::write_stream`] call
/// during [`commit_writes`], independent of how large the staged feature's
/// total output is.
const STAGE_READ_CHUNK: usize = 64 * 1024;

/// A terminal node for a *stored* feature: every encoded byte chunk handed
/// to it is appended straight to a temp file on disk rather than held in
/// memory, so a graph run's resident memory for any one stored feature is
/// bounded by a chunk's size, not by the feature's total output size. The
/// real write, opening a `write_stream` against a `Database` and closing it
/// on finalize, happens once after the graph run succeeds, streaming the
/// stage file's bytes back out in fixed-size pieces; see [`commit_writes`].
pub struct StagingWriter {
    cache: Option<Chunk>,
    stage: Arc<Mutex<NamedTempFile>>,
}

impl StagingWriter {
    pub fn new() -> std::io::Result<(Self, Arc<Mutex<NamedTempFile>>)> {
        let stage = Arc::new(Mutex::new(NamedTempFile::new()?));
        Ok((
            Self {
                cache: None,
                stage: Arc::clone(&stage),
            },
            stage,
        ))
    }
}

impl NodeLogic for StagingWriter {
    fn name(&self) -> &str {
        "StagingWriter"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(bytes) = data.as_bytes() {
            self.stage.lock().unwrap().as_file_mut().write_all(bytes)?;
        }
        Ok(Vec::new())
    }
}

/// A terminal node that buffers every chunk handed to it in memory and
/// nothing else. Used only as the partial graph's capture sink for an
/// *unstored* feature being fetched directly: the caller needs the decoded
/// value back immediately, so the bytes have to live in memory for that one
/// fetch regardless, unlike a stored feature's write which can stream
/// through a stage file instead.
pub struct CaptureWriter {
    cache: Option<Chunk>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureWriter {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                cache: None,
                buffer: Arc::clone(&buffer),
            },
            buffer,
        )
    }
}

impl NodeLogic for CaptureWriter {
    fn name(&self) -> &str {
        "CaptureWriter"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(bytes) = data.as_bytes() {
            self.buffer.lock().unwrap().extend_from_slice(bytes);
        }
        Ok(Vec::new())
    }
}

/// A source-like node that re-emits bytes already read out of the `Database`
/// as if they had just been computed, standing in for a feature's extractor
/// when the partial graph finds it already stored. Plain byte re-chunking,
/// same as [`ByteStreamSource`].
pub struct DecoderNode(ByteStreamSource);

impl DecoderNode {
    pub fn from_bytes(bytes: Vec<u8>, chunk_size: usize) -> Self {
        Self(ByteStreamSource::new(bytes, chunk_size))
    }
}

impl Source for DecoderNode {
    fn advance(&mut self) -> Result<Advance, EngineError> {
        self.0.advance()
    }
}

/// A stored feature's not-yet-persisted encoded bytes, staged to disk during
/// a graph run and waiting to be written to its `Database` once the run
/// succeeds. Kept outside the graph so a failed run never performs a single
/// real write (making rollback's job trivial: there is nothing to undo).
pub struct PendingWrite {
    pub key: String,
    pub content_type: String,
    pub database: Arc<dyn Database>,
    pub stage: Arc<Mutex<NamedTempFile>>,
}

/// Persists every staged feature to its bound `Database`, streaming each
/// stage file back out in fixed-size reads rather than loading it whole, so
/// committing stays bounded in memory regardless of a stored feature's
/// total output size. Called once, after a graph run has completed without
/// error.
pub async fn commit_writes(pending: &[PendingWrite]) -> Result<(), FeatureError> {
    for write in pending {
        let mut stream = write.database.write_stream(&write.key, &write.content_type).await?;
        let mut guard = write.stage.lock().unwrap();
        let file = guard.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; STAGE_READ_CHUNK];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            stream.write_chunk(&buf[..read]).await?;
        }
        drop(guard);
        stream.close().await?;
    }
    Ok(())
}

/// Best-effort, idempotent cleanup of whatever in `pending` may already have
/// been committed. Individual failures are logged and do not stop the rest
/// of the rollback from proceeding.
pub async fn rollback_writes(pending: &[PendingWrite]) {
    for write in pending {
        if let Err(err) = write.database.delete(&write.key).await {
            warn!("rollback: failed to delete key {:?}: {}", write.key, err);
        }
    }
}
