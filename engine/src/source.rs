use std::path::Path;

use tokio::fs;

use crate::chunk::Chunk;
use crate::node::{Advance, EngineError};

/// A root node's production, polled once per scheduler round. This is the
/// only place genuine incremental laziness survives the translation from
/// the reference implementation's generator-based roots: every other node
/// in the graph fully drains its input in one dispatch, but a source may
/// legitimately not have its next chunk ready yet (`Pending`).
pub trait Source: Send {
    fn advance(&mut self) -> Result<Advance, EngineError>;
}

/// Splits an in-memory byte buffer into fixed-size chunks. The reference
/// source adapter contract: zero-length input fails with
/// [`EngineError::EmptyStream`] on the very first call.
pub struct ByteStreamSource {
    data: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    started: bool,
}

impl ByteStreamSource {
    pub fn new(data: impl Into<Vec<u8>>, chunk_size: usize) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunk_size: chunk_size.max(1),
            started: false,
        }
    }
}

impl Source for ByteStreamSource {
    fn advance(&mut self) -> Result<Advance, EngineError> {
        if !self.started {
            self.started = true;
            if self.data.is_empty() {
                return Err(EngineError::EmptyStream);
            }
        }
        if self.pos >= self.data.len() {
            return Ok(Advance::Done);
        }
        let end = (self.pos + self.chunk_size).min(self.data.len());
        let chunk = Chunk::bytes(self.data[self.pos..end].to_vec());
        self.pos = end;
        Ok(Advance::Emit(chunk))
    }
}

/// Reads a local file's full contents once at construction, then chunks it
/// the same way [`ByteStreamSource`] does. The out-of-scope source adapters
/// (HTTP, zip members) follow the same `Source` contract but live outside
/// this crate.
pub struct FileSource {
    inner: ByteStreamSource,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, EngineError> {
        let path_ref = path.as_ref();
        let data = fs::read(path_ref).await.map_err(|err| EngineError::Extraction {
            node: format!("FileSource({})", path_ref.display()),
            source: Box::new(err),
        })?;
        Ok(Self {
            inner: ByteStreamSource::new(data, chunk_size),
        })
    }
}

impl Source for FileSource {
    fn advance(&mut self) -> Result<Advance, EngineError> {
        self.inner.advance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream_fails_on_first_poll() {
        let mut source = ByteStreamSource::new(Vec::new(), 4);
        assert!(matches!(source.advance(), Err(EngineError::EmptyStream)));
    }

    #[test]
    fn chunks_respect_configured_size() {
        let mut source = ByteStreamSource::new(b"hello world".to_vec(), 4);
        let mut chunks = Vec::new();
        loop {
            match source.advance().unwrap() {
                Advance::Emit(Chunk::Bytes(b)) => chunks.push(b.to_vec()),
                Advance::Emit(_) => unreachable!(),
                Advance::Pending => continue,
                Advance::Done => break,
            }
        }
        assert_eq!(chunks, vec![b"hell".to_vec(), b"o wo".to_vec(), b"rld".to_vec()]);
    }

    #[tokio::test]
    async fn file_source_reads_full_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        tokio::fs::write(&path, b"abcdef").await.unwrap();
        let mut source = FileSource::open(&path, 3).await.unwrap();
        let mut out = Vec::new();
        loop {
            match source.advance().unwrap() {
                Advance::Emit(c) => out.extend_from_slice(c.as_bytes().unwrap()),
                Advance::Pending => continue,
                Advance::Done => break,
            }
        }
        assert_eq!(out, b"abcdef");
    }
}
