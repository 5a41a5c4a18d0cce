use async_trait::async_trait;
use common::{DocId, KeyBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{DataStoreError, Database, ReadStream, Result, SeekPos, WriteStream, dedupe_doc_ids};

struct Blob {
    #[allow(dead_code)]
    content_type: String,
    data: Vec<u8>,
}

/// In-memory `Database` backend. Useful for tests and for short-lived runs
/// where persistence across process restarts isn't required.
///
/// Backed by an `Arc<Mutex<..>>` so that a `write_stream` writer can hold a
/// cloned handle to the map rather than borrowing `&self` for the lifetime
/// of the write.
#[derive(Default, Clone)]
pub struct MemoryDatabase {
    blobs: Arc<Mutex<HashMap<String, Blob>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Buffers writes in memory; `close` is the only moment the buffer is
/// promoted into the database's map, so a writer that is dropped without
/// closing leaves the key untouched. This is an explicit buffered writer,
/// not a hijacked `close` method.
struct MemoryWriteStream {
    key: String,
    content_type: String,
    buffer: Vec<u8>,
    blobs: Arc<Mutex<HashMap<String, Blob>>>,
}

#[async_trait]
impl WriteStream for MemoryWriteStream {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("memory database lock poisoned");
        blobs.insert(
            self.key,
            Blob {
                content_type: self.content_type,
                data: self.buffer,
            },
        );
        Ok(())
    }
}

struct MemoryReadStream {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl ReadStream for MemoryReadStream {
    async fn read_all(&mut self) -> Result<Vec<u8>> {
        let slice = &self.data[self.pos..];
        let out = slice.to_vec();
        self.pos = self.data.len();
        Ok(out)
    }

    async fn seek(&mut self, pos: SeekPos) -> Result<u64> {
        let new_pos = match pos {
            SeekPos::Start(offset) => offset as i64,
            SeekPos::Current(delta) => self.pos as i64 + delta,
            SeekPos::End(delta) => self.data.len() as i64 + delta,
        };
        self.pos = new_pos.clamp(0, self.data.len() as i64) as usize;
        Ok(self.pos as u64)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn write_stream(&self, key: &str, content_type: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(MemoryWriteStream {
            key: key.to_owned(),
            content_type: content_type.to_owned(),
            buffer: Vec::new(),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ReadStream>> {
        let blobs = self.blobs.lock().expect("memory database lock poisoned");
        let blob = blobs
            .get(key)
            .ok_or_else(|| DataStoreError::NotFound(key.to_owned()))?;
        Ok(Box::new(MemoryReadStream {
            data: blob.data.clone(),
            pos: 0,
        }))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let blobs = self.blobs.lock().expect("memory database lock poisoned");
        blobs
            .get(key)
            .map(|b| b.data.len() as u64)
            .ok_or_else(|| DataStoreError::NotFound(key.to_owned()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let blobs = self.blobs.lock().expect("memory database lock poisoned");
        Ok(blobs.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("memory database lock poisoned");
        blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DataStoreError::NotFound(key.to_owned()))
    }

    async fn iter_ids(&self, key_builder: &dyn KeyBuilder) -> Result<Vec<DocId>> {
        let blobs = self.blobs.lock().expect("memory database lock poisoned");
        dedupe_doc_ids(blobs.keys().cloned(), key_builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::StringDelimitedKeyBuilder;

    #[tokio::test]
    async fn write_is_invisible_until_close() {
        let db = MemoryDatabase::new();
        let mut w = db.write_stream("k", "application/octet-stream").await.unwrap();
        w.write_chunk(b"hello").await.unwrap();
        assert!(!db.exists("k").await.unwrap());
        w.close().await.unwrap();
        assert!(db.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn read_missing_key_is_not_found() {
        let db = MemoryDatabase::new();
        assert!(matches!(
            db.read_stream("missing").await,
            Err(DataStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_reported_on_absent_key() {
        let db = MemoryDatabase::new();
        assert!(matches!(
            db.delete("missing").await,
            Err(DataStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn iter_ids_dedupes_by_doc() {
        let db = MemoryDatabase::new();
        let kb = StringDelimitedKeyBuilder::default();
        for key in ["doc-1:a:v1", "doc-1:b:v1", "doc-2:a:v1"] {
            let mut w = db.write_stream(key, "application/octet-stream").await.unwrap();
            w.write_chunk(b"x").await.unwrap();
            w.close().await.unwrap();
        }
        let mut ids: Vec<_> = db
            .iter_ids(&kb)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.as_str().to_owned())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["doc-1".to_string(), "doc-2".to_string()]);
    }
}
