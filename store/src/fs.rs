use async_trait::async_trait;
use camino::Utf8PathBuf;
use common::{DocId, KeyBuilder};
use std::io::SeekFrom;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{DataStoreError, Database, ReadStream, Result, SeekPos, WriteStream, dedupe_doc_ids};

/// Filesystem-directory-backed `Database`: one file per composed key.
pub struct FileSystemDatabase {
    root: Utf8PathBuf,
}

impl FileSystemDatabase {
    pub async fn new(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Utf8PathBuf {
        self.root.join(key)
    }
}

struct FsReadStream {
    file: fs::File,
}

#[async_trait]
impl ReadStream for FsReadStream {
    async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn seek(&mut self, pos: SeekPos) -> Result<u64> {
        let from = match pos {
            SeekPos::Start(offset) => SeekFrom::Start(offset),
            SeekPos::Current(delta) => SeekFrom::Current(delta),
            SeekPos::End(delta) => SeekFrom::End(delta),
        };
        Ok(self.file.seek(from).await?)
    }
}

#[async_trait]
impl Database for FileSystemDatabase {
    async fn write_stream(&self, key: &str, _content_type: &str) -> Result<Box<dyn WriteStream>> {
        let path = self.path_for(key);
        // Write to a temp file and persist it on close so a crash mid-write
        // never leaves a partially-written blob visible under `key`.
        let tmp_path = path.with_extension("tmp");
        let file = fs::File::create(&tmp_path).await?;
        Ok(Box::new(TempFsWriteStream {
            file,
            tmp_path,
            final_path: path,
        }))
    }

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ReadStream>> {
        let path = self.path_for(key);
        let file = fs::File::open(&path)
            .await
            .map_err(|_| DataStoreError::NotFound(key.to_owned()))?;
        Ok(Box::new(FsReadStream { file }))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.path_for(key);
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| DataStoreError::NotFound(key.to_owned()))?;
        Ok(meta.len())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path_for(key))
            .await
            .map_err(|_| DataStoreError::NotFound(key.to_owned()))
    }

    async fn iter_ids(&self, key_builder: &dyn KeyBuilder) -> Result<Vec<DocId>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    keys.push(name.to_owned());
                }
            }
        }
        dedupe_doc_ids(keys.into_iter(), key_builder)
    }
}

/// Writer that stages bytes in a `.tmp` sibling and renames it into place on
/// `close`, so partial writes on a close-failure path are never readable
/// under the real key.
struct TempFsWriteStream {
    file: fs::File,
    tmp_path: Utf8PathBuf,
    final_path: Utf8PathBuf,
}

#[async_trait]
impl WriteStream for TempFsWriteStream {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        drop(self.file);
        fs::rename(&self.tmp_path, &self.final_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::StringDelimitedKeyBuilder;
    use tempfile::tempdir;

    async fn open(dir: &tempfile::TempDir) -> FileSystemDatabase {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        FileSystemDatabase::new(root).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_bytes() {
        let dir = tempdir().unwrap();
        let db = open(&dir).await;
        let mut w = db.write_stream("doc:feat:v1", "application/octet-stream").await.unwrap();
        w.write_chunk(b"hello ").await.unwrap();
        w.write_chunk(b"world").await.unwrap();
        w.close().await.unwrap();

        let mut r = db.read_stream("doc:feat:v1").await.unwrap();
        assert_eq!(r.read_all().await.unwrap(), b"hello world");
        assert_eq!(db.size("doc:feat:v1").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let db = open(&dir).await;
        assert!(matches!(
            db.read_stream("nope").await,
            Err(DataStoreError::NotFound(_))
        ));
        assert!(matches!(
            db.size("nope").await,
            Err(DataStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn partial_write_not_visible_before_close() {
        let dir = tempdir().unwrap();
        let db = open(&dir).await;
        let mut w = db.write_stream("doc:feat:v1", "application/octet-stream").await.unwrap();
        w.write_chunk(b"partial").await.unwrap();
        assert!(!db.exists("doc:feat:v1").await.unwrap());
    }

    #[tokio::test]
    async fn iter_ids_dedupes() {
        let dir = tempdir().unwrap();
        let db = open(&dir).await;
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
