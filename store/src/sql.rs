use async_trait::async_trait;
use common::{DocId, KeyBuilder};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::{AnyPool, Row};

use crate::{DataStoreError, Database, ReadStream, Result, SeekPos, WriteStream, dedupe_doc_ids};

/// SQL-backed `Database`: a thin wrapper around an `sqlx::AnyPool` with
/// migrations run at construction.
pub struct SqlDatabase {
    pool: AnyPool,
}

impl SqlDatabase {
    pub async fn connect(url: &str) -> Result<Self> {
        install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

struct SqlWriteStream {
    key: String,
    content_type: String,
    buffer: Vec<u8>,
    pool: AnyPool,
}

#[async_trait]
impl WriteStream for SqlWriteStream {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        sqlx::query("INSERT INTO blobs (key, content_type, data) VALUES ($1, $2, $3) ON CONFLICT(key) DO UPDATE SET content_type = excluded.content_type, data = excluded.data")
            .bind(self.key)
            .bind(self.content_type)
            .bind(self.buffer)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

struct SqlReadStream {
    // Open question from the memory-mapped KV reference implementation:
    // whether a borrowed byte buffer stays valid after its transaction
    // closes. We sidestep the ambiguity entirely by copying the row's bytes
    // out before the query that fetched them ever goes out of scope.
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl ReadStream for SqlReadStream {
    async fn read_all(&mut self) -> Result<Vec<u8>> {
        let out = self.data[self.pos..].to_vec();
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
impl Database for SqlDatabase {
    async fn write_stream(&self, key: &str, content_type: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(SqlWriteStream {
            key: key.to_owned(),
            content_type: content_type.to_owned(),
            buffer: Vec::new(),
            pool: self.pool.clone(),
        }))
    }

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ReadStream>> {
        let row = sqlx::query("SELECT data FROM blobs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DataStoreError::NotFound(key.to_owned()))?;
        let data: Vec<u8> = row.try_get("data")?;
        Ok(Box::new(SqlReadStream { data, pos: 0 }))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let row = sqlx::query("SELECT data FROM blobs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DataStoreError::NotFound(key.to_owned()))?;
        let data: Vec<u8> = row.try_get("data")?;
        Ok(data.len() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 as present FROM blobs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM blobs WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound(key.to_owned()));
        }
        Ok(())
    }

    async fn iter_ids(&self, key_builder: &dyn KeyBuilder) -> Result<Vec<DocId>> {
        let rows = sqlx::query("SELECT key FROM blobs").fetch_all(&self.pool).await?;
        let keys = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("key"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        dedupe_doc_ids(keys.into_iter(), key_builder)
    }
}
