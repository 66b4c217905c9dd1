//! Content-addressed binary storage for uploaded resume files (C2, §4.2).

use async_trait::async_trait;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::OBJECT_STORE_CHUNK_BYTES;
use crate::errors::{ObjectStoreError, PipelineError};

#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub content_type: String,
    pub checksum: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under a server-assigned `fileId`, chunked to
    /// `OBJECT_STORE_CHUNK_BYTES`. Returns the id.
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String, PipelineError>;

    /// Fetch the full blob, verifying the checksum against what was
    /// recorded at `put` time.
    async fn open_read(&self, file_id: &str) -> Result<Vec<u8>, PipelineError>;

    async fn stat(&self, file_id: &str) -> Result<FileStat, PipelineError>;
}

pub struct SqliteObjectStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteObjectStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SqliteObjectStore { conn }
    }

    pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS object_store_files (
                file_id TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS object_store_chunks (
                file_id TEXT NOT NULL REFERENCES object_store_files(file_id),
                chunk_index INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (file_id, chunk_index)
            );
            ",
        )
    }

    pub fn compute_checksum(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String, PipelineError> {
        let file_id = uuid::Uuid::new_v4().to_string();
        let checksum = Self::compute_checksum(bytes);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO object_store_files (file_id, size, content_type, checksum, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_id,
                bytes.len() as i64,
                content_type,
                checksum,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        for (chunk_index, chunk) in bytes.chunks(OBJECT_STORE_CHUNK_BYTES).enumerate() {
            conn.execute(
                "INSERT INTO object_store_chunks (file_id, chunk_index, data) VALUES (?1, ?2, ?3)",
                params![file_id, chunk_index as i64, chunk],
            )?;
        }
        Ok(file_id)
    }

    async fn open_read(&self, file_id: &str) -> Result<Vec<u8>, PipelineError> {
        let conn = self.conn.lock().await;
        let expected_checksum: String = conn
            .query_row(
                "SELECT checksum FROM object_store_files WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .map_err(|_| ObjectStoreError::NotFound(file_id.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT data FROM object_store_chunks WHERE file_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let mut bytes = Vec::new();
        let mut rows = stmt.query(params![file_id])?;
        while let Some(row) = rows.next()? {
            let chunk: Vec<u8> = row.get(0)?;
            bytes.extend_from_slice(&chunk);
        }

        let actual_checksum = Self::compute_checksum(&bytes);
        if actual_checksum != expected_checksum {
            return Err(ObjectStoreError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            }
            .into());
        }
        Ok(bytes)
    }

    async fn stat(&self, file_id: &str) -> Result<FileStat, PipelineError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT size, content_type, checksum FROM object_store_files WHERE file_id = ?1",
            params![file_id],
            |row| {
                Ok(FileStat {
                    size: row.get::<_, i64>(0)? as u64,
                    content_type: row.get(1)?,
                    checksum: row.get(2)?,
                })
            },
        )
        .map_err(|_| ObjectStoreError::NotFound(file_id.to_string()).into())
    }
}
