//! SQLite-backed store for course documents and their embeddings.

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vector store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("corrupt embedding for {doc_id}: {len} bytes")]
    CorruptEmbedding { doc_id: String, len: usize },
}

/// A document with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub doc_id: String,
    pub content: String,
    /// blake3 of `content`.
    pub content_hash: String,
    pub model: String,
    pub embedding: Vec<f32>,
}

impl StoredDocument {
    pub fn new(
        doc_id: impl Into<String>,
        content: impl Into<String>,
        model: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let content = content.into();
        Self {
            doc_id: doc_id.into(),
            content_hash: hash_text(&content),
            content,
            model: model.into(),
            embedding,
        }
    }
}

#[derive(Clone)]
pub struct SqliteVectorStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, VectorStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, path)
    }

    pub fn in_memory() -> Result<Self, VectorStoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, VectorStoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS documents (\
               doc_id TEXT PRIMARY KEY,\
               content TEXT NOT NULL,\
               content_hash TEXT NOT NULL,\
               model TEXT NOT NULL,\
               dims INTEGER NOT NULL,\
               embedding BLOB NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, VectorStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, VectorStoreError>,
    {
        let mut guard = self.conn.lock().map_err(|_| VectorStoreError::Poisoned)?;
        f(&mut guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, VectorStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, VectorStoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| VectorStoreError::Join(e.to_string()))?
    }

    /// `(content_hash, model)` for every stored document.
    pub async fn fingerprints(&self) -> Result<HashMap<String, (String, String)>, VectorStoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT doc_id, content_hash, model FROM documents")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
            })?;
            Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
        })
        .await
    }

    pub async fn upsert_many(&self, docs: Vec<StoredDocument>) -> Result<usize, VectorStoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = now_epoch();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO documents (\
                        doc_id, content, content_hash, model, dims, embedding, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(doc_id) DO UPDATE SET \
                        content = excluded.content,\
                        content_hash = excluded.content_hash,\
                        model = excluded.model,\
                        dims = excluded.dims,\
                        embedding = excluded.embedding,\
                        updated_at = excluded.updated_at",
                )?;
                for doc in &docs {
                    stmt.execute(params![
                        doc.doc_id,
                        doc.content,
                        doc.content_hash,
                        doc.model,
                        doc.embedding.len() as i64,
                        encode_embedding(&doc.embedding),
                        now,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(docs.len())
        })
        .await
    }

    /// All documents embedded with `model`.
    pub async fn all(&self, model: &str) -> Result<Vec<StoredDocument>, VectorStoreError> {
        let model = model.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT doc_id, content, content_hash, model, embedding \
                 FROM documents WHERE model = ?1 ORDER BY doc_id",
            )?;
            let mut rows = stmt.query(params![model])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let doc_id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(4)?;
                let embedding = decode_embedding(&blob).ok_or_else(|| {
                    VectorStoreError::CorruptEmbedding {
                        doc_id: doc_id.clone(),
                        len: blob.len(),
                    }
                })?;
                out.push(StoredDocument {
                    doc_id,
                    content: row.get(1)?,
                    content_hash: row.get(2)?,
                    model: row.get(3)?,
                    embedding,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Delete documents whose id is not in `keep`. Returns the number removed.
    pub async fn retain(&self, keep: Vec<String>) -> Result<usize, VectorStoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let existing: Vec<String> = {
                let mut stmt = tx.prepare("SELECT doc_id FROM documents")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut removed = 0;
            for id in existing.iter().filter(|id| !keep.contains(*id)) {
                removed += tx.execute("DELETE FROM documents WHERE doc_id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, VectorStoreError> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
