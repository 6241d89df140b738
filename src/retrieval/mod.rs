//! Course-material retrieval by embedding similarity.

pub mod store;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::gateway::{Attribution, EmbedGateway, EmbedModel, EmbedRequest, ProviderError};

pub use store::{hash_text, SqliteVectorStore, StoredDocument, VectorStoreError};

/// Texts per embedding request when indexing.
const EMBED_BATCH: usize = 16;
/// Embedding requests in flight when indexing.
const EMBED_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] VectorStoreError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("provider returned {got} embeddings for {expected} texts")]
    EmbeddingCount { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDoc {
    pub doc_id: String,
    pub content: String,
    pub score: f32,
}

/// Retrieval capability consumed by the pipeline.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` documents, best first.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDoc>, RetrievalError>;
}

/// Numbered context block for the answer prompt.
pub fn format_context(docs: &[RetrievedDoc]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, d)| {
            format!(
                "[Document {}: {}] (similarity: {:.3})\n{}\n",
                i + 1,
                d.doc_id,
                d.score,
                d.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Cosine similarity; 0.0 when either side is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// A document to be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub doc_id: String,
    pub content: String,
}

/// `*.txt` files directly under `dir`, sorted by file name. The file name is
/// the document id.
pub fn load_directory(dir: &Path) -> Result<Vec<SourceDocument>, RetrievalError> {
    let io_err = |source| RetrievalError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut docs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let content = std::fs::read_to_string(&path).map_err(|source| RetrievalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if content.trim().is_empty() {
            continue;
        }
        docs.push(SourceDocument {
            doc_id: name.to_string(),
            content,
        });
    }
    docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    Ok(docs)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub embedded: usize,
    pub unchanged: usize,
    pub removed: usize,
}

pub struct VectorRetriever {
    embedder: Arc<dyn EmbedGateway>,
    store: SqliteVectorStore,
    model: EmbedModel,
    min_score: Option<f32>,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn EmbedGateway>, store: SqliteVectorStore, model: EmbedModel) -> Self {
        Self {
            embedder,
            store,
            model,
            min_score: None,
        }
    }

    /// Drop results scoring below `threshold`.
    pub fn with_min_score(mut self, threshold: f32) -> Self {
        self.min_score = Some(threshold);
        self
    }

    pub fn store(&self) -> &SqliteVectorStore {
        &self.store
    }

    /// Embed and store `docs`. Documents whose content and model are
    /// unchanged are skipped; stored documents absent from `docs` are
    /// removed.
    pub async fn index(&self, docs: Vec<SourceDocument>) -> Result<IndexReport, RetrievalError> {
        let known = self.store.fingerprints().await?;
        let model = self.model.as_str();
        let keep: Vec<String> = docs.iter().map(|d| d.doc_id.clone()).collect();

        let (changed, unchanged): (Vec<_>, Vec<_>) = docs.into_iter().partition(|d| {
            known.get(&d.doc_id) != Some(&(hash_text(&d.content), model.to_string()))
        });

        let batches: Vec<Vec<SourceDocument>> =
            changed.chunks(EMBED_BATCH).map(|c| c.to_vec()).collect();
        let embedded: Vec<Vec<StoredDocument>> = stream::iter(batches)
            .map(|batch| self.embed_batch(batch))
            .buffer_unordered(EMBED_CONCURRENCY)
            .try_collect()
            .await?;

        let mut report = IndexReport {
            unchanged: unchanged.len(),
            ..Default::default()
        };
        for batch in embedded {
            report.embedded += self.store.upsert_many(batch).await?;
        }
        report.removed = self.store.retain(keep).await?;

        info!(
            embedded = report.embedded,
            unchanged = report.unchanged,
            removed = report.removed,
            "documents indexed"
        );
        Ok(report)
    }

    async fn embed_batch(&self, batch: Vec<SourceDocument>) -> Result<Vec<StoredDocument>, RetrievalError> {
        let texts: Vec<String> = batch.iter().map(|d| d.content.clone()).collect();
        let req = EmbedRequest::new(self.model, texts, Attribution::new("retrieval::index"));
        let resp = self.embedder.embed(req).await?;
        if resp.embeddings.len() != batch.len() {
            return Err(RetrievalError::EmbeddingCount {
                expected: batch.len(),
                got: resp.embeddings.len(),
            });
        }
        Ok(batch
            .into_iter()
            .zip(resp.embeddings)
            .map(|(d, e)| StoredDocument::new(d.doc_id, d.content, self.model.as_str(), e))
            .collect())
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDoc>, RetrievalError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let req = EmbedRequest::single(self.model, query, Attribution::new("retrieval::query"));
        let resp = self.embedder.embed(req).await?;
        let Some(query_vec) = resp.embeddings.into_iter().next() else {
            return Err(RetrievalError::EmbeddingCount { expected: 1, got: 0 });
        };

        let mut scored: Vec<RetrievedDoc> = self
            .store
            .all(self.model.as_str())
            .await?
            .into_iter()
            .map(|d| RetrievedDoc {
                score: cosine_similarity(&query_vec, &d.embedding),
                doc_id: d.doc_id,
                content: d.content,
            })
            .filter(|d| self.min_score.map_or(true, |min| d.score >= min))
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);

        debug!(matched = ?scored.iter().map(|d| &d.doc_id).collect::<Vec<_>>(), "documents retrieved");
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn context_is_numbered_with_scores() {
        let docs = vec![
            RetrievedDoc {
                doc_id: "01_IP.txt".into(),
                content: "IP addresses identify hosts.\n".into(),
                score: 0.8765,
            },
            RetrievedDoc {
                doc_id: "29_DNS.txt".into(),
                content: "DNS resolves names.".into(),
                score: 0.5,
            },
        ];
        assert_eq!(
            format_context(&docs),
            "[Document 1: 01_IP.txt] (similarity: 0.877)\nIP addresses identify hosts.\n\n\
             [Document 2: 29_DNS.txt] (similarity: 0.500)\nDNS resolves names."
        );
        assert_eq!(format_context(&[]), "");
    }

    #[test]
    fn directory_loading_keeps_only_text_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "  \n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "skip").unwrap();

        let docs = load_directory(dir.path()).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.txt"]);
    }
}
