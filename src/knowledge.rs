//! Knowledge-point catalogue and the K-dimension detector.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::complete_structured;
use crate::dimensions::KnowledgeCount;
use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::prompts::{knowledge_schema, KNOWLEDGE_PROMPT};

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid knowledge catalogue JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid mask {0:?}: expected a string of '0' and '1'")]
    InvalidMask(String),
}

// =============================================================================
// Catalogue
// =============================================================================

/// Fixed, ordered set of knowledge-point labels.
///
/// A label's position is its bit in [`KnowledgeMask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeCatalog {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    nodes: Vec<serde_json::Value>,
}

impl KnowledgeCatalog {
    /// Build from labels, trimming whitespace and skipping blanks and repeats.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut catalog = Self::default();
        for label in labels {
            let label = label.as_ref().trim();
            if label.is_empty() || catalog.index.contains_key(label) {
                continue;
            }
            catalog.index.insert(label.to_string(), catalog.labels.len());
            catalog.labels.push(label.to_string());
        }
        catalog
    }

    /// Load `{"nodes": [...]}`. Non-string nodes are ignored.
    pub fn from_json_file(path: &Path) -> Result<Self, KnowledgeError> {
        let raw = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        Ok(Self::new(
            file.nodes.iter().filter_map(|n| n.as_str()),
        ))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    /// Dedupe `points` in first-seen order and split into (known, unknown).
    pub fn partition(&self, points: &[String]) -> (Vec<String>, Vec<String>) {
        let mut seen = HashSet::new();
        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for p in points {
            let p = p.trim();
            if p.is_empty() || !seen.insert(p.to_string()) {
                continue;
            }
            if self.contains(p) {
                known.push(p.to_string());
            } else {
                unknown.push(p.to_string());
            }
        }
        (known, unknown)
    }

    /// Bitmask of the catalogue labels in `points`; unknown labels are ignored.
    pub fn mask<S: AsRef<str>>(&self, points: &[S]) -> KnowledgeMask {
        let mut mask = KnowledgeMask::zeros(self.len());
        for p in points {
            if let Some(i) = self.position(p.as_ref()) {
                mask.set(i);
            }
        }
        mask
    }

    /// Labels for the bits set in `mask`, in catalogue order.
    pub fn labels_of(&self, mask: &KnowledgeMask) -> Vec<String> {
        mask.ones()
            .filter_map(|i| self.labels.get(i).cloned())
            .collect()
    }

    /// Bullet list used by the detector prompt.
    pub fn bullet_list(&self) -> String {
        self.labels
            .iter()
            .map(|l| format!("- {l}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// Mask
// =============================================================================

/// Fixed-width bitmask over a [`KnowledgeCatalog`].
///
/// Serializes as a binary string with bit 0 first, e.g. `"0100"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KnowledgeMask {
    words: Vec<u64>,
    width: usize,
}

impl KnowledgeMask {
    pub fn zeros(width: usize) -> Self {
        Self {
            words: vec![0; width.div_ceil(64)],
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Set bit `i`. Bits at or past the width are ignored.
    pub fn set(&mut self, i: usize) {
        if i < self.width {
            self.words[i / 64] |= 1u64 << (i % 64);
        }
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.width && self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.width).filter(move |i| self.get(*i))
    }

    pub(crate) fn word(&self, i: usize) -> u64 {
        self.words.get(i).copied().unwrap_or(0)
    }

    pub(crate) fn word_count(&self) -> usize {
        self.words.len()
    }
}

impl fmt::Display for KnowledgeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.width {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl FromStr for KnowledgeMask {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut mask = Self::zeros(s.len());
        for (i, c) in s.chars().enumerate() {
            match c {
                '0' => {}
                '1' => mask.set(i),
                _ => return Err(KnowledgeError::InvalidMask(s.to_string())),
            }
        }
        Ok(mask)
    }
}

impl Serialize for KnowledgeMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KnowledgeMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Detector
// =============================================================================

/// K from the number of distinct detected points.
pub fn calculate_count(points: &[String]) -> KnowledgeCount {
    match points.len() {
        0 => KnowledgeCount::None,
        1 => KnowledgeCount::One,
        _ => KnowledgeCount::Many,
    }
}

#[derive(Debug, Deserialize)]
struct KnowledgeReply {
    #[serde(default)]
    knowledge_points: Vec<String>,
}

/// Identifies which catalogue knowledge points a question touches.
pub struct KnowledgeDetector {
    gateway: Arc<dyn ChatGateway>,
    catalog: Arc<KnowledgeCatalog>,
    model: String,
    max_tokens: u32,
}

impl KnowledgeDetector {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        catalog: Arc<KnowledgeCatalog>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            catalog,
            model: model.into(),
            max_tokens: 300,
        }
    }

    pub fn catalog(&self) -> &Arc<KnowledgeCatalog> {
        &self.catalog
    }

    /// Distinct catalogue labels in detector order. Never fails: any
    /// provider or parse problem yields an empty list.
    pub async fn detect(&self, query: &str) -> Vec<String> {
        if self.catalog.is_empty() {
            debug!("knowledge catalogue is empty; skipping detection");
            return Vec::new();
        }

        let prompt = KNOWLEDGE_PROMPT.render(&[
            ("query", query),
            ("knowledge_list", &self.catalog.bullet_list()),
        ]);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("classifier::knowledge"),
        )
        .temperature(0.0)
        .max_tokens(self.max_tokens)
        .schema(knowledge_schema());

        let reply: KnowledgeReply = match complete_structured(self.gateway.as_ref(), req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "knowledge detection failed; treating as no knowledge points");
                return Vec::new();
            }
        };

        let (known, unknown) = self.catalog.partition(&reply.knowledge_points);
        if !unknown.is_empty() {
            warn!(?unknown, "detector returned labels outside the catalogue; dropped");
        }
        debug!(points = ?known, "knowledge points detected");
        known
    }
}
