//! Bounded, persisted query history.
//!
//! The store keeps the most recent `max_size` records, oldest first, and
//! rewrites its JSON file after every mutation (temp file + rename).
//! Counters are derived from the retained records only.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::classifier::ClassificationResult;
use crate::dimensions::{Correctness, Dimension, KnowledgeCount, Repetition};
use crate::knowledge::{KnowledgeCatalog, KnowledgeMask};
use crate::repetition::WINDOW;

/// Points listed by [`HistoryStore::summary`].
const SUMMARY_RECENT_POINTS: usize = 5;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("history serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dimension values of a recorded query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDimensions {
    pub knowledge_count: KnowledgeCount,
    pub correctness: Correctness,
    pub repetition: Repetition,
    pub scenario_number: u32,
}

impl From<&ClassificationResult> for RecordedDimensions {
    fn from(c: &ClassificationResult) -> Self {
        Self {
            knowledge_count: c.knowledge_count,
            correctness: c.correctness,
            repetition: c.repetition,
            scenario_number: c.scenario_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub query: String,
    #[serde(default)]
    pub matched_docs: Vec<String>,
    #[serde(default)]
    pub knowledge_points: Vec<String>,
    pub dimensions: RecordedDimensions,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    knowledge_point_counter: BTreeMap<String, usize>,
    #[serde(default)]
    recent_window: Vec<KnowledgeMask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub total_queries: usize,
    pub max_size: usize,
    pub knowledge_point_counts: BTreeMap<String, usize>,
    /// `dimension key -> value -> count`.
    pub dimension_value_counts: BTreeMap<String, BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    #[serde(flatten)]
    pub stats: HistoryStats,
    /// Most recently accessed knowledge points, newest last.
    pub recent_points: Vec<String>,
}

#[derive(Debug, Default)]
struct HistoryState {
    records: VecDeque<HistoryRecord>,
    counter: BTreeMap<String, usize>,
}

impl HistoryState {
    fn count(&mut self, record: &HistoryRecord) {
        for p in &record.knowledge_points {
            *self.counter.entry(p.clone()).or_insert(0) += 1;
        }
    }

    fn uncount(&mut self, record: &HistoryRecord) {
        for p in &record.knowledge_points {
            if let Some(n) = self.counter.get_mut(p) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.counter.remove(p);
                }
            }
        }
    }
}

pub struct HistoryStore {
    path: Option<PathBuf>,
    max_size: usize,
    catalog: Arc<KnowledgeCatalog>,
    state: Mutex<HistoryState>,
}

impl HistoryStore {
    /// Open the store at `path`. A missing file starts empty; an unreadable
    /// or corrupt file is logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>, max_size: usize, catalog: Arc<KnowledgeCatalog>) -> Self {
        let path = path.into();
        let max_size = max_size.max(1);
        let mut state = HistoryState::default();

        match read_file(&path) {
            Ok(Some(file)) => {
                let skip = file.history.len().saturating_sub(max_size);
                for record in file.history.into_iter().skip(skip) {
                    state.count(&record);
                    state.records.push_back(record);
                }
                debug!(path = %path.display(), records = state.records.len(), "history loaded");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "history file unreadable; starting empty");
            }
        }

        Self {
            path: Some(path),
            max_size,
            catalog,
            state: Mutex::new(state),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory(max_size: usize, catalog: Arc<KnowledgeCatalog>) -> Self {
        Self {
            path: None,
            max_size: max_size.max(1),
            catalog,
            state: Mutex::new(HistoryState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Record a classified query, evicting the oldest record when full.
    pub fn append(
        &self,
        query: &str,
        matched_docs: Vec<String>,
        classification: &ClassificationResult,
    ) -> HistoryRecord {
        let record = HistoryRecord {
            query: query.to_string(),
            matched_docs,
            knowledge_points: classification.knowledge_points.clone(),
            dimensions: classification.into(),
            timestamp: Utc::now(),
        };

        let mut state = self.lock();
        state.count(&record);
        state.records.push_back(record.clone());
        while state.records.len() > self.max_size {
            if let Some(evicted) = state.records.pop_front() {
                state.uncount(&evicted);
            }
        }
        self.persist_logged(&state);
        record
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryRecord> {
        let state = self.lock();
        let skip = state.records.len().saturating_sub(n);
        state.records.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<HistoryRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Knowledge points of the last [`WINDOW`] records, oldest first.
    pub fn window_observations(&self) -> Vec<Vec<String>> {
        self.recent(WINDOW)
            .into_iter()
            .map(|r| r.knowledge_points)
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        *state = HistoryState::default();
        self.persist_logged(&state);
    }

    pub fn stats(&self) -> HistoryStats {
        let state = self.lock();
        stats_of(&state, self.max_size)
    }

    pub fn summary(&self) -> HistorySummary {
        let state = self.lock();
        let mut recent_points: Vec<String> = state
            .records
            .iter()
            .rev()
            .flat_map(|r| r.knowledge_points.iter().rev())
            .take(SUMMARY_RECENT_POINTS)
            .cloned()
            .collect();
        recent_points.reverse();
        HistorySummary {
            stats: stats_of(&state, self.max_size),
            recent_points,
        }
    }

    /// Write the current state now.
    pub fn flush(&self) -> Result<(), HistoryError> {
        let state = self.lock();
        self.persist(&state)
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist_logged(&self, state: &HistoryState) {
        if let Err(e) = self.persist(state) {
            warn!(error = %e, "failed to persist history");
        }
    }

    fn persist(&self, state: &HistoryState) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let skip = state.records.len().saturating_sub(WINDOW);
        let file = HistoryFile {
            history: state.records.iter().cloned().collect(),
            knowledge_point_counter: state.counter.clone(),
            recent_window: state
                .records
                .iter()
                .skip(skip)
                .map(|r| self.catalog.mask(&r.knowledge_points))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let io_err = |source| HistoryError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Option<HistoryFile>, HistoryError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(HistoryError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&raw)?))
}

fn stats_of(state: &HistoryState, max_size: usize) -> HistoryStats {
    let mut dims: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for r in &state.records {
        let d = &r.dimensions;
        for (key, value) in [
            (KnowledgeCount::KEY, d.knowledge_count.as_str()),
            (Correctness::KEY, d.correctness.as_str()),
            (Repetition::KEY, d.repetition.as_str()),
        ] {
            *dims
                .entry(key.to_string())
                .or_default()
                .entry(value.to_string())
                .or_insert(0) += 1;
        }
    }
    HistoryStats {
        total_queries: state.records.len(),
        max_size,
        knowledge_point_counts: state.counter.clone(),
        dimension_value_counts: dims,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<KnowledgeCatalog> {
        Arc::new(KnowledgeCatalog::new(["IPv4", "DNS", "TCP"]))
    }

    fn classified(points: &[&str]) -> ClassificationResult {
        let knowledge_points: Vec<String> = points.iter().map(|s| s.to_string()).collect();
        ClassificationResult {
            knowledge_count: crate::knowledge::calculate_count(&knowledge_points),
            correctness: Correctness::Correct,
            repetition: Repetition::Normal,
            knowledge_points,
            scenario_number: 5,
        }
    }

    #[test]
    fn evicts_oldest_and_uncounts() {
        let store = HistoryStore::in_memory(2, catalog());
        store.append("q1", vec![], &classified(&["DNS"]));
        store.append("q2", vec![], &classified(&["TCP"]));
        store.append("q3", vec![], &classified(&["TCP"]));

        let all = store.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].query, "q2");
        let stats = store.stats();
        assert_eq!(stats.knowledge_point_counts.get("TCP"), Some(&2));
        assert!(!stats.knowledge_point_counts.contains_key("DNS"));
    }

    #[test]
    fn recent_is_most_recent_last() {
        let store = HistoryStore::in_memory(10, catalog());
        for q in ["a", "b", "c"] {
            store.append(q, vec![], &classified(&[]));
        }
        let r: Vec<String> = store.recent(2).into_iter().map(|r| r.query).collect();
        assert_eq!(r, vec!["b", "c"]);
        assert_eq!(store.recent(10).len(), 3);
    }

    #[test]
    fn clear_resets_everything() {
        let store = HistoryStore::in_memory(10, catalog());
        store.append("q", vec![], &classified(&["DNS"]));
        store.clear();
        assert!(store.is_empty());
        let stats = store.stats();
        assert_eq!(stats.total_queries, 0);
        assert!(stats.knowledge_point_counts.is_empty());
        assert!(stats.dimension_value_counts.is_empty());
    }

    #[test]
    fn stats_count_dimension_values() {
        let store = HistoryStore::in_memory(10, catalog());
        store.append("a", vec![], &classified(&["DNS"]));
        store.append("b", vec![], &classified(&["DNS", "TCP"]));
        let stats = store.stats();
        assert_eq!(stats.dimension_value_counts["knowledge_count"]["one"], 1);
        assert_eq!(stats.dimension_value_counts["knowledge_count"]["many"], 1);
        assert_eq!(stats.dimension_value_counts["correctness"]["correct"], 2);
    }

    #[test]
    fn summary_lists_last_points() {
        let store = HistoryStore::in_memory(10, catalog());
        store.append("a", vec![], &classified(&["IPv4", "DNS", "TCP"]));
        store.append("b", vec![], &classified(&["DNS", "TCP", "IPv4"]));
        let s = store.summary();
        assert_eq!(s.recent_points, vec!["DNS", "TCP", "DNS", "TCP", "IPv4"]);
        assert_eq!(s.stats.total_queries, 2);
    }

    #[test]
    fn persists_window_as_masks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::open(&path, 10, catalog());
        store.append("a", vec!["29_DNS.txt".into()], &classified(&["IPv4"]));
        store.append("b", vec![], &classified(&["DNS"]));
        store.append("c", vec![], &classified(&["DNS", "TCP"]));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["recent_window"], serde_json::json!(["010", "011"]));
        assert_eq!(raw["knowledge_point_counter"]["DNS"], 2);
        assert_eq!(raw["history"][0]["dimensions"]["correctness"], "correct");
        assert!(!path.with_extension("json.tmp").exists());
    }
}
