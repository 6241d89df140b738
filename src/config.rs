//! Runtime configuration loaded from TOML.
//!
//! Every section is optional; omitted fields take the defaults below.
//! Relative paths resolve against the directory holding the config file.
//!
//! ```toml
//! [models]
//! classifier = "gpt-4o-mini"
//! answer = "gpt-4o-mini"
//! embedding = "text-embedding-3-small"
//!
//! [answer]
//! temperature = 0.7
//! max_tokens = 200
//!
//! [classification]
//! timeout_secs = 30
//!
//! [history]
//! path = "history.json"
//! max_size = 10
//!
//! [retrieval]
//! top_k = 3
//! vector_store = ".tutor_vectors.sqlite"
//! docs_dir = "data/docs"
//!
//! [knowledge]
//! points = ["IPv4", "IPv6", "DNS"]
//!
//! [knowledge.documents]
//! "29_DNS.txt" = "DNS"
//! ```
//!
//! Provider credentials never live here; see `OpenAiAdapter::from_env`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::EmbedModel;
use crate::knowledge::{KnowledgeCatalog, KnowledgeError};
use crate::scenario::{CatalogError, ScenarioCatalog};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config value for {field}: {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    Scenarios(#[from] CatalogError),
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsConfig {
    pub classifier: String,
    pub answer: String,
    pub embedding: EmbedModel,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            classifier: "gpt-4o-mini".to_string(),
            answer: "gpt-4o-mini".to_string(),
            embedding: EmbedModel::Small3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AnswerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationConfig {
    /// Per-detector limit.
    pub timeout_secs: u64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub path: PathBuf,
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("history.json"),
            max_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub vector_store: PathBuf,
    pub docs_dir: PathBuf,
    /// Drop documents scoring below this similarity.
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            vector_store: PathBuf::from(".tutor_vectors.sqlite"),
            docs_dir: PathBuf::from("data/docs"),
            min_score: None,
        }
    }
}

/// Where the knowledge catalogue comes from, in priority order: inline
/// `points`, then `catalog_path` (`{"nodes": [...]}`), then the labels of
/// the `documents` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct KnowledgeConfig {
    pub points: Vec<String>,
    pub catalog_path: Option<PathBuf>,
    /// Document id to the knowledge point it teaches.
    pub documents: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScenariosConfig {
    /// JSON catalogue; the generated catalogue when absent.
    pub catalog_path: Option<PathBuf>,
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TutorConfig {
    pub models: ModelsConfig,
    pub answer: AnswerConfig,
    pub classification: ClassificationConfig,
    pub history: HistoryConfig,
    pub retrieval: RetrievalConfig,
    pub knowledge: KnowledgeConfig,
    pub scenarios: ScenariosConfig,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl TutorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::parse(&raw, &path.display().to_string())?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, "<string>")
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.classifier.trim().is_empty() {
            return Err(invalid("models.classifier", "must not be empty"));
        }
        if self.models.answer.trim().is_empty() {
            return Err(invalid("models.answer", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.answer.temperature) {
            return Err(invalid("answer.temperature", "must be between 0.0 and 2.0"));
        }
        if self.answer.max_tokens == 0 {
            return Err(invalid("answer.max_tokens", "must be greater than 0"));
        }
        if self.classification.timeout_secs == 0 {
            return Err(invalid("classification.timeout_secs", "must be greater than 0"));
        }
        if self.history.max_size == 0 {
            return Err(invalid("history.max_size", "must be greater than 0"));
        }
        if self.retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k", "must be greater than 0"));
        }
        if let Some(min) = self.retrieval.min_score {
            if !(-1.0..=1.0).contains(&min) {
                return Err(invalid("retrieval.min_score", "must be between -1.0 and 1.0"));
            }
        }
        if !self.knowledge.points.is_empty() && self.knowledge.catalog_path.is_some() {
            return Err(invalid(
                "knowledge",
                "set either points or catalog_path, not both",
            ));
        }
        Ok(())
    }

    /// Resolve `path` against the config file's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn classification_timeout(&self) -> Duration {
        Duration::from_secs(self.classification.timeout_secs)
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve(&self.history.path)
    }

    pub fn vector_store_path(&self) -> PathBuf {
        self.resolve(&self.retrieval.vector_store)
    }

    pub fn docs_dir(&self) -> PathBuf {
        self.resolve(&self.retrieval.docs_dir)
    }

    /// Build the catalogue and check that every mapped document points at a
    /// catalogue label.
    pub fn knowledge_catalog(&self) -> Result<KnowledgeCatalog, ConfigError> {
        let k = &self.knowledge;
        let catalog = if !k.points.is_empty() {
            KnowledgeCatalog::new(&k.points)
        } else if let Some(path) = &k.catalog_path {
            KnowledgeCatalog::from_json_file(&self.resolve(path))?
        } else {
            KnowledgeCatalog::new(k.documents.values())
        };

        for (doc, label) in &k.documents {
            if !catalog.contains(label.trim()) {
                return Err(invalid(
                    &format!("knowledge.documents.{doc}"),
                    format!("{label:?} is not in the knowledge catalogue"),
                ));
            }
        }
        Ok(catalog)
    }

    /// Document id to knowledge point.
    pub fn document_points(&self) -> HashMap<String, String> {
        self.knowledge
            .documents
            .iter()
            .map(|(d, l)| (d.clone(), l.trim().to_string()))
            .collect()
    }

    pub fn scenario_catalog(&self) -> Result<ScenarioCatalog, ConfigError> {
        match &self.scenarios.catalog_path {
            Some(path) => Ok(ScenarioCatalog::load_json(
                &self.resolve(path),
                self.scenarios.allow_partial,
            )?),
            None => Ok(ScenarioCatalog::builtin()),
        }
    }
}
