//! Scenario catalogue: one response strategy per K/C/R combination.
//!
//! Numbers are the encoding from [`DimensionSignature::encode`]. Lookup is a
//! direct index; anything outside the populated range resolves to the
//! catalogue's default scenario (number 0).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::dimensions::{
    Correctness, Dimension, DimensionSignature, KnowledgeCount, Repetition, TOTAL_SCENARIOS,
};

/// Number reserved for the default scenario.
pub const DEFAULT_SCENARIO_NUMBER: u32 = 0;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario catalogue JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scenario {number} is out of range 1..={max}", max = TOTAL_SCENARIOS)]
    OutOfRange { number: u32 },

    #[error("scenario {number} has no dimension signature")]
    MissingSignature { number: u32 },

    #[error("scenario {number} has signature {signature} which encodes to {expected}")]
    NumberMismatch {
        number: u32,
        signature: DimensionSignature,
        expected: u32,
    },

    #[error("scenario {number} appears more than once")]
    Duplicate { number: u32 },

    #[error("catalogue is missing scenarios {missing:?}")]
    Incomplete { missing: Vec<u32> },
}

/// How the answer should be shaped for a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStrategy {
    pub response_style: String,
    pub knowledge_integration: String,
    pub error_handling: String,
    pub detail_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub number: u32,
    /// `None` only for the default scenario.
    #[serde(default, rename = "dimensions", skip_serializing_if = "Option::is_none")]
    pub signature: Option<DimensionSignature>,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub role: String,
    pub strategy: ResponseStrategy,
    /// Extra answer instructions appended to the final prompt.
    #[serde(default)]
    pub prompt_template: String,
}

impl Scenario {
    /// Generated scenario for `sig`.
    pub fn generated(sig: DimensionSignature) -> Self {
        let k = sig.knowledge_count;
        let c = sig.correctness;
        let r = sig.repetition;

        let response_style = match (c, r) {
            (Correctness::Incorrect, _) => "corrective: point out the mistake, then explain the correct idea",
            (_, Repetition::Repeated) => "deepening: explain from a different angle with a fresh example",
            _ => "concise: a clear, direct answer",
        };
        let knowledge_integration = match k {
            KnowledgeCount::None => "guiding: steer the student back to a related course topic",
            KnowledgeCount::One => "focused: go deep on the single knowledge point",
            KnowledgeCount::Many => "integrative: explain how the knowledge points relate",
        };
        let error_handling = match c {
            Correctness::Incorrect => "correct first: state what is wrong and why",
            Correctness::Correct => "answer directly: the question is well formed",
        };
        let detail_level = match r {
            Repetition::Repeated => "medium-high: go further than before and check understanding",
            Repetition::Normal => "medium: clear and brief",
        };
        let role = match (c, r, k) {
            (Correctness::Incorrect, _, _) => "a patient tutor who corrects misconceptions",
            (_, Repetition::Repeated, _) => "a tutor who re-explains from a new angle",
            (_, _, KnowledgeCount::None) => "a guide who connects the question to the course",
            (_, _, KnowledgeCount::One) => "a focused explainer",
            (_, _, KnowledgeCount::Many) => "an integrator who connects related concepts",
        };
        let prompt_template = match r {
            Repetition::Repeated => "End with one short question that checks understanding.",
            Repetition::Normal => "",
        };

        Self {
            number: sig.encode(),
            signature: Some(sig),
            label: format!(
                "{} knowledge point(s) / {} / {}",
                k.as_str(),
                c.as_str(),
                r.as_str()
            ),
            description: format!("The question {}, is {}, and is {}.", k.describe(), c.describe(), r.describe()),
            role: role.to_string(),
            strategy: ResponseStrategy {
                response_style: response_style.to_string(),
                knowledge_integration: knowledge_integration.to_string(),
                error_handling: error_handling.to_string(),
                detail_level: detail_level.to_string(),
            },
            prompt_template: prompt_template.to_string(),
        }
    }

    pub fn default_scenario() -> Self {
        Self {
            number: DEFAULT_SCENARIO_NUMBER,
            signature: None,
            label: "default".to_string(),
            description: "Fallback when no specific scenario applies.".to_string(),
            role: "a friendly, professional teaching assistant".to_string(),
            strategy: ResponseStrategy {
                response_style: "concise: a clear, direct answer".to_string(),
                knowledge_integration: "focused: answer what was asked".to_string(),
                error_handling: "answer directly".to_string(),
                detail_level: "medium: clear and brief".to_string(),
            },
            prompt_template: String::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.number == DEFAULT_SCENARIO_NUMBER
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    scenarios: Vec<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<Scenario>,
}

/// Scenarios indexed by number.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    // slots[n - 1] holds scenario n
    slots: Vec<Option<Scenario>>,
    default: Scenario,
}

impl ScenarioCatalog {
    /// Catalogue generated from the dimension values.
    pub fn builtin() -> Self {
        Self {
            slots: DimensionSignature::all()
                .map(|sig| Some(Scenario::generated(sig)))
                .collect(),
            default: Scenario::default_scenario(),
        }
    }

    /// Validate and index `records`.
    ///
    /// Every record needs a signature whose encoding equals its number, and
    /// numbers must be unique. Unless `allow_partial`, all numbers must be
    /// present.
    pub fn from_records(
        records: Vec<Scenario>,
        default: Option<Scenario>,
        allow_partial: bool,
    ) -> Result<Self, CatalogError> {
        let mut slots: Vec<Option<Scenario>> = vec![None; TOTAL_SCENARIOS as usize];

        for record in records {
            let number = record.number;
            if number == 0 || number > TOTAL_SCENARIOS {
                return Err(CatalogError::OutOfRange { number });
            }
            let signature = record
                .signature
                .ok_or(CatalogError::MissingSignature { number })?;
            let expected = signature.encode();
            if expected != number {
                return Err(CatalogError::NumberMismatch {
                    number,
                    signature,
                    expected,
                });
            }
            let slot = &mut slots[(number - 1) as usize];
            if slot.is_some() {
                return Err(CatalogError::Duplicate { number });
            }
            *slot = Some(record);
        }

        let missing: Vec<u32> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32 + 1)
            .collect();
        if !missing.is_empty() {
            if !allow_partial {
                return Err(CatalogError::Incomplete { missing });
            }
            warn!(?missing, "partial scenario catalogue; missing numbers use the default");
        }

        let mut default = default.unwrap_or_else(Scenario::default_scenario);
        default.number = DEFAULT_SCENARIO_NUMBER;
        default.signature = None;

        Ok(Self { slots, default })
    }

    /// Load `{"scenarios": [...], "default": {...}}`.
    pub fn load_json(path: &Path, allow_partial: bool) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        Self::from_records(file.scenarios, file.default, allow_partial)
    }

    /// Write the catalogue in the format [`load_json`](Self::load_json) reads.
    pub fn export_json(&self, path: &Path) -> Result<(), CatalogError> {
        let file = CatalogFile {
            scenarios: self.iter().cloned().collect(),
            default: Some(self.default.clone()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Scenario `number`, or the default scenario (with a warning).
    pub fn lookup(&self, number: u32) -> &Scenario {
        let found = number
            .checked_sub(1)
            .and_then(|i| self.slots.get(i as usize))
            .and_then(Option::as_ref);
        match found {
            Some(s) => s,
            None => {
                warn!(number, "no scenario for number; using default");
                &self.default
            }
        }
    }

    pub fn lookup_signature(&self, sig: DimensionSignature) -> &Scenario {
        self.lookup(sig.encode())
    }

    pub fn default_scenario(&self) -> &Scenario {
        &self.default
    }

    /// Populated scenarios in number order.
    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
