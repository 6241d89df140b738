//! Retrieval → classification → scenario → answer pipeline.
//!
//! One question flows through:
//! 1. **Analyse**: retrieve course material and classify the question, concurrently
//! 2. **Select**: map the classification to a scenario
//! 3. **Answer**: generate the reply under that scenario's strategy
//! 4. **Record**: append the classified question to history
//!
//! Usage:
//! ```bash
//! tutor ask "How does DNS resolve a name?"
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::{ClassificationResult, DimensionClassifier};
use crate::config::{ConfigError, TutorConfig};
use crate::correctness::CorrectnessDetector;
use crate::gateway::usage::millis;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::history::HistoryStore;
use crate::knowledge::KnowledgeDetector;
use crate::prompts::answer_prompt;
use crate::retrieval::{RetrievedDoc, Retriever};
use crate::scenario::{Scenario, ScenarioCatalog};

/// Reply used when the answer cannot be generated.
pub const APOLOGY: &str =
    "Sorry, I could not produce an answer right now. Please try asking again in a moment.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("question is empty")]
    EmptyQuery,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    /// Retrieval and classification, run concurrently.
    pub analysis_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub query: String,
    pub answer: String,
    pub scenario_number: u32,
    pub scenario_label: String,
    /// `None` when classification failed.
    pub classification: Option<ClassificationResult>,
    pub matched_docs: Vec<RetrievedDoc>,
    /// Knowledge points the matched documents teach.
    pub retrieved_points: Vec<String>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timings: StageTimings,
}

#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_k: usize,
}

impl AnswerSettings {
    pub fn from_config(config: &TutorConfig) -> Self {
        Self {
            model: config.models.answer.clone(),
            temperature: config.answer.temperature,
            max_tokens: config.answer.max_tokens,
            top_k: config.retrieval.top_k,
        }
    }
}

/// Components a pipeline is assembled from.
pub struct PipelineParts {
    pub gateway: Arc<dyn ChatGateway>,
    pub retriever: Arc<dyn Retriever>,
    pub classifier: DimensionClassifier,
    pub scenarios: Arc<ScenarioCatalog>,
    pub history: Arc<HistoryStore>,
    pub document_points: HashMap<String, String>,
    pub settings: AnswerSettings,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct QueryPipeline {
    gateway: Arc<dyn ChatGateway>,
    retriever: Arc<dyn Retriever>,
    classifier: DimensionClassifier,
    scenarios: Arc<ScenarioCatalog>,
    history: Arc<HistoryStore>,
    document_points: HashMap<String, String>,
    settings: AnswerSettings,
    session_id: Uuid,
}

impl QueryPipeline {
    /// Assemble a pipeline. The repetition window starts from the tail of
    /// the history store.
    pub fn new(parts: PipelineParts) -> Self {
        let classifier = parts
            .classifier
            .with_window(parts.history.window_observations());
        Self {
            gateway: parts.gateway,
            retriever: parts.retriever,
            classifier,
            scenarios: parts.scenarios,
            history: parts.history,
            document_points: parts.document_points,
            settings: parts.settings,
            session_id: Uuid::new_v4(),
        }
    }

    /// Wire a pipeline from configuration.
    pub fn from_config(
        config: &TutorConfig,
        gateway: Arc<dyn ChatGateway>,
        retriever: Arc<dyn Retriever>,
    ) -> Result<Self, PipelineError> {
        let catalog = Arc::new(config.knowledge_catalog()?);
        let classifier = DimensionClassifier::new(
            KnowledgeDetector::new(gateway.clone(), catalog.clone(), config.models.classifier.clone()),
            CorrectnessDetector::new(gateway.clone(), config.models.classifier.clone()),
            config.classification_timeout(),
        );
        let history = Arc::new(HistoryStore::open(
            config.history_path(),
            config.history.max_size,
            catalog,
        ));

        Ok(Self::new(PipelineParts {
            gateway,
            retriever,
            classifier,
            scenarios: Arc::new(config.scenario_catalog()?),
            history,
            document_points: config.document_points(),
            settings: AnswerSettings::from_config(config),
        }))
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn scenarios(&self) -> &Arc<ScenarioCatalog> {
        &self.scenarios
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Clear history and the repetition window together.
    pub async fn clear_history(&self) {
        self.history.clear();
        self.classifier.reset_window().await;
    }

    /// Answer one question.
    ///
    /// Only an empty question is an error. Classification or generation
    /// failures produce a degraded outcome under the default scenario.
    pub async fn ask(&self, query: &str) -> Result<QueryOutcome, PipelineError> {
        self.run(query, None).await
    }

    /// Like [`ask`](Self::ask), but streams the answer, handing each piece
    /// to `on_text` as it arrives.
    pub async fn ask_streaming<F>(&self, query: &str, mut on_text: F) -> Result<QueryOutcome, PipelineError>
    where
        F: FnMut(&str) + Send,
    {
        let sink: &mut (dyn FnMut(&str) + Send) = &mut on_text;
        self.run(query, Some(sink)).await
    }

    async fn run(
        &self,
        query: &str,
        on_text: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<QueryOutcome, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        let start = Instant::now();

        let (retrieved, detected) = tokio::join!(
            self.retriever.retrieve(query, self.settings.top_k),
            self.classifier.detect_all(query),
        );

        let docs = retrieved.unwrap_or_else(|e| {
            warn!(error = %e, "retrieval failed; answering without course material");
            Vec::new()
        });
        let retrieved_points = self.points_for(&docs);

        // Window update and history append commit together, before generation.
        let mut errors: Vec<String> = Vec::new();
        let (classification, scenario) = match detected {
            Ok(detected) => {
                let doc_ids: Vec<String> = docs.iter().map(|d| d.doc_id.clone()).collect();
                let c = self
                    .classifier
                    .commit(detected, |c| {
                        self.history.append(query, doc_ids, c);
                    })
                    .await;
                let scenario = self.scenarios.lookup(c.scenario_number);
                (Some(c), scenario)
            }
            Err(e) => {
                warn!(error = %e, "classification failed; using default scenario");
                errors.push(e.to_string());
                (None, self.scenarios.default_scenario())
            }
        };
        let analysis_ms = millis(start.elapsed());

        let points = classification
            .as_ref()
            .map(|c| c.knowledge_points.as_slice())
            .unwrap_or_default();
        let req = self.answer_request(scenario, query, &docs, points);
        let gen_start = Instant::now();
        let generated = match on_text {
            Some(on_text) => self.generate_streaming(req, on_text).await,
            None => self.generate(req).await,
        };
        let (answer, scenario) = match generated {
            Ok(text) => (text, scenario),
            Err(e) => {
                warn!(error = %e, "answer generation failed; replying with apology");
                errors.push(e.to_string());
                (APOLOGY.to_string(), self.scenarios.default_scenario())
            }
        };
        let generation_ms = millis(gen_start.elapsed());

        let outcome = QueryOutcome {
            query: query.to_string(),
            answer,
            scenario_number: scenario.number,
            scenario_label: scenario.label.clone(),
            classification,
            matched_docs: docs,
            retrieved_points,
            degraded: !errors.is_empty(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            timings: StageTimings {
                analysis_ms,
                generation_ms,
                total_ms: millis(start.elapsed()),
            },
        };

        info!(
            scenario = outcome.scenario_number,
            degraded = outcome.degraded,
            total_ms = outcome.timings.total_ms,
            "question answered"
        );
        Ok(outcome)
    }

    fn answer_request(
        &self,
        scenario: &Scenario,
        query: &str,
        docs: &[RetrievedDoc],
        points: &[String],
    ) -> ChatRequest {
        let prompt = answer_prompt(scenario, query, docs, points);
        ChatRequest::new(
            self.settings.model.clone(),
            prompt.to_messages(),
            Attribution::new("pipeline::answer").with_session(self.session_id),
        )
        .temperature(self.settings.temperature)
        .max_tokens(self.settings.max_tokens)
    }

    async fn generate(&self, req: ChatRequest) -> Result<String, ProviderError> {
        let resp = self.gateway.chat(req).await?;
        non_empty(&resp.content)
    }

    async fn generate_streaming(
        &self,
        req: ChatRequest,
        on_text: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, ProviderError> {
        let mut pieces = self.gateway.chat_stream(req).await?;
        let mut answer = String::new();
        while let Some(piece) = pieces.next().await {
            let piece = piece?;
            on_text(&piece);
            answer.push_str(&piece);
        }
        non_empty(&answer)
    }

    /// Distinct points taught by `docs`, in retrieval order.
    fn points_for(&self, docs: &[RetrievedDoc]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for d in docs {
            if let Some(p) = self.document_points.get(&d.doc_id) {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
        }
        out
    }
}

fn non_empty(answer: &str) -> Result<String, ProviderError> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Err(ProviderError::invalid_response("empty answer"));
    }
    Ok(answer.to_string())
}
