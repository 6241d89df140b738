#![forbid(unsafe_code)]

//! # tutor-harness
//!
//! A teaching-assistant question-answering pipeline.
//!
//! Each question is classified along three pedagogical dimensions: how many
//! course knowledge points it touches (K), whether it contains a mistake (C),
//! and whether it repeats the recent topic (R). The triple selects one of
//! twelve response scenarios, and the final answer is generated from the
//! retrieved course material under that scenario's strategy.
//!
//! The knowledge and correctness detectors are independent LLM calls run
//! concurrently; K is derived locally and R comes from a sliding window over
//! the last two questions. History is a bounded, persisted ring buffer.

pub mod classifier;
pub mod completion;
pub mod config;
pub mod correctness;
pub mod dimensions;
pub mod gateway;
pub mod history;
pub mod knowledge;
pub mod pipeline;
pub mod prompts;
pub mod repetition;
pub mod retrieval;
pub mod scenario;

#[cfg(test)]
mod testing;

pub use classifier::{ClassificationResult, ClassifyError, DimensionClassifier};
pub use config::TutorConfig;
pub use dimensions::{Correctness, DimensionSignature, KnowledgeCount, Repetition};
pub use gateway::{Attribution, ChatGateway, EmbedGateway, ProviderGateway, UsageSink};
pub use history::{HistoryRecord, HistoryStore};
pub use knowledge::{KnowledgeCatalog, KnowledgeDetector};
pub use pipeline::{QueryOutcome, QueryPipeline};
pub use retrieval::{Retriever, VectorRetriever};
pub use scenario::{Scenario, ScenarioCatalog};
