//! Dimension classification: fan out the detectors, derive K and R, and
//! compute the scenario number.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::info;

use crate::correctness::CorrectnessDetector;
use crate::dimensions::{Correctness, DimensionSignature, KnowledgeCount, Repetition};
use crate::knowledge::{calculate_count, KnowledgeDetector};
use crate::repetition::{LabelSet, RepetitionTracker};

/// Detector that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Knowledge,
    Correctness,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorKind::Knowledge => "knowledge",
            DetectorKind::Correctness => "correctness",
        })
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("{dimension} detection timed out after {after:?}")]
    DimensionTimedOut {
        dimension: DetectorKind,
        after: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub knowledge_count: KnowledgeCount,
    pub correctness: Correctness,
    pub repetition: Repetition,
    /// Distinct catalogue labels, in detector order.
    pub knowledge_points: Vec<String>,
    pub scenario_number: u32,
}

impl ClassificationResult {
    pub fn signature(&self) -> DimensionSignature {
        DimensionSignature::new(self.knowledge_count, self.correctness, self.repetition)
    }
}

/// Raw detector output for one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub correctness: Correctness,
    pub knowledge_points: Vec<String>,
}

pub struct DimensionClassifier {
    knowledge: KnowledgeDetector,
    correctness: CorrectnessDetector,
    tracker: Mutex<RepetitionTracker<LabelSet>>,
    timeout: Duration,
}

impl DimensionClassifier {
    pub fn new(
        knowledge: KnowledgeDetector,
        correctness: CorrectnessDetector,
        timeout: Duration,
    ) -> Self {
        Self {
            knowledge,
            correctness,
            tracker: Mutex::new(RepetitionTracker::new()),
            timeout,
        }
    }

    /// Start with the repetition window holding the tail of `observations`.
    pub fn with_window<I>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        self.tracker
            .get_mut()
            .seed(observations.into_iter().map(|p| p.into_iter().collect()));
        self
    }

    /// Rebuild the repetition window from `observations` (oldest first).
    pub async fn seed_window<I>(&self, observations: I)
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut tracker = self.tracker.lock().await;
        tracker.seed(observations.into_iter().map(|p| p.into_iter().collect()));
    }

    pub async fn reset_window(&self) {
        self.tracker.lock().await.clear();
    }

    /// Classify `query` on all three dimensions.
    ///
    /// The detectors run concurrently, each under its own timeout. A timeout
    /// fails the whole classification and leaves the repetition window as it
    /// was. Otherwise the window is updated exactly once.
    pub async fn classify_all(&self, query: &str) -> Result<ClassificationResult, ClassifyError> {
        let detected = self.detect_all(query).await?;
        Ok(self.commit(detected, |_| {}).await)
    }

    /// Run both detectors without touching the repetition window.
    pub async fn detect_all(&self, query: &str) -> Result<Detected, ClassifyError> {
        let (correctness, points) = tokio::join!(
            timeout(self.timeout, self.correctness.detect(query)),
            timeout(self.timeout, self.knowledge.detect(query)),
        );

        let correctness = correctness.map_err(|_| ClassifyError::DimensionTimedOut {
            dimension: DetectorKind::Correctness,
            after: self.timeout,
        })?;
        let knowledge_points = points.map_err(|_| ClassifyError::DimensionTimedOut {
            dimension: DetectorKind::Knowledge,
            after: self.timeout,
        })?;
        Ok(Detected {
            correctness,
            knowledge_points,
        })
    }

    /// Derive K and R from `detected` and update the window.
    ///
    /// `record` runs while the window is still locked, so whatever it
    /// persists stays in the same order as the window updates.
    pub async fn commit<F>(&self, detected: Detected, record: F) -> ClassificationResult
    where
        F: FnOnce(&ClassificationResult),
    {
        let Detected {
            correctness,
            knowledge_points,
        } = detected;
        let knowledge_count = calculate_count(&knowledge_points);

        let mut tracker = self.tracker.lock().await;
        let repetition = tracker.check_points(&knowledge_points);
        let scenario_number = DimensionSignature::new(knowledge_count, correctness, repetition).encode();

        info!(
            knowledge = %knowledge_count,
            correctness = %correctness,
            repetition = %repetition,
            scenario = scenario_number,
            points = ?knowledge_points,
            "question classified"
        );

        let result = ClassificationResult {
            knowledge_count,
            correctness,
            repetition,
            knowledge_points,
            scenario_number,
        };
        record(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::knowledge::KnowledgeCatalog;
    use crate::testing::ScriptedGateway;

    fn classifier(gw: ScriptedGateway, limit: Duration) -> DimensionClassifier {
        let gw = Arc::new(gw);
        let catalog = Arc::new(KnowledgeCatalog::new(["IPv4", "IPv6", "DNS"]));
        DimensionClassifier::new(
            KnowledgeDetector::new(gw.clone(), catalog, "m"),
            CorrectnessDetector::new(gw, "m"),
            limit,
        )
    }

    fn dns_gateway() -> ScriptedGateway {
        ScriptedGateway::new()
            .on("classifier::knowledge", r#"{"knowledge_points": ["DNS"]}"#)
            .on("classifier::correctness", r#"{"correct": 0}"#)
    }

    #[tokio::test]
    async fn single_point_correct_first_query() {
        let c = classifier(dns_gateway(), Duration::from_secs(5));
        let r = c.classify_all("What is DNS?").await.unwrap();
        assert_eq!(r.knowledge_count, KnowledgeCount::One);
        assert_eq!(r.correctness, Correctness::Correct);
        assert_eq!(r.repetition, Repetition::Normal);
        assert_eq!(r.knowledge_points, vec!["DNS"]);
        assert_eq!(r.scenario_number, 5);
        assert_eq!(r.signature().encode(), r.scenario_number);
    }

    #[tokio::test]
    async fn third_identical_query_is_repeated() {
        let c = classifier(dns_gateway(), Duration::from_secs(5));
        let reps: Vec<Repetition> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(c.classify_all("What is DNS?").await.unwrap().repetition);
            }
            v
        };
        assert_eq!(reps, vec![Repetition::Normal, Repetition::Normal, Repetition::Repeated]);
    }

    #[tokio::test]
    async fn detector_failures_fail_open() {
        let gw = ScriptedGateway::new()
            .fail("classifier::knowledge")
            .fail("classifier::correctness");
        let c = classifier(gw, Duration::from_secs(5));
        let r = c.classify_all("hello").await.unwrap();
        assert_eq!(r.knowledge_count, KnowledgeCount::None);
        assert_eq!(r.correctness, Correctness::Correct);
        assert_eq!(r.scenario_number, 1);
    }

    #[tokio::test]
    async fn timeout_surfaces_and_leaves_window_untouched() {
        let gw = dns_gateway().delay("classifier::knowledge", Duration::from_millis(200));
        let c = classifier(gw, Duration::from_millis(20));
        let err = c.classify_all("What is DNS?").await.unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::DimensionTimedOut { dimension: DetectorKind::Knowledge, .. }
        ));
        assert!(c.tracker.lock().await.is_empty());
    }

    #[tokio::test]
    async fn seeded_window_carries_over() {
        let c = classifier(dns_gateway(), Duration::from_secs(5))
            .with_window(vec![vec!["DNS".to_string()], vec!["DNS".to_string()]]);
        let r = c.classify_all("What is DNS?").await.unwrap();
        assert_eq!(r.repetition, Repetition::Repeated);

        c.reset_window().await;
        let r = c.classify_all("What is DNS?").await.unwrap();
        assert_eq!(r.repetition, Repetition::Normal);
    }

    #[tokio::test]
    async fn seed_window_replaces_the_current_window() {
        let c = classifier(dns_gateway(), Duration::from_secs(5))
            .with_window(vec![vec!["DNS".to_string()], vec!["DNS".to_string()]]);
        c.seed_window(vec![vec!["IPv4".to_string()], vec![]]).await;
        let r = c.classify_all("What is DNS?").await.unwrap();
        assert_eq!(r.repetition, Repetition::Normal);
        assert_eq!(c.tracker.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn detection_alone_leaves_the_window_alone() {
        let c = classifier(dns_gateway(), Duration::from_secs(5));
        let detected = c.detect_all("What is DNS?").await.unwrap();
        assert_eq!(detected.knowledge_points, vec!["DNS"]);
        assert!(c.tracker.lock().await.is_empty());

        let mut recorded = Vec::new();
        let r = c.commit(detected, |r| recorded.push(r.scenario_number)).await;
        assert_eq!(recorded, vec![r.scenario_number]);
        assert_eq!(c.tracker.lock().await.len(), 1);
    }
}
