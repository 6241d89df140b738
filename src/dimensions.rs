//! The three classified axes of a question and the scenario-number encoding.
//!
//! A question is classified on knowledge count (K), correctness (C) and
//! repetition (R). The triple is encoded as a 1-based scenario number:
//!
//! ```text
//! number = ((k * |C|) + c) * |R| + r + 1     // |C| = |R| = 2
//! ```
//!
//! Each weight is the product of the arities of the dimensions ordered after
//! it, so decoding is plain division and remainder.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One classified axis with a fixed, ordered value domain.
pub trait Dimension: Copy + Sized + 'static {
    /// Stable key used in persisted history and reports.
    const KEY: &'static str;
    const ARITY: u32;
    const VALUES: &'static [Self];

    fn index(self) -> u32;

    fn from_index(index: u32) -> Option<Self> {
        Self::VALUES.get(index as usize).copied()
    }

    /// Machine-readable value name (snake_case, matches serde).
    fn as_str(self) -> &'static str;

    /// Human-readable description for prompts and reports.
    fn describe(self) -> &'static str;
}

/// K: how many catalogue knowledge points the question touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCount {
    None,
    One,
    Many,
}

impl Dimension for KnowledgeCount {
    const KEY: &'static str = "knowledge_count";
    const ARITY: u32 = 3;
    const VALUES: &'static [Self] = &[Self::None, Self::One, Self::Many];

    fn index(self) -> u32 {
        match self {
            Self::None => 0,
            Self::One => 1,
            Self::Many => 2,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::One => "one",
            Self::Many => "many",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::None => "touches no course knowledge point",
            Self::One => "touches a single knowledge point",
            Self::Many => "touches several knowledge points",
        }
    }
}

/// C: whether the question is phrased correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correctness {
    Correct,
    Incorrect,
}

impl Dimension for Correctness {
    const KEY: &'static str = "correctness";
    const ARITY: u32 = 2;
    const VALUES: &'static [Self] = &[Self::Correct, Self::Incorrect];

    fn index(self) -> u32 {
        match self {
            Self::Correct => 0,
            Self::Incorrect => 1,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Correct => "phrased correctly",
            Self::Incorrect => "contains a factual or logical mistake",
        }
    }
}

/// R: whether the question repeats a recent topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repetition {
    Normal,
    Repeated,
}

impl Dimension for Repetition {
    const KEY: &'static str = "repetition";
    const ARITY: u32 = 2;
    const VALUES: &'static [Self] = &[Self::Normal, Self::Repeated];

    fn index(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::Repeated => 1,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Repeated => "repeated",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Normal => "a new question",
            Self::Repeated => "asked repeatedly about the same point",
        }
    }
}

macro_rules! display_via_as_str {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_via_as_str!(KnowledgeCount, Correctness, Repetition);

/// Number of scenarios in the K/C/R scheme.
pub const TOTAL_SCENARIOS: u32 = KnowledgeCount::ARITY * Correctness::ARITY * Repetition::ARITY;

/// The exact tuple of dimension values a scenario represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionSignature {
    pub knowledge_count: KnowledgeCount,
    pub correctness: Correctness,
    pub repetition: Repetition,
}

impl DimensionSignature {
    pub fn new(
        knowledge_count: KnowledgeCount,
        correctness: Correctness,
        repetition: Repetition,
    ) -> Self {
        Self {
            knowledge_count,
            correctness,
            repetition,
        }
    }

    /// 1-based scenario number in `[1, TOTAL_SCENARIOS]`.
    pub fn encode(self) -> u32 {
        ((self.knowledge_count.index() * Correctness::ARITY) + self.correctness.index())
            * Repetition::ARITY
            + self.repetition.index()
            + 1
    }

    /// Inverse of [`encode`](Self::encode); `None` outside `[1, TOTAL_SCENARIOS]`.
    pub fn decode(number: u32) -> Option<Self> {
        if number == 0 || number > TOTAL_SCENARIOS {
            return None;
        }
        let q = number - 1;
        let r = q % Repetition::ARITY;
        let c = (q / Repetition::ARITY) % Correctness::ARITY;
        let k = q / (Repetition::ARITY * Correctness::ARITY);
        Some(Self {
            knowledge_count: KnowledgeCount::from_index(k)?,
            correctness: Correctness::from_index(c)?,
            repetition: Repetition::from_index(r)?,
        })
    }

    /// Every signature, in scenario-number order.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=TOTAL_SCENARIOS).filter_map(Self::decode)
    }
}

impl fmt::Display for DimensionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.knowledge_count, self.correctness, self.repetition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn total_is_product_of_arities() {
        assert_eq!(TOTAL_SCENARIOS, 12);
    }

    #[test]
    fn encoding_is_a_bijection_onto_one_to_twelve() {
        let mut seen = HashSet::new();
        for k in KnowledgeCount::VALUES {
            for c in Correctness::VALUES {
                for r in Repetition::VALUES {
                    let sig = DimensionSignature::new(*k, *c, *r);
                    let n = sig.encode();
                    assert!((1..=TOTAL_SCENARIOS).contains(&n));
                    assert_eq!(DimensionSignature::decode(n), Some(sig));
                    assert!(seen.insert(n), "duplicate number {n}");
                }
            }
        }
        assert_eq!(seen.len(), TOTAL_SCENARIOS as usize);
    }

    #[test]
    fn known_numbers() {
        let first = DimensionSignature::new(
            KnowledgeCount::None,
            Correctness::Correct,
            Repetition::Normal,
        );
        assert_eq!(first.encode(), 1);

        let one_correct_normal = DimensionSignature::new(
            KnowledgeCount::One,
            Correctness::Correct,
            Repetition::Normal,
        );
        assert_eq!(one_correct_normal.encode(), 5);

        let last = DimensionSignature::new(
            KnowledgeCount::Many,
            Correctness::Incorrect,
            Repetition::Repeated,
        );
        assert_eq!(last.encode(), 12);
    }

    #[test]
    fn decode_rejects_out_of_range() {
        assert!(DimensionSignature::decode(0).is_none());
        assert!(DimensionSignature::decode(13).is_none());
    }

    #[test]
    fn all_is_in_number_order() {
        let numbers: Vec<u32> = DimensionSignature::all().map(|s| s.encode()).collect();
        assert_eq!(numbers, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn serde_names_match_as_str() {
        let raw = serde_json::to_string(&KnowledgeCount::Many).unwrap();
        assert_eq!(raw, format!("\"{}\"", KnowledgeCount::Many.as_str()));
    }
}
