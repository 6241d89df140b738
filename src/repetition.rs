//! Sliding-window repetition detection (the R dimension).
//!
//! A query is *repeated* when it shares a knowledge point with both of the
//! two previous queries. With fewer than two prior observations every query
//! is *normal*. The current observation always enters the window afterwards,
//! evicting the oldest.

use std::collections::{BTreeSet, VecDeque};

use crate::dimensions::Repetition;
use crate::knowledge::KnowledgeMask;

/// Number of prior observations the rule compares against.
pub const WINDOW: usize = 2;

/// An observation the tracker can compare.
pub trait WindowEntry: Clone {
    /// True when `self ∩ a ∩ b` is non-empty.
    fn shares_with_both(&self, a: &Self, b: &Self) -> bool;
}

impl WindowEntry for BTreeSet<String> {
    fn shares_with_both(&self, a: &Self, b: &Self) -> bool {
        self.iter().any(|p| a.contains(p) && b.contains(p))
    }
}

impl WindowEntry for KnowledgeMask {
    // Only words holding bits set in `self` are inspected.
    fn shares_with_both(&self, a: &Self, b: &Self) -> bool {
        (0..self.word_count()).any(|i| {
            let cur = self.word(i);
            cur != 0 && cur & a.word(i) & b.word(i) != 0
        })
    }
}

pub type LabelSet = BTreeSet<String>;

#[derive(Debug, Clone)]
pub struct RepetitionTracker<E: WindowEntry = LabelSet> {
    window: VecDeque<E>,
}

/// The same rule over catalogue bitmasks.
pub type MaskRepetitionTracker = RepetitionTracker<KnowledgeMask>;

impl<E: WindowEntry> Default for RepetitionTracker<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: WindowEntry> RepetitionTracker<E> {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW + 1),
        }
    }

    /// Build a tracker whose window holds the last [`WINDOW`] of `observations`.
    pub fn seeded<I: IntoIterator<Item = E>>(observations: I) -> Self {
        let mut tracker = Self::new();
        tracker.seed(observations);
        tracker
    }

    /// Replace the window with the tail of `observations` (oldest first).
    pub fn seed<I: IntoIterator<Item = E>>(&mut self, observations: I) {
        self.window.clear();
        for obs in observations {
            self.push(obs);
        }
    }

    /// Classify `current` against the window, then record it.
    pub fn check_and_update(&mut self, current: E) -> Repetition {
        let verdict = match (self.window.front(), self.window.get(1)) {
            (Some(a), Some(b)) if current.shares_with_both(a, b) => Repetition::Repeated,
            _ => Repetition::Normal,
        };
        self.push(current);
        verdict
    }

    pub fn window(&self) -> impl Iterator<Item = &E> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    fn push(&mut self, obs: E) {
        self.window.push_back(obs);
        while self.window.len() > WINDOW {
            self.window.pop_front();
        }
    }
}

impl RepetitionTracker<LabelSet> {
    pub fn check_points(&mut self, points: &[String]) -> Repetition {
        self.check_and_update(points.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeCatalog;

    fn set(items: &[&str]) -> LabelSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn same_point_three_times_is_repeated_on_the_third() {
        let mut t = RepetitionTracker::new();
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Normal);
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Normal);
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Repeated);
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Repeated);
    }

    #[test]
    fn distinct_points_stay_normal() {
        let mut t = RepetitionTracker::new();
        for p in ["A", "B", "C"] {
            assert_eq!(t.check_and_update(set(&[p])), Repetition::Normal);
        }
    }

    #[test]
    fn partial_overlap_on_a_common_point_is_repeated() {
        let mut t = RepetitionTracker::new();
        t.check_and_update(set(&["A", "B"]));
        t.check_and_update(set(&["A", "C"]));
        assert_eq!(t.check_and_update(set(&["A", "D"])), Repetition::Repeated);
    }

    #[test]
    fn overlap_with_only_one_prior_is_normal() {
        let mut t = RepetitionTracker::new();
        t.check_and_update(set(&["A"]));
        t.check_and_update(set(&["B"]));
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Normal);
    }

    #[test]
    fn empty_observations_never_repeat_and_still_occupy_the_window() {
        let mut t = RepetitionTracker::new();
        t.check_and_update(set(&["A"]));
        t.check_and_update(set(&["A"]));
        assert_eq!(t.check_and_update(set(&[])), Repetition::Normal);
        // window is now {A}, {}: no common point
        assert_eq!(t.check_and_update(set(&["A"])), Repetition::Normal);
        assert_eq!(t.len(), WINDOW);
    }

    #[test]
    fn seeding_keeps_only_the_tail() {
        let mut t = RepetitionTracker::seeded([set(&["X"]), set(&["A"]), set(&["A"])]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.check_points(&["A".to_string()]), Repetition::Repeated);
    }

    #[test]
    fn mask_tracker_agrees_with_label_tracker() {
        let catalog = KnowledgeCatalog::new(["A", "B", "C", "D"]);
        let seq: [&[&str]; 5] = [&["A", "B"], &["A", "C"], &["A", "D"], &["B"], &["B", "D"]];

        let mut labels = RepetitionTracker::new();
        let mut masks = MaskRepetitionTracker::new();
        for obs in seq {
            let by_label = labels.check_and_update(set(obs));
            let by_mask = masks.check_and_update(catalog.mask(obs));
            assert_eq!(by_label, by_mask, "disagreement on {obs:?}");
        }
    }

    #[test]
    fn mask_tracker_handles_wide_catalogues() {
        let labels: Vec<String> = (0..130).map(|i| format!("p{i}")).collect();
        let catalog = KnowledgeCatalog::new(&labels);
        let mut t = MaskRepetitionTracker::new();
        t.check_and_update(catalog.mask(&["p129"]));
        t.check_and_update(catalog.mask(&["p129", "p1"]));
        assert_eq!(t.check_and_update(catalog.mask(&["p129"])), Repetition::Repeated);
    }
}
