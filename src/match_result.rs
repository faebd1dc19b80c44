//! Match scores and the per-request result accumulator.

use crate::matcher::MatchError;
use serde::Serialize;
use std::cmp::Ordering;

/// Well-known score values.
pub struct MatchScores;

impl MatchScores {
    /// Score for a mismatch.
    pub const MISMATCH: f64 = 0.0;

    /// Score for a perfect match.
    pub const PERFECT: f64 = 1.0;

    /// Scores at or above this are treated as perfect (tolerates rounding).
    pub const ALMOST_PERFECT: f64 = 0.99995;

    /// Convert a boolean outcome into a score.
    pub fn to_score(matched: bool) -> f64 {
        if matched {
            Self::PERFECT
        } else {
            Self::MISMATCH
        }
    }

    /// Clamp any computed value into the valid score range.
    pub fn clamp(score: f64) -> f64 {
        if score.is_nan() {
            Self::MISMATCH
        } else {
            score.clamp(Self::MISMATCH, Self::PERFECT)
        }
    }
}

/// Score contributed by one facet matcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchDetail {
    /// Which facet matcher produced this score (e.g. `HeaderMatcher`).
    pub matcher_type: String,
    /// Score in [0, 1].
    pub score: f64,
    /// Fault captured while evaluating, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MatchError>,
}

/// Accumulated result of matching one request against one mapping predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMatchResult {
    pub total_score: f64,
    pub total_number: usize,
    pub match_details: Vec<MatchDetail>,
    #[serde(skip)]
    threshold: f64,
}

impl Default for RequestMatchResult {
    fn default() -> Self {
        Self::with_threshold(MatchScores::ALMOST_PERFECT)
    }
}

impl RequestMatchResult {
    /// Create an empty result using a custom near-perfect threshold.
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            total_score: 0.0,
            total_number: 0,
            match_details: Vec::new(),
            threshold,
        }
    }

    /// Record the score of one facet matcher and return the (clamped) score.
    pub fn add_score(
        &mut self,
        matcher_type: impl Into<String>,
        score: f64,
        error: Option<MatchError>,
    ) -> f64 {
        let score = MatchScores::clamp(score);
        self.total_score += score;
        self.total_number += 1;
        self.match_details.push(MatchDetail {
            matcher_type: matcher_type.into(),
            score,
            error,
        });
        score
    }

    /// Mean of all recorded scores (0 when nothing was recorded).
    pub fn average_total_score(&self) -> f64 {
        if self.total_number == 0 {
            MatchScores::MISMATCH
        } else {
            self.total_score / self.total_number as f64
        }
    }

    /// True when at least one score was recorded and every one of them is perfect.
    pub fn is_perfect_match(&self) -> bool {
        self.total_number > 0
            && self
                .match_details
                .iter()
                .all(|detail| detail.score >= self.threshold)
    }

    /// Orders better results first (by average score, descending).
    pub fn compare_by_score(&self, other: &Self) -> Ordering {
        other
            .average_total_score()
            .total_cmp(&self.average_total_score())
    }

    /// Whether any recorded detail carries a fault.
    pub fn has_errors(&self) -> bool {
        self.match_details.iter().any(|d| d.error.is_some())
    }
}
