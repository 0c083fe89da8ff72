//! Automation Scorer.
//!
//! ```text
//! score = round(100 * applied / relevant) - penalty * markers,  clamped to 0..=100
//! ```
//!
//! Only relevant rules count, so a large rule inventory does not deflate
//! the score of a small procedure. A unit with nothing to rewrite scores 100.

use serde::Serialize;

use crate::rewriter::{RewriteLog, count_markers};

/// Points subtracted per manual-review marker.
pub const DEFAULT_MANUAL_PENALTY: u32 = 10;

/// How a score was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub relevant: usize,
    pub applied: usize,
    pub markers: usize,
    pub penalty: u32,
    pub score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scorer {
    penalty: u32,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(DEFAULT_MANUAL_PENALTY)
    }
}

impl Scorer {
    pub fn new(penalty: u32) -> Self {
        Self { penalty }
    }

    pub fn score(&self, log: &RewriteLog, artifact: &str) -> ScoreBreakdown {
        let relevant = log.relevant_count();
        let applied = log.applied_count();
        let markers = count_markers(artifact);

        let base = if relevant == 0 {
            100
        } else {
            (100.0 * applied as f64 / relevant as f64).round() as u64
        };
        let deduction = u64::from(self.penalty) * markers as u64;
        let score = base.saturating_sub(deduction).min(100) as u8;

        ScoreBreakdown {
            relevant,
            applied,
            markers,
            penalty: self.penalty,
            score,
        }
    }
}
