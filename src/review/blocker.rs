//! Extraction of blocking conditions from score cards.

use crate::domain::ScoreCard;

/// Inspects score cards for conditions that must be resolved before the
/// workflow can leave its review phase: critically low correctness or
/// security scores, and any P0 issue.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockerChecker;

impl BlockerChecker {
    /// Returns whether any blocking condition exists, with one reason per
    /// condition found.
    pub fn check(&self, cards: &[ScoreCard]) -> (bool, Vec<String>) {
        let mut reasons = Vec::new();
        for card in cards {
            if card.scores.correctness <= 2 {
                reasons.push(format!(
                    "{}: correctness score {} is critically low",
                    card.reviewer, card.scores.correctness
                ));
            }
            if card.scores.security <= 2 {
                reasons.push(format!(
                    "{}: security score {} is critically low",
                    card.reviewer, card.scores.security
                ));
            }
            for issue in &card.issues {
                if issue.severity == "P0" {
                    reasons.push(format!(
                        "{}: P0 issue at {}: {}",
                        card.reviewer, issue.location, issue.description
                    ));
                }
            }
        }
        (!reasons.is_empty(), reasons)
    }
}
