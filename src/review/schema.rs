//! Score card schema validation.

use crate::domain::ScoreCard;
use crate::errors::{EngineError, EngineResult};

const VALID_VERDICTS: &[&str] = &["pass", "conditional_pass", "fail"];
const VALID_SEVERITIES: &[&str] = &["P0", "P1", "P2"];

/// Validates score card fields against the review schema. All violations
/// are collected and surfaced in a single error.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn validate(&self, card: &ScoreCard) -> EngineResult<()> {
        let mut violations = Vec::new();

        if card.review_id.is_empty() {
            violations.push("reviewId must be non-empty".to_string());
        }
        if card.reviewer.is_empty() {
            violations.push("reviewer must be non-empty".to_string());
        }
        if !VALID_VERDICTS.contains(&card.verdict.as_str()) {
            violations.push(format!(
                "verdict {:?} is not valid; must be pass, conditional_pass, or fail",
                card.verdict
            ));
        }

        let dims = [
            ("correctness", card.scores.correctness),
            ("security", card.scores.security),
            ("maintainability", card.scores.maintainability),
            ("cost", card.scores.cost),
            ("deliveryRisk", card.scores.delivery_risk),
        ];
        for (name, value) in dims {
            if !(1..=5).contains(&value) {
                violations.push(format!("{name} score {value} out of range [1, 5]"));
            }
        }

        for (i, issue) in card.issues.iter().enumerate() {
            if !VALID_SEVERITIES.contains(&issue.severity.as_str()) {
                violations.push(format!(
                    "issue[{i}] severity {:?} is not valid; must be P0, P1, or P2",
                    issue.severity
                ));
            }
        }

        if !violations.is_empty() {
            return Err(EngineError::ScoreCardInvalid { violations });
        }
        Ok(())
    }
}
