//! Weighted consensus over reviewer score cards.

use std::collections::HashMap;

use crate::domain::{ConsensusResult, ScoreCard};
use crate::errors::{EngineError, EngineResult};
use crate::review::schema::SchemaValidator;

/// Aggregates score cards into a single verdict via weighted averaging.
pub struct ConsensusEngine {
    pub weights: HashMap<String, f64>,
    validator: SchemaValidator,
}

/// The standard reviewer weight distribution.
pub fn default_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("primary".to_string(), 0.45),
        ("secondary".to_string(), 0.25),
        ("lead".to_string(), 0.30),
    ])
}

impl ConsensusEngine {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        ConsensusEngine {
            weights,
            validator: SchemaValidator,
        }
    }

    /// Validate every card, then compute the weighted mean of per-card
    /// score averages. Reviewers absent from the weight map carry weight
    /// 1.0. Verdict thresholds: pass >= 4.0, conditional_pass >= 3.0.
    pub fn evaluate(&self, cards: &[ScoreCard]) -> EngineResult<ConsensusResult> {
        if cards.is_empty() {
            return Err(EngineError::ConsensusNoCards);
        }

        for card in cards {
            self.validator.validate(card)?;
        }

        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for card in cards {
            let weight = self.weights.get(&card.reviewer).copied().unwrap_or(1.0);
            weighted_sum += card.scores.average() * weight;
            total_weight += weight;
        }
        let final_score = weighted_sum / total_weight;

        let verdict = if final_score >= 4.0 {
            "pass"
        } else if final_score >= 3.0 {
            "conditional_pass"
        } else {
            "fail"
        };

        Ok(ConsensusResult {
            weighted_score: final_score,
            blocking: false,
            block_reasons: Vec::new(),
            final_verdict: verdict.to_string(),
        })
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        ConsensusEngine::new(default_weights())
    }
}
