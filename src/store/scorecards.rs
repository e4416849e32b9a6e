//! Score card persistence. Issues and alternatives are stored as JSON.

use rusqlite::params;

use super::{store_err, Store};
use crate::domain::{ScoreCard, Scores};
use crate::errors::{EngineError, EngineResult};

impl Store {
    /// Insert a score card.
    pub fn create_score_card(&self, card: &ScoreCard) -> EngineResult<()> {
        let issues = serde_json::to_string(&card.issues)
            .map_err(|e| EngineError::StoreWrite(format!("encode issues: {e}")))?;
        let alternatives = serde_json::to_string(&card.alternatives)
            .map_err(|e| EngineError::StoreWrite(format!("encode alternatives: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO score_cards (review_id, task_id, reviewer, correctness, security, maintainability, cost, delivery_risk, issues_json, alternatives_json, verdict, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    card.review_id,
                    card.task_id,
                    card.reviewer,
                    card.scores.correctness,
                    card.scores.security,
                    card.scores.maintainability,
                    card.scores.cost,
                    card.scores.delivery_risk,
                    issues,
                    alternatives,
                    card.verdict,
                    card.created_at,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// All score cards for a task, oldest first.
    pub fn list_score_cards(&self, task_id: &str) -> EngineResult<Vec<ScoreCard>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT review_id, task_id, reviewer, correctness, security, maintainability, cost, delivery_risk, issues_json, alternatives_json, verdict, created_at
                 FROM score_cards WHERE task_id = ?1 ORDER BY created_at ASC, review_id ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                let issues_json: String = row.get(8)?;
                let alternatives_json: String = row.get(9)?;
                Ok((
                    ScoreCard {
                        review_id: row.get(0)?,
                        task_id: row.get(1)?,
                        reviewer: row.get(2)?,
                        scores: Scores {
                            correctness: row.get(3)?,
                            security: row.get(4)?,
                            maintainability: row.get(5)?,
                            cost: row.get(6)?,
                            delivery_risk: row.get(7)?,
                        },
                        issues: Vec::new(),
                        alternatives: Vec::new(),
                        verdict: row.get(10)?,
                        created_at: row.get(11)?,
                    },
                    issues_json,
                    alternatives_json,
                ))
            })
            .map_err(store_err)?;

        let mut cards = Vec::new();
        for row in rows {
            let (mut card, issues_json, alternatives_json) = row.map_err(store_err)?;
            card.issues = serde_json::from_str(&issues_json)
                .map_err(|e| EngineError::StoreWrite(format!("decode issues: {e}")))?;
            card.alternatives = serde_json::from_str(&alternatives_json)
                .map_err(|e| EngineError::StoreWrite(format!("decode alternatives: {e}")))?;
            cards.push(card);
        }
        Ok(cards)
    }
}
