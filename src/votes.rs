// Vote tally - community input on pending contributions
//
// One vote per (contribution, voter) pair, enforced by the UNIQUE constraint
// and surfaced as Conflict. Cast never upserts; direction/weight changes go
// through revise. The summary is advisory input for a reviewer: the
// coordinator enforces no vote threshold.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::error::{ReviewError, ReviewResult};

// ============================================================================
// VOTE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub contribution_id: String,
    pub user_id: String,
    pub is_upvote: bool,
    /// Positive influence multiplier, default 1.0.
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    /// Signed contribution to the score: +weight for up, -weight for down.
    pub fn signed_value(&self) -> f64 {
        if self.is_upvote {
            self.weight
        } else {
            -self.weight
        }
    }
}

/// Aggregate view over all votes on one contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSummary {
    pub contribution_id: String,
    pub total_votes: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub average_weight: f64,
    /// Σ (±1 × weight) over all votes.
    pub total_score: f64,
}

fn map_vote(row: &Row<'_>) -> rusqlite::Result<Vote> {
    let is_upvote: i64 = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(Vote {
        id: row.get(0)?,
        contribution_id: row.get(1)?,
        user_id: row.get(2)?,
        is_upvote: is_upvote != 0,
        weight: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

// ============================================================================
// VOTE TALLY
// ============================================================================

pub struct VoteTally {
    conn: Arc<Mutex<Connection>>,
}

impl VoteTally {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        VoteTally { conn }
    }

    /// Record a new vote. A second vote from the same user on the same
    /// contribution fails with `Conflict` (no implicit update).
    pub fn cast(
        &self,
        contribution_id: &str,
        user_id: &str,
        is_upvote: bool,
        weight: f64,
    ) -> ReviewResult<Vote> {
        if weight <= 0.0 {
            return Err(ReviewError::InvalidAmount(weight));
        }

        let vote = Vote {
            id: uuid::Uuid::new_v4().to_string(),
            contribution_id: contribution_id.to_string(),
            user_id: user_id.to_string(),
            is_upvote,
            weight,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO votes (id, contribution_id, user_id, is_upvote, weight, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                vote.id,
                vote.contribution_id,
                vote.user_id,
                vote.is_upvote as i64,
                vote.weight,
                vote.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(vote),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ReviewError::Conflict(format!(
                    "user {} already voted on contribution {}",
                    user_id, contribution_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Change direction and/or weight of an existing vote.
    pub fn revise(
        &self,
        vote_id: &str,
        is_upvote: Option<bool>,
        weight: Option<f64>,
    ) -> ReviewResult<Vote> {
        if let Some(w) = weight {
            if w <= 0.0 {
                return Err(ReviewError::InvalidAmount(w));
            }
        }

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE votes
             SET is_upvote = COALESCE(?2, is_upvote),
                 weight = COALESCE(?3, weight)
             WHERE id = ?1",
            params![vote_id, is_upvote.map(|b| b as i64), weight],
        )?;

        if updated == 0 {
            return Err(ReviewError::not_found("vote", vote_id));
        }

        conn.query_row(
            "SELECT id, contribution_id, user_id, is_upvote, weight, created_at
             FROM votes WHERE id = ?1",
            params![vote_id],
            map_vote,
        )
        .optional()?
        .ok_or_else(|| ReviewError::not_found("vote", vote_id))
    }

    pub fn delete(&self, vote_id: &str) -> ReviewResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM votes WHERE id = ?1", params![vote_id])?;
        if deleted == 0 {
            return Err(ReviewError::not_found("vote", vote_id));
        }
        Ok(())
    }

    /// Aggregate score for a contribution. All zeroes when no votes exist.
    pub fn summary(&self, contribution_id: &str) -> ReviewResult<VoteSummary> {
        let conn = self.conn.lock().unwrap();
        let summary = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN is_upvote = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_upvote = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(weight), 0),
                COALESCE(SUM(CASE WHEN is_upvote = 1 THEN weight ELSE -weight END), 0)
             FROM votes
             WHERE contribution_id = ?1",
            params![contribution_id],
            |row| {
                Ok(VoteSummary {
                    contribution_id: contribution_id.to_string(),
                    total_votes: row.get(0)?,
                    upvotes: row.get(1)?,
                    downvotes: row.get(2)?,
                    average_weight: row.get(3)?,
                    total_score: row.get(4)?,
                })
            },
        )?;
        Ok(summary)
    }

    pub fn list_by_contribution(&self, contribution_id: &str) -> ReviewResult<Vec<Vote>> {
        self.list("contribution_id", contribution_id)
    }

    pub fn list_by_user(&self, user_id: &str) -> ReviewResult<Vec<Vote>> {
        self.list("user_id", user_id)
    }

    fn list(&self, column: &str, value: &str) -> ReviewResult<Vec<Vote>> {
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "SELECT id, contribution_id, user_id, is_upvote, weight, created_at
             FROM votes WHERE {} = ?1 ORDER BY created_at ASC",
            column
        );
        let mut stmt = conn.prepare(&query)?;
        let votes = stmt
            .query_map(params![value], map_vote)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(votes)
    }
}

// ============================================================================
// TESTS
// ============================================================================
