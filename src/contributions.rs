// Contribution entity + store
//
// A contribution is a user-submitted proposal against the marker registry.
// Its status moves exactly once: Pending -> Approved or Pending -> Rejected.
// Terminal states are immutable; the compare-and-swap in `transition_in_tx`
// is the only path out of Pending. The store is owned exclusively by the
// ReviewCoordinator; nothing else writes these tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{ReviewError, ReviewResult};

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::Pending => "pending",
            ContributionStatus::Approved => "approved",
            ContributionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ContributionStatus::Pending),
            "approved" => Some(ContributionStatus::Approved),
            "rejected" => Some(ContributionStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContributionStatus::Pending)
    }
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ACTION
// ============================================================================

/// What the submitter proposes to do to the registry.
///
/// `Add` carries the fields a new marker needs; `Update` references an
/// existing marker and carries the proposed field changes (any subset);
/// `Delete` only references the marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ContributionAction {
    Add {
        marker_type: String,
        latitude: f64,
        longitude: f64,
    },
    Update {
        marker_id: String,
        marker_type: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
    Delete {
        marker_id: String,
    },
}

impl ContributionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionAction::Add { .. } => "add",
            ContributionAction::Update { .. } => "update",
            ContributionAction::Delete { .. } => "delete",
        }
    }

    /// The marker the submitter referenced, if any (Update/Delete only).
    pub fn referenced_marker(&self) -> Option<&str> {
        match self {
            ContributionAction::Add { .. } => None,
            ContributionAction::Update { marker_id, .. }
            | ContributionAction::Delete { marker_id } => Some(marker_id),
        }
    }
}

// ============================================================================
// CONTRIBUTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    /// Stable identity (UUID), assigned on creation.
    pub id: String,

    /// Owning submitter.
    pub user_id: String,

    pub action: ContributionAction,

    pub description: Option<String>,
    pub image_url: Option<String>,

    pub status: ContributionStatus,

    /// Set by the coordinator on successful Add approval; for Update/Delete
    /// it mirrors the submitter-supplied reference.
    pub marker_id: Option<String>,

    /// Reviewer note recorded on rejection.
    pub admin_note: Option<String>,

    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl Contribution {
    pub fn new(
        user_id: &str,
        action: ContributionAction,
        description: Option<String>,
        image_url: Option<String>,
    ) -> Self {
        let marker_id = action.referenced_marker().map(|s| s.to_string());
        Contribution {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            action,
            description,
            image_url,
            status: ContributionStatus::Pending,
            marker_id,
            admin_note: None,
            created_at: Utc::now(),
            reviewed_at: None,
        }
    }
}

/// Owner-side edits, permitted only while Pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerPatch {
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub marker_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl OwnerPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.image_url.is_none()
            && self.marker_type.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
    }
}

/// One step of a contribution's status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub contribution_id: String,
    pub from_status: ContributionStatus,
    pub to_status: ContributionStatus,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const CONTRIBUTION_COLUMNS: &str =
    "id, user_id, action, marker_type, latitude, longitude, marker_id,
     description, image_url, status, admin_note, created_at, reviewed_at";

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn map_contribution(row: &Row<'_>) -> rusqlite::Result<Contribution> {
    let action_str: String = row.get(2)?;
    let marker_type: Option<String> = row.get(3)?;
    let latitude: Option<f64> = row.get(4)?;
    let longitude: Option<f64> = row.get(5)?;
    let marker_id: Option<String> = row.get(6)?;
    let status_str: String = row.get(9)?;
    let created_at: String = row.get(11)?;
    let reviewed_at: Option<String> = row.get(12)?;

    let action = match action_str.as_str() {
        "add" => ContributionAction::Add {
            marker_type: marker_type.unwrap_or_default(),
            latitude: latitude.unwrap_or(0.0),
            longitude: longitude.unwrap_or(0.0),
        },
        "update" => ContributionAction::Update {
            marker_id: marker_id.clone().unwrap_or_default(),
            marker_type,
            latitude,
            longitude,
        },
        "delete" => ContributionAction::Delete {
            marker_id: marker_id.clone().unwrap_or_default(),
        },
        _ => return Err(rusqlite::Error::InvalidQuery),
    };

    let status = ContributionStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?;

    Ok(Contribution {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action,
        description: row.get(7)?,
        image_url: row.get(8)?,
        status,
        marker_id,
        admin_note: row.get(10)?,
        created_at: parse_timestamp(&created_at),
        reviewed_at: reviewed_at.as_deref().map(parse_timestamp),
    })
}

// ============================================================================
// TRANSACTION-SCOPED OPERATIONS
// ============================================================================

pub(crate) fn insert_in_tx(conn: &Connection, c: &Contribution) -> ReviewResult<()> {
    let (marker_type, latitude, longitude) = match &c.action {
        ContributionAction::Add {
            marker_type,
            latitude,
            longitude,
        } => (Some(marker_type.clone()), Some(*latitude), Some(*longitude)),
        ContributionAction::Update {
            marker_type,
            latitude,
            longitude,
            ..
        } => (marker_type.clone(), *latitude, *longitude),
        ContributionAction::Delete { .. } => (None, None, None),
    };

    conn.execute(
        "INSERT INTO contributions
         (id, user_id, action, marker_type, latitude, longitude, marker_id,
          description, image_url, status, admin_note, created_at, reviewed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            c.id,
            c.user_id,
            c.action.as_str(),
            marker_type,
            latitude,
            longitude,
            c.marker_id,
            c.description,
            c.image_url,
            c.status.as_str(),
            c.admin_note,
            c.created_at.to_rfc3339(),
            c.reviewed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_in_tx(conn: &Connection, id: &str) -> ReviewResult<Contribution> {
    let query = format!(
        "SELECT {} FROM contributions WHERE id = ?1",
        CONTRIBUTION_COLUMNS
    );
    conn.query_row(&query, params![id], map_contribution)
        .optional()?
        .ok_or_else(|| ReviewError::not_found("contribution", id))
}

/// Compare-and-swap `pending -> to`. Zero rows affected means the
/// contribution was already reviewed (or never existed); the loser of a
/// concurrent review race lands here instead of double-processing.
pub(crate) fn transition_in_tx(
    conn: &Connection,
    id: &str,
    to: ContributionStatus,
    admin_note: Option<&str>,
) -> ReviewResult<()> {
    debug_assert!(to.is_terminal());

    let updated = conn.execute(
        "UPDATE contributions
         SET status = ?2, admin_note = COALESCE(?3, admin_note), reviewed_at = ?4
         WHERE id = ?1 AND status = 'pending'",
        params![id, to.as_str(), admin_note, Utc::now().to_rfc3339()],
    )?;

    if updated == 0 {
        let current = get_in_tx(conn, id)?;
        return Err(ReviewError::AlreadyReviewed {
            contribution_id: id.to_string(),
            status: current.status,
        });
    }
    Ok(())
}

/// Record the registry-assigned marker id after an Add approval.
pub(crate) fn set_marker_id_in_tx(
    conn: &Connection,
    id: &str,
    marker_id: &str,
) -> ReviewResult<()> {
    let updated = conn.execute(
        "UPDATE contributions SET marker_id = ?2 WHERE id = ?1 AND status = 'approved'",
        params![id, marker_id],
    )?;
    if updated == 0 {
        return Err(ReviewError::not_found("contribution", id));
    }
    Ok(())
}

pub(crate) fn record_event_in_tx(
    conn: &Connection,
    contribution_id: &str,
    from: ContributionStatus,
    to: ContributionStatus,
    actor: &str,
    note: Option<&str>,
) -> ReviewResult<()> {
    conn.execute(
        "INSERT INTO contribution_events
         (contribution_id, from_status, to_status, actor, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            contribution_id,
            from.as_str(),
            to.as_str(),
            actor,
            note,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// STORE
// ============================================================================

pub struct ContributionStore {
    conn: Arc<Mutex<Connection>>,
}

impl ContributionStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        ContributionStore { conn }
    }

    pub fn get(&self, id: &str) -> ReviewResult<Contribution> {
        let conn = self.conn.lock().unwrap();
        get_in_tx(&conn, id)
    }

    pub fn list_by_status(&self, status: ContributionStatus) -> ReviewResult<Vec<Contribution>> {
        self.filter(Some(status), None, None)
    }

    pub fn list_by_user(&self, user_id: &str) -> ReviewResult<Vec<Contribution>> {
        self.filter(None, None, Some(user_id))
    }

    /// Combined filter; every argument is optional and AND-ed together.
    pub fn filter(
        &self,
        status: Option<ContributionStatus>,
        action: Option<&str>,
        user_id: Option<&str>,
    ) -> ReviewResult<Vec<Contribution>> {
        let conn = self.conn.lock().unwrap();

        let mut query = format!(
            "SELECT {} FROM contributions WHERE 1 = 1",
            CONTRIBUTION_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = status {
            args.push(Box::new(status.as_str().to_string()));
            query.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(action) = action {
            args.push(Box::new(action.to_string()));
            query.push_str(&format!(" AND action = ?{}", args.len()));
        }
        if let Some(user_id) = user_id {
            args.push(Box::new(user_id.to_string()));
            query.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query)?;
        let contributions = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), map_contribution)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(contributions)
    }

    /// Owner edit: only the submitter, only while Pending.
    pub fn update_fields(
        &self,
        id: &str,
        user_id: &str,
        patch: &OwnerPatch,
    ) -> ReviewResult<Contribution> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let current = get_in_tx(&tx, id)?;
        check_owner_and_pending(&current, user_id)?;

        if patch.is_empty() {
            tx.commit()?;
            return Ok(current);
        }

        // A delete proposal carries no marker fields to edit
        if matches!(current.action, ContributionAction::Delete { .. })
            && (patch.marker_type.is_some()
                || patch.latitude.is_some()
                || patch.longitude.is_some())
        {
            return Err(ReviewError::Validation(
                "marker fields cannot be edited on a delete contribution".to_string(),
            ));
        }

        tx.execute(
            "UPDATE contributions
             SET description = COALESCE(?2, description),
                 image_url = COALESCE(?3, image_url),
                 marker_type = COALESCE(?4, marker_type),
                 latitude = COALESCE(?5, latitude),
                 longitude = COALESCE(?6, longitude)
             WHERE id = ?1",
            params![
                id,
                patch.description,
                patch.image_url,
                patch.marker_type,
                patch.latitude,
                patch.longitude,
            ],
        )?;

        let updated = get_in_tx(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Owner delete: only the submitter, only while Pending. Reviewed
    /// contributions are never deleted.
    pub fn delete(&self, id: &str, user_id: &str) -> ReviewResult<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let current = get_in_tx(&tx, id)?;
        check_owner_and_pending(&current, user_id)?;

        tx.execute("DELETE FROM contributions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Status history, oldest first.
    pub fn history(&self, contribution_id: &str) -> ReviewResult<Vec<StatusEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT contribution_id, from_status, to_status, actor, note, created_at
             FROM contribution_events
             WHERE contribution_id = ?1
             ORDER BY id ASC",
        )?;

        let events = stmt
            .query_map(params![contribution_id], |row| {
                let from: String = row.get(1)?;
                let to: String = row.get(2)?;
                let created_at: String = row.get(5)?;
                Ok(StatusEvent {
                    contribution_id: row.get(0)?,
                    from_status: ContributionStatus::parse(&from)
                        .ok_or(rusqlite::Error::InvalidQuery)?,
                    to_status: ContributionStatus::parse(&to)
                        .ok_or(rusqlite::Error::InvalidQuery)?,
                    actor: row.get(3)?,
                    note: row.get(4)?,
                    created_at: parse_timestamp(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

fn check_owner_and_pending(c: &Contribution, user_id: &str) -> ReviewResult<()> {
    if c.user_id != user_id {
        return Err(ReviewError::Forbidden {
            user_id: user_id.to_string(),
            contribution_id: c.id.clone(),
        });
    }
    if c.status.is_terminal() {
        return Err(ReviewError::Conflict(format!(
            "contribution {} is {} and can no longer be modified",
            c.id, c.status
        )));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
