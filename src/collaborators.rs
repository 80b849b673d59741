// External collaborator seams: the marker registry and the notifier
//
// The coordinator only ever talks to these through the traits below. The
// SQLite-backed registry is the deployment used by the CLI and tests; a
// remote registry would implement the same trait.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::error::{ReviewError, ReviewResult};

// ============================================================================
// MARKER REGISTRY
// ============================================================================

/// Fields for a marker to be created on Add approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMarker {
    pub marker_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_url: Option<String>,
}

/// Non-empty changed fields for an Update approval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerPatch {
    pub marker_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_url: Option<String>,
}

impl MarkerPatch {
    pub fn is_empty(&self) -> bool {
        self.marker_type.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
            && self.image_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub marker_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The registry of physical markers the review workflow mutates on approval.
pub trait MarkerRegistry: Send + Sync {
    /// Create a marker and return its assigned id.
    fn create_marker(&self, marker: &NewMarker) -> ReviewResult<String>;

    /// Apply the non-empty fields of `patch` to an existing marker.
    fn update_marker(&self, marker_id: &str, patch: &MarkerPatch) -> ReviewResult<()>;

    fn delete_marker(&self, marker_id: &str) -> ReviewResult<()>;

    /// Used by Submit to validate Update/Delete references.
    fn marker_exists(&self, marker_id: &str) -> ReviewResult<bool>;
}

/// Registry backed by the local `markers` table.
pub struct SqliteMarkerRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMarkerRegistry {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SqliteMarkerRegistry { conn }
    }

    pub fn get_marker(&self, marker_id: &str) -> ReviewResult<Marker> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, marker_type, latitude, longitude, image_url, created_at, updated_at
             FROM markers WHERE id = ?1",
            params![marker_id],
            |row| {
                let created_at: String = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(Marker {
                    id: row.get(0)?,
                    marker_type: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    image_url: row.get(4)?,
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                })
            },
        )
        .optional()?
        .ok_or_else(|| ReviewError::not_found("marker", marker_id))
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl MarkerRegistry for SqliteMarkerRegistry {
    fn create_marker(&self, marker: &NewMarker) -> ReviewResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO markers (id, marker_type, latitude, longitude, image_url,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                marker.marker_type,
                marker.latitude,
                marker.longitude,
                marker.image_url,
                now,
            ],
        )?;
        Ok(id)
    }

    fn update_marker(&self, marker_id: &str, patch: &MarkerPatch) -> ReviewResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE markers
             SET marker_type = COALESCE(?2, marker_type),
                 latitude = COALESCE(?3, latitude),
                 longitude = COALESCE(?4, longitude),
                 image_url = COALESCE(?5, image_url),
                 updated_at = ?6
             WHERE id = ?1",
            params![
                marker_id,
                patch.marker_type,
                patch.latitude,
                patch.longitude,
                patch.image_url,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(ReviewError::not_found("marker", marker_id));
        }
        Ok(())
    }

    fn delete_marker(&self, marker_id: &str) -> ReviewResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM markers WHERE id = ?1", params![marker_id])?;
        if deleted == 0 {
            return Err(ReviewError::not_found("marker", marker_id));
        }
        Ok(())
    }

    fn marker_exists(&self, marker_id: &str) -> ReviewResult<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM markers WHERE id = ?1",
                params![marker_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub message: String,
}

/// Fire-and-forget delivery. The coordinator swallows failures; a lost
/// notification never fails a review operation.
pub trait Notifier: Send + Sync {
    fn send(&self, user_id: &str, title: &str, message: &str) -> ReviewResult<()>;
}

/// CLI notifier: prints to stdout.
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn send(&self, user_id: &str, title: &str, message: &str) -> ReviewResult<()> {
        println!("📨 [{}] {}: {}", user_id, title, message);
        Ok(())
    }
}

/// Test notifier: keeps everything it was asked to deliver.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, user_id: &str, title: &str, message: &str) -> ReviewResult<()> {
        self.sent.lock().unwrap().push(Notification {
            user_id: user_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
