// Review coordinator - the contribution state machine
//
// Submit: validate, then debit the submission cost and insert the pending
// contribution in ONE SQLite transaction, so a refused debit leaves no
// partial state. Approve: CAS the status, credit the reward and append the
// status event in one transaction, commit, and only then touch the marker
// registry; a registry failure after the commit surfaces as
// MarkerSyncPending and never reverses a reward already paid. Reject flips
// the status with no ledger effect. Notifications are best-effort.

use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::collaborators::{MarkerPatch, MarkerRegistry, NewMarker, Notifier};
use crate::contributions::{
    self, Contribution, ContributionAction, ContributionStatus, ContributionStore, OwnerPatch,
    StatusEvent,
};
use crate::error::{ReviewError, ReviewResult};
use crate::ledger::{self, Ledger};
use crate::policy::ReviewPolicy;

/// Actor recorded in the status history for admin decisions.
const ADMIN_ACTOR: &str = "admin";

/// What a client sends to `submit`.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub action: ContributionAction,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

pub struct ReviewCoordinator {
    conn: Arc<Mutex<Connection>>,
    store: ContributionStore,
    ledger: Ledger,
    registry: Arc<dyn MarkerRegistry>,
    notifier: Arc<dyn Notifier>,
    policy: ReviewPolicy,
}

impl ReviewCoordinator {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        registry: Arc<dyn MarkerRegistry>,
        notifier: Arc<dyn Notifier>,
        policy: ReviewPolicy,
    ) -> Self {
        ReviewCoordinator {
            store: ContributionStore::new(conn.clone()),
            ledger: Ledger::new(conn.clone()),
            conn,
            registry,
            notifier,
            policy,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    // ========================================================================
    // SUBMIT
    // ========================================================================

    /// Validate, charge the submission cost, and create the pending
    /// contribution. Debit and insert run in one transaction: a refused
    /// debit means no contribution row exists for the attempt.
    pub fn submit(&self, user_id: &str, request: SubmitRequest) -> ReviewResult<Contribution> {
        self.validate_action(&request.action)?;

        let contribution = Contribution::new(
            user_id,
            request.action,
            request.description,
            request.image_url,
        );

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        ledger::debit_in_tx(
            &tx,
            user_id,
            self.policy.submission_cost,
            &format!("submit:{}", contribution.id),
        )?;
        contributions::insert_in_tx(&tx, &contribution)?;

        tx.commit()?;
        Ok(contribution)
    }

    fn validate_action(&self, action: &ContributionAction) -> ReviewResult<()> {
        match action {
            ContributionAction::Add {
                marker_type,
                latitude,
                longitude,
            } => {
                if marker_type.trim().is_empty() {
                    return Err(ReviewError::Validation(
                        "add contribution requires a marker type".to_string(),
                    ));
                }
                validate_coordinates(*latitude, *longitude)?;
            }
            ContributionAction::Update {
                marker_id,
                latitude,
                longitude,
                ..
            } => {
                self.require_marker(marker_id)?;
                if let Some(lat) = latitude {
                    validate_latitude(*lat)?;
                }
                if let Some(lon) = longitude {
                    validate_longitude(*lon)?;
                }
            }
            ContributionAction::Delete { marker_id } => {
                self.require_marker(marker_id)?;
            }
        }
        Ok(())
    }

    fn require_marker(&self, marker_id: &str) -> ReviewResult<()> {
        if marker_id.trim().is_empty() {
            return Err(ReviewError::Validation(
                "update/delete contribution requires a marker id".to_string(),
            ));
        }
        if !self.registry.marker_exists(marker_id)? {
            return Err(ReviewError::not_found("marker", marker_id));
        }
        Ok(())
    }

    // ========================================================================
    // APPROVE / REJECT
    // ========================================================================

    /// Approve a pending contribution: flip the status, pay the reward
    /// (idempotency-keyed on the contribution id), then mutate the registry.
    /// The status flip and the reward are durable before the registry is
    /// touched; a registry failure returns `MarkerSyncPending`.
    pub fn approve(
        &self,
        contribution_id: &str,
        reward_override: Option<f64>,
    ) -> ReviewResult<Contribution> {
        let reward = reward_override.unwrap_or(self.policy.approval_reward);
        if reward <= 0.0 {
            return Err(ReviewError::InvalidAmount(reward));
        }

        let contribution = {
            let conn = self.conn.lock().unwrap();
            let tx = conn.unchecked_transaction()?;

            let contribution = contributions::get_in_tx(&tx, contribution_id)?;
            contributions::transition_in_tx(&tx, contribution_id, ContributionStatus::Approved, None)?;
            ledger::credit_in_tx(
                &tx,
                &contribution.user_id,
                reward,
                &format!("reward:{}", contribution_id),
            )?;
            contributions::record_event_in_tx(
                &tx,
                contribution_id,
                ContributionStatus::Pending,
                ContributionStatus::Approved,
                ADMIN_ACTOR,
                None,
            )?;

            tx.commit()?;
            contribution
        };

        // Registry dispatch happens strictly after the commit above.
        self.sync_marker(&contribution)
            .map_err(|e| sync_failure(contribution_id, e))?;

        let approved = self.store.get(contribution_id)?;

        // Best-effort: a lost notification never fails the approval
        let _ = self.notifier.send(
            &approved.user_id,
            "Contribution approved",
            &format!(
                "Your {} contribution {} was approved. {} coins were credited to your account.",
                approved.action.as_str(),
                approved.id,
                reward
            ),
        );

        Ok(approved)
    }

    /// Reject a pending contribution. No ledger effect; the admin note (if
    /// any) is stored and included in the notification.
    pub fn reject(
        &self,
        contribution_id: &str,
        admin_note: Option<&str>,
    ) -> ReviewResult<Contribution> {
        {
            let conn = self.conn.lock().unwrap();
            let tx = conn.unchecked_transaction()?;

            contributions::get_in_tx(&tx, contribution_id)?;
            contributions::transition_in_tx(
                &tx,
                contribution_id,
                ContributionStatus::Rejected,
                admin_note,
            )?;
            contributions::record_event_in_tx(
                &tx,
                contribution_id,
                ContributionStatus::Pending,
                ContributionStatus::Rejected,
                ADMIN_ACTOR,
                admin_note,
            )?;

            tx.commit()?;
        }

        let rejected = self.store.get(contribution_id)?;

        let message = match admin_note {
            Some(note) => format!(
                "Your contribution {} was rejected: {}",
                rejected.id, note
            ),
            None => format!("Your contribution {} was rejected.", rejected.id),
        };
        let _ = self
            .notifier
            .send(&rejected.user_id, "Contribution rejected", &message);

        Ok(rejected)
    }

    /// Re-run the registry dispatch for a contribution that was approved but
    /// whose marker mutation failed. Idempotent: an Add that already has its
    /// marker id recorded is a no-op.
    pub fn retry_marker_sync(&self, contribution_id: &str) -> ReviewResult<Contribution> {
        let contribution = self.store.get(contribution_id)?;
        if contribution.status != ContributionStatus::Approved {
            return Err(ReviewError::Conflict(format!(
                "contribution {} is {}, marker sync only applies to approved contributions",
                contribution_id, contribution.status
            )));
        }

        self.sync_marker(&contribution)
            .map_err(|e| sync_failure(contribution_id, e))?;

        let synced = self.store.get(contribution_id)?;

        // The approval notification was skipped when the original approve
        // failed mid-sync; deliver it now (still best-effort).
        let _ = self.notifier.send(
            &synced.user_id,
            "Contribution approved",
            &format!(
                "Your {} contribution {} was approved and the marker registry has been updated.",
                synced.action.as_str(),
                synced.id
            ),
        );

        Ok(synced)
    }

    fn sync_marker(&self, contribution: &Contribution) -> ReviewResult<()> {
        match &contribution.action {
            ContributionAction::Add {
                marker_type,
                latitude,
                longitude,
            } => {
                // Already synced on a previous attempt
                if contribution.marker_id.is_some() {
                    return Ok(());
                }
                let marker_id = self.registry.create_marker(&NewMarker {
                    marker_type: marker_type.clone(),
                    latitude: *latitude,
                    longitude: *longitude,
                    image_url: contribution.image_url.clone(),
                })?;
                let conn = self.conn.lock().unwrap();
                contributions::set_marker_id_in_tx(&conn, &contribution.id, &marker_id)?;
            }
            ContributionAction::Update {
                marker_id,
                marker_type,
                latitude,
                longitude,
            } => {
                let patch = MarkerPatch {
                    marker_type: marker_type.clone(),
                    latitude: *latitude,
                    longitude: *longitude,
                    image_url: contribution.image_url.clone(),
                };
                self.registry.update_marker(marker_id, &patch)?;
            }
            ContributionAction::Delete { marker_id } => {
                match self.registry.delete_marker(marker_id) {
                    // Already gone: treat the retry as satisfied
                    Err(ReviewError::NotFound { .. }) => {}
                    other => other?,
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // OWNER OPERATIONS
    // ========================================================================

    /// Owner edit while Pending. Patched marker fields pass the same checks
    /// as `submit`, so an edit cannot corrupt a validated contribution.
    pub fn update_own(
        &self,
        contribution_id: &str,
        user_id: &str,
        patch: &OwnerPatch,
    ) -> ReviewResult<Contribution> {
        if let Some(marker_type) = &patch.marker_type {
            if marker_type.trim().is_empty() {
                return Err(ReviewError::Validation(
                    "marker type cannot be empty".to_string(),
                ));
            }
        }
        if let Some(lat) = patch.latitude {
            validate_latitude(lat)?;
        }
        if let Some(lon) = patch.longitude {
            validate_longitude(lon)?;
        }

        self.store.update_fields(contribution_id, user_id, patch)
    }

    pub fn delete_own(&self, contribution_id: &str, user_id: &str) -> ReviewResult<()> {
        self.store.delete(contribution_id, user_id)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&self, contribution_id: &str) -> ReviewResult<Contribution> {
        self.store.get(contribution_id)
    }

    pub fn list_by_status(&self, status: ContributionStatus) -> ReviewResult<Vec<Contribution>> {
        self.store.list_by_status(status)
    }

    pub fn list_by_user(&self, user_id: &str) -> ReviewResult<Vec<Contribution>> {
        self.store.list_by_user(user_id)
    }

    pub fn filter(
        &self,
        status: Option<ContributionStatus>,
        action: Option<&str>,
        user_id: Option<&str>,
    ) -> ReviewResult<Vec<Contribution>> {
        self.store.filter(status, action, user_id)
    }

    pub fn history(&self, contribution_id: &str) -> ReviewResult<Vec<StatusEvent>> {
        self.store.history(contribution_id)
    }
}

/// Classify a registry failure after the approval already committed.
/// A missing marker is terminal (no retry can make an Update target
/// reappear); everything else stays a retryable pending sync.
fn sync_failure(contribution_id: &str, e: ReviewError) -> ReviewError {
    match e {
        ReviewError::NotFound { .. } => e,
        other => ReviewError::MarkerSyncPending {
            contribution_id: contribution_id.to_string(),
            source_msg: other.to_string(),
        },
    }
}

fn validate_latitude(latitude: f64) -> ReviewResult<()> {
    if !(-90.0..=90.0).contains(&latitude) || !latitude.is_finite() {
        return Err(ReviewError::Validation(format!(
            "latitude {} out of range [-90, 90]",
            latitude
        )));
    }
    Ok(())
}

fn validate_longitude(longitude: f64) -> ReviewResult<()> {
    if !(-180.0..=180.0).contains(&longitude) || !longitude.is_finite() {
        return Err(ReviewError::Validation(format!(
            "longitude {} out of range [-180, 180]",
            longitude
        )));
    }
    Ok(())
}

fn validate_coordinates(latitude: f64, longitude: f64) -> ReviewResult<()> {
    validate_latitude(latitude)?;
    validate_longitude(longitude)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NewMarker, RecordingNotifier, SqliteMarkerRegistry};
    use crate::db::setup_database;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Registry wrapper whose mutations can be made to fail on demand, to
    /// exercise the approved-with-pending-marker-sync path.
    struct FlakyRegistry {
        inner: SqliteMarkerRegistry,
        fail: AtomicBool,
    }

    impl FlakyRegistry {
        fn new(conn: Arc<Mutex<Connection>>) -> Self {
            FlakyRegistry {
                inner: SqliteMarkerRegistry::new(conn),
                fail: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> ReviewResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ReviewError::Upstream("registry unreachable".to_string()));
            }
            Ok(())
        }
    }

    impl MarkerRegistry for FlakyRegistry {
        fn create_marker(&self, marker: &NewMarker) -> ReviewResult<String> {
            self.check()?;
            self.inner.create_marker(marker)
        }

        fn update_marker(&self, marker_id: &str, patch: &MarkerPatch) -> ReviewResult<()> {
            self.check()?;
            self.inner.update_marker(marker_id, patch)
        }

        fn delete_marker(&self, marker_id: &str) -> ReviewResult<()> {
            self.check()?;
            self.inner.delete_marker(marker_id)
        }

        fn marker_exists(&self, marker_id: &str) -> ReviewResult<bool> {
            // Existence checks stay available even when mutations fail
            self.inner.marker_exists(marker_id)
        }
    }

    struct Harness {
        coordinator: ReviewCoordinator,
        registry: Arc<FlakyRegistry>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let registry = Arc::new(FlakyRegistry::new(conn.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = ReviewCoordinator::new(
            conn,
            registry.clone(),
            notifier.clone(),
            ReviewPolicy::default(),
        );

        Harness {
            coordinator,
            registry,
            notifier,
        }
    }

    fn add_request() -> SubmitRequest {
        SubmitRequest {
            action: ContributionAction::Add {
                marker_type: "trail_sign".to_string(),
                latitude: 47.36,
                longitude: 8.54,
            },
            description: Some("fork at the ridge".to_string()),
            image_url: None,
        }
    }

    #[test]
    fn test_end_to_end_add_approval() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();

        // Submit: balance 5 -> 0, contribution pending
        let c = h.coordinator.submit("alice", add_request()).unwrap();
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 0.0);
        assert_eq!(c.status, ContributionStatus::Pending);

        // Approve: balance -> 10, status approved, marker created, notified
        let approved = h.coordinator.approve(&c.id, None).unwrap();
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 10.0);
        assert_eq!(approved.status, ContributionStatus::Approved);

        let marker_id = approved.marker_id.expect("Add approval must record marker id");
        assert!(h.registry.marker_exists(&marker_id).unwrap());

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "alice");
        assert_eq!(sent[0].title, "Contribution approved");

        // Second approve fails and pays nothing
        let err = h.coordinator.approve(&c.id, None).unwrap_err();
        assert!(matches!(err, ReviewError::AlreadyReviewed { .. }));
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 10.0);
    }

    #[test]
    fn test_submit_insufficient_funds_creates_nothing() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 3.0, "grant:t1").unwrap();

        let err = h.coordinator.submit("alice", add_request()).unwrap_err();
        assert!(matches!(err, ReviewError::InsufficientFunds { .. }));

        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 3.0);
        assert!(h.coordinator.list_by_user("alice").unwrap().is_empty());
    }

    #[test]
    fn test_submit_success_is_exactly_one_pending_row() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 12.0, "grant:t1").unwrap();

        h.coordinator.submit("alice", add_request()).unwrap();

        let pending = h
            .coordinator
            .list_by_status(ContributionStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 7.0);
    }

    #[test]
    fn test_submit_validation_rejected_before_any_debit() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 50.0, "grant:t1").unwrap();

        let bad_requests = vec![
            SubmitRequest {
                action: ContributionAction::Add {
                    marker_type: " ".to_string(),
                    latitude: 10.0,
                    longitude: 10.0,
                },
                description: None,
                image_url: None,
            },
            SubmitRequest {
                action: ContributionAction::Add {
                    marker_type: "trail_sign".to_string(),
                    latitude: 91.0,
                    longitude: 10.0,
                },
                description: None,
                image_url: None,
            },
            SubmitRequest {
                action: ContributionAction::Add {
                    marker_type: "trail_sign".to_string(),
                    latitude: 10.0,
                    longitude: -180.5,
                },
                description: None,
                image_url: None,
            },
        ];

        for request in bad_requests {
            let err = h.coordinator.submit("alice", request).unwrap_err();
            assert!(matches!(err, ReviewError::Validation(_)));
        }

        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 50.0);
        assert!(h.coordinator.list_by_user("alice").unwrap().is_empty());
    }

    #[test]
    fn test_submit_update_requires_existing_marker() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 10.0, "grant:t1").unwrap();

        let request = SubmitRequest {
            action: ContributionAction::Update {
                marker_id: "nowhere".to_string(),
                marker_type: None,
                latitude: None,
                longitude: None,
            },
            description: None,
            image_url: None,
        };

        let err = h.coordinator.submit("alice", request).unwrap_err();
        assert!(matches!(err, ReviewError::NotFound { kind: "marker", .. }));
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 10.0);
    }

    #[test]
    fn test_approve_update_patches_marker() {
        let h = harness();
        let marker_id = h
            .registry
            .create_marker(&NewMarker {
                marker_type: "trail_sign".to_string(),
                latitude: 1.0,
                longitude: 2.0,
                image_url: None,
            })
            .unwrap();

        h.coordinator.ledger().credit("bob", 5.0, "grant:t1").unwrap();
        let c = h
            .coordinator
            .submit(
                "bob",
                SubmitRequest {
                    action: ContributionAction::Update {
                        marker_id: marker_id.clone(),
                        marker_type: Some("info_board".to_string()),
                        latitude: None,
                        longitude: None,
                    },
                    description: Some("type is wrong on site".to_string()),
                    image_url: None,
                },
            )
            .unwrap();

        h.coordinator.approve(&c.id, None).unwrap();

        let marker = h.registry.inner.get_marker(&marker_id).unwrap();
        assert_eq!(marker.marker_type, "info_board");
        assert_eq!(marker.latitude, 1.0, "Unchanged fields stay");
    }

    #[test]
    fn test_approve_delete_removes_marker() {
        let h = harness();
        let marker_id = h
            .registry
            .create_marker(&NewMarker {
                marker_type: "trail_sign".to_string(),
                latitude: 1.0,
                longitude: 2.0,
                image_url: None,
            })
            .unwrap();

        h.coordinator.ledger().credit("bob", 5.0, "grant:t1").unwrap();
        let c = h
            .coordinator
            .submit(
                "bob",
                SubmitRequest {
                    action: ContributionAction::Delete {
                        marker_id: marker_id.clone(),
                    },
                    description: None,
                    image_url: None,
                },
            )
            .unwrap();

        h.coordinator.approve(&c.id, None).unwrap();
        assert!(!h.registry.marker_exists(&marker_id).unwrap());
    }

    #[test]
    fn test_approve_reward_override() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        h.coordinator.approve(&c.id, Some(25.0)).unwrap();
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 25.0);
    }

    #[test]
    fn test_reject_has_no_ledger_effect_and_notes_the_reason() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        let rejected = h
            .coordinator
            .reject(&c.id, Some("duplicate of an existing sign"))
            .unwrap();

        assert_eq!(rejected.status, ContributionStatus::Rejected);
        assert_eq!(
            rejected.admin_note.as_deref(),
            Some("duplicate of an existing sign")
        );
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 0.0);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("duplicate of an existing sign"));

        // Reject after reject: AlreadyReviewed
        let err = h.coordinator.reject(&c.id, None).unwrap_err();
        assert!(matches!(err, ReviewError::AlreadyReviewed { .. }));
    }

    #[test]
    fn test_reject_unknown_contribution() {
        let h = harness();
        let err = h.coordinator.reject("missing", None).unwrap_err();
        assert!(matches!(err, ReviewError::NotFound { .. }));
    }

    #[test]
    fn test_registry_failure_surfaces_as_marker_sync_pending() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        h.registry.set_failing(true);
        let err = h.coordinator.approve(&c.id, None).unwrap_err();
        assert!(matches!(err, ReviewError::MarkerSyncPending { .. }));
        assert!(err.is_retryable());

        // Status and reward are already durable
        let loaded = h.coordinator.get(&c.id).unwrap();
        assert_eq!(loaded.status, ContributionStatus::Approved);
        assert!(loaded.marker_id.is_none());
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 10.0);

        // Retry once the registry is back: marker lands, no second reward
        h.registry.set_failing(false);
        let synced = h.coordinator.retry_marker_sync(&c.id).unwrap();
        let marker_id = synced.marker_id.expect("Retry must record the marker id");
        assert!(h.registry.marker_exists(&marker_id).unwrap());
        assert_eq!(h.coordinator.ledger().balance("alice").unwrap(), 10.0);

        // A second retry is a no-op and creates no second marker
        h.coordinator.retry_marker_sync(&c.id).unwrap();
        let again = h.coordinator.get(&c.id).unwrap();
        assert_eq!(again.marker_id.as_deref(), Some(marker_id.as_str()));
    }

    #[test]
    fn test_retry_marker_sync_requires_approved_status() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        let err = h.coordinator.retry_marker_sync(&c.id).unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
    }

    #[test]
    fn test_ownership_scenario() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        // User B cannot delete A's pending contribution
        let err = h.coordinator.delete_own(&c.id, "bob").unwrap_err();
        assert!(matches!(err, ReviewError::Forbidden { .. }));

        // The owner can
        h.coordinator.delete_own(&c.id, "alice").unwrap();
        assert!(matches!(
            h.coordinator.get(&c.id).unwrap_err(),
            ReviewError::NotFound { .. }
        ));
    }

    #[test]
    fn test_owner_update_before_review() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        let updated = h
            .coordinator
            .update_own(
                &c.id,
                "alice",
                &OwnerPatch {
                    description: Some("clearer wording".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("clearer wording"));

        h.coordinator.reject(&c.id, None).unwrap();
        let err = h
            .coordinator
            .update_own(
                &c.id,
                "alice",
                &OwnerPatch {
                    description: Some("too late".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
    }

    #[test]
    fn test_owner_patch_fields_validated_like_submit() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        let bad_patches = vec![
            OwnerPatch {
                latitude: Some(999.0),
                ..Default::default()
            },
            OwnerPatch {
                longitude: Some(-200.0),
                ..Default::default()
            },
            OwnerPatch {
                marker_type: Some("  ".to_string()),
                ..Default::default()
            },
        ];

        for patch in bad_patches {
            let err = h.coordinator.update_own(&c.id, "alice", &patch).unwrap_err();
            assert!(matches!(err, ReviewError::Validation(_)));
        }

        // The contribution keeps its validated fields, and approval creates
        // an in-range marker
        let loaded = h.coordinator.get(&c.id).unwrap();
        assert_eq!(loaded.action, add_request().action);

        let approved = h.coordinator.approve(&c.id, None).unwrap();
        let marker = h
            .registry
            .inner
            .get_marker(approved.marker_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(marker.latitude, 47.36);
        assert_eq!(marker.marker_type, "trail_sign");
    }

    #[test]
    fn test_approve_update_on_vanished_marker_is_terminal() {
        let h = harness();
        let marker_id = h
            .registry
            .create_marker(&NewMarker {
                marker_type: "trail_sign".to_string(),
                latitude: 1.0,
                longitude: 2.0,
                image_url: None,
            })
            .unwrap();

        h.coordinator.ledger().credit("bob", 5.0, "grant:t1").unwrap();
        let c = h
            .coordinator
            .submit(
                "bob",
                SubmitRequest {
                    action: ContributionAction::Update {
                        marker_id: marker_id.clone(),
                        marker_type: Some("info_board".to_string()),
                        latitude: None,
                        longitude: None,
                    },
                    description: None,
                    image_url: None,
                },
            )
            .unwrap();

        // Marker disappears between submit and approve
        h.registry.delete_marker(&marker_id).unwrap();

        let err = h.coordinator.approve(&c.id, None).unwrap_err();
        assert!(
            matches!(err, ReviewError::NotFound { kind: "marker", .. }),
            "A vanished Update target is terminal, got {:?}",
            err
        );
        assert!(!err.is_retryable(), "No retry can bring the marker back");

        // The approval itself is still durable
        let loaded = h.coordinator.get(&c.id).unwrap();
        assert_eq!(loaded.status, ContributionStatus::Approved);
        assert_eq!(h.coordinator.ledger().balance("bob").unwrap(), 10.0);
    }

    #[test]
    fn test_retry_delivers_deferred_approval_notification() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        h.registry.set_failing(true);
        h.coordinator.approve(&c.id, None).unwrap_err();
        assert!(
            h.notifier.sent().is_empty(),
            "No approval notification while the sync is pending"
        );

        h.registry.set_failing(false);
        h.coordinator.retry_marker_sync(&c.id).unwrap();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "alice");
        assert_eq!(sent[0].title, "Contribution approved");
    }

    #[test]
    fn test_history_records_the_transition() {
        let h = harness();
        h.coordinator.ledger().credit("alice", 5.0, "grant:t1").unwrap();
        let c = h.coordinator.submit("alice", add_request()).unwrap();

        h.coordinator.approve(&c.id, None).unwrap();

        let history = h.coordinator.history(&c.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, ContributionStatus::Pending);
        assert_eq!(history[0].to_status, ContributionStatus::Approved);
        assert_eq!(history[0].actor, "admin");
    }

    #[test]
    fn test_custom_policy_amounts() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let registry = Arc::new(FlakyRegistry::new(conn.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = ReviewCoordinator::new(
            conn,
            registry,
            notifier,
            ReviewPolicy {
                submission_cost: 2.0,
                approval_reward: 3.0,
            },
        );

        coordinator.ledger().credit("alice", 2.0, "grant:t1").unwrap();
        let c = coordinator.submit("alice", add_request()).unwrap();
        assert_eq!(coordinator.ledger().balance("alice").unwrap(), 0.0);

        coordinator.approve(&c.id, None).unwrap();
        assert_eq!(coordinator.ledger().balance("alice").unwrap(), 3.0);
    }
}

