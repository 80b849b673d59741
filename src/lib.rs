// Waymark Review - Contribution Review & Coin Ledger Coordinator
// Core library: the review state machine, the coin ledger, and the vote tally

pub mod db;
pub mod error;
pub mod policy;
pub mod ledger;
pub mod contributions;
pub mod votes;
pub mod collaborators;
pub mod coordinator;

// Re-export commonly used types
pub use db::{open_database, setup_database};
pub use error::{ReviewError, ReviewResult};
pub use policy::{ReviewPolicy, DEFAULT_APPROVAL_REWARD, DEFAULT_SUBMISSION_COST};
pub use ledger::{AdjustmentKind, Ledger, LedgerEntry};
pub use contributions::{
    Contribution, ContributionAction, ContributionStatus, ContributionStore, OwnerPatch,
    StatusEvent,
};
pub use votes::{Vote, VoteSummary, VoteTally};
pub use collaborators::{
    Marker, MarkerPatch, MarkerRegistry, NewMarker, Notification, Notifier, RecordingNotifier,
    SqliteMarkerRegistry, StdoutNotifier,
};
pub use coordinator::{ReviewCoordinator, SubmitRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
