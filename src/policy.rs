// Review economics as injected configuration
// Cost and reward are policy, not code: changing them must never require
// touching the state machine.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_SUBMISSION_COST: f64 = 5.0;
pub const DEFAULT_APPROVAL_REWARD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewPolicy {
    /// Coins debited from the submitter when a contribution is created.
    #[serde(default = "default_cost")]
    pub submission_cost: f64,

    /// Coins credited to the submitter when a contribution is approved
    /// (unless the reviewer overrides the amount).
    #[serde(default = "default_reward")]
    pub approval_reward: f64,
}

fn default_cost() -> f64 {
    DEFAULT_SUBMISSION_COST
}

fn default_reward() -> f64 {
    DEFAULT_APPROVAL_REWARD
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        ReviewPolicy {
            submission_cost: DEFAULT_SUBMISSION_COST,
            approval_reward: DEFAULT_APPROVAL_REWARD,
        }
    }
}

impl ReviewPolicy {
    /// Load policy from a JSON file, e.g. `{"submission_cost": 5.0,
    /// "approval_reward": 10.0}`. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read policy file: {:?}", path.as_ref()))?;

        let policy: ReviewPolicy =
            serde_json::from_str(&content).context("Failed to parse policy JSON")?;

        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.submission_cost > 0.0,
            "submission_cost must be > 0 (got {})",
            self.submission_cost
        );
        anyhow::ensure!(
            self.approval_reward > 0.0,
            "approval_reward must be > 0 (got {})",
            self.approval_reward
        );
        Ok(())
    }
}
