// Coin ledger - one balance per user, non-negative at all times
//
// Every mutation goes through credit/debit/adjust; nothing else touches
// ledger_accounts. Sufficiency is re-verified inside the debit's own
// conditional UPDATE, so a separate has_sufficient_balance() check can never
// stand in for the atomic debit. Each mutation appends a journal row keyed by
// a SHA-256 idempotency hash; replaying the same logical operation is a no-op.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

use crate::error::{ReviewError, ReviewResult};

// ============================================================================
// ADJUSTMENT KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentKind {
    Credit,
    Debit,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentKind::Credit => "credit",
            AdjustmentKind::Debit => "debit",
        }
    }
}

// ============================================================================
// JOURNAL ENTRY
// ============================================================================

/// One row of the ledger journal (read-back view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub kind: String,
    pub amount: f64,
    pub balance_after: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Idempotency key for a logical ledger operation.
///
/// The reason string carries the operation identity (e.g. "submit:<id>",
/// "reward:<id>"), so a retried credit for the same contribution hashes to
/// the same key and is skipped.
fn idempotency_hash(user_id: &str, kind: AdjustmentKind, amount: f64, reason: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", user_id, kind.as_str(), amount, reason));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Ledger { conn }
    }

    /// Credit `amount` to the user's account, creating it if absent.
    /// Returns the new balance.
    pub fn credit(&self, user_id: &str, amount: f64, reason: &str) -> ReviewResult<f64> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let balance = credit_in_tx(&tx, user_id, amount, reason)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Debit `amount` from the user's account. Fails with `InsufficientFunds`
    /// when the account is missing or the balance is short; the balance is
    /// unchanged in that case. Returns the new balance.
    pub fn debit(&self, user_id: &str, amount: f64, reason: &str) -> ReviewResult<f64> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let balance = debit_in_tx(&tx, user_id, amount, reason)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Administrative credit/debit, same invariants as the user-facing ops.
    pub fn adjust(
        &self,
        user_id: &str,
        kind: AdjustmentKind,
        amount: f64,
        reason: &str,
    ) -> ReviewResult<f64> {
        match kind {
            AdjustmentKind::Credit => self.credit(user_id, amount, reason),
            AdjustmentKind::Debit => self.debit(user_id, amount, reason),
        }
    }

    /// Current balance; 0 for an account that has never been touched
    /// (accounts are created lazily on first credit).
    pub fn balance(&self, user_id: &str) -> ReviewResult<f64> {
        let conn = self.conn.lock().unwrap();
        balance_in_tx(&conn, user_id)
    }

    /// Advisory read-only check. Never a substitute for `debit`, which
    /// re-verifies sufficiency inside its own atomic step.
    pub fn has_sufficient_balance(&self, user_id: &str, amount: f64) -> ReviewResult<bool> {
        Ok(self.balance(user_id)? >= amount)
    }

    /// Journal read-back, newest first.
    pub fn entries(&self, user_id: &str) -> ReviewResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, kind, amount, balance_after, reason, created_at
             FROM ledger_entries
             WHERE user_id = ?1
             ORDER BY id DESC",
        )?;

        let entries = stmt
            .query_map(params![user_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(LedgerEntry {
                    user_id: row.get(0)?,
                    kind: row.get(1)?,
                    amount: row.get(2)?,
                    balance_after: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

// ============================================================================
// TRANSACTION-SCOPED OPERATIONS
// The coordinator composes these with its own writes inside one transaction
// (e.g. debit + contribution insert during Submit).
// ============================================================================

pub(crate) fn balance_in_tx(conn: &Connection, user_id: &str) -> ReviewResult<f64> {
    let balance: Option<f64> = conn
        .query_row(
            "SELECT balance FROM ledger_accounts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0.0))
}

pub(crate) fn credit_in_tx(
    conn: &Connection,
    user_id: &str,
    amount: f64,
    reason: &str,
) -> ReviewResult<f64> {
    if amount <= 0.0 {
        return Err(ReviewError::InvalidAmount(amount));
    }

    let hash = idempotency_hash(user_id, AdjustmentKind::Credit, amount, reason);
    if entry_exists(conn, &hash)? {
        // Replay of an already-applied credit
        return balance_in_tx(conn, user_id);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO ledger_accounts (user_id, balance, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET balance = balance + ?2, updated_at = ?3",
        params![user_id, amount, now],
    )?;

    let balance = balance_in_tx(conn, user_id)?;
    append_entry(conn, &hash, user_id, AdjustmentKind::Credit, amount, balance, reason)?;
    Ok(balance)
}

pub(crate) fn debit_in_tx(
    conn: &Connection,
    user_id: &str,
    amount: f64,
    reason: &str,
) -> ReviewResult<f64> {
    if amount <= 0.0 {
        return Err(ReviewError::InvalidAmount(amount));
    }

    let hash = idempotency_hash(user_id, AdjustmentKind::Debit, amount, reason);
    if entry_exists(conn, &hash)? {
        return balance_in_tx(conn, user_id);
    }

    let now = Utc::now().to_rfc3339();

    // Single conditional update: sufficiency check and debit in one step.
    let updated = conn.execute(
        "UPDATE ledger_accounts
         SET balance = balance - ?1, updated_at = ?2
         WHERE user_id = ?3 AND balance >= ?1",
        params![amount, now, user_id],
    )?;

    if updated == 0 {
        let available = balance_in_tx(conn, user_id)?;
        return Err(ReviewError::InsufficientFunds {
            user_id: user_id.to_string(),
            requested: amount,
            available,
        });
    }

    let balance = balance_in_tx(conn, user_id)?;
    append_entry(conn, &hash, user_id, AdjustmentKind::Debit, amount, balance, reason)?;
    Ok(balance)
}

fn entry_exists(conn: &Connection, hash: &str) -> ReviewResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ledger_entries WHERE idempotency_hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn append_entry(
    conn: &Connection,
    hash: &str,
    user_id: &str,
    kind: AdjustmentKind,
    amount: f64,
    balance_after: f64,
    reason: &str,
) -> ReviewResult<()> {
    conn.execute(
        "INSERT INTO ledger_entries
         (idempotency_hash, user_id, kind, amount, balance_after, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            hash,
            user_id,
            kind.as_str(),
            amount,
            balance_after,
            reason,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
