use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

/// Open (or create) the database file and apply the schema.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Contributions (the review state machine's durable record)
    // status: 'pending' | 'approved' | 'rejected'; terminal states immutable
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contributions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            marker_type TEXT,
            latitude REAL,
            longitude REAL,
            marker_id TEXT,
            description TEXT,
            image_url TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            admin_note TEXT,
            created_at TEXT NOT NULL,
            reviewed_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Contribution status history (append-only audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contribution_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contribution_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            actor TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Ledger accounts (one row per user, balance never negative)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_accounts (
            user_id TEXT PRIMARY KEY,
            balance REAL NOT NULL DEFAULT 0 CHECK (balance >= 0),
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Ledger journal (every credit/debit, keyed for replay safety)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            balance_after REAL NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Votes (one per voter per contribution)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS votes (
            id TEXT PRIMARY KEY,
            contribution_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            is_upvote INTEGER NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0 CHECK (weight > 0),
            created_at TEXT NOT NULL,
            UNIQUE (contribution_id, user_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Markers (backing table for the local registry implementation)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS markers (
            id TEXT PRIMARY KEY,
            marker_type TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            image_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contributions_status ON contributions(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contributions_user ON contributions(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_contribution
         ON contribution_events(contribution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_user ON ledger_entries(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_votes_contribution ON votes(contribution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_votes_user ON votes(user_id)",
        [],
    )?;

    Ok(())
}
