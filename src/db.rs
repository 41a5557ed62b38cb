use std::path::Path;

use rusqlite::Connection;

use crate::error::{QuillError, Result};
use crate::models::Account;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    institution TEXT,
    currency TEXT NOT NULL DEFAULT 'USD',
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS raw_files (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    content BLOB NOT NULL,
    checksum TEXT NOT NULL,
    byte_len INTEGER NOT NULL,
    received_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS source_rows (
    id INTEGER PRIMARY KEY,
    raw_file_id INTEGER NOT NULL,
    row_number INTEGER NOT NULL,
    fields TEXT NOT NULL,
    UNIQUE (raw_file_id, row_number),
    FOREIGN KEY (raw_file_id) REFERENCES raw_files(id)
);

CREATE TABLE IF NOT EXISTS parse_plans (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    institution TEXT,
    working_config TEXT NOT NULL,
    working_revision INTEGER NOT NULL DEFAULT 0,
    head_version_id INTEGER,
    forked_from_version_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (head_version_id) REFERENCES plan_versions(id),
    FOREIGN KEY (forked_from_version_id) REFERENCES plan_versions(id)
);

CREATE TABLE IF NOT EXISTS plan_versions (
    id INTEGER PRIMARY KEY,
    plan_id INTEGER NOT NULL,
    parent_version_id INTEGER,
    version_number INTEGER NOT NULL,
    config TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    commit_message TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (plan_id, version_number),
    FOREIGN KEY (plan_id) REFERENCES parse_plans(id),
    FOREIGN KEY (parent_version_id) REFERENCES plan_versions(id)
);

CREATE TABLE IF NOT EXISTS parse_runs (
    id INTEGER PRIMARY KEY,
    plan_id INTEGER NOT NULL,
    plan_version_id INTEGER,
    raw_file_id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    rows_total INTEGER NOT NULL DEFAULT 0,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT DEFAULT (datetime('now')),
    finished_at TEXT,
    FOREIGN KEY (plan_id) REFERENCES parse_plans(id),
    FOREIGN KEY (plan_version_id) REFERENCES plan_versions(id),
    FOREIGN KEY (raw_file_id) REFERENCES raw_files(id),
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS run_rows (
    run_id INTEGER NOT NULL,
    row_number INTEGER NOT NULL,
    plan_version_id INTEGER,
    steps_applied TEXT NOT NULL,
    outcome TEXT NOT NULL,
    error TEXT,
    PRIMARY KEY (run_id, row_number),
    FOREIGN KEY (run_id) REFERENCES parse_runs(id)
);

CREATE TABLE IF NOT EXISTS txn_groups (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    group_key TEXT NOT NULL,
    csv_amount_cents INTEGER,
    entry_sum_cents INTEGER NOT NULL,
    balanced INTEGER NOT NULL DEFAULT 1,
    origin_run_id INTEGER,
    origin_delta_id INTEGER,
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (origin_run_id) REFERENCES parse_runs(id)
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    side TEXT NOT NULL CHECK (side IN ('debit', 'credit')),
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL DEFAULT 'USD',
    txn_type TEXT NOT NULL DEFAULT '',
    csv_amount_cents INTEGER,
    amount_discrepancy_cents INTEGER,
    flag TEXT,
    row_number INTEGER NOT NULL DEFAULT 0,
    origin_run_id INTEGER,
    origin_delta_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (group_id) REFERENCES txn_groups(id),
    FOREIGN KEY (origin_run_id) REFERENCES parse_runs(id)
);

CREATE TABLE IF NOT EXISTS entry_sources (
    entry_id INTEGER NOT NULL,
    source_row_id INTEGER NOT NULL,
    PRIMARY KEY (entry_id, source_row_id),
    FOREIGN KEY (entry_id) REFERENCES ledger_entries(id),
    FOREIGN KEY (source_row_id) REFERENCES source_rows(id)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    raw_file_id INTEGER NOT NULL,
    row_number INTEGER NOT NULL,
    date TEXT NOT NULL,
    csv_balance_cents INTEGER NOT NULL,
    UNIQUE (account_id, raw_file_id, row_number),
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (raw_file_id) REFERENCES raw_files(id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    iterations INTEGER NOT NULL DEFAULT 0,
    initial_discrepancies INTEGER NOT NULL DEFAULT 0,
    final_discrepancies INTEGER NOT NULL DEFAULT 0,
    termination_reason TEXT,
    started_at TEXT DEFAULT (datetime('now')),
    finished_at TEXT,
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS investigations (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL,
    checkpoint_id INTEGER,
    discrepancy TEXT NOT NULL,
    hypothesis TEXT,
    evidence_analysis TEXT,
    proposed_fixes TEXT NOT NULL DEFAULT '[]',
    uncertainties TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS fix_deltas (
    id INTEGER PRIMARY KEY,
    investigation_id INTEGER NOT NULL,
    fix_index INTEGER NOT NULL,
    approval_source TEXT NOT NULL CHECK (approval_source IN ('auto', 'manual')),
    entry_ids TEXT NOT NULL,
    checkpoints_resolved TEXT NOT NULL DEFAULT '[]',
    applied_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (investigation_id) REFERENCES investigations(id)
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn get_account(conn: &Connection, account_id: i64) -> Result<Account> {
    conn.query_row(
        "SELECT id, name, institution, currency FROM accounts WHERE id = ?1",
        [account_id],
        |row| {
            Ok(Account {
                id: row.get(0)?,
                name: row.get(1)?,
                institution: row.get(2)?,
                currency: row.get(3)?,
            })
        },
    )
    .map_err(|_| QuillError::UnknownAccount(account_id.to_string()))
}

pub fn get_account_by_name(conn: &Connection, name: &str) -> Result<Account> {
    let id: i64 = conn
        .query_row("SELECT id FROM accounts WHERE name = ?1", [name], |row| row.get(0))
        .map_err(|_| QuillError::UnknownAccount(name.to_string()))?;
    get_account(conn, id)
}
