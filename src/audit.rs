use rusqlite::Connection;

use crate::error::{QuillError, Result};
use crate::models::{LedgerEntry, Side};

/// One source row as resolved through an entry's provenance links.
#[derive(Debug, Clone)]
pub struct LineageRow {
    pub source_row_id: i64,
    pub raw_file_id: i64,
    pub row_number: i64,
    pub fields: Vec<String>,
    pub steps_applied: Vec<String>,
}

#[derive(Debug)]
pub struct EntryLineage {
    pub entry: LedgerEntry,
    pub plan_version_id: Option<i64>,
    pub source_rows: Vec<LineageRow>,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TransactionDelta {
    pub id: i64,
    pub investigation_id: i64,
    pub fix_index: i64,
    pub approval_source: String,
    pub entry_ids: Vec<i64>,
    pub checkpoints_resolved: Vec<i64>,
    pub applied_at: String,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub account_id: i64,
    pub status: String,
    pub iterations: i64,
    pub initial_discrepancies: i64,
    pub final_discrepancies: i64,
    pub termination_reason: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

fn load_entry(conn: &Connection, entry_id: i64) -> Result<LedgerEntry> {
    conn.query_row(
        "SELECT id, account_id, group_id, date, side, amount_cents, currency, txn_type, \
         csv_amount_cents, amount_discrepancy_cents, flag, row_number, origin_run_id, \
         origin_delta_id FROM ledger_entries WHERE id = ?1",
        [entry_id],
        |row| {
            let side: String = row.get(4)?;
            Ok(LedgerEntry {
                id: row.get(0)?,
                account_id: row.get(1)?,
                group_id: row.get(2)?,
                date: row.get(3)?,
                side: Side::from_str(&side).unwrap_or(Side::Debit),
                amount_cents: row.get(5)?,
                currency: row.get(6)?,
                txn_type: row.get(7)?,
                csv_amount_cents: row.get(8)?,
                amount_discrepancy_cents: row.get(9)?,
                flag: row.get(10)?,
                row_number: row.get(11)?,
                origin_run_id: row.get(12)?,
                origin_delta_id: row.get(13)?,
            })
        },
    )
    .map_err(|_| QuillError::Other(format!("no ledger entry {entry_id}")))
}

/// Resolve an entry back to its source rows, re-verifying the raw file
/// checksum behind each one. A missing link, missing row, or corrupted file
/// is a provenance integrity error, never a silent null.
pub fn entry_lineage(conn: &Connection, entry_id: i64) -> Result<EntryLineage> {
    let entry = load_entry(conn, entry_id)?;

    let mut stmt = conn.prepare(
        "SELECT source_row_id FROM entry_sources WHERE entry_id = ?1 ORDER BY source_row_id",
    )?;
    let source_ids: Vec<i64> = stmt
        .query_map([entry_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if source_ids.is_empty() {
        return Err(QuillError::ProvenanceIntegrity(format!(
            "ledger entry {entry_id} resolves to no source row"
        )));
    }

    let plan_version_id: Option<i64> = match entry.origin_run_id {
        Some(run_id) => conn
            .query_row(
                "SELECT plan_version_id FROM parse_runs WHERE id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .map_err(|_| {
                QuillError::ProvenanceIntegrity(format!(
                    "ledger entry {entry_id} references missing run {run_id}"
                ))
            })?,
        None => None,
    };

    let mut source_rows = Vec::with_capacity(source_ids.len());
    for source_row_id in source_ids {
        let (raw_file_id, row_number, fields): (i64, i64, String) = conn
            .query_row(
                "SELECT raw_file_id, row_number, fields FROM source_rows WHERE id = ?1",
                [source_row_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| {
                QuillError::ProvenanceIntegrity(format!(
                    "ledger entry {entry_id} references missing source row {source_row_id}"
                ))
            })?;
        // Checksum re-verification; fails loudly on tampered content.
        crate::blobstore::get(conn, raw_file_id)?;

        let steps_applied = match entry.origin_run_id {
            Some(run_id) => conn
                .query_row(
                    "SELECT steps_applied FROM run_rows WHERE run_id = ?1 AND row_number = ?2",
                    [run_id, row_number],
                    |row| row.get::<_, String>(0),
                )
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        source_rows.push(LineageRow {
            source_row_id,
            raw_file_id,
            row_number,
            fields: serde_json::from_str(&fields).unwrap_or_default(),
            steps_applied,
        });
    }

    Ok(EntryLineage {
        entry,
        plan_version_id,
        source_rows,
    })
}

/// Check one transaction group's double-entry identity against its recorded
/// csv amount. Broken groups are never silently resolved; they stay flagged
/// until a correction lands.
pub fn verify_group(conn: &Connection, group_id: i64) -> Result<()> {
    let (csv_amount, entry_sum): (Option<i64>, i64) = conn
        .query_row(
            "SELECT csv_amount_cents, entry_sum_cents FROM txn_groups WHERE id = ?1",
            [group_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| QuillError::Other(format!("no transaction group {group_id}")))?;
    if let Some(csv) = csv_amount {
        let delta = entry_sum - csv;
        if delta.abs() > crate::money::TOLERANCE_CENTS {
            return Err(QuillError::DoubleEntryViolation { delta_cents: delta });
        }
    }
    Ok(())
}

pub fn session_history(conn: &Connection, account_id: i64) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, status, iterations, initial_discrepancies, final_discrepancies, \
         termination_reason, started_at, finished_at FROM sessions WHERE account_id = ?1 ORDER BY id",
    )?;
    let sessions = stmt
        .query_map([account_id], |row| {
            Ok(SessionRecord {
                id: row.get(0)?,
                account_id: row.get(1)?,
                status: row.get(2)?,
                iterations: row.get(3)?,
                initial_discrepancies: row.get(4)?,
                final_discrepancies: row.get(5)?,
                termination_reason: row.get(6)?,
                started_at: row.get(7)?,
                finished_at: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(sessions)
}

pub fn session_deltas(conn: &Connection, session_id: i64) -> Result<Vec<TransactionDelta>> {
    let mut stmt = conn.prepare(
        "SELECT fd.id, fd.investigation_id, fd.fix_index, fd.approval_source, fd.entry_ids, \
         fd.checkpoints_resolved, fd.applied_at FROM fix_deltas fd \
         JOIN investigations i ON i.id = fd.investigation_id \
         WHERE i.session_id = ?1 ORDER BY fd.id",
    )?;
    let deltas = stmt
        .query_map([session_id], |row| {
            let entry_ids: String = row.get(4)?;
            let resolved: String = row.get(5)?;
            Ok(TransactionDelta {
                id: row.get(0)?,
                investigation_id: row.get(1)?,
                fix_index: row.get(2)?,
                approval_source: row.get(3)?,
                entry_ids: serde_json::from_str(&entry_ids).unwrap_or_default(),
                checkpoints_resolved: serde_json::from_str(&resolved).unwrap_or_default(),
                applied_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::models::SourceRow;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    fn setup_entry(conn: &Connection) -> i64 {
        conn.execute("INSERT INTO accounts (name) VALUES ('A')", []).unwrap();
        crate::blobstore::put(conn, "f.csv", b"Date,Amount\n01/15/2025,1.00\n").unwrap();
        crate::extract::persist_rows(
            conn,
            &[SourceRow {
                raw_file_id: 1,
                row_number: 2,
                fields: vec!["01/15/2025".into(), "1.00".into()],
            }],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO parse_plans (name, working_config) VALUES ('p', '{}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO plan_versions (plan_id, version_number, config, content_hash, commit_message) \
             VALUES (1, 0, '{}', 'h', 'm')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO parse_runs (plan_id, plan_version_id, raw_file_id, account_id, mode) \
             VALUES (1, 1, 1, 1, 'commit')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO run_rows (run_id, row_number, plan_version_id, steps_applied, outcome) \
             VALUES (1, 2, 1, '[\"flip\"]', 'materialized')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO txn_groups (account_id, date, group_key, entry_sum_cents, origin_run_id) \
             VALUES (1, '2025-01-15', 'k', 100, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ledger_entries (account_id, group_id, date, side, amount_cents, row_number, \
             origin_run_id) VALUES (1, 1, '2025-01-15', 'debit', 100, 2, 1)",
            [],
        )
        .unwrap();
        let entry_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO entry_sources (entry_id, source_row_id) VALUES (?1, 1)",
            [entry_id],
        )
        .unwrap();
        entry_id
    }

    #[test]
    fn test_lineage_resolves_to_source_rows() {
        let (_dir, conn) = test_db();
        let entry_id = setup_entry(&conn);
        let lineage = entry_lineage(&conn, entry_id).unwrap();
        assert_eq!(lineage.plan_version_id, Some(1));
        assert_eq!(lineage.source_rows.len(), 1);
        assert_eq!(lineage.source_rows[0].row_number, 2);
        assert_eq!(lineage.source_rows[0].steps_applied, vec!["flip"]);
        assert_eq!(lineage.source_rows[0].fields[1], "1.00");
    }

    #[test]
    fn test_lineage_detects_corrupted_raw_file() {
        let (_dir, conn) = test_db();
        let entry_id = setup_entry(&conn);
        conn.execute("UPDATE raw_files SET content = x'deadbeef' WHERE id = 1", []).unwrap();
        let err = entry_lineage(&conn, entry_id).unwrap_err();
        assert!(matches!(err, QuillError::ProvenanceIntegrity(_)));
    }

    #[test]
    fn test_lineage_requires_source_rows() {
        let (_dir, conn) = test_db();
        let entry_id = setup_entry(&conn);
        conn.execute("DELETE FROM entry_sources WHERE entry_id = ?1", [entry_id]).unwrap();
        let err = entry_lineage(&conn, entry_id).unwrap_err();
        assert!(matches!(err, QuillError::ProvenanceIntegrity(_)));
    }

    #[test]
    fn test_verify_group_flags_double_entry_break() {
        let (_dir, conn) = test_db();
        conn.execute("INSERT INTO accounts (name) VALUES ('A')", []).unwrap();
        conn.execute(
            "INSERT INTO txn_groups (account_id, date, group_key, csv_amount_cents, \
             entry_sum_cents, balanced) VALUES (1, '2025-01-15', 'k', -50000, -49000, 0)",
            [],
        )
        .unwrap();
        let err = verify_group(&conn, 1).unwrap_err();
        match err {
            QuillError::DoubleEntryViolation { delta_cents } => assert_eq!(delta_cents, 1000),
            other => panic!("expected DoubleEntryViolation, got {other:?}"),
        }

        conn.execute(
            "INSERT INTO txn_groups (account_id, date, group_key, csv_amount_cents, \
             entry_sum_cents) VALUES (1, '2025-01-15', 'k2', -50000, -50000)",
            [],
        )
        .unwrap();
        verify_group(&conn, 2).unwrap();
    }

    #[test]
    fn test_session_history_and_deltas() {
        let (_dir, conn) = test_db();
        conn.execute("INSERT INTO accounts (name) VALUES ('A')", []).unwrap();
        conn.execute(
            "INSERT INTO sessions (account_id, status, iterations, initial_discrepancies, \
             final_discrepancies, termination_reason, finished_at) \
             VALUES (1, 'converged', 2, 10, 0, 'converged', datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO investigations (session_id, discrepancy, status) VALUES (1, '{}', 'recorded')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO fix_deltas (investigation_id, fix_index, approval_source, entry_ids, \
             checkpoints_resolved) VALUES (1, 0, 'auto', '[5,6]', '[3]')",
            [],
        )
        .unwrap();

        let sessions = session_history(&conn, 1).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, "converged");
        assert_eq!(sessions[0].iterations, 2);

        let deltas = session_deltas(&conn, sessions[0].id).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].approval_source, "auto");
        assert_eq!(deltas[0].entry_ids, vec![5, 6]);
        assert_eq!(deltas[0].checkpoints_resolved, vec![3]);
    }
}
