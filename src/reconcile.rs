use std::time::Duration;

use rusqlite::Connection;

use crate::assistant::{
    self, Assistant, ContextCheckpoint, ContextEntry, ContextRow, DiscrepancyContext,
    InvestigationRequest, InvestigationResponse,
};
use crate::detect;
use crate::error::{QuillError, Result};
use crate::fixes::{self, FixApprover, FixDecision};
use crate::models::Discrepancy;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_iterations: usize,
    pub window_days: i64,
    pub assistant_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            window_days: 7,
            assistant_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            window_days: settings.context_window_days,
            assistant_timeout: Duration::from_millis(settings.assistant_timeout_ms),
        }
    }
}

/// Session lifecycle: Pending → Investigating → Applying, looping until the
/// account converges or the iteration budget runs out. Both endings are
/// reportable outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Investigating,
    Applying,
    Converged,
    PartiallyReconciled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Investigating => "investigating",
            SessionState::Applying => "applying",
            SessionState::Converged => "converged",
            SessionState::PartiallyReconciled => "partially_reconciled",
        }
    }
}

#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: i64,
    pub state: SessionState,
    pub iterations: usize,
    pub investigations_run: usize,
    pub fixes_applied: usize,
    pub fixes_declined: usize,
    pub flagged_manual: usize,
    pub initial_discrepancies: usize,
    pub final_discrepancies: usize,
    pub termination_reason: String,
}

/// Context for one investigation: the discrepancy, source rows and
/// checkpoints within the window, and the ledger entries in range.
fn build_request(
    conn: &Connection,
    discrepancy: &Discrepancy,
    window_days: i64,
) -> Result<InvestigationRequest> {
    let center = chrono::NaiveDate::parse_from_str(&discrepancy.checkpoint.date, "%Y-%m-%d")
        .map_err(|_| QuillError::Other(format!("corrupt checkpoint date {}", discrepancy.checkpoint.date)))?;
    let from = (center - chrono::Duration::days(window_days)).format("%Y-%m-%d").to_string();
    let to = (center + chrono::Duration::days(window_days)).format("%Y-%m-%d").to_string();
    let account_id = discrepancy.checkpoint.account_id;

    let mut stmt = conn.prepare(
        "SELECT id, date, side, amount_cents, txn_type, flag FROM ledger_entries \
         WHERE account_id = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY date, row_number, id",
    )?;
    let entries_in_range: Vec<ContextEntry> = stmt
        .query_map(rusqlite::params![account_id, from, to], |row| {
            let side: String = row.get(2)?;
            Ok(ContextEntry {
                entry_id: row.get(0)?,
                date: row.get(1)?,
                side: crate::models::Side::from_str(&side).unwrap_or(crate::models::Side::Debit),
                amount_cents: row.get(3)?,
                txn_type: row.get(4)?,
                flag: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT sr.id, sr.row_number, sr.fields FROM source_rows sr \
         JOIN entry_sources es ON es.source_row_id = sr.id \
         JOIN ledger_entries le ON le.id = es.entry_id \
         WHERE le.account_id = ?1 AND le.date BETWEEN ?2 AND ?3 ORDER BY sr.row_number",
    )?;
    let source_rows: Vec<ContextRow> = stmt
        .query_map(rusqlite::params![account_id, from, to], |row| {
            let fields: String = row.get(2)?;
            Ok(ContextRow {
                source_row_id: row.get(0)?,
                row_number: row.get(1)?,
                fields: serde_json::from_str(&fields).unwrap_or_default(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT date, row_number, csv_balance_cents FROM checkpoints \
         WHERE account_id = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY date, row_number",
    )?;
    let checkpoints: Vec<ContextCheckpoint> = stmt
        .query_map(rusqlite::params![account_id, from, to], |row| {
            Ok(ContextCheckpoint {
                date: row.get(0)?,
                row_number: row.get(1)?,
                csv_balance_cents: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(InvestigationRequest {
        discrepancy: DiscrepancyContext::from_discrepancy(discrepancy),
        window_days,
        source_rows,
        checkpoints,
        entries_in_range,
    })
}

fn record_investigation(
    conn: &Connection,
    session_id: i64,
    discrepancy: &Discrepancy,
    response: &InvestigationResponse,
    status: &str,
) -> Result<i64> {
    let context = serde_json::to_string(&DiscrepancyContext::from_discrepancy(discrepancy))
        .map_err(|e| QuillError::Other(e.to_string()))?;
    conn.execute(
        "INSERT INTO investigations (session_id, checkpoint_id, discrepancy, hypothesis, \
         evidence_analysis, proposed_fixes, uncertainties, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            session_id,
            discrepancy.checkpoint.id,
            context,
            response.hypothesis,
            response.evidence_analysis,
            serde_json::to_string(&response.proposed_fixes).map_err(|e| QuillError::Other(e.to_string()))?,
            serde_json::to_string(&response.uncertainties).map_err(|e| QuillError::Other(e.to_string()))?,
            status,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn record_failed_investigation(
    conn: &Connection,
    session_id: i64,
    discrepancy: &Discrepancy,
    error: &str,
) -> Result<()> {
    let context = serde_json::to_string(&DiscrepancyContext::from_discrepancy(discrepancy))
        .map_err(|e| QuillError::Other(e.to_string()))?;
    conn.execute(
        "INSERT INTO investigations (session_id, checkpoint_id, discrepancy, status, error) \
         VALUES (?1, ?2, ?3, 'failed', ?4)",
        rusqlite::params![session_id, discrepancy.checkpoint.id, context, error],
    )?;
    Ok(())
}

/// Provenance fallback for fix entries: the source row behind the
/// discrepancy's checkpoint.
fn checkpoint_source_row(conn: &Connection, discrepancy: &Discrepancy) -> Option<i64> {
    let raw_file_id: i64 = conn
        .query_row(
            "SELECT raw_file_id FROM checkpoints WHERE id = ?1",
            [discrepancy.checkpoint.id],
            |row| row.get(0),
        )
        .ok()?;
    crate::extract::source_row_id(conn, raw_file_id, discrepancy.checkpoint.row_number).ok()
}

/// Drive the investigate/apply loop for one account. Serialized per account:
/// a second session while one is running fails with SessionInProgress.
pub fn run_session(
    conn: &Connection,
    assistant: &dyn Assistant,
    approver: &dyn FixApprover,
    account_id: i64,
    config: &SessionConfig,
) -> Result<SessionSummary> {
    crate::db::get_account(conn, account_id)?;
    let active: Option<i64> = conn
        .query_row(
            "SELECT id FROM sessions WHERE account_id = ?1 AND status = 'running'",
            [account_id],
            |row| row.get(0),
        )
        .ok();
    if active.is_some() {
        return Err(QuillError::SessionInProgress(account_id));
    }

    let initial = detect::detect(conn, account_id)?;
    conn.execute(
        "INSERT INTO sessions (account_id, initial_discrepancies) VALUES (?1, ?2)",
        rusqlite::params![account_id, initial.len() as i64],
    )?;
    let session_id = conn.last_insert_rowid();

    let mut summary = SessionSummary {
        session_id,
        state: SessionState::Pending,
        iterations: 0,
        investigations_run: 0,
        fixes_applied: 0,
        fixes_declined: 0,
        flagged_manual: 0,
        initial_discrepancies: initial.len(),
        final_discrepancies: 0,
        termination_reason: String::new(),
    };

    loop {
        let discrepancies = if summary.iterations == 0 {
            initial.clone()
        } else {
            detect::detect(conn, account_id)?
        };
        if discrepancies.is_empty() {
            summary.state = SessionState::Converged;
            summary.final_discrepancies = 0;
            summary.termination_reason = "converged".to_string();
            break;
        }
        if summary.iterations >= config.max_iterations {
            summary.state = SessionState::PartiallyReconciled;
            summary.final_discrepancies = discrepancies.len();
            summary.termination_reason = "max_iterations".to_string();
            break;
        }
        summary.iterations += 1;

        summary.state = SessionState::Investigating;
        let mut recorded: Vec<(i64, Discrepancy, InvestigationResponse)> = Vec::new();
        for discrepancy in &discrepancies {
            let request = build_request(conn, discrepancy, config.window_days)?;
            match assistant::investigate_checked(assistant, &request, config.assistant_timeout) {
                Ok(response) => {
                    summary.investigations_run += 1;
                    let best = response
                        .proposed_fixes
                        .iter()
                        .map(|f| f.confidence)
                        .fold(f64::NEG_INFINITY, f64::max);
                    if response.proposed_fixes.is_empty() || best < fixes::ACTIONABLE_CONFIDENCE {
                        // Conservative fallback: nothing certain enough to
                        // stage; no best-guess entry is materialized.
                        record_investigation(conn, session_id, discrepancy, &response, "no_actionable_fix")?;
                        summary.flagged_manual += 1;
                        continue;
                    }
                    let id = record_investigation(conn, session_id, discrepancy, &response, "recorded")?;
                    recorded.push((id, discrepancy.clone(), response));
                }
                Err(e) => {
                    summary.investigations_run += 1;
                    record_failed_investigation(conn, session_id, discrepancy, &e.to_string())?;
                }
            }
        }

        summary.state = SessionState::Applying;
        for (investigation_id, discrepancy, response) in recorded {
            let fallback = checkpoint_source_row(conn, &discrepancy);
            let mut ordered: Vec<(usize, &crate::assistant::ProposedFix)> =
                response.proposed_fixes.iter().enumerate().collect();
            ordered.sort_by(|a, b| {
                b.1.confidence
                    .partial_cmp(&a.1.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut applied = false;
            for (fix_index, fix) in ordered {
                match fixes::apply_fix(
                    conn,
                    account_id,
                    investigation_id,
                    fix_index,
                    fix,
                    approver,
                    fallback,
                )? {
                    FixDecision::Applied { .. } => {
                        summary.fixes_applied += 1;
                        applied = true;
                        break;
                    }
                    FixDecision::Declined => {
                        summary.fixes_declined += 1;
                    }
                    FixDecision::Rejected { .. } | FixDecision::BelowThreshold => {}
                }
            }
            if !applied {
                summary.flagged_manual += 1;
            }
        }
    }

    conn.execute(
        "UPDATE sessions SET status = ?1, iterations = ?2, final_discrepancies = ?3, \
         termination_reason = ?4, finished_at = datetime('now') WHERE id = ?5",
        rusqlite::params![
            summary.state.as_str(),
            summary.iterations as i64,
            summary.final_discrepancies as i64,
            summary.termination_reason,
            session_id,
        ],
    )?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;
    use crate::assistant::{FixAction, FixLeg, PredictedImpact, ProposedFix};
    use crate::db::{get_connection, init_db};
    use crate::fixes::RejectAll;
    use crate::models::{Side, SourceRow};
    use crate::money::Cents;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
    }

    /// Account with one debit entry and checkpoints at the given dates and
    /// reported balances.
    fn setup_account(conn: &Connection, entry_cents: Cents, checkpoints: &[(&str, i64, Cents)]) -> i64 {
        conn.execute("INSERT INTO accounts (name) VALUES ('Checking')", []).unwrap();
        let account_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO raw_files (filename, content, checksum, byte_len) VALUES ('f', x'00', 'c', 1)",
            [],
        )
        .unwrap();
        let mut rows = vec![SourceRow {
            raw_file_id: 1,
            row_number: 2,
            fields: vec![],
        }];
        for (_, row_number, _) in checkpoints {
            rows.push(SourceRow {
                raw_file_id: 1,
                row_number: *row_number,
                fields: vec![],
            });
        }
        crate::extract::persist_rows(conn, &rows).unwrap();
        conn.execute(
            "INSERT INTO txn_groups (account_id, date, group_key, entry_sum_cents) \
             VALUES (?1, '2025-01-15', 'k', ?2)",
            rusqlite::params![account_id, entry_cents],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ledger_entries (account_id, group_id, date, side, amount_cents, row_number) \
             VALUES (?1, 1, '2025-01-15', 'debit', ?2, 2)",
            rusqlite::params![account_id, entry_cents],
        )
        .unwrap();
        for (date, row_number, balance) in checkpoints {
            conn.execute(
                "INSERT INTO checkpoints (account_id, raw_file_id, row_number, date, csv_balance_cents) \
                 VALUES (?1, 1, ?2, ?3, ?4)",
                rusqlite::params![account_id, row_number, date, balance],
            )
            .unwrap();
        }
        account_id
    }

    fn deposit_fix(date: &str, cents: Cents, confidence: f64) -> ProposedFix {
        ProposedFix {
            description: format!("add missing {cents}c deposit"),
            confidence,
            assumptions: vec![],
            predicted_impact: PredictedImpact {
                balance_change_cents: cents,
                transactions_created: 1,
                checkpoints_resolved: 1,
                warnings: vec![],
            },
            action: FixAction::AddTransaction {
                date: date.to_string(),
                txn_type: "adjustment".to_string(),
                description: "missing deposit".to_string(),
                legs: vec![FixLeg {
                    side: Side::Debit,
                    amount_cents: cents,
                }],
                source_row_ids: vec![],
            },
        }
    }

    fn response(fixes: Vec<ProposedFix>) -> InvestigationResponse {
        InvestigationResponse {
            hypothesis: "a deposit was never imported".to_string(),
            evidence_analysis: "delta matches one payout".to_string(),
            proposed_fixes: fixes,
            uncertainties: vec![],
        }
    }

    /// Deterministic scripted assistant: responses keyed by checkpoint date,
    /// consumed per call so later iterations can see different answers.
    struct ScriptedAssistant {
        by_date: RefCell<HashMap<String, Vec<std::result::Result<InvestigationResponse, String>>>>,
    }

    impl ScriptedAssistant {
        fn new(
            script: Vec<(&str, std::result::Result<InvestigationResponse, String>)>,
        ) -> Self {
            let mut by_date: HashMap<String, Vec<_>> = HashMap::new();
            for (date, resp) in script {
                by_date.entry(date.to_string()).or_default().push(resp);
            }
            Self {
                by_date: RefCell::new(by_date),
            }
        }
    }

    impl Assistant for ScriptedAssistant {
        fn investigate(
            &self,
            request: &InvestigationRequest,
        ) -> std::result::Result<InvestigationResponse, String> {
            let mut map = self.by_date.borrow_mut();
            let queue = map
                .get_mut(&request.discrepancy.checkpoint_date)
                .ok_or_else(|| "no scripted response".to_string())?;
            if queue.is_empty() {
                return Err("script exhausted".to_string());
            }
            queue.remove(0)
        }
    }

    #[test]
    fn test_no_discrepancies_converges_immediately() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 10_000, &[("2025-01-15", 2, 10_000)]);
        let assistant = ScriptedAssistant::new(vec![]);
        let summary = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap();
        assert_eq!(summary.state, SessionState::Converged);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.investigations_run, 0);
        let status: String = conn
            .query_row("SELECT status FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "converged");
    }

    #[test]
    fn test_single_iteration_convergence() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        let assistant = ScriptedAssistant::new(vec![(
            "2025-01-15",
            Ok(response(vec![deposit_fix("2025-01-15", 5_000, 0.96)])),
        )]);
        let summary = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap();
        assert_eq!(summary.state, SessionState::Converged);
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.fixes_applied, 1);
        assert_eq!(summary.final_discrepancies, 0);
        assert_eq!(summary.initial_discrepancies, 1);

        let inv_status: String = conn
            .query_row("SELECT status FROM investigations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(inv_status, "recorded");
        let deltas: i64 = conn
            .query_row("SELECT count(*) FROM fix_deltas", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deltas, 1);
    }

    #[test]
    fn test_two_iteration_convergence() {
        let (_dir, conn) = test_db();
        // Short by $50.00 at the first checkpoint; the first response only
        // offers an uncertain fix, the second round offers a confident one.
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        let assistant = ScriptedAssistant::new(vec![
            (
                "2025-01-15",
                Ok(response(vec![deposit_fix("2025-01-15", 5_000, 0.65)])),
            ),
            (
                "2025-01-15",
                Ok(response(vec![deposit_fix("2025-01-15", 5_000, 0.97)])),
            ),
        ]);
        let summary = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap();
        assert_eq!(summary.state, SessionState::Converged);
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.fixes_applied, 1);
        assert_eq!(summary.final_discrepancies, 0);
    }

    #[test]
    fn test_non_convergence_stops_at_max_iterations() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        let assistant = ScriptedAssistant::new(vec![
            ("2025-01-15", Err("model unavailable".to_string())),
            ("2025-01-15", Err("model unavailable".to_string())),
            ("2025-01-15", Err("model unavailable".to_string())),
            // A fourth response must never be requested.
            (
                "2025-01-15",
                Ok(response(vec![deposit_fix("2025-01-15", 5_000, 0.99)])),
            ),
        ]);
        let summary = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap();
        assert_eq!(summary.state, SessionState::PartiallyReconciled);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.final_discrepancies, 1);
        assert_eq!(summary.investigations_run, 3);
        let failed: i64 = conn
            .query_row(
                "SELECT count(*) FROM investigations WHERE status = 'failed'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(failed, 3);
        let status: String = conn
            .query_row("SELECT status FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "partially_reconciled");
    }

    #[test]
    fn test_uncertain_investigation_flags_manual_review() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        let mut script = Vec::new();
        for _ in 0..3 {
            script.push((
                "2025-01-15",
                Ok(response(vec![deposit_fix("2025-01-15", 5_000, 0.40)])),
            ));
        }
        let assistant = ScriptedAssistant::new(script);
        let summary = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap();
        assert_eq!(summary.state, SessionState::PartiallyReconciled);
        assert_eq!(summary.flagged_manual, 3);
        assert_eq!(summary.fixes_applied, 0);
        let no_fix: i64 = conn
            .query_row(
                "SELECT count(*) FROM investigations WHERE status = 'no_actionable_fix'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(no_fix, 3);
        let entries: i64 = conn
            .query_row("SELECT count(*) FROM ledger_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_session_serialized_per_account() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        conn.execute("INSERT INTO sessions (account_id, status) VALUES (?1, 'running')", [account_id])
            .unwrap();
        let assistant = ScriptedAssistant::new(vec![]);
        let err = run_session(&conn, &assistant, &RejectAll, account_id, &fast_config()).unwrap_err();
        assert!(matches!(err, QuillError::SessionInProgress(_)));
    }

    #[test]
    fn test_request_context_window() {
        let (_dir, conn) = test_db();
        let account_id = setup_account(&conn, 5_000, &[("2025-01-15", 2, 10_000)]);
        // Entry outside the ±7 day window must not appear in context.
        conn.execute(
            "INSERT INTO txn_groups (account_id, date, group_key, entry_sum_cents) \
             VALUES (?1, '2025-03-01', 'far', 100)",
            [account_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ledger_entries (account_id, group_id, date, side, amount_cents, row_number) \
             VALUES (?1, 2, '2025-03-01', 'debit', 100, 9)",
            [account_id],
        )
        .unwrap();
        let discrepancies = detect::detect(&conn, account_id).unwrap();
        let request = build_request(&conn, &discrepancies[0], 7).unwrap();
        assert_eq!(request.entries_in_range.len(), 1);
        assert_eq!(request.checkpoints.len(), 1);
        assert_eq!(request.discrepancy.delta_cents, 5_000);
    }
}
