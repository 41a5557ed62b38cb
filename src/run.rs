use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rusqlite::Connection;

use crate::error::{QuillError, Result};
use crate::evaluate::{self, StepQuota, TransformEvaluator, ValidationEvaluator};
use crate::extract::{self, Extracted};
use crate::materialize;
use crate::models::MappedRow;
use crate::plan::PlanSource;

/// Commit-mode write granularity. Whole transaction groups land in one
/// chunk, so cancellation can never leave a half-written group.
pub const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    Preview { sample_size: usize },
    Commit,
}

impl RunMode {
    fn as_str(&self) -> &'static str {
        match self {
            RunMode::Preview { .. } => "preview",
            RunMode::Commit => "commit",
        }
    }
}

pub struct Evaluators<'a> {
    pub transform: &'a dyn TransformEvaluator,
    pub validate: &'a dyn ValidationEvaluator,
    pub quota: StepQuota,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub rows_processed: i64,
    pub rows_total: i64,
    pub eta_secs: Option<u64>,
}

#[derive(Debug)]
pub struct RowFailure {
    pub row_number: i64,
    pub stage: &'static str,
    pub message: String,
}

/// Partial-success report for one run. Per-row failures are collected, not
/// fatal; only structural problems abort a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub run_id: Option<i64>,
    pub rows_total: usize,
    pub rows_processed: usize,
    pub failures: Vec<RowFailure>,
    pub entries_created: usize,
    pub checkpoints_created: usize,
    pub broken_groups: usize,
    pub duplicate_import: bool,
    pub cancelled: bool,
    /// Mapped output of successfully processed rows, for preview display
    /// and replay comparison.
    pub mapped_rows: Vec<(i64, MappedRow)>,
}

struct ProcessedRows {
    ok: Vec<(i64, MappedRow, Vec<String>)>,
    failures: Vec<RowFailure>,
}

/// Deterministic extract → map → transform → validate stage. Reads no clock
/// and no external state besides the evaluators, which are contractually
/// pure; identical (plan config, file bytes) inputs give identical output.
fn process_rows(
    extracted: &Extracted,
    source: &PlanSource,
    evals: &Evaluators,
    limit: Option<usize>,
) -> ProcessedRows {
    let config = source.config();
    let headers = extracted.headers.as_deref();
    let rows: Vec<_> = match limit {
        Some(n) => extracted.rows.iter().take(n).collect(),
        None => extracted.rows.iter().collect(),
    };

    let mut ok = Vec::new();
    let mut failures = Vec::new();
    for row in rows {
        let mapped = match evaluate::map_row(row, headers, &config.schema) {
            Ok(m) => m,
            Err(e) => {
                failures.push(RowFailure {
                    row_number: row.row_number,
                    stage: "schema",
                    message: e.to_string(),
                });
                continue;
            }
        };
        match evaluate::apply_transforms(
            evals.transform,
            &mapped,
            &config.transforms,
            evals.quota,
            &config.schema,
        ) {
            Ok((transformed, steps)) => ok.push((row.row_number, transformed, steps)),
            Err(e) => failures.push(RowFailure {
                row_number: row.row_number,
                stage: "transform",
                message: e.to_string(),
            }),
        }
    }

    // Validation rules see the whole batch; failed rows drop out of
    // materialization but stay in the report.
    for rule in &config.validations {
        let batch: Vec<(i64, MappedRow)> =
            ok.iter().map(|(n, m, _)| (*n, m.clone())).collect();
        let verdicts = evals.validate.evaluate(&batch, rule);
        let failed: HashSet<i64> = verdicts
            .iter()
            .filter(|v| !v.passed)
            .map(|v| v.row_number)
            .collect();
        for verdict in verdicts.into_iter().filter(|v| !v.passed) {
            let err = QuillError::ValidationFailure {
                rule: rule.name.clone(),
                message: verdict.message,
            };
            failures.push(RowFailure {
                row_number: verdict.row_number,
                stage: "validation",
                message: err.to_string(),
            });
        }
        ok.retain(|(n, _, _)| !failed.contains(n));
    }

    ProcessedRows { ok, failures }
}

fn load_file(conn: &Connection, source: &PlanSource, raw_file_id: i64) -> Result<Extracted> {
    let bytes = crate::blobstore::get(conn, raw_file_id)?;
    let filename: String = conn.query_row(
        "SELECT filename FROM raw_files WHERE id = ?1",
        [raw_file_id],
        |row| row.get(0),
    )?;
    let is_workbook = std::path::Path::new(&filename)
        .extension()
        .map(|e| e.eq_ignore_ascii_case("xlsx") || e.eq_ignore_ascii_case("xls"))
        .unwrap_or(false);
    if is_workbook {
        #[cfg(feature = "xlsx")]
        {
            return extract::extract_xlsx(&bytes, &source.config().dialect, raw_file_id);
        }
        #[cfg(not(feature = "xlsx"))]
        {
            return Err(QuillError::Dialect(
                "workbook files require the xlsx feature".to_string(),
            ));
        }
    }
    extract::extract(&bytes, &source.config().dialect, raw_file_id)
}

/// Execute a parse run. Preview bounds the row count and writes nothing;
/// commit persists source rows, lineage, ledger entries, and checkpoints in
/// resumable chunks.
pub fn run(
    conn: &Connection,
    source: &PlanSource,
    raw_file_id: i64,
    account_id: i64,
    mode: RunMode,
    evals: &Evaluators,
    cancel: Option<&AtomicBool>,
    on_progress: Option<&mut dyn FnMut(&Progress)>,
) -> Result<RunReport> {
    match mode {
        RunMode::Preview { sample_size } => {
            let extracted = load_file(conn, source, raw_file_id)?;
            let processed = process_rows(&extracted, source, evals, Some(sample_size));
            Ok(RunReport {
                run_id: None,
                rows_total: extracted.rows.len(),
                rows_processed: processed.ok.len() + processed.failures.len(),
                mapped_rows: processed
                    .ok
                    .iter()
                    .map(|(n, m, _)| (*n, m.clone()))
                    .collect(),
                failures: processed.failures,
                ..RunReport::default()
            })
        }
        RunMode::Commit => {
            // Structural checks happen before any write: a draft cannot be
            // committed, and the version must verify against its hash.
            let version = match source {
                PlanSource::Draft(_) => return Err(QuillError::WorkingCopyCommit),
                PlanSource::Committed(v) => v,
            };
            crate::plan::verify_version(conn, version.id)?;

            let already: Option<i64> = conn
                .query_row(
                    "SELECT id FROM parse_runs WHERE raw_file_id = ?1 AND account_id = ?2 \
                     AND plan_version_id = ?3 AND mode = 'commit' AND status = 'completed'",
                    rusqlite::params![raw_file_id, account_id, version.id],
                    |row| row.get(0),
                )
                .ok();
            if let Some(run_id) = already {
                return Ok(RunReport {
                    run_id: Some(run_id),
                    duplicate_import: true,
                    ..RunReport::default()
                });
            }

            let extracted = load_file(conn, source, raw_file_id)?;
            conn.execute(
                "INSERT INTO parse_runs (plan_id, plan_version_id, raw_file_id, account_id, mode, \
                 rows_total) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    source.plan_id(),
                    version.id,
                    raw_file_id,
                    account_id,
                    mode.as_str(),
                    extracted.rows.len() as i64,
                ],
            )?;
            let run_id = conn.last_insert_rowid();
            execute_commit(conn, run_id, source, raw_file_id, account_id, extracted, evals, cancel, on_progress)
        }
    }
}

/// Continue a cancelled (or interrupted) commit run from the last fully
/// committed chunk. Reprocessing is safe because the transform stage is
/// deterministic and all writes are keyed idempotently.
pub fn resume_run(
    conn: &Connection,
    run_id: i64,
    evals: &Evaluators,
    cancel: Option<&AtomicBool>,
    on_progress: Option<&mut dyn FnMut(&Progress)>,
) -> Result<RunReport> {
    let (version_id, raw_file_id, account_id, status): (Option<i64>, i64, i64, String) = conn
        .query_row(
            "SELECT plan_version_id, raw_file_id, account_id, status FROM parse_runs \
             WHERE id = ?1 AND mode = 'commit'",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|_| QuillError::UnknownRun(run_id))?;
    if status == "completed" {
        return Err(QuillError::Other(format!("run {run_id} already completed")));
    }
    let version_id = version_id.ok_or(QuillError::WorkingCopyCommit)?;
    let version = crate::plan::get_version(conn, version_id)?;
    let source = PlanSource::Committed(version);
    let extracted = load_file(conn, &source, raw_file_id)?;
    execute_commit(conn, run_id, &source, raw_file_id, account_id, extracted, evals, cancel, on_progress)
}

#[allow(clippy::too_many_arguments)]
fn execute_commit(
    conn: &Connection,
    run_id: i64,
    source: &PlanSource,
    raw_file_id: i64,
    account_id: i64,
    extracted: Extracted,
    evals: &Evaluators,
    cancel: Option<&AtomicBool>,
    mut on_progress: Option<&mut dyn FnMut(&Progress)>,
) -> Result<RunReport> {
    let account = crate::db::get_account(conn, account_id)?;
    let started = Instant::now();
    let rows_total = extracted.rows.len();

    let done_rows: HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT row_number FROM run_rows WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        rows
    };

    let processed = process_rows(&extracted, source, evals, None);
    let checkpoints = crate::checkpoint::build_checkpoints(
        &extracted.rows,
        extracted.headers.as_deref(),
        &source.config().schema,
    );

    // Chunk over whole groups so a chunk boundary never splits one.
    let ok_rows: Vec<(i64, MappedRow)> = processed
        .ok
        .iter()
        .map(|(n, m, _)| (*n, m.clone()))
        .collect();
    let steps_by_row: std::collections::HashMap<i64, &Vec<String>> =
        processed.ok.iter().map(|(n, _, s)| (*n, s)).collect();
    let (groups, ungroupable) = materialize::group_rows(&ok_rows);

    let mut report = RunReport {
        run_id: Some(run_id),
        rows_total,
        mapped_rows: ok_rows.clone(),
        ..RunReport::default()
    };
    for (row_number, reason) in &ungroupable {
        report.failures.push(RowFailure {
            row_number: *row_number,
            stage: "materialize",
            message: reason.clone(),
        });
    }

    let mut pending: Vec<&materialize::TxnGroup> = Vec::new();
    let mut pending_rows = 0usize;
    let mut chunks: Vec<Vec<&materialize::TxnGroup>> = Vec::new();
    for group in &groups {
        pending_rows += group.rows.len();
        pending.push(group);
        if pending_rows >= CHUNK_SIZE {
            chunks.push(std::mem::take(&mut pending));
            pending_rows = 0;
        }
    }
    if !pending.is_empty() {
        chunks.push(pending);
    }

    let mut rows_written = done_rows.len();
    for chunk in chunks {
        if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
            conn.execute(
                "UPDATE parse_runs SET status = 'cancelled', rows_processed = ?1 WHERE id = ?2",
                rusqlite::params![rows_written as i64, run_id],
            )?;
            report.cancelled = true;
            report.rows_processed = rows_written;
            return Ok(report);
        }

        let tx = conn.unchecked_transaction()?;
        for group in chunk {
            // A group already present (from the pre-cancel prefix) is skipped
            // whole; partial presence is impossible at chunk granularity.
            if group.rows.iter().any(|(n, _)| done_rows.contains(n)) {
                continue;
            }
            let rows: Vec<(i64, MappedRow)> = group.rows.clone();
            extract::persist_rows(
                &tx,
                &extracted
                    .rows
                    .iter()
                    .filter(|r| rows.iter().any(|(n, _)| *n == r.row_number))
                    .cloned()
                    .collect::<Vec<_>>(),
            )?;
            let outcome = materialize::materialize_rows(
                &tx,
                account_id,
                &account.currency,
                raw_file_id,
                run_id,
                &rows,
            )?;
            report.entries_created += outcome.entry_ids.len();
            report.broken_groups += outcome.broken_groups;
            let skipped_in_group: HashSet<i64> =
                outcome.skipped.iter().map(|(n, _)| *n).collect();
            for (row_number, reason) in outcome.skipped {
                report.failures.push(RowFailure {
                    row_number,
                    stage: "materialize",
                    message: reason,
                });
            }
            for (row_number, _) in &rows {
                let steps = steps_by_row
                    .get(row_number)
                    .map(|s| serde_json::to_string(s).unwrap_or_else(|_| "[]".to_string()))
                    .unwrap_or_else(|| "[]".to_string());
                let row_outcome = if skipped_in_group.contains(row_number) {
                    "skipped"
                } else {
                    "materialized"
                };
                tx.execute(
                    "INSERT OR IGNORE INTO run_rows (run_id, row_number, plan_version_id, \
                     steps_applied, outcome) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![run_id, row_number, source.version_id(), steps, row_outcome],
                )?;
                rows_written += 1;
            }
            let chunk_checkpoints: Vec<_> = checkpoints
                .iter()
                .filter(|c| rows.iter().any(|(n, _)| *n == c.row_number))
                .cloned()
                .collect();
            report.checkpoints_created +=
                crate::checkpoint::persist_checkpoints(&tx, account_id, raw_file_id, &chunk_checkpoints)?;
        }
        tx.execute(
            "UPDATE parse_runs SET rows_processed = ?1 WHERE id = ?2",
            rusqlite::params![rows_written as i64, run_id],
        )?;
        tx.commit()?;

        if let Some(cb) = on_progress.as_deref_mut() {
            let elapsed = started.elapsed().as_secs_f64();
            let eta = if rows_written > 0 && rows_written < rows_total {
                Some(
                    (elapsed / rows_written as f64 * (rows_total - rows_written) as f64).ceil()
                        as u64,
                )
            } else {
                None
            };
            cb(&Progress {
                rows_processed: rows_written as i64,
                rows_total: rows_total as i64,
                eta_secs: eta,
            });
        }
    }

    // Failed rows are lineage too: persist their source rows, record their
    // outcome, and pick up any checkpoints their balances carry. A row that
    // fails a transform still reports a balance the detector must honor.
    let tx = conn.unchecked_transaction()?;
    let failed_numbers: HashSet<i64> = processed.failures.iter().map(|f| f.row_number).collect();
    extract::persist_rows(
        &tx,
        &extracted
            .rows
            .iter()
            .filter(|r| failed_numbers.contains(&r.row_number))
            .cloned()
            .collect::<Vec<_>>(),
    )?;
    report.checkpoints_created +=
        crate::checkpoint::persist_checkpoints(&tx, account_id, raw_file_id, &checkpoints)?;
    for failure in &processed.failures {
        tx.execute(
            "INSERT OR IGNORE INTO run_rows (run_id, row_number, plan_version_id, steps_applied, \
             outcome, error) VALUES (?1, ?2, ?3, '[]', 'failed', ?4)",
            rusqlite::params![
                run_id,
                failure.row_number,
                source.version_id(),
                format!("{}: {}", failure.stage, failure.message),
            ],
        )?;
        rows_written += 1;
    }
    tx.execute(
        "UPDATE parse_runs SET status = 'completed', rows_processed = ?1, \
         finished_at = datetime('now') WHERE id = ?2",
        rusqlite::params![rows_written as i64, run_id],
    )?;
    tx.commit()?;

    report.rows_processed = rows_written;
    report.failures.extend(processed.failures);
    Ok(report)
}
