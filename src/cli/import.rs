use std::path::Path;

use colored::Colorize;

use crate::db::{get_account_by_name, get_connection};
use crate::error::{QuillError, Result};
use crate::evaluate::{BuiltinEvaluator, StepQuota};
use crate::plan::PlanSource;
use crate::run::{self, Evaluators, RunMode};
use crate::settings::{get_data_dir, load_settings};

pub fn run_import(file: &str, account: &str, plan_name: &str, preview: Option<usize>) -> Result<()> {
    let settings = load_settings();
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let account = get_account_by_name(&conn, account)?;
    let plan = crate::plan::get_plan_by_name(&conn, plan_name)?;

    let bytes = std::fs::read(Path::new(file))?;
    let filename = Path::new(file)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let stored = crate::blobstore::put(&conn, filename, &bytes)?;

    let evals = Evaluators {
        transform: &BuiltinEvaluator,
        validate: &BuiltinEvaluator,
        quota: StepQuota::from_millis(settings.step_quota_ms),
    };

    let (source, mode) = match preview {
        Some(sample_size) => (PlanSource::Draft(plan), RunMode::Preview { sample_size }),
        None => {
            let head = plan
                .head_version_id
                .ok_or_else(|| QuillError::Other(format!(
                    "plan '{plan_name}' has no committed version; commit it or use --preview"
                )))?;
            (PlanSource::Committed(crate::plan::get_version(&conn, head)?), RunMode::Commit)
        }
    };

    let mut print_progress = |p: &run::Progress| {
        match p.eta_secs {
            Some(eta) => println!("  {}/{} rows, ~{eta}s remaining", p.rows_processed, p.rows_total),
            None => println!("  {}/{} rows", p.rows_processed, p.rows_total),
        }
    };
    let report = run::run(
        &conn,
        &source,
        stored.id,
        account.id,
        mode,
        &evals,
        None,
        Some(&mut print_progress),
    )?;

    if report.duplicate_import {
        println!("This file was already committed with this plan version (run {}).",
            report.run_id.unwrap_or_default());
        return Ok(());
    }

    match mode {
        RunMode::Preview { .. } => {
            println!(
                "Preview: {} of {} rows mapped, {} failed",
                report.mapped_rows.len(),
                report.rows_total,
                report.failures.len()
            );
            for (row_number, mapped) in report.mapped_rows.iter().take(10) {
                println!(
                    "  row {row_number}: {}",
                    serde_json::to_string(mapped).unwrap_or_default()
                );
            }
        }
        RunMode::Commit => {
            println!(
                "{} entries from {} rows, {} checkpoints, {} failed rows",
                report.entries_created,
                report.rows_processed,
                report.checkpoints_created,
                report.failures.len()
            );
            if report.broken_groups > 0 {
                println!(
                    "{}",
                    format!("{} transaction group(s) broke double-entry", report.broken_groups).red()
                );
            }
        }
    }
    for failure in report.failures.iter().take(10) {
        println!("  row {}: [{}] {}", failure.row_number, failure.stage, failure.message);
    }
    if report.failures.len() > 10 {
        println!("  ... and {} more", report.failures.len() - 10);
    }
    Ok(())
}

pub fn resume(run_id: i64) -> Result<()> {
    let settings = load_settings();
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let evals = Evaluators {
        transform: &BuiltinEvaluator,
        validate: &BuiltinEvaluator,
        quota: StepQuota::from_millis(settings.step_quota_ms),
    };
    let mut print_progress = |p: &run::Progress| {
        println!("  {}/{} rows", p.rows_processed, p.rows_total);
    };
    let report = run::resume_run(&conn, run_id, &evals, None, Some(&mut print_progress))?;
    println!(
        "Resumed run {run_id}: {} rows processed, {} failed",
        report.rows_processed,
        report.failures.len()
    );
    Ok(())
}
