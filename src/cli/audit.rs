use comfy_table::Table;

use crate::audit;
use crate::db::{get_account_by_name, get_connection};
use crate::error::Result;
use crate::fmt::money;
use crate::settings::get_data_dir;

pub fn entry(entry_id: i64) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let lineage = audit::entry_lineage(&conn, entry_id)?;

    let e = &lineage.entry;
    println!(
        "Entry {}: {} {} {} on {} ({})",
        e.id,
        e.side.as_str(),
        money(e.amount_cents),
        e.currency,
        e.date,
        if e.txn_type.is_empty() { "untyped" } else { &e.txn_type },
    );
    if let Some(flag) = &e.flag {
        println!("  flags: {flag}");
    }
    if let Err(err) = audit::verify_group(&conn, e.group_id) {
        println!("  group {}: {err}", e.group_id);
    }
    match (e.origin_run_id, e.origin_delta_id) {
        (Some(run), _) => println!(
            "  origin: parse run {run}, plan version {}",
            lineage
                .plan_version_id
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(working copy)".to_string())
        ),
        (None, Some(delta)) => println!("  origin: fix delta {delta}"),
        (None, None) => {}
    }
    for row in &lineage.source_rows {
        println!(
            "  source row {} (file {}, row {}): {}",
            row.source_row_id,
            row.raw_file_id,
            row.row_number,
            row.fields.join(" | "),
        );
        if !row.steps_applied.is_empty() {
            println!("    steps: {}", row.steps_applied.join(", "));
        }
    }
    Ok(())
}

pub fn sessions(account: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let account = get_account_by_name(&conn, account)?;

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Status", "Iterations", "Initial", "Final", "Reason", "Started", "Finished",
    ]);
    let records = audit::session_history(&conn, account.id)?;
    for s in &records {
        table.add_row(vec![
            s.id.to_string(),
            s.status.clone(),
            s.iterations.to_string(),
            s.initial_discrepancies.to_string(),
            s.final_discrepancies.to_string(),
            s.termination_reason.clone().unwrap_or_default(),
            s.started_at.clone(),
            s.finished_at.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");

    for s in &records {
        for delta in audit::session_deltas(&conn, s.id)? {
            println!(
                "session {} delta {}: fix {} of investigation {} ({}), entries {:?}, resolved checkpoints {:?}",
                s.id,
                delta.id,
                delta.fix_index,
                delta.investigation_id,
                delta.approval_source,
                delta.entry_ids,
                delta.checkpoints_resolved,
            );
        }
    }
    Ok(())
}

pub fn runs() -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let mut stmt = conn.prepare(
        "SELECT r.id, p.name, r.plan_version_id, f.filename, a.name, r.mode, r.status, \
         r.rows_processed, r.rows_total, r.started_at FROM parse_runs r \
         JOIN parse_plans p ON p.id = r.plan_id \
         JOIN raw_files f ON f.id = r.raw_file_id \
         JOIN accounts a ON a.id = r.account_id ORDER BY r.id",
    )?;
    let rows: Vec<(i64, String, Option<i64>, String, String, String, String, i64, i64, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Plan", "Version", "File", "Account", "Mode", "Status", "Rows", "Started",
    ]);
    for (id, plan, version, file, account, mode, status, processed, total, started) in rows {
        table.add_row(vec![
            id.to_string(),
            plan,
            version.map(|v| v.to_string()).unwrap_or_default(),
            file,
            account,
            mode,
            status,
            format!("{processed}/{total}"),
            started,
        ]);
    }
    println!("{table}");
    Ok(())
}
