use crate::db::get_connection;
use crate::error::Result;
use crate::settings::get_data_dir;

pub fn run() -> Result<()> {
    let data_dir = get_data_dir();
    let db_path = data_dir.join("quill.db");
    if !db_path.exists() {
        println!("No database at {}. Run `quill init` first.", db_path.display());
        return Ok(());
    }
    let conn = get_connection(&db_path)?;

    println!("Database: {}", db_path.display());
    for (label, table) in &[
        ("Accounts", "accounts"),
        ("Raw files", "raw_files"),
        ("Source rows", "source_rows"),
        ("Parse plans", "parse_plans"),
        ("Plan versions", "plan_versions"),
        ("Parse runs", "parse_runs"),
        ("Ledger entries", "ledger_entries"),
        ("Checkpoints", "checkpoints"),
        ("Sessions", "sessions"),
        ("Applied fixes", "fix_deltas"),
    ] {
        let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?;
        println!("  {label}: {count}");
    }

    let unbalanced: i64 = conn.query_row(
        "SELECT count(*) FROM txn_groups WHERE balanced = 0",
        [],
        |r| r.get(0),
    )?;
    if unbalanced > 0 {
        println!("  Broken double-entry groups: {unbalanced}");
    }
    Ok(())
}
