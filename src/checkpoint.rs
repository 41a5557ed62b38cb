use rusqlite::Connection;

use crate::error::Result;
use crate::models::{BalanceCheckpoint, FieldSpec, SourceRow};
use crate::money::{parse_cents, Cents};

#[derive(Debug, Clone)]
pub struct CheckpointDraft {
    pub row_number: i64,
    pub date: String,
    pub csv_balance_cents: Cents,
}

fn field_index(spec: &FieldSpec, headers: Option<&[String]>) -> Option<usize> {
    match &spec.column {
        crate::models::ColumnRef::Index(i) => Some(*i),
        crate::models::ColumnRef::Name(name) => {
            headers?.iter().position(|h| h.eq_ignore_ascii_case(name))
        }
    }
}

/// Build checkpoints from rows carrying a reported balance. Rows without a
/// parseable balance are skipped, not errors: intra-day trade legs often
/// lack the field while settlement legs carry it.
pub fn build_checkpoints(
    rows: &[SourceRow],
    headers: Option<&[String]>,
    schema: &[FieldSpec],
) -> Vec<CheckpointDraft> {
    let balance_spec = schema.iter().find(|f| f.name == "balance");
    let date_spec = schema.iter().find(|f| f.name == "date");
    let (Some(balance_spec), Some(date_spec)) = (balance_spec, date_spec) else {
        return Vec::new();
    };
    let (Some(balance_idx), Some(date_idx)) = (
        field_index(balance_spec, headers),
        field_index(date_spec, headers),
    ) else {
        return Vec::new();
    };
    let date_format = date_spec.format.as_deref().unwrap_or("%Y-%m-%d");

    let mut drafts = Vec::new();
    for row in rows {
        let raw_balance = row.fields.get(balance_idx).map(|s| s.as_str()).unwrap_or("");
        let Some(balance) = parse_cents(raw_balance) else {
            continue;
        };
        let raw_date = row.fields.get(date_idx).map(|s| s.trim()).unwrap_or("");
        let Ok(date) = chrono::NaiveDate::parse_from_str(raw_date, date_format) else {
            continue;
        };
        drafts.push(CheckpointDraft {
            row_number: row.row_number,
            date: date.format("%Y-%m-%d").to_string(),
            csv_balance_cents: balance,
        });
    }
    drafts
}

/// Idempotent per (account, file, row) so resumed runs do not duplicate.
pub fn persist_checkpoints(
    conn: &Connection,
    account_id: i64,
    raw_file_id: i64,
    drafts: &[CheckpointDraft],
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO checkpoints (account_id, raw_file_id, row_number, date, \
         csv_balance_cents) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = 0usize;
    for draft in drafts {
        inserted += stmt.execute(rusqlite::params![
            account_id,
            raw_file_id,
            draft.row_number,
            draft.date,
            draft.csv_balance_cents,
        ])?;
    }
    Ok(inserted)
}

pub fn load_checkpoints(conn: &Connection, account_id: i64) -> Result<Vec<BalanceCheckpoint>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, date, row_number, csv_balance_cents FROM checkpoints \
         WHERE account_id = ?1 ORDER BY date, row_number",
    )?;
    let checkpoints = stmt
        .query_map([account_id], |row| {
            Ok(BalanceCheckpoint {
                id: row.get(0)?,
                account_id: row.get(1)?,
                date: row.get(2)?,
                row_number: row.get(3)?,
                csv_balance_cents: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(checkpoints)
}
