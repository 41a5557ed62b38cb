use rusqlite::Connection;

use crate::error::Result;
use crate::models::{BalanceCheckpoint, Discrepancy, LedgerEntry, Severity, Side};
use crate::money::{Cents, TOLERANCE_CENTS};

/// Severity bands over the absolute delta, in cents. Deltas within
/// tolerance are balanced and produce no discrepancy at all.
pub fn classify_delta(delta_cents: Cents) -> Option<Severity> {
    let abs = delta_cents.abs();
    if abs <= TOLERANCE_CENTS {
        None
    } else if abs <= 1_000 {
        Some(Severity::Low)
    } else if abs <= 100_000 {
        Some(Severity::Medium)
    } else {
        Some(Severity::Critical)
    }
}

pub fn load_entries(conn: &Connection, account_id: i64) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, group_id, date, side, amount_cents, currency, txn_type, \
         csv_amount_cents, amount_discrepancy_cents, flag, row_number, origin_run_id, \
         origin_delta_id FROM ledger_entries WHERE account_id = ?1 ORDER BY date, row_number, id",
    )?;
    let entries = stmt
        .query_map([account_id], |row| {
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
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Dates of transaction groups whose entry totals broke double-entry.
fn broken_group_dates(conn: &Connection, account_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT date FROM txn_groups WHERE account_id = ?1 AND balanced = 0 ORDER BY date",
    )?;
    let dates = stmt
        .query_map([account_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(dates)
}

/// Pure comparison core: walk entries in (date, row_number) order, and at
/// each checkpoint date compare the running balance to the reported one.
/// Multiple checkpoints on one date collapse to the last in row order.
/// A broken double-entry group at or before the checkpoint escalates the
/// discrepancy to CRITICAL regardless of delta magnitude.
pub fn compare(
    entries: &[LedgerEntry],
    checkpoints: &[BalanceCheckpoint],
    broken_dates: &[String],
) -> Vec<Discrepancy> {
    // Last checkpoint per date wins; checkpoints arrive date/row ordered.
    let mut effective: Vec<&BalanceCheckpoint> = Vec::new();
    for cp in checkpoints {
        match effective.last_mut() {
            Some(last) if last.date == cp.date => *last = cp,
            _ => effective.push(cp),
        }
    }

    let mut discrepancies = Vec::new();
    let mut running: Cents = 0;
    let mut idx = 0usize;
    for cp in effective {
        while idx < entries.len() && entries[idx].date.as_str() <= cp.date.as_str() {
            running += entries[idx].signed_amount();
            idx += 1;
        }
        let delta = cp.csv_balance_cents - running;
        let mut severity = match classify_delta(delta) {
            Some(s) => s,
            None => continue,
        };
        if broken_dates.iter().any(|d| d.as_str() <= cp.date.as_str()) {
            severity = Severity::Critical;
        }
        discrepancies.push(Discrepancy {
            checkpoint: cp.clone(),
            expected_cents: cp.csv_balance_cents,
            calculated_cents: running,
            delta_cents: delta,
            severity,
        });
    }
    discrepancies
}

/// Detect all current discrepancies for one account from stored state.
pub fn detect(conn: &Connection, account_id: i64) -> Result<Vec<Discrepancy>> {
    let entries = load_entries(conn, account_id)?;
    let checkpoints = crate::checkpoint::load_checkpoints(conn, account_id)?;
    let broken = broken_group_dates(conn, account_id)?;
    Ok(compare(&entries, &checkpoints, &broken))
}
