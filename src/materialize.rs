use rusqlite::Connection;

use crate::error::Result;
use crate::models::{MappedRow, MappedValue, Side};
use crate::money::{Cents, TOLERANCE_CENTS};

/// How many rows past a group's last action row a settlement row may sit
/// and still be folded into that transaction.
pub const SETTLEMENT_WINDOW: usize = 3;

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TxnGroup {
    pub date: String,
    pub key: String,
    /// (row_number, mapped row), in input order.
    pub rows: Vec<(i64, MappedRow)>,
    /// Position in the input sequence of the last non-settlement row.
    last_action_pos: usize,
}

fn text_of(row: &MappedRow, key: &str) -> Option<String> {
    let s = row.get(key)?.as_text()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn date_of(row: &MappedRow) -> Option<String> {
    match row.get("date") {
        Some(MappedValue::Date(d)) => Some(d.clone()),
        _ => None,
    }
}

fn is_settlement(row: &MappedRow) -> bool {
    // Settlement legs carry no originating action and zero/blank quantity.
    let blank_action = row.contains_key("action") && text_of(row, "action").is_none();
    let no_quantity = match row.get("quantity") {
        None => true,
        Some(MappedValue::Integer(q)) => *q == 0,
        Some(MappedValue::Missing) => true,
        Some(_) => false,
    };
    blank_action && no_quantity
}

/// Group mapped rows into candidate transactions by (date, action) key.
/// Settlement rows fold into the preceding action row's group when they sit
/// within the adjacency window on the same date; rows without an action key
/// each stand alone. Rows without a date are returned separately.
pub fn group_rows(rows: &[(i64, MappedRow)]) -> (Vec<TxnGroup>, Vec<(i64, String)>) {
    let mut groups: Vec<TxnGroup> = Vec::new();
    let mut skipped: Vec<(i64, String)> = Vec::new();
    let mut last_action_group: Option<usize> = None;

    for (pos, (row_number, row)) in rows.iter().enumerate() {
        let Some(date) = date_of(row) else {
            skipped.push((*row_number, "row has no date".to_string()));
            continue;
        };

        if is_settlement(row) {
            if let Some(gidx) = last_action_group {
                let g = &mut groups[gidx];
                if g.date == date && pos - g.last_action_pos <= SETTLEMENT_WINDOW {
                    g.rows.push((*row_number, row.clone()));
                    continue;
                }
            }
            groups.push(TxnGroup {
                date,
                key: format!("settlement:{row_number}"),
                rows: vec![(*row_number, row.clone())],
                last_action_pos: pos,
            });
            continue;
        }

        let key = match text_of(row, "action") {
            Some(action) => action.to_lowercase(),
            None => format!("row:{row_number}"),
        };
        let existing = groups
            .iter()
            .position(|g| g.date == date && g.key == key);
        match existing {
            Some(gidx) => {
                groups[gidx].rows.push((*row_number, row.clone()));
                groups[gidx].last_action_pos = pos;
                last_action_group = Some(gidx);
            }
            None => {
                groups.push(TxnGroup {
                    date,
                    key,
                    rows: vec![(*row_number, row.clone())],
                    last_action_pos: pos,
                });
                last_action_group = Some(groups.len() - 1);
            }
        }
    }
    (groups, skipped)
}

// ---------------------------------------------------------------------------
// Entry construction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EntryLine {
    pub side: Side,
    /// Always non-negative; the side carries the sign.
    pub amount_cents: Cents,
    pub csv_amount_cents: Option<Cents>,
    pub currency: String,
    pub txn_type: String,
    pub row_number: i64,
    pub source_row_ids: Vec<i64>,
    pub flags: Vec<String>,
}

impl EntryLine {
    fn signed(&self) -> Cents {
        match self.side {
            Side::Debit => self.amount_cents,
            Side::Credit => -self.amount_cents,
        }
    }
}

#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub groups_created: usize,
    pub entry_ids: Vec<i64>,
    /// Groups whose entry total missed the recorded csv amount beyond
    /// tolerance (broken double-entry, over-grouping candidates).
    pub broken_groups: usize,
    pub duplicate_source_rows: usize,
    pub skipped: Vec<(i64, String)>,
}

fn signed_cents(row: &MappedRow, key: &str) -> Option<Cents> {
    row.get(key).and_then(|v| v.as_cents())
}

fn line_from_row(row_number: i64, row: &MappedRow, currency: &str, source_row_id: i64) -> Option<EntryLine> {
    let csv_amount = signed_cents(row, "amount");
    let computed = signed_cents(row, "computed_amount");
    let effective = computed.or(csv_amount)?;
    let side = if effective >= 0 { Side::Debit } else { Side::Credit };
    let mut flags = Vec::new();
    if let (Some(computed), Some(csv)) = (computed, csv_amount) {
        if (computed - csv).abs() > TOLERANCE_CENTS {
            flags.push("amount_deviation".to_string());
        }
    }
    Some(EntryLine {
        side,
        amount_cents: effective.abs(),
        csv_amount_cents: csv_amount,
        currency: text_of(row, "currency").unwrap_or_else(|| currency.to_string()),
        txn_type: text_of(row, "type").unwrap_or_default(),
        row_number,
        source_row_ids: vec![source_row_id],
        flags,
    })
}

/// Insert one transaction group and its entry lines. The entry total is
/// checked against the recorded csv amount; a mismatch beyond tolerance
/// marks every entry in the group rather than forcing balance.
pub fn insert_group(
    conn: &Connection,
    account_id: i64,
    date: &str,
    key: &str,
    csv_amount: Option<Cents>,
    lines: &[EntryLine],
    origin_run_id: Option<i64>,
    origin_delta_id: Option<i64>,
) -> Result<(i64, Vec<i64>, bool)> {
    let entry_sum: Cents = lines.iter().map(|l| l.signed()).sum();
    let discrepancy = csv_amount.map(|csv| entry_sum - csv);
    let broken = discrepancy.map(|d| d.abs() > TOLERANCE_CENTS).unwrap_or(false);

    conn.execute(
        "INSERT INTO txn_groups (account_id, date, group_key, csv_amount_cents, entry_sum_cents, \
         balanced, origin_run_id, origin_delta_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            account_id,
            date,
            key,
            csv_amount,
            entry_sum,
            !broken as i64,
            origin_run_id,
            origin_delta_id,
        ],
    )?;
    let group_id = conn.last_insert_rowid();

    let mut entry_ids = Vec::with_capacity(lines.len());
    for line in lines {
        let mut flags = line.flags.clone();
        if broken {
            flags.insert(0, "over_grouping".to_string());
        }
        for source_row_id in &line.source_row_ids {
            let used: i64 = conn.query_row(
                "SELECT count(*) FROM entry_sources WHERE source_row_id = ?1",
                [source_row_id],
                |r| r.get(0),
            )?;
            if used > 0 && !flags.iter().any(|f| f == "duplicate_source") {
                flags.push("duplicate_source".to_string());
            }
        }
        let flag = if flags.is_empty() { None } else { Some(flags.join(",")) };
        conn.execute(
            "INSERT INTO ledger_entries (account_id, group_id, date, side, amount_cents, currency, \
             txn_type, csv_amount_cents, amount_discrepancy_cents, flag, row_number, origin_run_id, \
             origin_delta_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                account_id,
                group_id,
                date,
                line.side.as_str(),
                line.amount_cents,
                line.currency,
                line.txn_type,
                line.csv_amount_cents,
                if broken { discrepancy } else { None },
                flag,
                line.row_number,
                origin_run_id,
                origin_delta_id,
            ],
        )?;
        let entry_id = conn.last_insert_rowid();
        for source_row_id in &line.source_row_ids {
            conn.execute(
                "INSERT OR IGNORE INTO entry_sources (entry_id, source_row_id) VALUES (?1, ?2)",
                rusqlite::params![entry_id, source_row_id],
            )?;
        }
        entry_ids.push(entry_id);
    }
    Ok((group_id, entry_ids, broken))
}

/// Materialize validated mapped rows into ledger entries, grouping related
/// rows into double-entry transactions and linking every entry back to its
/// source rows.
pub fn materialize_rows(
    conn: &Connection,
    account_id: i64,
    currency: &str,
    raw_file_id: i64,
    origin_run_id: i64,
    rows: &[(i64, MappedRow)],
) -> Result<MaterializeOutcome> {
    let (groups, skipped) = group_rows(rows);
    let mut outcome = MaterializeOutcome {
        skipped,
        ..MaterializeOutcome::default()
    };

    for group in &groups {
        let mut lines = Vec::new();
        let mut csv_sum: Option<Cents> = None;
        for (row_number, row) in &group.rows {
            let source_row_id = crate::extract::source_row_id(conn, raw_file_id, *row_number)?;
            if let Some(csv) = signed_cents(row, "amount") {
                csv_sum = Some(csv_sum.unwrap_or(0) + csv);
            }
            match line_from_row(*row_number, row, currency, source_row_id) {
                Some(line) => lines.push(line),
                None => outcome
                    .skipped
                    .push((*row_number, "row has no amount".to_string())),
            }
        }
        if lines.is_empty() {
            continue;
        }
        let (_, entry_ids, broken) = insert_group(
            conn,
            account_id,
            &group.date,
            &group.key,
            csv_sum,
            &lines,
            Some(origin_run_id),
            None,
        )?;
        outcome.groups_created += 1;
        if broken {
            outcome.broken_groups += 1;
        }
        outcome.duplicate_source_rows += entry_flag_count(conn, &entry_ids, "duplicate_source")?;
        outcome.entry_ids.extend(entry_ids);
    }
    Ok(outcome)
}

fn entry_flag_count(conn: &Connection, entry_ids: &[i64], flag: &str) -> Result<usize> {
    let mut count = 0usize;
    for id in entry_ids {
        let f: Option<String> = conn.query_row(
            "SELECT flag FROM ledger_entries WHERE id = ?1",
            [id],
            |r| r.get(0),
        )?;
        if f.map(|f| f.split(',').any(|p| p == flag)).unwrap_or(false) {
            count += 1;
        }
    }
    Ok(count)
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

    fn setup(conn: &Connection, row_numbers: &[i64]) -> (i64, i64, i64) {
        conn.execute("INSERT INTO accounts (name) VALUES ('Test')", []).unwrap();
        let account_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO raw_files (filename, content, checksum, byte_len) VALUES ('f', x'00', 'c', 1)",
            [],
        )
        .unwrap();
        let raw_file_id = conn.last_insert_rowid();
        let rows: Vec<SourceRow> = row_numbers
            .iter()
            .map(|n| SourceRow {
                raw_file_id,
                row_number: *n,
                fields: vec![],
            })
            .collect();
        crate::extract::persist_rows(conn, &rows).unwrap();
        conn.execute(
            "INSERT INTO parse_plans (name, working_config) VALUES ('p', '{}')",
            [],
        )
        .unwrap();
        let plan_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO parse_runs (plan_id, raw_file_id, account_id, mode) VALUES (?1, ?2, ?3, 'commit')",
            rusqlite::params![plan_id, raw_file_id, account_id],
        )
        .unwrap();
        (account_id, raw_file_id, conn.last_insert_rowid())
    }

    fn mapped(date: &str, action: Option<&str>, quantity: Option<i64>, amount: Option<Cents>) -> MappedRow {
        let mut row = MappedRow::new();
        row.insert("date".to_string(), MappedValue::Date(date.to_string()));
        row.insert(
            "action".to_string(),
            match action {
                Some(a) => MappedValue::Text(a.to_string()),
                None => MappedValue::Missing,
            },
        );
        row.insert(
            "quantity".to_string(),
            match quantity {
                Some(q) => MappedValue::Integer(q),
                None => MappedValue::Missing,
            },
        );
        if let Some(a) = amount {
            row.insert("amount".to_string(), MappedValue::Cents(a));
        }
        row
    }

    #[test]
    fn test_grouping_by_date_and_action() {
        let rows = vec![
            (2, mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000))),
            (3, mapped("2025-01-15", Some("SELL"), Some(5), Some(25000))),
            (4, mapped("2025-01-16", Some("BUY"), Some(1), Some(-1000))),
        ];
        let (groups, skipped) = group_rows(&rows);
        assert!(skipped.is_empty());
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_settlement_row_joins_preceding_action() {
        let rows = vec![
            (2, mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000))),
            (3, mapped("2025-01-15", None, None, Some(-12))),
        ];
        let (groups, _) = group_rows(&rows);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].rows.len(), 2);
    }

    #[test]
    fn test_settlement_row_outside_window_stands_alone() {
        // One action row followed by four settlement rows: the first three
        // sit inside the adjacency window, the fourth does not.
        let mut rows = vec![(2, mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000)))];
        for n in 3..=6 {
            rows.push((n, mapped("2025-01-15", None, None, Some(-12))));
        }
        let (groups, _) = group_rows(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rows.len(), 4);
        assert!(groups[1].key.starts_with("settlement:"));
    }

    #[test]
    fn test_settlement_row_different_date_stands_alone() {
        let rows = vec![
            (2, mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000))),
            (3, mapped("2025-01-16", None, None, Some(-12))),
        ];
        let (groups, _) = group_rows(&rows);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_rows_without_action_key_stand_alone() {
        let mut a = MappedRow::new();
        a.insert("date".to_string(), MappedValue::Date("2025-01-15".to_string()));
        a.insert("amount".to_string(), MappedValue::Cents(-450));
        let mut b = a.clone();
        b.insert("amount".to_string(), MappedValue::Cents(-450));
        let (groups, _) = group_rows(&[(2, a), (3, b)]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_materialize_balanced_group() {
        let (_dir, conn) = test_db();
        let (account_id, raw_file_id, run_id) = setup(&conn, &[2, 3]);
        let rows = vec![
            (2, mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000))),
            (3, mapped("2025-01-15", None, None, Some(-12))),
        ];
        let out = materialize_rows(&conn, account_id, "USD", raw_file_id, run_id, &rows).unwrap();
        assert_eq!(out.groups_created, 1);
        assert_eq!(out.entry_ids.len(), 2);
        assert_eq!(out.broken_groups, 0);

        let balanced: i64 = conn
            .query_row("SELECT balanced FROM txn_groups", [], |r| r.get(0))
            .unwrap();
        assert_eq!(balanced, 1);
        let sides: Vec<String> = conn
            .prepare("SELECT side FROM ledger_entries ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(sides, vec!["credit", "credit"]);
    }

    #[test]
    fn test_computed_amount_mismatch_flags_group_critical() {
        let (_dir, conn) = test_db();
        let (account_id, raw_file_id, run_id) = setup(&conn, &[2]);
        let mut row = mapped("2025-01-15", Some("BUY"), Some(10), Some(-50000));
        // Transform computed a different economic amount than the file
        // reported; the group must be surfaced, not forced to balance.
        row.insert("computed_amount".to_string(), MappedValue::Cents(-49000));
        let out = materialize_rows(&conn, account_id, "USD", raw_file_id, run_id, &[(2, row)]).unwrap();
        assert_eq!(out.broken_groups, 1);

        let (flag, disc): (String, i64) = conn
            .query_row(
                "SELECT flag, amount_discrepancy_cents FROM ledger_entries",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(flag.contains("over_grouping"));
        assert!(flag.contains("amount_deviation"));
        assert_eq!(disc, 1000);
        let balanced: i64 = conn
            .query_row("SELECT balanced FROM txn_groups", [], |r| r.get(0))
            .unwrap();
        assert_eq!(balanced, 0);
    }

    #[test]
    fn test_duplicate_source_row_flagged() {
        let (_dir, conn) = test_db();
        let (account_id, raw_file_id, run_id) = setup(&conn, &[2]);
        let rows = vec![(2, mapped("2025-01-15", Some("BUY"), Some(1), Some(-1000)))];
        materialize_rows(&conn, account_id, "USD", raw_file_id, run_id, &rows).unwrap();
        let out = materialize_rows(&conn, account_id, "USD", raw_file_id, run_id, &rows).unwrap();
        assert_eq!(out.duplicate_source_rows, 1);
        let flag: Option<String> = conn
            .query_row(
                "SELECT flag FROM ledger_entries ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(flag.as_deref(), Some("duplicate_source"));
    }

    #[test]
    fn test_rows_without_date_are_skipped() {
        let (_dir, conn) = test_db();
        let (account_id, raw_file_id, run_id) = setup(&conn, &[2]);
        let mut row = MappedRow::new();
        row.insert("amount".to_string(), MappedValue::Cents(100));
        let out = materialize_rows(&conn, account_id, "USD", raw_file_id, run_id, &[(2, row)]).unwrap();
        assert_eq!(out.groups_created, 0);
        assert_eq!(out.skipped.len(), 1);
    }
}
