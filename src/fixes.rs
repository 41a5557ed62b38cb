use rusqlite::Connection;

use crate::assistant::{FixAction, ProposedFix};
use crate::detect;
use crate::error::{QuillError, Result};
use crate::materialize::{self, EntryLine};
use crate::models::{LedgerEntry, Side};
use crate::money::Cents;

/// Confidence gates. A fix at or above AUTO applies without approval; one in
/// [REVIEW, AUTO) is staged for explicit approval; below REVIEW it is never
/// applied. ACTIONABLE is the investigation-level floor: when even the best
/// fix sits under it, the investigation yields nothing to stage.
pub const AUTO_APPLY_CONFIDENCE: f64 = 0.95;
pub const REVIEW_CONFIDENCE: f64 = 0.70;
pub const ACTIONABLE_CONFIDENCE: f64 = 0.60;

pub trait FixApprover {
    fn approve(&self, fix: &ProposedFix) -> bool;
}

/// Declines every staged fix; used for unattended sessions.
pub struct RejectAll;

impl FixApprover for RejectAll {
    fn approve(&self, _fix: &ProposedFix) -> bool {
        false
    }
}

#[derive(Debug)]
pub enum FixDecision {
    Applied {
        delta_id: i64,
        entry_ids: Vec<i64>,
        checkpoints_resolved: Vec<i64>,
        auto: bool,
    },
    /// Dry-run contradicted the stated impact, or the fix referenced
    /// entities that do not exist. The discrepancy stays open.
    Rejected { reason: String },
    /// Staged for review and explicitly declined.
    Declined,
    /// Confidence below the application threshold; flagged for manual
    /// investigation.
    BelowThreshold,
}

#[derive(Debug)]
pub struct DryRunResult {
    pub balance_change_cents: Cents,
    pub transactions_created: usize,
    pub checkpoints_resolved: Vec<i64>,
}

fn validated_action(conn: &Connection, fix: &ProposedFix) -> Result<FixAction> {
    let FixAction::AddTransaction {
        date,
        legs,
        source_row_ids,
        ..
    } = &fix.action;

    if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(QuillError::Other(format!("fix date '{date}' is not a YYYY-MM-DD date")));
    }
    if legs.is_empty() {
        return Err(QuillError::Other("fix proposes no entry legs".to_string()));
    }
    for leg in legs {
        if leg.amount_cents <= 0 {
            return Err(QuillError::Other(format!(
                "fix leg amount {} must be positive; the side carries the sign",
                leg.amount_cents
            )));
        }
    }
    for id in source_row_ids {
        let exists: bool = conn
            .prepare_cached("SELECT 1 FROM source_rows WHERE id = ?1")?
            .exists([id])?;
        if !exists {
            return Err(QuillError::Other(format!("fix references missing source row {id}")));
        }
    }
    Ok(fix.action.clone())
}

fn signed(leg_side: Side, amount: Cents) -> Cents {
    match leg_side {
        Side::Debit => amount,
        Side::Credit => -amount,
    }
}

/// Simulate the fix against current ledger state without writing anything.
/// Returns what would actually change, for comparison against the fix's own
/// predicted impact.
pub fn dry_run(conn: &Connection, account_id: i64, fix: &ProposedFix) -> Result<DryRunResult> {
    let action = validated_action(conn, fix)?;
    let FixAction::AddTransaction { date, legs, .. } = &action;

    let mut entries = detect::load_entries(conn, account_id)?;
    let checkpoints = crate::checkpoint::load_checkpoints(conn, account_id)?;
    let broken = Vec::new();
    let before: std::collections::HashSet<i64> = detect::detect(conn, account_id)?
        .iter()
        .map(|d| d.checkpoint.id)
        .collect();

    let balance_change: Cents = legs.iter().map(|l| signed(l.side, l.amount_cents)).sum();
    for leg in legs {
        entries.push(LedgerEntry {
            id: -1,
            account_id,
            group_id: -1,
            date: date.clone(),
            side: leg.side,
            amount_cents: leg.amount_cents,
            currency: String::new(),
            txn_type: String::new(),
            csv_amount_cents: None,
            amount_discrepancy_cents: None,
            flag: None,
            row_number: i64::MAX,
            origin_run_id: None,
            origin_delta_id: None,
        });
    }
    entries.sort_by(|a, b| (a.date.as_str(), a.row_number).cmp(&(b.date.as_str(), b.row_number)));

    // Broken-group escalation is deliberately ignored here: the dry run asks
    // what the balances would be, not how severe the leftovers are.
    let after: std::collections::HashSet<i64> = detect::compare(&entries, &checkpoints, &broken)
        .iter()
        .map(|d| d.checkpoint.id)
        .collect();
    let resolved: Vec<i64> = before.iter().filter(|id| !after.contains(id)).copied().collect();

    Ok(DryRunResult {
        balance_change_cents: balance_change,
        transactions_created: 1,
        checkpoints_resolved: resolved,
    })
}

/// Route one proposed fix through the confidence policy. Nothing mutates the
/// ledger without a dry-run that agrees with the fix's stated impact, and
/// every application writes an audit delta with its approval source.
pub fn apply_fix(
    conn: &Connection,
    account_id: i64,
    investigation_id: i64,
    fix_index: usize,
    fix: &ProposedFix,
    approver: &dyn FixApprover,
    fallback_source_row_id: Option<i64>,
) -> Result<FixDecision> {
    if fix.confidence < REVIEW_CONFIDENCE {
        return Ok(FixDecision::BelowThreshold);
    }

    let dry = match dry_run(conn, account_id, fix) {
        Ok(d) => d,
        Err(e) => {
            return Ok(FixDecision::Rejected { reason: e.to_string() });
        }
    };
    if dry.balance_change_cents != fix.predicted_impact.balance_change_cents {
        return Ok(FixDecision::Rejected {
            reason: format!(
                "dry-run balance change {} contradicts predicted {}",
                dry.balance_change_cents, fix.predicted_impact.balance_change_cents
            ),
        });
    }
    if dry.transactions_created != fix.predicted_impact.transactions_created {
        return Ok(FixDecision::Rejected {
            reason: format!(
                "dry-run creates {} transactions, fix predicted {}",
                dry.transactions_created, fix.predicted_impact.transactions_created
            ),
        });
    }

    let auto = fix.confidence >= AUTO_APPLY_CONFIDENCE;
    if !auto && !approver.approve(fix) {
        return Ok(FixDecision::Declined);
    }

    let FixAction::AddTransaction {
        date,
        txn_type,
        legs,
        source_row_ids,
        ..
    } = &fix.action;

    let account = crate::db::get_account(conn, account_id)?;
    let sources: Vec<i64> = if source_row_ids.is_empty() {
        fallback_source_row_id.into_iter().collect()
    } else {
        source_row_ids.clone()
    };
    if sources.is_empty() {
        return Ok(FixDecision::Rejected {
            reason: "fix has no source rows to ground its provenance".to_string(),
        });
    }
    let row_number: i64 = conn.query_row(
        "SELECT min(row_number) FROM source_rows WHERE id IN (SELECT value FROM json_each(?1))",
        [serde_json::to_string(&sources)
            .map_err(|e| QuillError::Other(e.to_string()))?],
        |row| row.get(0),
    )?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO fix_deltas (investigation_id, fix_index, approval_source, entry_ids) \
         VALUES (?1, ?2, ?3, '[]')",
        rusqlite::params![investigation_id, fix_index as i64, if auto { "auto" } else { "manual" }],
    )?;
    let delta_id = tx.last_insert_rowid();

    let lines: Vec<EntryLine> = legs
        .iter()
        .map(|leg| EntryLine {
            side: leg.side,
            amount_cents: leg.amount_cents,
            csv_amount_cents: None,
            currency: account.currency.clone(),
            txn_type: txn_type.clone(),
            row_number,
            source_row_ids: sources.clone(),
            flags: Vec::new(),
        })
        .collect();
    let (_, entry_ids, _) = materialize::insert_group(
        &tx,
        account_id,
        date,
        &format!("fix:{investigation_id}:{fix_index}"),
        None,
        &lines,
        None,
        Some(delta_id),
    )?;

    let resolved = dry.checkpoints_resolved.clone();
    tx.execute(
        "UPDATE fix_deltas SET entry_ids = ?1, checkpoints_resolved = ?2 WHERE id = ?3",
        rusqlite::params![
            serde_json::to_string(&entry_ids).map_err(|e| QuillError::Other(e.to_string()))?,
            serde_json::to_string(&resolved).map_err(|e| QuillError::Other(e.to_string()))?,
            delta_id,
        ],
    )?;
    tx.commit()?;

    Ok(FixDecision::Applied {
        delta_id,
        entry_ids,
        checkpoints_resolved: resolved,
        auto,
    })
}
