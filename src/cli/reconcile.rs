use std::path::Path;

use colored::Colorize;
use comfy_table::Table;

use crate::assistant::{FileAssistant, ProposedFix};
use crate::db::{get_account_by_name, get_connection};
use crate::error::Result;
use crate::fixes::{FixApprover, RejectAll};
use crate::fmt::money;
use crate::models::Severity;
use crate::reconcile::{run_session, SessionConfig};
use crate::settings::{get_data_dir, load_settings};

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Low => severity.as_str().normal().to_string(),
        Severity::Medium => severity.as_str().yellow().to_string(),
        Severity::Critical => severity.as_str().red().bold().to_string(),
    }
}

pub fn check(account: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let account = get_account_by_name(&conn, account)?;
    let discrepancies = crate::detect::detect(&conn, account.id)?;

    if discrepancies.is_empty() {
        println!("All checkpoints balanced for '{}'.", account.name);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Date", "Row", "Reported", "Calculated", "Delta", "Severity"]);
    for d in &discrepancies {
        table.add_row(vec![
            d.checkpoint.date.clone(),
            d.checkpoint.row_number.to_string(),
            money(d.expected_cents),
            money(d.calculated_cents),
            money(d.delta_cents),
            severity_label(d.severity),
        ]);
    }
    println!("{table}");
    println!("{} discrepancies", discrepancies.len());
    Ok(())
}

struct PromptApprover;

impl FixApprover for PromptApprover {
    fn approve(&self, fix: &ProposedFix) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(format!(
                "Apply fix '{}' (confidence {:.2})?",
                fix.description, fix.confidence
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

pub fn run(account: &str, fixes_path: &str, auto_only: bool) -> Result<()> {
    let settings = load_settings();
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let account = get_account_by_name(&conn, account)?;
    let assistant = FileAssistant::from_path(Path::new(fixes_path))?;
    let config = SessionConfig::from_settings(&settings);

    let summary = if auto_only {
        run_session(&conn, &assistant, &RejectAll, account.id, &config)?
    } else {
        run_session(&conn, &assistant, &PromptApprover, account.id, &config)?
    };

    let state = match summary.state {
        crate::reconcile::SessionState::Converged => "Converged".green().to_string(),
        _ => "Partially reconciled".yellow().to_string(),
    };
    println!(
        "{state}: {} -> {} discrepancies in {} iteration(s)",
        summary.initial_discrepancies, summary.final_discrepancies, summary.iterations
    );
    println!(
        "  {} investigations, {} fixes applied, {} declined, {} flagged for manual review",
        summary.investigations_run, summary.fixes_applied, summary.fixes_declined, summary.flagged_manual
    );
    Ok(())
}
