pub mod accounts;
pub mod audit;
pub mod import;
pub mod init;
pub mod plan;
pub mod reconcile;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "quill", about = "Deterministic statement import and balance reconciliation.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up Quill: choose a data directory and initialize the database.
    Init {
        /// Path for Quill data (default: ~/Documents/quill)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Manage accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommands,
    },
    /// Manage parse plans and their version history.
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Import a statement file through a parse plan.
    Import {
        /// Path to the statement file
        file: String,
        /// Account name to import into
        #[arg(long)]
        account: String,
        /// Parse plan name
        #[arg(long)]
        plan: String,
        /// Preview the first N rows against the working copy; writes nothing
        #[arg(long)]
        preview: Option<usize>,
    },
    /// Resume a cancelled or interrupted commit run.
    Resume {
        /// Run ID (shown in `quill audit runs`)
        run_id: i64,
    },
    /// Reconcile calculated balances against reported checkpoints.
    Reconcile {
        #[command(subcommand)]
        command: ReconcileCommands,
    },
    /// Inspect lineage and reconciliation history.
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Show current database and summary statistics.
    Status,
}

#[derive(Subcommand)]
pub enum AccountsCommands {
    /// Add a new account.
    Add {
        /// Account name, e.g. 'Brokerage Cash'
        name: String,
        /// Institution name
        #[arg(long)]
        institution: Option<String>,
        /// Account currency
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    /// List all accounts.
    List,
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a parse plan from a config file.
    New {
        /// Plan name, e.g. 'brokerage-export'
        name: String,
        /// Institution name
        #[arg(long)]
        institution: Option<String>,
        /// Path to plan config JSON (dialect, schema, transforms, validations)
        #[arg(long)]
        config: String,
    },
    /// Replace the plan's working copy from a config file.
    Edit {
        name: String,
        /// Path to plan config JSON
        #[arg(long)]
        config: String,
        /// Working-copy revision you last read (see `quill plan log`)
        #[arg(long)]
        revision: i64,
    },
    /// Snapshot the working copy into a new immutable version.
    Commit {
        name: String,
        /// Commit message
        #[arg(long)]
        message: String,
        /// Working-copy revision you last read
        #[arg(long)]
        revision: i64,
    },
    /// Fork a committed version into a new plan.
    Fork {
        /// Version ID to fork from (see `quill plan log`)
        version: i64,
        /// Name for the new plan
        name: String,
    },
    /// Show a plan's version chain and working-copy revision.
    Log { name: String },
}

#[derive(Subcommand)]
pub enum ReconcileCommands {
    /// Detect discrepancies without changing anything.
    Check {
        /// Account name
        account: String,
    },
    /// Run an investigate/apply reconciliation session.
    Run {
        /// Account name
        account: String,
        /// Path to assistant responses JSON, keyed by checkpoint date
        #[arg(long)]
        fixes: String,
        /// Only auto-apply high-confidence fixes; decline staged ones
        #[arg(long = "auto-only")]
        auto_only: bool,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Trace a ledger entry back to its source rows and plan version.
    Entry {
        /// Ledger entry ID
        id: i64,
    },
    /// List reconciliation sessions and applied fixes for an account.
    Sessions {
        /// Account name
        account: String,
    },
    /// List parse runs.
    Runs,
}
