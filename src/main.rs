mod assistant;
mod audit;
mod blobstore;
mod checkpoint;
mod cli;
mod db;
mod detect;
mod error;
mod evaluate;
mod extract;
mod fixes;
mod fmt;
mod materialize;
mod models;
mod money;
mod plan;
mod reconcile;
mod run;
mod settings;

use clap::Parser;

use cli::{AccountsCommands, AuditCommands, Cli, Commands, PlanCommands, ReconcileCommands};

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Accounts { command } => match command {
            AccountsCommands::Add {
                name,
                institution,
                currency,
            } => cli::accounts::add(&name, institution.as_deref(), &currency),
            AccountsCommands::List => cli::accounts::list(),
        },
        Commands::Plan { command } => match command {
            PlanCommands::New {
                name,
                institution,
                config,
            } => cli::plan::new(&name, institution.as_deref(), &config),
            PlanCommands::Edit {
                name,
                config,
                revision,
            } => cli::plan::edit(&name, &config, revision),
            PlanCommands::Commit {
                name,
                message,
                revision,
            } => cli::plan::commit(&name, &message, revision),
            PlanCommands::Fork { version, name } => cli::plan::fork(version, &name),
            PlanCommands::Log { name } => cli::plan::log(&name),
        },
        Commands::Import {
            file,
            account,
            plan,
            preview,
        } => cli::import::run_import(&file, &account, &plan, preview),
        Commands::Resume { run_id } => cli::import::resume(run_id),
        Commands::Reconcile { command } => match command {
            ReconcileCommands::Check { account } => cli::reconcile::check(&account),
            ReconcileCommands::Run {
                account,
                fixes,
                auto_only,
            } => cli::reconcile::run(&account, &fixes, auto_only),
        },
        Commands::Audit { command } => match command {
            AuditCommands::Entry { id } => cli::audit::entry(id),
            AuditCommands::Sessions { account } => cli::audit::sessions(&account),
            AuditCommands::Runs => cli::audit::runs(),
        },
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
