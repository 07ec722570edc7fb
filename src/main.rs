use std::process::ExitCode;

use clap::{Parser, Subcommand};

use foreman::commands::doctor::DoctorArgs;
use foreman::commands::init::InitArgs;
use foreman::commands::reconcile::ReconcileArgs;
use foreman::commands::run::RunArgs;
use foreman::commands::status::StatusArgs;
use foreman::commands::unassign::UnassignArgs;
use foreman::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    version,
    about = "Assign project-board issues to supervised worker agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduling loop until interrupted
    Run(RunArgs),
    /// Show local assignments and capacity
    Status(StatusArgs),
    /// Reconcile the local ledger with the board once
    Reconcile(ReconcileArgs),
    /// Stop a worker and drop its assignment
    Unassign(UnassignArgs),
    /// Validate config, credentials and worker binaries
    Doctor(DoctorArgs),
    /// Create .foreman.toml for a project
    Init(InitArgs),
    /// Print the JSON Schema for .foreman.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Status(_) => "status",
            Self::Reconcile(_) => "reconcile",
            Self::Unassign(_) => "unassign",
            Self::Doctor(_) => "doctor",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Reconcile(args) => args.execute(),
        Commands::Unassign(args) => args.execute(),
        Commands::Doctor(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
