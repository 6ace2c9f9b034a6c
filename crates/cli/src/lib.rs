pub mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::executions::ExecutionQuery;

#[derive(Debug, Parser)]
#[command(
    name = "dealflow",
    about = "Dealflow operator CLI",
    long_about = "Apply migrations, inspect configuration, run workflow passes and inspect or replay playbook executions.",
    after_help = "Examples:\n  dealflow migrate\n  dealflow tick\n  dealflow executions --status failed\n  dealflow replay <execution-id> --actor ops@acme.mx"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run one playbook executor pass and one reminder pass, then exit")]
    Tick,
    #[command(about = "List playbook step executions from the ledger")]
    Executions {
        #[arg(long, help = "Only rows for this tenant")]
        tenant: Option<String>,
        #[arg(long, help = "Only rows for this opportunity")]
        opportunity: Option<String>,
        #[arg(long, help = "pending, executing, completed or failed")]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    #[command(about = "Show one execution with its full transition history")]
    History { execution_id: String },
    #[command(about = "Return a failed execution to pending so the next pass retries it")]
    Replay {
        execution_id: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_logging() {
    let filter = EnvFilter::try_from_env("DEALFLOW_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Tick => commands::tick::run(),
        Command::Executions { tenant, opportunity, status, limit } => {
            commands::executions::list(ExecutionQuery { tenant, opportunity, status, limit })
        }
        Command::History { execution_id } => commands::executions::history(&execution_id),
        Command::Replay { execution_id, actor } => commands::replay::run(&execution_id, &actor),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
