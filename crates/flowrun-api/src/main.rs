//! flowrun CLI entry point.
//!
//! Binary name: `flowrun`
//!
//! Parses CLI arguments, loads `config.toml` from the data directory, sets up
//! tracing, wires the engine and dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use flowrun_infra::config::load_engine_config;
use flowrun_infra::filesystem::resolve_data_dir;
use flowrun_types::run::RunFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let config = load_engine_config(&data_dir).await;

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,flowrun=debug",
        _ => "trace",
    };
    flowrun_observe::init_tracing(filter, config.logging.json, config.logging.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(data_dir, config).await?;
    let result = dispatch(cli.command, &state, cli.json).await;

    flowrun_observe::shutdown_tracing();
    result
}

async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Start {
            workflow,
            task,
            context,
            detach,
        } => {
            cli::run::start(
                state,
                &workflow,
                task.as_deref(),
                context.as_deref(),
                detach,
                json,
            )
            .await
        }
        Commands::Resume {
            run_id,
            context,
            detach,
        } => cli::run::resume(state, &run_id, context.as_deref(), detach, json).await,
        Commands::Show { run_id } => cli::run::show(state, &run_id, json).await,
        Commands::List {
            task,
            workflow,
            status,
        } => {
            let filter = RunFilter {
                task_id: task,
                workflow_id: workflow,
                status,
            };
            cli::run::list(state, filter, json).await
        }
        Commands::Workflows => cli::run::workflows(state, json).await,
    }
}
