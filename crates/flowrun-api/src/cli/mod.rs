//! CLI command definitions for the `flowrun` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowrun_types::run::RunStatus;

/// Run multi-step agent workflows.
#[derive(Parser)]
#[command(name = "flowrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $FLOWRUN_DATA_DIR, then ~/.flowrun).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a run of a workflow and follow it until it stops.
    Start {
        /// Workflow ID (file name under workflows/).
        workflow: String,

        /// Task ID to load into `context.task`.
        #[arg(long)]
        task: Option<String>,

        /// Extra context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Print the run ID without streaming step events.
        #[arg(long)]
        detach: bool,
    },

    /// Resume a blocked run.
    Resume {
        /// Run ID.
        run_id: String,

        /// Context to merge before resuming, as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Print the run ID without streaming step events.
        #[arg(long)]
        detach: bool,
    },

    /// Show a run and its steps.
    Show {
        /// Run ID.
        run_id: String,
    },

    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs for this task.
        #[arg(long)]
        task: Option<String>,

        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only runs in this status (running, blocked, completed, failed).
        #[arg(long)]
        status: Option<RunStatus>,
    },

    /// List available workflow definitions.
    Workflows,
}
