//! CLI run subcommands: start, resume, show, list and workflows.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

use flowrun_core::workflow::RunHandle;
use flowrun_types::event::RunEvent;
use flowrun_types::run::{RunFilter, RunStatus, StepStatus, WorkflowRun};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Start / resume
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    workflow: &str,
    task: Option<&str>,
    context: Option<&str>,
    detach: bool,
    json: bool,
) -> Result<()> {
    let extra = parse_context(context)?;
    let events = state.orchestrator.subscribe();
    let handle = state
        .orchestrator
        .start_run(workflow, task, extra)
        .await
        .with_context(|| format!("Failed to start workflow '{workflow}'"))?;

    follow(events, handle, detach, json).await
}

pub async fn resume(
    state: &AppState,
    run_id: &str,
    context: Option<&str>,
    detach: bool,
    json: bool,
) -> Result<()> {
    let extra = parse_context(context)?;
    let events = state.orchestrator.subscribe();
    let handle = state
        .orchestrator
        .resume_run(run_id, extra)
        .await
        .with_context(|| format!("Failed to resume run {run_id}"))?;

    follow(events, handle, detach, json).await
}

/// Print the loop's events for `handle` until it stops, then the final run.
///
/// The run loop lives in this process, so even a detached invocation waits
/// for it before exiting; it just does not print step events.
async fn follow(
    mut events: Receiver<RunEvent>,
    handle: RunHandle,
    detach: bool,
    json: bool,
) -> Result<()> {
    let run_id = handle.run_id().clone();

    if detach {
        if json {
            println!(
                "{}",
                serde_json::to_string(&serde_json::json!({
                    "run_id": run_id.to_string(),
                    "status": handle.run().status.as_str(),
                }))?
            );
        } else {
            println!();
            println!(
                "  {} Run {} ({})",
                style("*").green().bold(),
                style(&run_id).cyan(),
                handle.run().status
            );
        }
    } else {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id() == &run_id => {
                    print_event(&event, json)?;
                    if event.ends_loop() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged, waiting for the run to stop");
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let run = handle.finished().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }

    if run.status == RunStatus::Failed {
        bail!(
            "Run {} failed: {}",
            run.id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_event(event: &RunEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let run = event.run();
    match event {
        RunEvent::RunStarted { .. } => println!(
            "\n  {} Started run {} ({} v{})\n",
            style(">").green().bold(),
            style(&run.id).cyan(),
            run.workflow_id,
            run.workflow_version
        ),
        RunEvent::RunResumed { .. } => println!(
            "\n  {} Resumed run {} at step '{}'\n",
            style(">").green().bold(),
            style(&run.id).cyan(),
            run.current_step
        ),
        RunEvent::StepStarted { step_id, .. } => {
            println!("  {} {}", style("-").dim(), step_id);
        }
        RunEvent::StepCompleted { step_id, .. } => {
            let duration = run
                .step(step_id)
                .and_then(|s| s.duration)
                .map(|d| format!(" ({d}s)"))
                .unwrap_or_default();
            println!("  {} {}{}", style("✓").green(), step_id, style(duration).dim());
        }
        RunEvent::StepFailed { step_id, .. } => {
            let error = run
                .step(step_id)
                .and_then(|s| s.error.as_deref())
                .unwrap_or("unknown error");
            println!("  {} {}: {}", style("✗").red(), step_id, error);
        }
        RunEvent::RunBlocked { .. } => println!(
            "\n  {} Blocked at '{}': {}",
            style("!").yellow().bold(),
            run.current_step,
            run.error.as_deref().unwrap_or("awaiting a human")
        ),
        RunEvent::RunCompleted { .. } => {
            println!("\n  {} Run completed", style("✓").green().bold());
        }
        RunEvent::RunFailed { .. } => println!(
            "\n  {} Run failed: {}",
            style("✗").red().bold(),
            run.error.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run = state
        .orchestrator
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(())
}

fn print_run(run: &WorkflowRun) {
    println!();
    println!("  Run:       {}", style(&run.id).cyan());
    println!("  Workflow:  {} v{}", run.workflow_id, run.workflow_version);
    if let Some(task_id) = &run.task_id {
        println!("  Task:      {task_id}");
    }
    println!("  Status:    {}", styled_status(run.status));
    println!("  Step:      {}", run.current_step);
    println!(
        "  Started:   {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &run.error {
        println!("  Error:     {}", style(error).red());
    }
    println!();
    println!("{}", step_table(run));
    println!();
}

fn step_table(run: &WorkflowRun) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Duration"),
            Cell::new("Output / Error"),
        ]);

    for step in &run.steps {
        let status_color = match step.status {
            StepStatus::Completed => Color::Green,
            StepStatus::Failed => Color::Red,
            StepStatus::Running => Color::Yellow,
            StepStatus::Skipped | StepStatus::Pending => Color::DarkGrey,
        };
        let detail = step
            .error
            .as_deref()
            .or(step.output.as_deref())
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(&step.step_id),
            Cell::new(step.status.as_str()).fg(status_color),
            Cell::new(step.retries),
            Cell::new(
                step.duration
                    .map(|d| format!("{d}s"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(detail),
        ]);
    }
    table
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Running => style(text).yellow(),
        RunStatus::Blocked => style(text).magenta(),
        RunStatus::Completed => style(text).green(),
        RunStatus::Failed => style(text).red(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, filter: RunFilter, json: bool) -> Result<()> {
    let runs = state.orchestrator.list_runs(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!(
            "  Start one with: {}",
            style("flowrun start <workflow>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Task"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Progress"),
            Cell::new("Started"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(&run.id),
            Cell::new(&run.workflow_id),
            Cell::new(run.task_id.as_deref().unwrap_or("-")),
            Cell::new(run.status.as_str()),
            Cell::new(&run.current_step),
            Cell::new(format!("{}/{}", run.settled_steps(), run.steps.len())),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

pub async fn workflows(state: &AppState, json: bool) -> Result<()> {
    let definitions = state.orchestrator.list_workflows().await?;

    if json {
        let out: Vec<_> = definitions
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "version": d.version,
                    "name": d.name,
                    "steps": d.steps.len(),
                    "agents": d.agents.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Add one at: {}",
            style(
                state
                    .data_dir
                    .join("workflows")
                    .join("<id>.yml")
                    .display()
                    .to_string()
            )
            .dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Name"),
            Cell::new("Steps"),
        ]);

    for d in &definitions {
        table.add_row(vec![
            Cell::new(&d.id),
            Cell::new(&d.version),
            Cell::new(d.name.as_deref().unwrap_or("-")),
            Cell::new(d.steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a `--context` argument, which must be a JSON object.
pub fn parse_context(raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw).context("Invalid JSON in --context")? {
        Value::Object(map) => Ok(Some(map)),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}
