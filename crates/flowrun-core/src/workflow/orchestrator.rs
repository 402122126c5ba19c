//! Run orchestrator: starts, drives and resumes workflow runs.
//!
//! `RunOrchestrator` owns admission control, the single-writer registry of
//! runs with a live loop, and the event bus. Each admitted run is driven on
//! its own tokio task by a `RunDriver`, which executes steps strictly in
//! order, persists after every state change and only then publishes the
//! matching `RunEvent`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowrun_types::error::StoreError;
use flowrun_types::event::RunEvent;
use flowrun_types::run::{
    RunContext, RunFilter, RunId, RunStatus, StepRun, StepStatus, WorkflowRun,
};
use flowrun_types::workflow::WorkflowDefinition;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;

use crate::event::EventBus;
use crate::repository::RunStore;
use crate::service::agent::BoxAgentExecutor;
use crate::service::definition::DefinitionSource;
use crate::service::task::{TaskError, TaskSource};

use super::admission::AdmissionControl;
use super::definition::{DefinitionError, validate_definition};
use super::failure::{self, FailureOutcome, PolicyError};
use super::step_executor::{StepError, StepExecutor};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by orchestrator operations and recorded on failed runs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("step '{step_id}' failed: {source}")]
    Step { step_id: String, source: StepError },

    #[error("definition source error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("task source error: {0}")]
    Task(#[from] TaskError),

    /// The run's task ended without returning a snapshot.
    #[error("run task ended abnormally: {0}")]
    Aborted(String),
}

impl From<PolicyError> for OrchestratorError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnknownRedirectTarget { .. } => OrchestratorError::NotFound(e.to_string()),
            PolicyError::AgentEscalation { .. } => OrchestratorError::NotImplemented(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A started (or resumed) run.
///
/// Holds the snapshot persisted before the loop began and the loop's task.
/// Dropping the handle detaches the task; the run keeps going.
#[derive(Debug)]
pub struct RunHandle {
    run: WorkflowRun,
    task: JoinHandle<WorkflowRun>,
}

impl RunHandle {
    /// The snapshot persisted when the run was started or resumed.
    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.id
    }

    /// Wait for the loop to stop (completed, failed or blocked) and return
    /// the final snapshot.
    pub async fn finished(self) -> Result<WorkflowRun, OrchestratorError> {
        self.task
            .await
            .map_err(|e| OrchestratorError::Aborted(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Single-writer registry
// ---------------------------------------------------------------------------

/// Marks a run as being driven by a loop; released on drop.
struct ActiveRunGuard {
    active: Arc<DashMap<RunId, ()>>,
    run_id: RunId,
}

impl ActiveRunGuard {
    fn claim(active: &Arc<DashMap<RunId, ()>>, run_id: &RunId) -> Option<Self> {
        match active.entry(run_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    active: Arc::clone(active),
                    run_id: run_id.clone(),
                })
            }
        }
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Public entry point of the run engine.
///
/// Generic over `S: RunStore` and `D: DefinitionSource` for storage flexibility.
pub struct RunOrchestrator<S: RunStore, D: DefinitionSource> {
    definitions: Arc<D>,
    tasks: Option<Arc<dyn TaskSource>>,
    admission: AdmissionControl,
    active: Arc<DashMap<RunId, ()>>,
    driver: RunDriver<S>,
}

impl<S, D> RunOrchestrator<S, D>
where
    S: RunStore + 'static,
    D: DefinitionSource,
{
    pub fn new(
        store: Arc<S>,
        definitions: Arc<D>,
        agents: BoxAgentExecutor,
        admission: AdmissionControl,
        event_bus: EventBus,
    ) -> Self {
        Self {
            definitions,
            tasks: None,
            admission,
            active: Arc::new(DashMap::new()),
            driver: RunDriver {
                store,
                steps: StepExecutor::new(agents),
                events: event_bus,
                max_redirects: 3,
            },
        }
    }

    /// Resolve `task_id`s through this source when starting runs.
    pub fn with_task_source(mut self, tasks: Arc<dyn TaskSource>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Bound on redirect-retries per failing step.
    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.driver.max_redirects = max_redirects;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.driver.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.driver.events.subscribe()
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Start a run of `workflow_id` and return once it is persisted.
    ///
    /// The context is seeded from the definition variables, then `task`,
    /// then `extra_context`, then `workflow` and `run` metadata.
    pub async fn start_run(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
        extra_context: Option<Map<String, Value>>,
    ) -> Result<RunHandle, OrchestratorError> {
        let permit = self.admit()?;

        let definition = self
            .definitions
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow '{workflow_id}'")))?;
        validate_definition(&definition)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        let task = match (task_id, &self.tasks) {
            (Some(task_id), Some(tasks)) => Some(
                tasks
                    .get_task(task_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("task '{task_id}'")))?,
            ),
            _ => None,
        };

        let run = build_run(&definition, task_id, task, extra_context);

        self.driver.store.save(&run).await?;
        self.driver
            .store
            .snapshot_definition(&run.id, &definition)
            .await?;

        let guard = ActiveRunGuard::claim(&self.active, &run.id).ok_or_else(|| {
            OrchestratorError::Validation(format!("run {} is already executing", run.id))
        })?;

        tracing::info!(
            run_id = %run.id,
            workflow = %definition.id,
            version = %definition.version,
            task_id = task_id.unwrap_or("-"),
            "starting workflow run"
        );
        self.driver
            .events
            .publish(RunEvent::RunStarted { run: run.clone() });

        Ok(self.spawn(run, definition, permit, guard))
    }

    /// Resume a blocked run, optionally merging extra context first.
    ///
    /// The run continues with the definition snapshotted when it started.
    pub async fn resume_run(
        &self,
        run_id: &str,
        resume_context: Option<Map<String, Value>>,
    ) -> Result<RunHandle, OrchestratorError> {
        let run_id = RunId::parse(run_id).map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        // Claim before reading so the blocked check and the status flip below
        // happen under the single-writer claim.
        let guard = ActiveRunGuard::claim(&self.active, &run_id).ok_or_else(|| {
            OrchestratorError::Validation(format!("run {run_id} is already executing"))
        })?;

        let mut run = self
            .driver
            .store
            .get(&run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id}")))?;

        if run.status != RunStatus::Blocked {
            return Err(OrchestratorError::Validation(format!(
                "run {run_id} is not blocked (status: {})",
                run.status
            )));
        }

        let permit = self.admit()?;

        let definition = self
            .driver
            .store
            .load_definition_snapshot(&run_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("definition snapshot for run {run_id}"))
            })?;

        if let Some(extra) = resume_context {
            run.context.merge(extra);
        }
        run.status = RunStatus::Running;
        run.error = None;
        self.driver.store.save(&run).await?;

        tracing::info!(run_id = %run_id, step_id = %run.current_step, "resuming workflow run");
        self.driver
            .events
            .publish(RunEvent::RunResumed { run: run.clone() });

        Ok(self.spawn(run, definition, permit, guard))
    }

    /// Load a run by its externally supplied ID.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, OrchestratorError> {
        let run_id = RunId::parse(run_id).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        Ok(self.driver.store.get(&run_id).await?)
    }

    /// List runs, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, OrchestratorError> {
        Ok(self.driver.store.list(filter).await?)
    }

    /// Definitions available to `start_run`.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, OrchestratorError> {
        Ok(self.definitions.list_workflows().await?)
    }

    fn admit(&self) -> Result<OwnedSemaphorePermit, OrchestratorError> {
        self.admission.try_admit().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "maximum concurrent workflow runs ({}) exceeded; wait for active runs to complete",
                self.admission.limit()
            ))
        })
    }

    fn spawn(
        &self,
        run: WorkflowRun,
        definition: WorkflowDefinition,
        permit: OwnedSemaphorePermit,
        guard: ActiveRunGuard,
    ) -> RunHandle {
        let driver = self.driver.clone();
        let events = self.driver.events.clone();
        let snapshot = run.clone();
        let task = tokio::spawn(async move {
            let run = driver.drive(run, definition).await;
            // Slot and claim are free before subscribers learn the loop stopped.
            drop(guard);
            drop(permit);
            if let Some(event) = stop_event(&run) {
                events.publish(event);
            }
            run
        });
        RunHandle {
            run: snapshot,
            task,
        }
    }
}

/// The event announcing why a loop stopped, if it did.
fn stop_event(run: &WorkflowRun) -> Option<RunEvent> {
    match run.status {
        RunStatus::Completed => Some(RunEvent::RunCompleted { run: run.clone() }),
        RunStatus::Failed => Some(RunEvent::RunFailed { run: run.clone() }),
        RunStatus::Blocked => Some(RunEvent::RunBlocked { run: run.clone() }),
        RunStatus::Running => None,
    }
}

/// Build a fresh run with every step pending.
fn build_run(
    definition: &WorkflowDefinition,
    task_id: Option<&str>,
    task: Option<Value>,
    extra_context: Option<Map<String, Value>>,
) -> WorkflowRun {
    let id = RunId::generate();
    let started_at = Utc::now();

    let mut context = RunContext::from_map(definition.variables.clone());
    if let Some(task) = task {
        context.insert("task", task);
    }
    if let Some(extra) = extra_context {
        context.merge(extra);
    }
    context.insert(
        "workflow",
        json!({"id": definition.id, "version": definition.version}),
    );
    context.insert("run", json!({"id": id, "startedAt": started_at}));

    WorkflowRun {
        id,
        workflow_id: definition.id.clone(),
        workflow_version: definition.version.clone(),
        task_id: task_id.map(str::to_string),
        status: RunStatus::Running,
        current_step: definition
            .steps
            .first()
            .map(|s| s.id.clone())
            .unwrap_or_default(),
        context,
        steps: definition
            .steps
            .iter()
            .map(|s| StepRun::pending(&s.id))
            .collect(),
        started_at,
        completed_at: None,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// RunDriver
// ---------------------------------------------------------------------------

/// Drives one run's step queue. Cloned into each spawned run task.
struct RunDriver<S> {
    store: Arc<S>,
    steps: StepExecutor,
    events: EventBus,
    max_redirects: u32,
}

impl<S> Clone for RunDriver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            steps: self.steps.clone(),
            events: self.events.clone(),
            max_redirects: self.max_redirects,
        }
    }
}

impl<S: RunStore> RunDriver<S> {
    /// Run the loop until it stops; errors mark the run failed. The caller
    /// publishes the stop event.
    async fn drive(self, mut run: WorkflowRun, definition: WorkflowDefinition) -> WorkflowRun {
        if let Err(e) = self.execute(&mut run, &definition).await {
            tracing::error!(run_id = %run.id, error = %e, "workflow run failed");
            run.status = RunStatus::Failed;
            run.error = Some(e.to_string());
            run.completed_at = Some(Utc::now());
            if let Err(save_err) = self.store.save(&run).await {
                tracing::error!(
                    run_id = %run.id,
                    error = %save_err,
                    "failed to persist failed run"
                );
            }
        }
        run
    }

    async fn execute(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        let mut queue: VecDeque<String> = definition
            .steps
            .iter()
            .filter(|s| run.step(&s.id).is_some_and(|r| !r.status.is_settled()))
            .map(|s| s.id.clone())
            .collect();

        while let Some(step_id) = queue.pop_front() {
            let step = definition.step(&step_id).ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "step '{step_id}' in workflow '{}'",
                    definition.id
                ))
            })?;

            // A redirect may requeue steps that have since settled.
            if step_run_mut(run, &step_id)?.status.is_settled() {
                continue;
            }

            run.current_step = step_id.clone();
            self.persist(run).await?;
            self.events.publish(RunEvent::StepStarted {
                step_id: step_id.clone(),
                run: run.clone(),
            });

            {
                let step_run = step_run_mut(run, &step_id)?;
                step_run.status = StepStatus::Running;
                step_run.started_at = Some(Utc::now());
            }
            self.persist(run).await?;

            match self.steps.execute(&*self.store, step, run, definition).await {
                Ok(result) => {
                    let completed_at = Utc::now();
                    let step_run = step_run_mut(run, &step_id)?;
                    step_run.status = StepStatus::Completed;
                    step_run.completed_at = Some(completed_at);
                    step_run.duration = step_run
                        .started_at
                        .map(|started| (completed_at - started).num_seconds().max(0) as u64);
                    step_run.output = Some(result.output_ref);
                    step_run.error = None;
                    let duration = step_run.duration;
                    run.context.insert(step_id.clone(), result.output);

                    self.persist(run).await?;
                    tracing::info!(
                        run_id = %run.id,
                        step_id = %step_id,
                        duration_secs = duration.unwrap_or(0),
                        "step completed"
                    );
                    self.events.publish(RunEvent::StepCompleted {
                        step_id: step_id.clone(),
                        run: run.clone(),
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    let step_run = step_run_mut(run, &step_id)?;
                    step_run.status = StepStatus::Failed;
                    step_run.error = Some(message.clone());
                    step_run.completed_at = Some(Utc::now());

                    self.persist(run).await?;
                    tracing::warn!(
                        run_id = %run.id,
                        step_id = %step_id,
                        error = %message,
                        "step failed"
                    );
                    self.events.publish(RunEvent::StepFailed {
                        step_id: step_id.clone(),
                        run: run.clone(),
                    });

                    let action = failure::resolve(
                        step.on_fail.as_ref(),
                        step_run_mut(run, &step_id)?,
                        definition,
                        self.max_redirects,
                    )?;
                    match failure::apply(action, run, &mut queue, definition, &step_id, &message) {
                        FailureOutcome::Continue => self.persist(run).await?,
                        FailureOutcome::Blocked => {
                            self.persist(run).await?;
                            tracing::warn!(
                                run_id = %run.id,
                                step_id = %step_id,
                                reason = run.error.as_deref().unwrap_or_default(),
                                "workflow run blocked, awaiting resume"
                            );
                            return Ok(());
                        }
                        FailureOutcome::Unhandled => {
                            return Err(OrchestratorError::Step {
                                step_id,
                                source: err,
                            });
                        }
                    }
                }
            }
        }

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        self.persist(run).await?;
        tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow_id,
            steps = run.steps.len(),
            "workflow run completed"
        );
        Ok(())
    }

    async fn persist(&self, run: &WorkflowRun) -> Result<(), OrchestratorError> {
        self.store.save(run).await?;
        tracing::debug!(run_id = %run.id, status = %run.status, step = %run.current_step, "run persisted");
        Ok(())
    }
}

fn step_run_mut<'a>(
    run: &'a mut WorkflowRun,
    step_id: &str,
) -> Result<&'a mut StepRun, OrchestratorError> {
    let run_id = run.id.clone();
    run.step_mut(step_id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("step run '{step_id}' in run {run_id}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRunStore, ProgressAppend};
    use crate::service::agent::{AgentError, AgentExecutor, AgentInvocation, EchoAgentExecutor};
    use crate::workflow::definition::parse_workflow_yaml;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    // -- Test collaborators --------------------------------------------------

    struct StaticDefinitions(HashMap<String, WorkflowDefinition>);

    impl StaticDefinitions {
        fn from_yaml(docs: &[&str]) -> Arc<Self> {
            let defs = docs
                .iter()
                .map(|yaml| {
                    let def = parse_workflow_yaml(yaml).unwrap();
                    (def.id.clone(), def)
                })
                .collect();
            Arc::new(Self(defs))
        }
    }

    impl DefinitionSource for StaticDefinitions {
        async fn load_workflow(
            &self,
            workflow_id: &str,
        ) -> Result<Option<WorkflowDefinition>, DefinitionError> {
            Ok(self.0.get(workflow_id).cloned())
        }

        async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
            Ok(self.0.values().cloned().collect())
        }
    }

    struct StaticTasks(HashMap<String, Value>);

    impl TaskSource for StaticTasks {
        fn get_task<'a>(
            &'a self,
            task_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, TaskError>> + Send + 'a>> {
            Box::pin(async move { Ok(self.0.get(task_id).cloned()) })
        }
    }

    /// Fails the first `failures` attempts of each listed step, then echoes.
    #[derive(Default)]
    struct ScriptedAgent {
        failures: HashMap<String, usize>,
        attempts: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedAgent {
        fn failing(step_id: &str, failures: usize) -> Self {
            Self {
                failures: HashMap::from([(step_id.to_string(), failures)]),
                ..Default::default()
            }
        }
    }

    impl AgentExecutor for ScriptedAgent {
        async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(invocation.step_id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let limit = self.failures.get(&invocation.step_id).copied().unwrap_or(0);
            if attempt <= limit {
                return Err(AgentError::Failed(format!(
                    "{} attempt {attempt} failed",
                    invocation.step_id
                )));
            }
            EchoAgentExecutor.invoke(invocation).await
        }
    }

    /// Blocks every invocation until the test releases the gate.
    struct GatedAgent {
        gate: Arc<Semaphore>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl AgentExecutor for GatedAgent {
        async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| AgentError::Failed(e.to_string()))?;
            permit.forget();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            EchoAgentExecutor.invoke(invocation).await
        }
    }

    /// Fails the first attempt of `step_id`, then holds later attempts at the gate.
    struct FailThenHold {
        step_id: String,
        gate: Semaphore,
        attempts: AtomicUsize,
    }

    impl FailThenHold {
        fn new(step_id: &str) -> Self {
            Self {
                step_id: step_id.to_string(),
                gate: Semaphore::new(0),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl AgentExecutor for FailThenHold {
        async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
            if invocation.step_id == self.step_id {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AgentError::Failed("first attempt failed".to_string()));
                }
                self.gate
                    .acquire()
                    .await
                    .map_err(|e| AgentError::Failed(e.to_string()))?
                    .forget();
            }
            EchoAgentExecutor.invoke(invocation).await
        }
    }

    /// Memory store whose next `get`, once armed, holds its result until released.
    struct StallingReads {
        inner: MemoryRunStore,
        armed: AtomicBool,
        gate: Semaphore,
    }

    impl StallingReads {
        fn new() -> Self {
            Self {
                inner: MemoryRunStore::default(),
                armed: AtomicBool::new(false),
                gate: Semaphore::new(0),
            }
        }

        fn stall_next_get(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    impl RunStore for StallingReads {
        async fn save(&self, run: &WorkflowRun) -> Result<(), StoreError> {
            self.inner.save(run).await
        }

        async fn get(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError> {
            let run = self.inner.get(run_id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let _held = self.gate.acquire().await;
            }
            Ok(run)
        }

        async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
            self.inner.list(filter).await
        }

        async fn snapshot_definition(
            &self,
            run_id: &RunId,
            definition: &WorkflowDefinition,
        ) -> Result<(), StoreError> {
            self.inner.snapshot_definition(run_id, definition).await
        }

        async fn load_definition_snapshot(
            &self,
            run_id: &RunId,
        ) -> Result<Option<WorkflowDefinition>, StoreError> {
            self.inner.load_definition_snapshot(run_id).await
        }

        async fn save_step_output(
            &self,
            run_id: &RunId,
            step_id: &str,
            raw: &str,
        ) -> Result<String, StoreError> {
            self.inner.save_step_output(run_id, step_id, raw).await
        }

        async fn load_progress(&self, run_id: &RunId) -> Result<Option<String>, StoreError> {
            self.inner.load_progress(run_id).await
        }

        async fn append_progress(
            &self,
            run_id: &RunId,
            entry: &str,
        ) -> Result<ProgressAppend, StoreError> {
            self.inner.append_progress(run_id, entry).await
        }
    }

    /// Shares an executor between the orchestrator and the test body.
    struct Shared<T>(Arc<T>);

    impl<T: AgentExecutor> AgentExecutor for Shared<T> {
        async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
            self.0.invoke(invocation).await
        }
    }

    const THREE_STEPS: &str = r#"
id: three-steps
version: 1
variables:
  repo: flowrun
steps:
  - id: plan
    type: agent
    agent: planner
    input: "Plan {{task.title}} in {{repo}}"
  - id: build
    type: agent
    agent: builder
    input: "Build from {{steps.plan.output}}"
  - id: review
    type: agent
    agent: reviewer
    acceptance_criteria: ["STATUS: done"]
"#;

    const RETRY_TWICE: &str = r#"
id: retry-twice
steps:
  - id: flaky
    type: agent
    agent: worker
    on_fail:
      retry: 2
"#;

    const ESCALATE_HUMAN: &str = r#"
id: escalate-human
steps:
  - id: first
    type: agent
    agent: worker
  - id: risky
    type: agent
    agent: worker
    on_fail:
      escalate_to: human
      escalate_message: Needs review
  - id: last
    type: agent
    agent: worker
"#;

    const ESCALATE_SKIP: &str = r#"
id: escalate-skip
steps:
  - id: optional
    type: agent
    agent: worker
    on_fail:
      escalate_to: skip
  - id: required
    type: agent
    agent: worker
"#;

    const ESCALATE_AGENT: &str = r#"
id: escalate-agent
steps:
  - id: only
    type: agent
    agent: worker
    on_fail:
      escalate_to: "agent:reviewer"
"#;

    const REDIRECT: &str = r#"
id: redirect
steps:
  - id: implement
    type: agent
    agent: dev
    input: "Implement after {{_retryContext.failedStep}}: {{_retryContext.error}}"
  - id: verify
    type: agent
    agent: qa
    on_fail:
      retry_step: implement
"#;

    const RESERVED: &str = r#"
id: reserved
steps:
  - id: wait
    type: gate
"#;

    fn orchestrator<A: AgentExecutor + 'static>(
        agent: A,
        limit: usize,
    ) -> RunOrchestrator<MemoryRunStore, StaticDefinitions> {
        orchestrator_over(Arc::new(MemoryRunStore::default()), agent, limit)
    }

    fn orchestrator_over<S: RunStore + 'static, A: AgentExecutor + 'static>(
        store: Arc<S>,
        agent: A,
        limit: usize,
    ) -> RunOrchestrator<S, StaticDefinitions> {
        RunOrchestrator::new(
            store,
            StaticDefinitions::from_yaml(&[
                THREE_STEPS,
                RETRY_TWICE,
                ESCALATE_HUMAN,
                ESCALATE_SKIP,
                ESCALATE_AGENT,
                REDIRECT,
                RESERVED,
            ]),
            BoxAgentExecutor::new(agent),
            AdmissionControl::new(limit),
            EventBus::new(256),
        )
    }

    fn statuses(run: &WorkflowRun) -> Vec<StepStatus> {
        run.steps.iter().map(|s| s.status).collect()
    }

    // -- Happy path ------------------------------------------------------------

    #[tokio::test]
    async fn test_sequential_steps_complete_in_order() {
        let orch = orchestrator(EchoAgentExecutor, 10)
            .with_task_source(Arc::new(StaticTasks(HashMap::from([(
                "task_1".to_string(),
                json!({"title": "Fix bug"}),
            )]))));
        let mut events = orch.subscribe();

        let handle = orch
            .start_run("three-steps", Some("task_1"), None)
            .await
            .unwrap();
        assert_eq!(handle.run().status, RunStatus::Running);
        assert_eq!(handle.run().current_step, "plan");
        assert!(handle.run().steps.iter().all(|s| s.status == StepStatus::Pending));

        let run = handle.finished().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(statuses(&run), vec![StepStatus::Completed; 3]);
        for step in ["plan", "build", "review"] {
            assert!(run.context.contains_key(step), "missing context for {step}");
            assert!(run.step(step).unwrap().output.is_some());
        }
        let plan = run.context.get("plan").unwrap().as_str().unwrap();
        assert!(plan.contains("Plan Fix bug in flowrun"));
        let build = run.context.get("build").unwrap().as_str().unwrap();
        assert!(build.contains("Build from Agent planner executed step plan"));
        assert_eq!(run.context.lookup("workflow.id"), Some(&json!("three-steps")));
        assert_eq!(run.context.lookup("run.id"), Some(&json!(run.id.as_str())));
        assert!(run.context.lookup("run.startedAt").is_some());

        let stored = orch.get_run(run.id.as_str()).await.unwrap().unwrap();
        assert_eq!(stored, run);

        let mut started_steps = Vec::new();
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let RunEvent::StepStarted { step_id, .. } = &event {
                started_steps.push(step_id.clone());
            }
            last = Some(event.kind());
        }
        assert_eq!(started_steps, vec!["plan", "build", "review"]);
        assert_eq!(last, Some("run_completed"));
    }

    #[tokio::test]
    async fn test_extra_context_overrides_variables() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let mut extra = Map::new();
        extra.insert("repo".to_string(), json!("other-repo"));

        let run = orch
            .start_run("three-steps", None, Some(extra))
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        let plan = run.context.get("plan").unwrap().as_str().unwrap();
        assert!(plan.contains("in other-repo"));
        assert!(plan.contains("{{task.title}}"));
    }

    // -- Start validation ------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let err = orch.start_run("missing", None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert_eq!(orch.admission().active(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let orch = orchestrator(EchoAgentExecutor, 10)
            .with_task_source(Arc::new(StaticTasks(HashMap::new())));
        let err = orch
            .start_run("three-steps", Some("task_404"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(ref m) if m.contains("task_404")));
        assert!(orch.list_runs(&RunFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_id_without_task_source_is_recorded() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let run = orch
            .start_run("three-steps", Some("task_9"), None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(run.task_id.as_deref(), Some("task_9"));
        assert!(!run.context.contains_key("task"));
    }

    #[tokio::test]
    async fn test_admission_ceiling_rejects_excess_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let agent = Arc::new(GatedAgent {
            gate: Arc::clone(&gate),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orch = orchestrator(Shared(Arc::clone(&agent)), 2);

        let first = orch.start_run("retry-twice", None, None).await.unwrap();
        let second = orch.start_run("retry-twice", None, None).await.unwrap();
        let err = orch.start_run("retry-twice", None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ref m) if m.contains("(2)")));
        assert_eq!(orch.admission().active(), 2);

        gate.add_permits(2);
        assert_eq!(first.finished().await.unwrap().status, RunStatus::Completed);
        assert_eq!(second.finished().await.unwrap().status, RunStatus::Completed);
        assert!(agent.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(orch.admission().active(), 0);

        // Slots are released once loops finish.
        gate.add_permits(1);
        let third = orch.start_run("retry-twice", None, None).await.unwrap();
        assert_eq!(third.finished().await.unwrap().status, RunStatus::Completed);
    }

    // -- Failure policy --------------------------------------------------------

    #[tokio::test]
    async fn test_retries_exhausted_fails_run() {
        let orch = orchestrator(ScriptedAgent::failing("flaky", 3), 10);
        let run = orch
            .start_run("retry-twice", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let flaky = run.step("flaky").unwrap();
        assert_eq!(flaky.retries, 2);
        assert_eq!(flaky.status, StepStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("flaky attempt 3 failed"));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let orch = orchestrator(ScriptedAgent::failing("flaky", 2), 10);
        let run = orch
            .start_run("retry-twice", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let flaky = run.step("flaky").unwrap();
        assert_eq!(flaky.retries, 2);
        assert_eq!(flaky.status, StepStatus::Completed);
        assert!(flaky.error.is_none());
    }

    #[tokio::test]
    async fn test_escalate_human_blocks_then_resume_reattempts() {
        let orch = orchestrator(ScriptedAgent::failing("risky", 1), 10);
        let mut events = orch.subscribe();
        let blocked = orch
            .start_run("escalate-human", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(blocked.status, RunStatus::Blocked);
        assert_eq!(blocked.current_step, "risky");
        assert_eq!(blocked.error.as_deref(), Some("Needs review"));
        assert_eq!(
            statuses(&blocked),
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Pending]
        );
        assert!(blocked.completed_at.is_none());
        assert_eq!(orch.admission().active(), 0);

        let mut saw_blocked = false;
        while let Ok(event) = events.try_recv() {
            saw_blocked |= matches!(event, RunEvent::RunBlocked { .. });
        }
        assert!(saw_blocked);

        let mut resume_ctx = Map::new();
        resume_ctx.insert("approved_by".to_string(), json!("alice"));
        let handle = orch
            .resume_run(blocked.id.as_str(), Some(resume_ctx))
            .await
            .unwrap();
        assert_eq!(handle.run().status, RunStatus::Running);
        assert!(handle.run().error.is_none());

        let run = handle.finished().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(statuses(&run), vec![StepStatus::Completed; 3]);
        assert_eq!(run.context.get("approved_by"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn test_escalate_skip_continues() {
        let orch = orchestrator(ScriptedAgent::failing("optional", 1), 10);
        let run = orch
            .start_run("escalate-skip", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Skipped, StepStatus::Completed]
        );
        assert!(!run.context.contains_key("optional"));
    }

    #[tokio::test]
    async fn test_escalate_to_agent_is_not_implemented() {
        let orch = orchestrator(ScriptedAgent::failing("only", 1), 10);
        let run = orch
            .start_run("escalate-agent", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().starts_with("not implemented"));
    }

    #[tokio::test]
    async fn test_redirect_reruns_chain_and_is_bounded() {
        // verify fails twice, each time redirecting back to implement.
        let orch = orchestrator(ScriptedAgent::failing("verify", 2), 10);
        let run = orch
            .start_run("redirect", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("verify").unwrap().redirects, 2);
        assert_eq!(
            run.context.lookup("_retryContext.failedStep"),
            Some(&json!("verify"))
        );
        assert_eq!(run.context.lookup("_retryContext.retries"), Some(&json!(0)));
        // The redirect target sees why it is running again.
        let implement = run.context.get("implement").unwrap().as_str().unwrap();
        assert!(implement.contains("Implement after verify: "));
        assert!(implement.contains("verify attempt 2 failed"));

        // More failures than the redirect bound: the run fails.
        let orch = orchestrator(ScriptedAgent::failing("verify", 10), 10).with_max_redirects(1);
        let run = orch
            .start_run("redirect", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step("verify").unwrap().redirects, 1);
    }

    #[tokio::test]
    async fn test_reserved_step_kind_fails_run() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let run = orch
            .start_run("reserved", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("gate steps are not implemented"));
    }

    // -- Resume and lookup validation ------------------------------------------

    #[tokio::test]
    async fn test_resume_claims_run_before_reading_it() {
        let agent = Arc::new(ScriptedAgent::failing("risky", 1));
        let store = Arc::new(StallingReads::new());
        let orch = orchestrator_over(Arc::clone(&store), Shared(Arc::clone(&agent)), 10);
        let blocked = orch
            .start_run("escalate-human", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(blocked.status, RunStatus::Blocked);
        let id = blocked.id.as_str();

        // The first resume holds its read open while a second one runs to
        // the end. Only one of them may drive the run.
        store.stall_next_get();
        let (first, second) = tokio::join!(orch.resume_run(id, None), async {
            let second = match orch.resume_run(id, None).await {
                Ok(handle) => Ok(handle.finished().await.unwrap()),
                Err(e) => Err(e),
            };
            store.release();
            second
        });

        let err = second.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ref m) if m.contains("already executing")));
        let run = first.unwrap().finished().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let attempts = agent.attempts.lock().unwrap();
        assert_eq!(attempts.get("risky"), Some(&2));
        assert_eq!(attempts.get("last"), Some(&1));
    }

    #[tokio::test]
    async fn test_resume_rejected_while_loop_is_running() {
        let agent = Arc::new(FailThenHold::new("risky"));
        let orch = orchestrator(Shared(Arc::clone(&agent)), 10);
        let blocked = orch
            .start_run("escalate-human", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        let id = blocked.id.as_str();

        let handle = orch.resume_run(id, None).await.unwrap();
        while agent.attempts.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let err = orch.resume_run(id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ref m) if m.contains("already executing")));
        let stored = orch.get_run(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);

        agent.gate.add_permits(1);
        let run = handle.finished().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(agent.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_accepted_as_soon_as_blocked_event_arrives() {
        let orch = orchestrator(ScriptedAgent::failing("risky", 1), 1);
        let mut events = orch.subscribe();
        let handle = orch.start_run("escalate-human", None, None).await.unwrap();

        loop {
            if let RunEvent::RunBlocked { run } = events.recv().await.unwrap() {
                assert_eq!(&run.id, handle.run_id());
                break;
            }
        }
        assert_eq!(orch.admission().active(), 0);

        let resumed = orch
            .resume_run(handle.run_id().as_str(), None)
            .await
            .unwrap();
        assert_eq!(resumed.finished().await.unwrap().status, RunStatus::Completed);
        assert_eq!(handle.finished().await.unwrap().status, RunStatus::Blocked);
    }

    #[tokio::test]
    async fn test_resume_rejects_non_blocked_and_unknown_runs() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let run = orch
            .start_run("retry-twice", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        let err = orch.resume_run(run.id.as_str(), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ref m) if m.contains("not blocked")));

        let err = orch
            .resume_run("run_1700000000000_abcdef", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err = orch.resume_run("../etc", None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_run_validates_ids() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        assert!(matches!(
            orch.get_run("../secrets").await,
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(orch.get_run("").await, Err(OrchestratorError::Validation(_))));
        assert!(
            orch.get_run("run_1700000000000_abcdef")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let orch = orchestrator(ScriptedAgent::failing("flaky", 5), 10);
        let failed = orch
            .start_run("retry-twice", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        let completed = orch
            .start_run("three-steps", None, None)
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();

        let all = orch.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_failed = orch
            .list_runs(&RunFilter {
                status: Some(RunStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed.id);

        let by_workflow = orch
            .list_runs(&RunFilter {
                workflow_id: Some("three-steps".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_workflow[0].id, completed.id);
    }

    #[tokio::test]
    async fn test_list_workflows_delegates() {
        let orch = orchestrator(EchoAgentExecutor, 10);
        let mut ids: Vec<String> = orch
            .list_workflows()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        ids.sort();
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[0], "escalate-agent");
    }

    #[test]
    fn test_policy_errors_map_to_taxonomy() {
        let not_found: OrchestratorError = PolicyError::UnknownRedirectTarget {
            step_id: "a".to_string(),
            target: "b".to_string(),
        }
        .into();
        assert!(matches!(not_found, OrchestratorError::NotFound(_)));

        let not_impl: OrchestratorError = PolicyError::AgentEscalation {
            agent: "x".to_string(),
        }
        .into();
        assert!(matches!(not_impl, OrchestratorError::NotImplemented(_)));
    }
}
