//! Event-driven workflow scheduler.
//!
//! Each started workflow gets one registry entry. Every transition of that
//! workflow (ready-set computation, submission, phase changes) happens under
//! the entry's async lock, so `stop()` and node completions never interleave.
//! Pollers read a separately published copy and never wait on that lock.
//!
//! Phases:
//!
//! ```text
//! (absent) --start--> RUNNING
//! RUNNING  --all nodes completed--> COMPLETED
//! RUNNING  --any node failed------> FAILED
//! RUNNING  --stop()---------------> STOPPING --in-flight drained--> STOPPED
//! ```

use super::builder::PATTERN_OPTIONS;
use super::definition::{JobNode, NodeInput, WorkflowDefinition};
use super::listener::{CompletionListener, NodeEventListener};
use super::materialize::OutputMaterializer;
use super::state::{ExecutionSnapshot, WorkflowExecutionState};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::substrate::{AttemptEvent, ExecutionSubstrate, SubmitRequest};
use crate::types::{AttemptId, NodeStatus, WorkflowId, WorkflowPhase};
use anyhow::{anyhow, Context};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What `poll` reports about a workflow
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub phase: WorkflowPhase,
    /// Nodes whose attempts were found abandoned; non-empty means external remediation is needed
    pub stuck_nodes: Vec<String>,
    pub snapshot: ExecutionSnapshot,
}

impl WorkflowStatus {
    pub fn is_stuck(&self) -> bool {
        !self.stuck_nodes.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Starts, stops and advances workflows on top of an execution substrate
pub struct WorkflowScheduler {
    inner: Arc<SchedulerInner>,
    shutdown: CancellationToken,
}

struct SchedulerInner {
    substrate: Arc<dyn ExecutionSubstrate>,
    config: SchedulerConfig,
    materializer: OutputMaterializer,
    workers: Arc<Semaphore>,
    registry: Mutex<HashMap<WorkflowId, Arc<RegistryEntry>>>,
    history: Mutex<History>,
}

struct RegistryEntry {
    definition: Arc<WorkflowDefinition>,
    completion: CompletionListener,
    events: NodeEventListener,
    run: tokio::sync::Mutex<RunState>,
    published: RwLock<WorkflowStatus>,
}

struct RunState {
    phase: WorkflowPhase,
    state: WorkflowExecutionState,
    /// Ready nodes waiting for a worker permit
    pending: HashSet<String>,
    in_flight: HashMap<String, InFlight>,
    stuck: Vec<String>,
    last_change: Instant,
}

struct InFlight {
    attempt_id: AttemptId,
    // None for attempts adopted from a previous scheduler instance
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct History {
    order: VecDeque<WorkflowId>,
    statuses: HashMap<WorkflowId, WorkflowStatus>,
}

impl WorkflowScheduler {
    /// Create a scheduler and spawn its notification and liveness tasks.
    /// Must be called from within a tokio runtime.
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>, config: SchedulerConfig) -> Self {
        let inner = Arc::new(SchedulerInner {
            materializer: OutputMaterializer::new(config.link_outputs),
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            registry: Mutex::new(HashMap::new()),
            history: Mutex::new(History::default()),
            substrate,
            config,
        });
        let shutdown = CancellationToken::new();

        spawn_notification_pump(inner.clone(), shutdown.clone());
        spawn_liveness_guard(inner.clone(), shutdown.clone());

        Self { inner, shutdown }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start (or restart) a workflow. Returns once the initial ready set has
    /// been handed to the worker pool; it does not wait for completion.
    pub async fn start(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        completion: CompletionListener,
        events: Option<NodeEventListener>,
    ) -> Result<WorkflowId, SchedulerError> {
        let definition = definition.into();
        let id = definition.id();
        let entry = Arc::new(RegistryEntry::new(
            definition,
            completion,
            events.unwrap_or_default(),
        ));

        // Hold the workflow lock before the entry becomes visible
        let mut run = entry.run.lock().await;
        {
            let mut registry = lock(&self.inner.registry);
            if registry.contains_key(&id) {
                return Err(SchedulerError::AlreadyRunning);
            }
            registry.insert(id, entry.clone());
        }

        if let Err(e) = self.inner.initialize(&entry, &mut run).await {
            lock(&self.inner.registry).remove(&id);
            return Err(e);
        }

        Ok(id)
    }

    /// Ask every in-flight attempt to stop. The workflow reaches STOPPED once
    /// the substrate has reported all of them terminal.
    pub async fn stop(&self, id: WorkflowId) -> Result<(), SchedulerError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| self.inner.inactive_error(id))?;

        let mut run = entry.run.lock().await;
        match run.phase {
            WorkflowPhase::Running => {}
            WorkflowPhase::Stopping => return Err(SchedulerError::AlreadyStopping),
            phase => return Err(SchedulerError::NotRunning { phase }),
        }

        tracing::info!("Stopping workflow: workflow_id={}", id);
        run.phase = WorkflowPhase::Stopping;
        run.pending.clear();
        run.last_change = Instant::now();

        let attempts: Vec<(String, AttemptId)> = run
            .in_flight
            .iter()
            .map(|(node, flight)| (node.clone(), flight.attempt_id))
            .collect();
        for (node, attempt_id) in attempts {
            if let Err(e) = self.inner.substrate.stop(attempt_id).await {
                tracing::warn!(
                    "Failed to request stop: workflow_id={}, node={}, error={:#}",
                    id,
                    node,
                    e
                );
            }
        }

        if run.in_flight.is_empty() {
            self.inner.finish(&entry, &mut run, WorkflowPhase::Stopped).await;
        } else {
            self.inner.publish(&entry, &run);
        }

        Ok(())
    }

    /// Current phase and a consistent snapshot; never blocks on in-progress transitions
    pub fn poll(&self, id: WorkflowId) -> Result<WorkflowStatus, SchedulerError> {
        if let Some(entry) = self.inner.entry(id) {
            return Ok(entry
                .published
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone());
        }

        lock(&self.inner.history)
            .statuses
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotStarted)
    }

    /// Ids of workflows in RUNNING or STOPPING phase
    pub fn active_workflows(&self) -> Vec<WorkflowId> {
        lock(&self.inner.registry).keys().copied().collect()
    }

    /// Stop the background tasks. Workflows in flight stop advancing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WorkflowScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RegistryEntry {
    fn new(
        definition: Arc<WorkflowDefinition>,
        completion: CompletionListener,
        events: NodeEventListener,
    ) -> Self {
        let state = WorkflowExecutionState::new(&definition);
        let published = WorkflowStatus {
            phase: WorkflowPhase::Running,
            stuck_nodes: Vec::new(),
            snapshot: ExecutionSnapshot::new(definition.clone(), state.clone()),
        };

        Self {
            completion,
            events,
            run: tokio::sync::Mutex::new(RunState {
                phase: WorkflowPhase::Running,
                state,
                pending: HashSet::new(),
                in_flight: HashMap::new(),
                stuck: Vec::new(),
                last_change: Instant::now(),
            }),
            published: RwLock::new(published),
            definition,
        }
    }

    fn snapshot(&self, run: &RunState) -> ExecutionSnapshot {
        ExecutionSnapshot::new(self.definition.clone(), run.state.clone())
    }
}

impl SchedulerInner {
    fn entry(&self, id: WorkflowId) -> Option<Arc<RegistryEntry>> {
        lock(&self.registry).get(&id).cloned()
    }

    fn inactive_error(&self, id: WorkflowId) -> SchedulerError {
        match lock(&self.history).statuses.get(&id) {
            Some(status) => SchedulerError::NotRunning {
                phase: status.phase,
            },
            None => SchedulerError::NotStarted,
        }
    }

    /// Reconcile with the substrate and submit the initial ready set
    async fn initialize(
        self: &Arc<Self>,
        entry: &Arc<RegistryEntry>,
        run: &mut RunState,
    ) -> Result<(), SchedulerError> {
        let definition = entry.definition.clone();
        let id = definition.id();

        run.state
            .reload(&definition, self.substrate.as_ref())
            .await
            .context("Failed to reload workflow state")?;

        if run.state.is_complete() {
            return Err(SchedulerError::AlreadyComplete);
        }

        let abandoned = run.state.nodes_with_status(NodeStatus::Abandoned);
        if !abandoned.is_empty() {
            tracing::warn!(
                "Refusing to start workflow with abandoned attempts: workflow_id={}, nodes={:?}",
                id,
                abandoned
            );
            return Err(SchedulerError::Stuck { nodes: abandoned });
        }

        // Attempts still running from an earlier scheduler are awaited, not resubmitted
        for (node, node_state) in run.state.nodes() {
            if node_state.status == NodeStatus::Running {
                if let Some(attempt_id) = node_state.attempt_id {
                    tracing::info!(
                        "Adopting running attempt: workflow_id={}, node={}, attempt_id={}",
                        id,
                        node,
                        attempt_id
                    );
                    run.in_flight.insert(
                        node.to_string(),
                        InFlight {
                            attempt_id,
                            _permit: None,
                        },
                    );
                }
            }
        }

        let ready: Vec<String> = definition
            .nodes_in_topological_order()
            .into_iter()
            .filter(|node| is_ready(&definition, run, &node.name))
            .map(|node| node.name.clone())
            .collect();

        tracing::info!(
            "Starting workflow: workflow_id={}, nodes={}, ready={:?}",
            id,
            definition.len(),
            ready
        );

        run.last_change = Instant::now();
        self.dispatch(entry, run, ready);
        self.publish(entry, run);
        Ok(())
    }

    /// Mark nodes pending and hand each to the worker pool
    fn dispatch(self: &Arc<Self>, entry: &Arc<RegistryEntry>, run: &mut RunState, nodes: Vec<String>) {
        for node in nodes {
            if !run.pending.insert(node.clone()) {
                continue;
            }
            let inner = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                inner.submit_node(entry, node).await;
            });
        }
    }

    /// Wait for a worker permit, then submit the node if the workflow is still running
    async fn submit_node(self: Arc<Self>, entry: Arc<RegistryEntry>, node: String) {
        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            return;
        };

        let mut run = entry.run.lock().await;
        if run.phase != WorkflowPhase::Running || !run.pending.remove(&node) {
            return;
        }

        let definition = entry.definition.clone();
        let id = definition.id();
        let job = match definition.node(&node) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Dispatched unknown node: workflow_id={}, error={}", id, e);
                return;
            }
        };

        let inputs = match resolve_inputs(&definition, job) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_node(&entry, &mut run, &node, format!("{:#}", e)).await;
                return;
            }
        };

        entry.events.before(&node, &entry.snapshot(&run));

        let request = SubmitRequest {
            identity: job.identity.clone(),
            job_kind: job.job_kind.clone(),
            parameters: job.parameters.clone(),
            inputs,
        };

        match self.substrate.submit(request).await {
            Ok(attempt_id) => {
                tracing::info!(
                    "Node submitted: workflow_id={}, node={}, attempt_id={}",
                    id,
                    node,
                    attempt_id
                );
                run.state.mark_submitted(&node, attempt_id);
                run.in_flight.insert(
                    node,
                    InFlight {
                        attempt_id,
                        _permit: Some(permit),
                    },
                );
                run.last_change = Instant::now();
                self.publish(&entry, &run);
            }
            Err(e) => {
                // Pair the before_node already fired with an after_node
                let error = format!("submission failed: {:#}", e);
                run.state
                    .set_status(&node, NodeStatus::Failed, Some(error.clone()));
                entry.events.after(&node, &entry.snapshot(&run));
                self.fail_node(&entry, &mut run, &node, error).await;
            }
        }
    }

    async fn on_attempt_event(self: Arc<Self>, event: AttemptEvent) {
        let Some(entry) = self.entry(event.identity.workflow_id) else {
            tracing::debug!(
                "Ignoring notification for inactive workflow: identity={}, attempt_id={}",
                event.identity,
                event.attempt_id
            );
            return;
        };

        let mut run = entry.run.lock().await;
        self.handle_finished(&entry, &mut run, &event.identity.node, event.attempt_id)
            .await;
    }

    /// Process one attempt reaching a terminal state
    async fn handle_finished(
        self: &Arc<Self>,
        entry: &Arc<RegistryEntry>,
        run: &mut RunState,
        node: &str,
        attempt_id: AttemptId,
    ) {
        if run.phase.is_terminal() {
            return;
        }
        match run.in_flight.get(node) {
            Some(flight) if flight.attempt_id == attempt_id => {}
            _ => {
                tracing::debug!("Ignoring stale attempt: node={}, attempt_id={}", node, attempt_id);
                return;
            }
        }

        let definition = entry.definition.clone();
        let id = definition.id();
        let record = match run
            .state
            .reload_node(&definition, self.substrate.as_ref(), node)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    "Failed to reload node: workflow_id={}, node={}, error={:#}",
                    id,
                    node,
                    e
                );
                run.state
                    .set_status(node, NodeStatus::Failed, Some(format!("{:#}", e)));
                None
            }
        };

        let mut status = run.state.status_of(node).unwrap_or(NodeStatus::Failed);
        if !status.is_terminal() {
            // Notification raced ahead of the substrate's own bookkeeping
            return;
        }

        run.in_flight.remove(node);
        run.last_change = Instant::now();

        if status == NodeStatus::Abandoned {
            self.mark_stuck(entry, run, node).await;
            return;
        }

        entry.events.after(node, &entry.snapshot(run));

        if status == NodeStatus::Completed {
            let materialized = match (definition.node(node), record) {
                (Ok(job), Some(record)) => self
                    .materializer
                    .materialize(job, &record.result_context)
                    .await
                    .map_err(|e| e.to_string()),
                _ => Err("no attempt record for completed node".to_string()),
            };
            if let Err(e) = materialized {
                tracing::error!(
                    "Output materialization failed: workflow_id={}, node={}, error={}",
                    id,
                    node,
                    e
                );
                run.state.set_status(
                    node,
                    NodeStatus::Failed,
                    Some(format!("materialization failed: {}", e)),
                );
                status = NodeStatus::Failed;
            }
        }

        match run.phase {
            WorkflowPhase::Running => match status {
                NodeStatus::Completed => {
                    tracing::info!("Node completed: workflow_id={}, node={}", id, node);
                    if run.state.is_complete() {
                        self.finish(entry, run, WorkflowPhase::Completed).await;
                        return;
                    }

                    let ready: Vec<String> = definition
                        .dependents(node)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|dependent| is_ready(&definition, run, dependent))
                        .map(str::to_string)
                        .collect();
                    tracing::debug!("Ready set: workflow_id={}, nodes={:?}", id, ready);
                    self.dispatch(entry, run, ready);
                    self.publish(entry, run);
                }
                _ => {
                    tracing::error!(
                        "Node did not complete: workflow_id={}, node={}, status={:?}",
                        id,
                        node,
                        status
                    );
                    self.finish(entry, run, WorkflowPhase::Failed).await;
                }
            },
            WorkflowPhase::Stopping => {
                if run.in_flight.is_empty() {
                    self.finish(entry, run, WorkflowPhase::Stopped).await;
                } else {
                    self.publish(entry, run);
                }
            }
            _ => {}
        }
    }

    /// A node that never reached the substrate fails the workflow
    async fn fail_node(
        self: &Arc<Self>,
        entry: &Arc<RegistryEntry>,
        run: &mut RunState,
        node: &str,
        error: String,
    ) {
        tracing::error!(
            "Node failed before submission: workflow_id={}, node={}, error={}",
            entry.definition.id(),
            node,
            error
        );
        run.state.set_status(node, NodeStatus::Failed, Some(error));
        self.finish(entry, run, WorkflowPhase::Failed).await;
    }

    /// Abandoned attempts never report again; surface them through `poll`.
    /// An abandoned attempt is terminal, so it can be the last one a stop waits on.
    async fn mark_stuck(&self, entry: &Arc<RegistryEntry>, run: &mut RunState, node: &str) {
        tracing::warn!(
            "Node attempt abandoned, workflow needs remediation: workflow_id={}, node={}",
            entry.definition.id(),
            node
        );
        run.in_flight.remove(node);
        if !run.stuck.iter().any(|n| n == node) {
            run.stuck.push(node.to_string());
        }

        if run.phase == WorkflowPhase::Stopping && run.in_flight.is_empty() {
            self.finish(entry, run, WorkflowPhase::Stopped).await;
        } else {
            self.publish(entry, run);
        }
    }

    /// Enter a terminal phase, fire the matching listener, then retire the entry
    async fn finish(&self, entry: &Arc<RegistryEntry>, run: &mut RunState, mut phase: WorkflowPhase) {
        let id = entry.definition.id();

        if phase == WorkflowPhase::Completed {
            if let Err(e) = self
                .materializer
                .publish_final_outputs(&entry.definition)
                .await
            {
                tracing::error!("Failed to publish final outputs: workflow_id={}, error={}", id, e);
                phase = WorkflowPhase::Failed;
            }
        }

        run.phase = phase;
        run.pending.clear();
        run.last_change = Instant::now();
        let status = self.publish(entry, run);

        match phase {
            WorkflowPhase::Completed => {
                tracing::info!("Workflow completed: workflow_id={}", id);
                entry.completion.success(&status.snapshot);
            }
            WorkflowPhase::Failed => {
                tracing::error!("Workflow failed: workflow_id={}", id);
                entry.completion.failure(&status.snapshot);
            }
            WorkflowPhase::Stopped => {
                tracing::info!("Workflow stopped: workflow_id={}", id);
                entry.completion.stopped(&status.snapshot);
            }
            WorkflowPhase::Running | WorkflowPhase::Stopping => return,
        }

        self.retire(id, status);
    }

    /// Replace the copy pollers read
    fn publish(&self, entry: &RegistryEntry, run: &RunState) -> WorkflowStatus {
        let status = WorkflowStatus {
            phase: run.phase,
            stuck_nodes: run.stuck.clone(),
            snapshot: entry.snapshot(run),
        };
        *entry
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status.clone();
        status
    }

    /// Remove the registry entry and archive its final status
    fn retire(&self, id: WorkflowId, status: WorkflowStatus) {
        lock(&self.registry).remove(&id);

        let capacity = self.config.retained_workflows;
        if capacity == 0 {
            return;
        }
        let mut history = lock(&self.history);
        if history.statuses.insert(id, status).is_none() {
            history.order.push_back(id);
        }
        while history.order.len() > capacity {
            if let Some(oldest) = history.order.pop_front() {
                history.statuses.remove(&oldest);
            }
        }
    }

    /// Backstop for missed notifications and crashed attempts
    async fn check_liveness(self: &Arc<Self>) {
        let entries: Vec<Arc<RegistryEntry>> = lock(&self.registry).values().cloned().collect();
        let timeout = self.config.liveness_timeout();

        for entry in entries {
            // A held lock means a transition is in progress
            let Ok(mut run) = entry.run.try_lock() else {
                continue;
            };
            if run.phase.is_terminal() || run.last_change.elapsed() < timeout {
                continue;
            }
            self.reconcile(&entry, &mut run).await;
        }
    }

    async fn reconcile(self: &Arc<Self>, entry: &Arc<RegistryEntry>, run: &mut RunState) {
        let definition = entry.definition.clone();
        let id = definition.id();
        tracing::warn!(
            "No progress within liveness timeout, reconciling: workflow_id={}, in_flight={}",
            id,
            run.in_flight.len()
        );

        let attempts: Vec<(String, AttemptId)> = run
            .in_flight
            .iter()
            .map(|(node, flight)| (node.clone(), flight.attempt_id))
            .collect();

        for (node, attempt_id) in attempts {
            if run.phase.is_terminal() {
                break;
            }
            let Ok(job) = definition.node(&node) else {
                continue;
            };
            let records = match self.substrate.query_attempts(&job.identity).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("Liveness query failed: workflow_id={}, node={}, error={:#}", id, node, e);
                    continue;
                }
            };
            let Some(record) = records.iter().find(|r| r.attempt_id == attempt_id) else {
                continue;
            };

            match NodeStatus::from(record.status) {
                NodeStatus::Abandoned => {
                    run.state.record_attempt(&node, record);
                    self.mark_stuck(entry, run, &node).await;
                }
                status if status.is_terminal() => {
                    tracing::warn!(
                        "Recovering missed notification: workflow_id={}, node={}, attempt_id={}",
                        id,
                        node,
                        attempt_id
                    );
                    self.handle_finished(entry, run, &node, attempt_id).await;
                }
                _ => {}
            }
        }

        if !run.phase.is_terminal() {
            run.last_change = Instant::now();
            self.publish(entry, run);
        }
    }
}

/// Not yet done or running, and every dependency COMPLETED
fn is_ready(definition: &WorkflowDefinition, run: &RunState, node: &str) -> bool {
    let status = match run.state.status_of(node) {
        Ok(status) => status,
        Err(_) => return false,
    };
    if matches!(status, NodeStatus::Completed | NodeStatus::Running)
        || run.pending.contains(node)
        || run.in_flight.contains_key(node)
    {
        return false;
    }

    definition
        .dependencies(node)
        .map(|deps| {
            deps.iter()
                .all(|dep| matches!(run.state.status_of(dep), Ok(NodeStatus::Completed)))
        })
        .unwrap_or(false)
}

/// Expand staged inputs against the producers' staging directories
fn resolve_inputs(definition: &WorkflowDefinition, node: &JobNode) -> anyhow::Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for input in &node.inputs {
        match input {
            NodeInput::Literal { path } => resolved.push(path.clone()),
            NodeInput::Staged {
                producer, pattern, ..
            } => {
                let staging = definition.staging_directory(producer)?;
                let full = format!(
                    "{}/{}",
                    glob::Pattern::escape(&staging.to_string_lossy()),
                    pattern
                );
                let mut matches: Vec<PathBuf> = glob::glob_with(&full, PATTERN_OPTIONS)
                    .with_context(|| format!("Invalid input pattern '{}'", pattern))?
                    .filter_map(Result::ok)
                    .filter(|path| path.is_file())
                    .collect();
                if matches.is_empty() {
                    return Err(anyhow!(
                        "no staged output of '{}' matches '{}'",
                        producer,
                        pattern
                    ));
                }
                matches.sort();
                resolved.extend(matches);
            }
        }
    }
    Ok(resolved)
}

fn spawn_notification_pump(inner: Arc<SchedulerInner>, shutdown: CancellationToken) {
    let mut notifications = inner.substrate.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = notifications.recv() => match received {
                    Ok(event) => {
                        tokio::spawn(inner.clone().on_attempt_event(event));
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} attempt notifications, relying on liveness guard", missed);
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Substrate notification channel closed");
                        break;
                    }
                },
            }
        }
    });
}

fn spawn_liveness_guard(inner: Arc<SchedulerInner>, shutdown: CancellationToken) {
    let period = inner.config.liveness_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => inner.check_liveness().await,
            }
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{
        AttemptRecord, AttemptStatus, Job, JobContext, LocalSubstrate, ResultContext,
    };
    use crate::types::JobIdentity;
    use crate::workflow::builder::{InputSpec, NodeSpec, WorkflowBuilder};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// Writes every file named in the `files` parameter and remembers its inputs
    #[derive(Default)]
    struct WriteJob {
        seen: Mutex<HashMap<String, Vec<PathBuf>>>,
    }

    #[async_trait::async_trait]
    impl Job for WriteJob {
        async fn run(&self, ctx: JobContext) -> anyhow::Result<ResultContext> {
            lock(&self.seen).insert(ctx.identity.node.clone(), ctx.inputs.clone());
            if let Ok(files) = ctx.param_str("files") {
                for file in files.split(',') {
                    tokio::fs::write(ctx.work_dir.join(file), ctx.identity.node.as_bytes()).await?;
                }
            }
            Ok(ResultContext::output_dir(&ctx.work_dir))
        }
    }

    struct FailJob;

    #[async_trait::async_trait]
    impl Job for FailJob {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<ResultContext> {
            Err(anyhow!("boom"))
        }
    }

    struct BlockJob;

    #[async_trait::async_trait]
    impl Job for BlockJob {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<ResultContext> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ResultContext::new())
        }
    }

    /// Substrate whose attempts only finish when the test says so
    struct ManualSubstrate {
        attempts: Mutex<HashMap<JobIdentity, Vec<AttemptRecord>>>,
        requests: Mutex<Vec<SubmitRequest>>,
        stop_requests: Mutex<Vec<AttemptId>>,
        events: broadcast::Sender<AttemptEvent>,
    }

    impl ManualSubstrate {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(64);
            Arc::new(Self {
                attempts: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                stop_requests: Mutex::new(Vec::new()),
                events,
            })
        }

        fn seed(&self, identity: &JobIdentity, status: AttemptStatus) {
            lock(&self.attempts)
                .entry(identity.clone())
                .or_default()
                .push(AttemptRecord::new(status));
        }

        fn submitted(&self) -> Vec<String> {
            lock(&self.requests)
                .iter()
                .map(|r| r.identity.node.clone())
                .collect()
        }

        fn finish(&self, identity: &JobIdentity, status: AttemptStatus, result: ResultContext, notify: bool) {
            let attempt_id = {
                let mut attempts = lock(&self.attempts);
                let record = attempts
                    .get_mut(identity)
                    .and_then(|records| records.last_mut())
                    .unwrap();
                record.status = status;
                record.end_time = Some(chrono::Utc::now());
                record.result_context = result;
                record.attempt_id
            };
            if notify {
                let _ = self.events.send(AttemptEvent {
                    identity: identity.clone(),
                    attempt_id,
                    status,
                });
            }
        }
    }

    #[async_trait::async_trait]
    impl ExecutionSubstrate for ManualSubstrate {
        async fn submit(&self, request: SubmitRequest) -> anyhow::Result<AttemptId> {
            let record = AttemptRecord::new(AttemptStatus::Started);
            let attempt_id = record.attempt_id;
            lock(&self.attempts)
                .entry(request.identity.clone())
                .or_default()
                .push(record);
            lock(&self.requests).push(request);
            Ok(attempt_id)
        }

        async fn query_attempts(&self, identity: &JobIdentity) -> anyhow::Result<Vec<AttemptRecord>> {
            Ok(lock(&self.attempts).get(identity).cloned().unwrap_or_default())
        }

        async fn stop(&self, attempt_id: AttemptId) -> anyhow::Result<()> {
            lock(&self.stop_requests).push(attempt_id);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
            self.events.subscribe()
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn outcome_listener() -> (CompletionListener, Log) {
        let log: Log = Arc::default();
        let (success, failure, stopped) = (log.clone(), log.clone(), log.clone());
        let listener = CompletionListener::new()
            .on_success(move |_| lock(&success).push("success".to_string()))
            .on_failure(move |_| lock(&failure).push("failure".to_string()))
            .on_stopped(move |_| lock(&stopped).push("stopped".to_string()));
        (listener, log)
    }

    fn event_listener() -> (NodeEventListener, Log) {
        let log: Log = Arc::default();
        let (before, after) = (log.clone(), log.clone());
        let listener = NodeEventListener::new()
            .before_node(move |node, _| lock(&before).push(format!("before:{}", node)))
            .after_node(move |node, _| lock(&after).push(format!("after:{}", node)));
        (listener, log)
    }

    fn entries(log: &Log) -> Vec<String> {
        lock(log).clone()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn local(temp_dir: &TempDir) -> (Arc<LocalSubstrate>, Arc<WriteJob>) {
        let substrate = Arc::new(LocalSubstrate::new(temp_dir.path().join("work")).unwrap());
        let writer = Arc::new(WriteJob::default());
        substrate.register("write", writer.clone());
        substrate.register("fail", Arc::new(FailJob));
        substrate.register("block", Arc::new(BlockJob));
        (substrate, writer)
    }

    fn chain(data_dir: &Path) -> WorkflowDefinition {
        WorkflowBuilder::new(data_dir)
            .node(NodeSpec::new("a", "write").param("files", "a.txt").output("a.txt"))
            .node(
                NodeSpec::new("b", "write")
                    .param("files", "b.txt")
                    .input(InputSpec::output("a", "a.txt"))
                    .output("b.txt"),
            )
            .node(
                NodeSpec::new("c", "write")
                    .param("files", "c.txt")
                    .input(InputSpec::output("b", "b.txt"))
                    .output("c.txt"),
            )
            .final_output("result", "c", "c.txt")
            .build()
            .unwrap()
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[tokio::test]
    async fn test_chain_runs_to_completion() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, _) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = Arc::new(chain(&temp_dir.path().join("data")));
        let (completion, outcomes) = outcome_listener();
        let (events, nodes) = event_listener();

        let id = scheduler.start(def.clone(), completion, Some(events)).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(entries(&outcomes), vec!["success"]);
        let log = entries(&nodes);
        assert_eq!(log.len(), 6);
        assert!(position(&log, "after:a") < position(&log, "before:b"));
        assert!(position(&log, "after:b") < position(&log, "before:c"));

        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Completed);
        assert!(status.snapshot.is_complete());
        assert!(scheduler.active_workflows().is_empty());

        let result = def.final_output_path("result").unwrap();
        assert_eq!(std::fs::read_to_string(result).unwrap(), "c");
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, _) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = WorkflowBuilder::new(temp_dir.path().join("data"))
            .node(NodeSpec::new("a", "write").param("files", "a.txt").output("a.txt"))
            .node(
                NodeSpec::new("b", "fail")
                    .input(InputSpec::output("a", "*.txt"))
                    .output("b.txt"),
            )
            .node(NodeSpec::new("c", "write").input(InputSpec::output("b", "b.txt")))
            .build()
            .unwrap();
        let (completion, outcomes) = outcome_listener();
        let (events, nodes) = event_listener();

        let id = scheduler.start(def, completion, Some(events)).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(entries(&outcomes), vec!["failure"]);
        assert!(!entries(&nodes).contains(&"before:c".to_string()));

        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Failed);
        assert_eq!(status.snapshot.status_of("a").unwrap(), NodeStatus::Completed);
        assert_eq!(status.snapshot.status_of("b").unwrap(), NodeStatus::Failed);
        assert_eq!(status.snapshot.status_of("c").unwrap(), NodeStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_staged_inputs_follow_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, writer) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = Arc::new(
            WorkflowBuilder::new(temp_dir.path().join("data"))
                .node(
                    NodeSpec::new("a", "write")
                        .param("files", "a1.txt,a2.txt")
                        .output("a1.txt,a2.txt"),
                )
                .node(NodeSpec::new("b", "write").input(InputSpec::output("a", "*.txt")))
                .node(NodeSpec::new("c", "write").input(InputSpec::output("a", "a1.txt")))
                .build()
                .unwrap(),
        );
        let (completion, outcomes) = outcome_listener();

        scheduler.start(def.clone(), completion, None).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["success"]);

        let staging = def.staging_directory("a").unwrap();
        let seen = lock(&writer.seen).clone();
        assert_eq!(seen["b"], vec![staging.join("a1.txt"), staging.join("a2.txt")]);
        assert_eq!(seen["c"], vec![staging.join("a1.txt")]);
    }

    #[tokio::test]
    async fn test_start_twice_then_stop() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, _) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = Arc::new(
            WorkflowBuilder::new(temp_dir.path().join("data"))
                .node(NodeSpec::new("slow", "block"))
                .build()
                .unwrap(),
        );
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def.clone(), completion, None).await.unwrap();
        let err = scheduler
            .start(def.clone(), CompletionListener::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));

        scheduler.stop(id).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["stopped"]);
        assert_eq!(scheduler.poll(id).unwrap().phase, WorkflowPhase::Stopped);

        let err = scheduler.stop(id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::NotRunning {
                phase: WorkflowPhase::Stopped
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_started() {
        let scheduler = WorkflowScheduler::new(ManualSubstrate::new(), SchedulerConfig::default());
        let id = WorkflowId::new();

        assert!(matches!(scheduler.stop(id).await, Err(SchedulerError::NotStarted)));
        assert!(matches!(scheduler.poll(id), Err(SchedulerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_second_stop_reports_already_stopping() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = WorkflowBuilder::new(temp_dir.path())
            .node(NodeSpec::new("a", "any"))
            .build()
            .unwrap();
        let identity = def.node("a").unwrap().identity.clone();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;

        scheduler.stop(id).await.unwrap();
        assert!(matches!(scheduler.stop(id).await, Err(SchedulerError::AlreadyStopping)));
        assert_eq!(scheduler.poll(id).unwrap().phase, WorkflowPhase::Stopping);
        assert_eq!(lock(&substrate.stop_requests).len(), 1);

        substrate.finish(&identity, AttemptStatus::Stopped, ResultContext::new(), true);
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["stopped"]);
    }

    #[tokio::test]
    async fn test_abandoned_last_attempt_finishes_stop() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = Arc::new(
            WorkflowBuilder::new(temp_dir.path())
                .node(NodeSpec::new("a", "any"))
                .build()
                .unwrap(),
        );
        let identity = def.node("a").unwrap().identity.clone();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def.clone(), completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;
        scheduler.stop(id).await.unwrap();

        substrate.finish(&identity, AttemptStatus::Abandoned, ResultContext::new(), true);
        wait_until(|| !entries(&outcomes).is_empty()).await;

        assert_eq!(entries(&outcomes), vec!["stopped"]);
        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Stopped);
        assert_eq!(status.stuck_nodes, vec!["a"]);
        assert!(scheduler.active_workflows().is_empty());

        // The id is free again; the abandoned attempt now blocks a restart instead
        let err = scheduler
            .start(def, CompletionListener::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Stuck { .. }));
    }

    #[tokio::test]
    async fn test_liveness_finishes_stop_on_abandoned_attempt() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), eager_liveness());
        let def = WorkflowBuilder::new(temp_dir.path())
            .node(NodeSpec::new("a", "any"))
            .build()
            .unwrap();
        let identity = def.node("a").unwrap().identity.clone();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;
        scheduler.stop(id).await.unwrap();

        substrate.finish(&identity, AttemptStatus::Abandoned, ResultContext::new(), false);
        wait_until(|| !entries(&outcomes).is_empty()).await;

        assert_eq!(entries(&outcomes), vec!["stopped"]);
        assert_eq!(scheduler.poll(id).unwrap().phase, WorkflowPhase::Stopped);
    }

    #[tokio::test]
    async fn test_failed_workflow_ignores_late_completions() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = WorkflowBuilder::new(temp_dir.path().join("data"))
            .node(NodeSpec::new("x", "any"))
            .node(NodeSpec::new("y", "any").output("y.txt"))
            .node(NodeSpec::new("z", "any").input(InputSpec::output("y", "y.txt")))
            .build()
            .unwrap();
        let x = def.node("x").unwrap().identity.clone();
        let y = def.node("y").unwrap().identity.clone();
        let produced = temp_dir.path().join("produced");
        std::fs::create_dir_all(&produced).unwrap();
        std::fs::write(produced.join("y.txt"), "y").unwrap();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 2).await;

        substrate.finish(&x, AttemptStatus::Failed, ResultContext::new(), true);
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert!(scheduler.active_workflows().is_empty());

        substrate.finish(&y, AttemptStatus::Completed, ResultContext::output_dir(&produced), true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(entries(&outcomes), vec!["failure"]);
        let mut submitted = substrate.submitted();
        submitted.sort();
        assert_eq!(submitted, vec!["x", "y"]);
        assert_eq!(scheduler.poll(id).unwrap().phase, WorkflowPhase::Failed);
    }

    #[tokio::test]
    async fn test_failed_submission_pairs_node_events() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, _) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = WorkflowBuilder::new(temp_dir.path().join("data"))
            .node(NodeSpec::new("a", "unregistered"))
            .build()
            .unwrap();
        let (completion, outcomes) = outcome_listener();
        let (events, nodes) = event_listener();

        let id = scheduler.start(def, completion, Some(events)).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;

        assert_eq!(entries(&outcomes), vec!["failure"]);
        assert_eq!(entries(&nodes), vec!["before:a", "after:a"]);
        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.snapshot.status_of("a").unwrap(), NodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_stop_prevents_new_submissions() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = WorkflowBuilder::new(temp_dir.path().join("data"))
            .node(NodeSpec::new("a", "any").output("a.txt"))
            .node(NodeSpec::new("b", "any").input(InputSpec::output("a", "a.txt")))
            .build()
            .unwrap();
        let identity = def.node("a").unwrap().identity.clone();
        let produced = temp_dir.path().join("produced");
        std::fs::create_dir_all(&produced).unwrap();
        std::fs::write(produced.join("a.txt"), "a").unwrap();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;
        scheduler.stop(id).await.unwrap();

        substrate.finish(
            &identity,
            AttemptStatus::Completed,
            ResultContext::output_dir(&produced),
            true,
        );
        wait_until(|| !entries(&outcomes).is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(entries(&outcomes), vec!["stopped"]);
        assert_eq!(substrate.submitted(), vec!["a"]);
        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Stopped);
        assert_eq!(status.snapshot.status_of("a").unwrap(), NodeStatus::Completed);
        assert_eq!(status.snapshot.status_of("b").unwrap(), NodeStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_completed_workflow_is_not_restarted() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = chain(temp_dir.path());
        for node in def.nodes() {
            substrate.seed(&node.identity, AttemptStatus::Completed);
        }
        let id = def.id();

        let err = scheduler
            .start(def, CompletionListener::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyComplete));
        assert!(scheduler.active_workflows().is_empty());
        assert!(matches!(scheduler.poll(id), Err(SchedulerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_abandoned_attempt_blocks_start() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = chain(temp_dir.path());
        substrate.seed(&def.node("a").unwrap().identity, AttemptStatus::Completed);
        substrate.seed(&def.node("b").unwrap().identity, AttemptStatus::Unknown);

        let err = scheduler
            .start(def, CompletionListener::new(), None)
            .await
            .unwrap_err();
        match err {
            SchedulerError::Stuck { nodes } => assert_eq!(nodes, vec!["b"]),
            other => panic!("unexpected error: {}", other),
        }
        assert!(substrate.submitted().is_empty());
        assert!(scheduler.active_workflows().is_empty());
    }

    #[tokio::test]
    async fn test_restart_resubmits_only_unfinished_nodes() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), SchedulerConfig::default());
        let def = chain(temp_dir.path());
        substrate.seed(&def.node("a").unwrap().identity, AttemptStatus::Completed);
        substrate.seed(&def.node("b").unwrap().identity, AttemptStatus::Failed);

        // a's outputs survive from the earlier run
        let staging = def.staging_directory("a").unwrap().to_path_buf();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.txt"), "a").unwrap();

        scheduler.start(def, CompletionListener::new(), None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(substrate.submitted(), vec!["b"]);
        let requests = lock(&substrate.requests);
        assert_eq!(requests[0].inputs, vec![staging.join("a.txt")]);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let config = SchedulerConfig {
            worker_pool_size: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = WorkflowScheduler::new(substrate.clone(), config);
        let def = WorkflowBuilder::new(temp_dir.path())
            .node(NodeSpec::new("x", "any"))
            .node(NodeSpec::new("y", "any"))
            .build()
            .unwrap();
        let identities: HashMap<String, JobIdentity> = def
            .nodes()
            .map(|n| (n.name.clone(), n.identity.clone()))
            .collect();
        let (completion, outcomes) = outcome_listener();

        scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(substrate.submitted().len(), 1);

        let first = substrate.submitted()[0].clone();
        substrate.finish(&identities[&first], AttemptStatus::Completed, ResultContext::new(), true);
        wait_until(|| substrate.submitted().len() == 2).await;

        let second = substrate.submitted()[1].clone();
        assert_ne!(first, second);
        substrate.finish(&identities[&second], AttemptStatus::Completed, ResultContext::new(), true);
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["success"]);
    }

    fn eager_liveness() -> SchedulerConfig {
        SchedulerConfig {
            liveness_timeout_secs: 0,
            liveness_interval_secs: 1,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_liveness_recovers_missed_notification() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), eager_liveness());
        let def = WorkflowBuilder::new(temp_dir.path())
            .node(NodeSpec::new("a", "any"))
            .build()
            .unwrap();
        let identity = def.node("a").unwrap().identity.clone();
        let (completion, outcomes) = outcome_listener();

        scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 1).await;

        substrate.finish(&identity, AttemptStatus::Completed, ResultContext::new(), false);
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["success"]);
    }

    #[tokio::test]
    async fn test_liveness_surfaces_abandoned_attempt() {
        let temp_dir = TempDir::new().unwrap();
        let substrate = ManualSubstrate::new();
        let scheduler = WorkflowScheduler::new(substrate.clone(), eager_liveness());
        let def = WorkflowBuilder::new(temp_dir.path())
            .node(NodeSpec::new("a", "any"))
            .node(NodeSpec::new("b", "any"))
            .build()
            .unwrap();
        let identity = def.node("a").unwrap().identity.clone();
        let (completion, outcomes) = outcome_listener();

        let id = scheduler.start(def, completion, None).await.unwrap();
        wait_until(|| substrate.submitted().len() == 2).await;

        substrate.finish(&identity, AttemptStatus::Abandoned, ResultContext::new(), false);
        wait_until(|| scheduler.poll(id).map(|s| s.is_stuck()).unwrap_or(false)).await;

        let status = scheduler.poll(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Running);
        assert_eq!(status.stuck_nodes, vec!["a"]);
        assert_eq!(status.snapshot.status_of("a").unwrap(), NodeStatus::Abandoned);
        assert!(entries(&outcomes).is_empty());

        // Only b is still awaited once a is written off
        scheduler.stop(id).await.unwrap();
        assert_eq!(lock(&substrate.stop_requests).len(), 1);

        let b = scheduler.poll(id).unwrap().snapshot.definition().node("b").unwrap().identity.clone();
        substrate.finish(&b, AttemptStatus::Stopped, ResultContext::new(), true);
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["stopped"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stall_workflow() {
        let temp_dir = TempDir::new().unwrap();
        let (substrate, _) = local(&temp_dir);
        let scheduler = WorkflowScheduler::new(substrate, SchedulerConfig::default());
        let def = chain(&temp_dir.path().join("data"));
        let (completion, outcomes) = outcome_listener();
        let events = NodeEventListener::new().before_node(|_, _| panic!("listener bug"));

        scheduler.start(def, completion, Some(events)).await.unwrap();
        wait_until(|| !entries(&outcomes).is_empty()).await;
        assert_eq!(entries(&outcomes), vec!["success"]);
    }
}
