//! Top-level orchestration engine.
//!
//! Drives a run batch by batch: admits specs through the rate gate,
//! executes each through the supervisor, routes outcomes through the
//! status monitor and contract gate, persists lifecycle transitions, and
//! propagates terminal failures to transitive dependents. Every wait in
//! here (admission holds, retry sleeps, the agent wait) observes the run's
//! cancellation token and resolves promptly on `stop()`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use sce_store::models::{CoordinationPolicy, LifecycleState, ResultSummary, SpecStatus};
use sce_store::{MetadataStore, MultiAgentConfig, OrchestratorConfig, OrchestratorOverrides};

use crate::contract::ContractGate;
use crate::events::{EventBus, TelemetryEvent};
use crate::graph::{DependencyGraph, DependencyResolver, ExecutionPlan, ResolverError};
use crate::monitor::{OrchestrationStatus, SpecRunStatus, StatusMonitor};
use crate::rategate::RateGate;
use crate::supervisor::{AgentEvent, AgentHandle, AgentSupervisor, WorkerCommand};

pub use crate::monitor::EngineState;

/// Extra wait beyond the per-agent timeout before the engine gives up on
/// an agent whose terminal event never arrived.
const FALLBACK_WAIT_GRACE: Duration = Duration::from_secs(30);
/// How long the dispatch loop waits for in-flight executors to settle
/// after a stop request.
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(10);
/// Run-session artifact with the structured result of the last run.
const LAST_RUN_FILE: &str = "last-run.json";

/// The structured result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub state: EngineState,
    pub plan: ExecutionPlan,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub result_summaries: HashMap<String, ResultSummary>,
    pub coordination_policy: CoordinationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message sent from a spec-executor back to the dispatch loop.
struct SpecDone {
    spec: String,
    outcome: SpecOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// What the agent wait observed.
enum WaitResult {
    Completed,
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    Timeout {
        timeout_seconds: u64,
    },
    /// The fallback deadline elapsed without any terminal event.
    Fallback,
    Cancelled,
}

/// Shared per-run context handed to spec-executor tasks.
struct RunContext {
    store: MetadataStore,
    config: OrchestratorConfig,
    gate: ContractGate,
    rate: RateGate,
    supervisor: Arc<AgentSupervisor>,
    monitor: Arc<StatusMonitor>,
    bus: EventBus,
    cancel: CancellationToken,
    graph: DependencyGraph,
}

/// Coordinates one run at a time. Each engine instance owns its run state,
/// rate-gate state, and event bus; concurrent engines in one process share
/// nothing.
pub struct OrchestrationEngine {
    store: MetadataStore,
    worker: WorkerCommand,
    bus: EventBus,
    monitor: Arc<StatusMonitor>,
    cancel: Mutex<CancellationToken>,
    supervisor: Mutex<Option<Arc<AgentSupervisor>>>,
}

impl OrchestrationEngine {
    /// Create an engine over a project root. `worker` is how agents are
    /// launched, one per spec.
    pub fn new(store: MetadataStore, worker: WorkerCommand) -> Self {
        let monitor = Arc::new(StatusMonitor::new(store.clone()));
        Self {
            store,
            worker,
            bus: EventBus::new(),
            monitor,
            cancel: Mutex::new(CancellationToken::new()),
            supervisor: Mutex::new(None),
        }
    }

    /// The engine's telemetry bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Aggregate run status, readable at any time.
    pub fn status(&self) -> OrchestrationStatus {
        self.monitor.snapshot()
    }

    /// Request cancellation of the current run: wakes every sleeping
    /// admission and retry wait and kills all in-flight agents.
    pub async fn stop(&self) {
        let cancel = lock(&self.cancel).clone();
        cancel.cancel();
        let supervisor = lock(&self.supervisor).clone();
        if let Some(supervisor) = supervisor {
            supervisor.kill_all().await;
        }
    }

    /// Run the given specs to a terminal state.
    ///
    /// Rejects when a run is already in progress. Configuration problems
    /// (missing spec directory, blocked spec, dependency cycle, unreadable
    /// config) end the run immediately with a `failed` outcome carrying a
    /// top-level error; they are not `Err` returns.
    pub async fn start(
        &self,
        specs: &[String],
        overrides: OrchestratorOverrides,
    ) -> Result<RunOutcome> {
        self.run(specs, overrides, HashSet::new()).await
    }

    /// Resume a previously stopped run: specs completed in `prior` are
    /// seeded as completed and never re-dispatched.
    pub async fn resume(
        &self,
        specs: &[String],
        prior: &OrchestrationStatus,
        overrides: OrchestratorOverrides,
    ) -> Result<RunOutcome> {
        let seed: HashSet<String> = prior
            .specs
            .iter()
            .filter(|(_, run)| run.status == SpecRunStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect();
        self.run(specs, overrides, seed).await
    }

    async fn run(
        &self,
        specs: &[String],
        overrides: OrchestratorOverrides,
        completed_seed: HashSet<String>,
    ) -> Result<RunOutcome> {
        if !self.monitor.try_begin_run() {
            anyhow::bail!("orchestration is already running");
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();

        // Resolve configuration and policy; freeze both for the run.
        let config = match OrchestratorConfig::load(self.store.root(), &overrides) {
            Ok(config) => config,
            Err(e) => return Ok(self.config_failure(specs, format!("{e:#}"))),
        };
        let policy = match sce_store::config::load_coordination_policy(self.store.root(), &overrides)
        {
            Ok(policy) => policy,
            Err(e) => return Ok(self.config_failure(specs, format!("{e:#}"))),
        };
        let multi_agent = MultiAgentConfig::load(self.store.root());

        if specs.is_empty() {
            return Ok(self.config_failure_with_policy(specs, policy, "no specs requested".into()));
        }
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.as_str()) {
                return Ok(self.config_failure_with_policy(
                    specs,
                    policy,
                    format!("duplicate spec {spec:?} in request"),
                ));
            }
        }

        // Every spec needs a backing directory, and none may be blocked.
        for spec in specs {
            if !self.store.spec_exists(spec) {
                return Ok(self.config_failure_with_policy(
                    specs,
                    policy,
                    format!("spec {spec:?} has no directory under .sce/specs"),
                ));
            }
        }
        for spec in specs {
            match self.store.read(spec).await {
                Ok(Some(collab)) if collab.status.current == SpecStatus::Blocked => {
                    let reason = collab
                        .status
                        .block_reason
                        .unwrap_or_else(|| "no reason recorded".to_owned());
                    return Ok(self.config_failure_with_policy(
                        specs,
                        policy,
                        format!("spec {spec:?} is blocked: {reason}"),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Ok(self.config_failure_with_policy(specs, policy, format!("{e:#}")));
                }
            }
        }

        // Build the plan.
        let resolver = DependencyResolver::new(self.store.clone());
        let graph = match resolver.build_graph(Some(specs)).await {
            Ok(graph) => graph,
            Err(ResolverError::SpecNotFound(spec)) => {
                return Ok(self.config_failure_with_policy(
                    specs,
                    policy,
                    format!("spec {spec:?} has no metadata under .sce/specs"),
                ));
            }
            Err(e) => {
                return Ok(self.config_failure_with_policy(specs, policy, format!("{e:#}")));
            }
        };

        if let Some(cycle) = graph.detect_cycle() {
            let plan = ExecutionPlan {
                specs: specs.to_vec(),
                batches: Vec::new(),
                has_cycle: true,
                cycle_path: Some(cycle.clone()),
            };
            self.monitor.set_run_state(EngineState::Failed);
            let outcome = RunOutcome {
                state: EngineState::Failed,
                plan,
                completed: Vec::new(),
                failed: Vec::new(),
                skipped: Vec::new(),
                result_summaries: HashMap::new(),
                coordination_policy: policy,
                error: Some(format!("dependency cycle detected: {}", cycle.join(" -> "))),
            };
            self.write_last_run(&outcome).await;
            return Ok(outcome);
        }

        let plan = ExecutionPlan {
            specs: specs.to_vec(),
            batches: graph.compute_batches(specs),
            has_cycle: false,
            cycle_path: None,
        };

        // Seed the monitor.
        self.monitor.set_batch_info(0, plan.batches.len());
        for (index, batch) in plan.batches.iter().enumerate() {
            for spec in batch {
                self.monitor.init_spec(spec, index);
                if completed_seed.contains(spec) {
                    self.monitor
                        .update_spec(spec, SpecRunStatus::Completed, None, None);
                }
            }
        }

        let supervisor = Arc::new(AgentSupervisor::new(
            self.worker.clone(),
            self.store.auto_dir().join("results"),
            Duration::from_secs(config.timeout_seconds),
        ));
        *lock(&self.supervisor) = Some(Arc::clone(&supervisor));

        let max_parallel = if multi_agent.enabled {
            config.max_parallel
        } else {
            info!("multi-agent features disabled, clamping parallelism to 1");
            1
        };
        let rate = RateGate::new(config.rate_limit.clone(), max_parallel, self.bus.clone());

        let ctx = Arc::new(RunContext {
            store: self.store.clone(),
            config,
            gate: ContractGate::new(policy),
            rate,
            supervisor,
            monitor: Arc::clone(&self.monitor),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
            graph,
        });

        // Drive the batches in topological order.
        for (index, batch) in plan.batches.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            self.monitor.set_batch_info(index, plan.batches.len());

            let runnable: Vec<String> = batch
                .iter()
                .filter(|spec| {
                    self.monitor.spec_status(spec) == Some(SpecRunStatus::Pending)
                })
                .cloned()
                .collect();
            if runnable.is_empty() {
                continue;
            }

            self.bus.emit(TelemetryEvent::BatchStart {
                index,
                specs: runnable.clone(),
            });
            run_batch(&ctx, runnable).await;
            self.bus.emit(TelemetryEvent::BatchComplete { index });
        }

        // Terminal state.
        let stopped = cancel.is_cancelled();
        if stopped {
            for spec in &plan.specs {
                self.monitor.mark_skipped(spec, "orchestration stopped");
            }
        }

        let snapshot = self.monitor.snapshot();
        let state = if stopped {
            EngineState::Stopped
        } else if snapshot
            .specs
            .values()
            .any(|run| matches!(run.status, SpecRunStatus::Failed | SpecRunStatus::Timeout))
        {
            EngineState::Failed
        } else {
            EngineState::Completed
        };
        self.monitor.set_run_state(state);
        *lock(&self.supervisor) = None;

        self.bus.emit(TelemetryEvent::OrchestrationComplete {
            state: state.to_string(),
        });

        let snapshot = self.monitor.snapshot();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        for (spec, run) in &snapshot.specs {
            match run.status {
                SpecRunStatus::Completed => completed.push(spec.clone()),
                SpecRunStatus::Failed | SpecRunStatus::Timeout => failed.push(spec.clone()),
                SpecRunStatus::Skipped => skipped.push(spec.clone()),
                _ => {}
            }
        }

        let outcome = RunOutcome {
            state,
            plan,
            completed,
            failed,
            skipped,
            result_summaries: self.monitor.summaries(),
            coordination_policy: *ctx.gate.policy(),
            error: None,
        };
        self.write_last_run(&outcome).await;
        Ok(outcome)
    }

    fn config_failure(&self, specs: &[String], error: String) -> RunOutcome {
        self.config_failure_with_policy(specs, CoordinationPolicy::default(), error)
    }

    fn config_failure_with_policy(
        &self,
        specs: &[String],
        policy: CoordinationPolicy,
        error: String,
    ) -> RunOutcome {
        warn!(error = %error, "run rejected by configuration check");
        self.monitor.set_run_state(EngineState::Failed);
        RunOutcome {
            state: EngineState::Failed,
            plan: ExecutionPlan {
                specs: specs.to_vec(),
                batches: Vec::new(),
                has_cycle: false,
                cycle_path: None,
            },
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            result_summaries: HashMap::new(),
            coordination_policy: policy,
            error: Some(error),
        }
    }

    /// Persist the structured result under `.sce/auto/`. Best-effort.
    async fn write_last_run(&self, outcome: &RunOutcome) {
        let dir = self.store.auto_dir();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(error = %e, "could not create .sce/auto");
            return;
        }
        let path = dir.join(LAST_RUN_FILE);
        match serde_json::to_vec_pretty(outcome) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), error = %e, "could not write run artifact");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize run outcome"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

/// Run one batch to quiescence: a pending queue plus an in-flight map,
/// admissions gated by the rate gate, completions fanned in over a channel.
async fn run_batch(ctx: &Arc<RunContext>, specs: Vec<String>) {
    let capacity = specs.len().max(1);
    let mut pending: VecDeque<String> = specs.into();
    let (tx, mut rx) = mpsc::channel::<SpecDone>(capacity);
    let mut in_flight = 0usize;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Admit as many pending specs as the current parallelism allows.
        while in_flight < ctx.rate.effective_parallel() {
            let Some(spec) = pending.front().cloned() else {
                break;
            };
            // Propagation may have skipped a spec while it sat in the queue.
            if ctx.monitor.spec_status(&spec) != Some(SpecRunStatus::Pending) {
                pending.pop_front();
                continue;
            }
            if !ctx.rate.admit(&ctx.cancel).await {
                break;
            }
            pending.pop_front();
            in_flight += 1;

            let ctx = Arc::clone(ctx);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = execute_spec(&ctx, &spec).await;
                let _ = tx.send(SpecDone { spec, outcome }).await;
            });
        }

        if in_flight == 0 && pending.is_empty() {
            break;
        }

        tokio::select! {
            done = rx.recv() => {
                if let Some(done) = done {
                    in_flight -= 1;
                    handle_done(ctx, &done);
                }
            }
            _ = ctx.cancel.cancelled() => {
                continue;
            }
        }
    }

    // Stop requested with executors still in flight: kill the agents and
    // give the executors a bounded window to settle.
    if ctx.cancel.is_cancelled() && in_flight > 0 {
        ctx.supervisor.kill_all().await;
        let deadline = tokio::time::Instant::now() + STOP_DRAIN_DEADLINE;
        while in_flight > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(done)) => {
                    in_flight -= 1;
                    handle_done(ctx, &done);
                }
                _ => break,
            }
        }
        if in_flight > 0 {
            warn!(remaining = in_flight, "drain deadline expired with executors still in flight");
        }
    }
}

/// Apply a settled spec's outcome: failures propagate to every transitive
/// dependent still in the plan.
fn handle_done(ctx: &Arc<RunContext>, done: &SpecDone) {
    match done.outcome {
        SpecOutcome::Completed => {
            info!(spec = %done.spec, "spec completed");
        }
        SpecOutcome::Failed => {
            for dependent in ctx.graph.transitive_dependents(&done.spec) {
                ctx.monitor
                    .mark_skipped(&dependent, &format!("dependency {} failed", done.spec));
            }
        }
        SpecOutcome::Cancelled => {
            ctx.monitor.mark_skipped(&done.spec, "orchestration stopped");
        }
    }
}

// ---------------------------------------------------------------------------
// Per-spec execution
// ---------------------------------------------------------------------------

/// Execute one spec to a terminal outcome, retrying recoverable failures
/// up to the configured ceiling.
async fn execute_spec(ctx: &Arc<RunContext>, spec: &str) -> SpecOutcome {
    loop {
        if ctx.cancel.is_cancelled() {
            return SpecOutcome::Cancelled;
        }

        ensure_assigned(ctx, spec).await;

        let spec_dir = ctx.store.spec_dir(spec);
        let handle = ctx.supervisor.spawn(spec, &spec_dir).await;
        let agent_id = handle.agent_id;
        ctx.monitor
            .update_spec(spec, SpecRunStatus::Running, Some(agent_id), None);
        ctx.bus.emit(TelemetryEvent::SpecStart {
            spec: spec.to_owned(),
            agent_id,
        });
        ctx.monitor.sync_external(spec, SpecRunStatus::Running).await;

        let waited = wait_for_terminal(ctx, handle).await;

        let (error, timed_out) = match waited {
            WaitResult::Completed => {
                match settle_completed(ctx, spec, agent_id).await {
                    Ok(()) => return SpecOutcome::Completed,
                    Err(error) => {
                        // Contract violations are never retried.
                        ctx.monitor.update_spec(
                            spec,
                            SpecRunStatus::Failed,
                            None,
                            Some(error.clone()),
                        );
                        ctx.bus.emit(TelemetryEvent::SpecFailed {
                            spec: spec.to_owned(),
                            error,
                            summary_contract_violation: true,
                        });
                        return SpecOutcome::Failed;
                    }
                }
            }
            WaitResult::Failed { exit_code, stderr } => (
                match exit_code {
                    Some(code) => format!("agent exited with status {code}: {stderr}"),
                    None => format!("agent failed: {stderr}"),
                },
                false,
            ),
            WaitResult::Timeout { timeout_seconds } => (
                format!("agent timed out after {timeout_seconds}s"),
                true,
            ),
            WaitResult::Fallback => (
                "agent wait expired without a terminal event".to_owned(),
                true,
            ),
            WaitResult::Cancelled => return SpecOutcome::Cancelled,
        };

        // A kill during stop() surfaces as a worker failure; the stop flag
        // decides, not the event race.
        if ctx.cancel.is_cancelled() {
            return SpecOutcome::Cancelled;
        }

        // Retriable failure path.
        let rate_limited = RateGate::is_rate_limit_error(&error);
        let retry_limit = if rate_limited {
            ctx.config
                .max_retries
                .max(ctx.config.rate_limit.rate_limit_max_retries)
        } else {
            ctx.config.max_retries
        };
        let retries = ctx.monitor.retry_count(spec);

        if retries < retry_limit && !ctx.cancel.is_cancelled() {
            warn!(
                spec = %spec,
                attempt = retries + 1,
                rate_limited,
                error = %error,
                "spec attempt failed, retrying"
            );
            ctx.monitor.begin_retry(spec);

            // Only rate-limit signals carry an admission delay.
            if rate_limited {
                let delay = ctx.rate.on_rate_limit(spec, retries, &error);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => return SpecOutcome::Cancelled,
                }
            }
            continue;
        }

        let terminal_status = if timed_out {
            SpecRunStatus::Timeout
        } else {
            SpecRunStatus::Failed
        };
        ctx.monitor
            .update_spec(spec, terminal_status, None, Some(error.clone()));
        ctx.bus.emit(TelemetryEvent::SpecFailed {
            spec: spec.to_owned(),
            error,
            summary_contract_violation: false,
        });
        return SpecOutcome::Failed;
    }
}

/// Completion path: read the summary, run the contract gate, persist and
/// announce. Returns the descriptive error on any contract violation.
async fn settle_completed(
    ctx: &Arc<RunContext>,
    spec: &str,
    agent_id: Uuid,
) -> Result<(), String> {
    let payload = ctx
        .supervisor
        .get_result_summary(agent_id)
        .await
        .map_err(|e| format!("result summary unreadable: {e}"))?;

    let summary = ctx
        .gate
        .evaluate(spec, payload)
        .map_err(|violation| violation.to_string())?;

    ctx.monitor.record_summary(spec, summary.clone());
    ctx.monitor
        .update_spec(spec, SpecRunStatus::Completed, None, None);
    ctx.monitor
        .sync_external(spec, SpecRunStatus::Completed)
        .await;
    ctx.bus.emit(TelemetryEvent::SpecComplete {
        spec: spec.to_owned(),
        summary,
    });
    Ok(())
}

/// Observe the agent's event stream until a terminal event, the fallback
/// deadline, or cancellation. Output events are folded into the monitor as
/// they arrive; the terminal agent event strictly precedes every status
/// update derived from it.
async fn wait_for_terminal(ctx: &Arc<RunContext>, handle: AgentHandle) -> WaitResult {
    let fallback = Duration::from_secs(ctx.config.timeout_seconds) + FALLBACK_WAIT_GRACE;
    let deadline = tokio::time::sleep(fallback);
    tokio::pin!(deadline);

    let mut events = handle.events;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(AgentEvent::Started { .. }) => {}
                Some(AgentEvent::Output { agent_id, payload }) => {
                    ctx.monitor.handle_event(agent_id, &payload);
                }
                Some(AgentEvent::Completed { .. }) => return WaitResult::Completed,
                Some(AgentEvent::Failed { exit_code, stderr, .. }) => {
                    return WaitResult::Failed { exit_code, stderr };
                }
                Some(AgentEvent::Timeout { timeout_seconds, .. }) => {
                    return WaitResult::Timeout { timeout_seconds };
                }
                None => {
                    return WaitResult::Failed {
                        exit_code: None,
                        stderr: "agent event stream ended without a terminal event".to_owned(),
                    };
                }
            },
            _ = &mut deadline => return WaitResult::Fallback,
            _ = ctx.cancel.cancelled() => return WaitResult::Cancelled,
        }
    }
}

/// Best-effort lifecycle advance to `assigned` before spawning. On a retry
/// the record is already `in-progress` and nothing needs to move.
async fn ensure_assigned(ctx: &Arc<RunContext>, spec: &str) {
    let current = match ctx.store.read_lifecycle(spec).await {
        Ok(record) => record.status,
        Err(e) => {
            warn!(spec = %spec, error = %e, "could not read lifecycle record");
            return;
        }
    };
    if current == LifecycleState::Planned {
        if let Err(e) = ctx
            .store
            .record_transition(spec, LifecycleState::Assigned)
            .await
        {
            warn!(spec = %spec, error = %e, "lifecycle transition to assigned failed");
        }
    }
}
