//! Run-state ownership and status aggregation.
//!
//! The monitor owns every per-spec [`SpecRun`] entry and the aggregate run
//! state. Spec-executors and the engine mutate state through it; external
//! readers only ever see a [`snapshot`](StatusMonitor::snapshot). Agent
//! stdout events are folded in tolerantly: a malformed payload is ignored,
//! never an error.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use sce_store::MetadataStore;
use sce_store::models::{LifecycleState, ResultSummary, SpecStatus};

/// Aggregate state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-spec run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl SpecRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Skipped
        )
    }
}

impl fmt::Display for SpecRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Mutable per-spec entry in the run state.
#[derive(Debug, Clone, Serialize)]
pub struct SpecRun {
    pub status: SpecRunStatus,
    pub batch_index: usize,
    pub agent_id: Option<Uuid>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub turn_count: u32,
}

impl SpecRun {
    fn new(batch_index: usize) -> Self {
        Self {
            status: SpecRunStatus::Pending,
            batch_index,
            agent_id: None,
            retry_count: 0,
            last_error: None,
            turn_count: 0,
        }
    }
}

/// Point-in-time aggregate view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStatus {
    pub state: EngineState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub specs: BTreeMap<String, SpecRun>,
}

struct Inner {
    state: EngineState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    current_batch: usize,
    total_batches: usize,
    specs: HashMap<String, SpecRun>,
    agents: HashMap<Uuid, String>,
    summaries: HashMap<String, ResultSummary>,
}

/// Owns the process-local run state for one engine instance.
pub struct StatusMonitor {
    store: MetadataStore,
    inner: Mutex<Inner>,
}

impl StatusMonitor {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                started_at: None,
                completed_at: None,
                current_batch: 0,
                total_batches: 0,
                specs: HashMap::new(),
                agents: HashMap::new(),
                summaries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panicking writer; the state is still the
        // best information available for shutdown reporting.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically begin a run: moves any non-running state to `running` and
    /// clears all per-spec state from a prior run. Returns `false` when a
    /// run is already in progress.
    pub fn try_begin_run(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == EngineState::Running {
            return false;
        }
        inner.state = EngineState::Running;
        inner.started_at = Some(Utc::now());
        inner.completed_at = None;
        inner.current_batch = 0;
        inner.total_batches = 0;
        inner.specs.clear();
        inner.agents.clear();
        inner.summaries.clear();
        true
    }

    /// Register a spec at the start of a run. Resets any prior entry.
    pub fn init_spec(&self, spec: &str, batch_index: usize) {
        self.lock()
            .specs
            .insert(spec.to_owned(), SpecRun::new(batch_index));
    }

    /// Update a spec's status. Transitions are monotonic: a terminal status
    /// is never overwritten, and moving back to `pending` happens only
    /// through [`Self::begin_retry`].
    pub fn update_spec(
        &self,
        spec: &str,
        status: SpecRunStatus,
        agent_id: Option<Uuid>,
        error: Option<String>,
    ) {
        let mut inner = self.lock();
        if let Some(agent) = agent_id {
            inner.agents.insert(agent, spec.to_owned());
        }
        let Some(run) = inner.specs.get_mut(spec) else {
            debug!(spec = %spec, "status update for unknown spec ignored");
            return;
        };
        if run.status.is_terminal() {
            debug!(spec = %spec, from = %run.status, to = %status, "ignoring status regression from terminal state");
            return;
        }
        if status == SpecRunStatus::Pending && run.status != SpecRunStatus::Pending {
            debug!(spec = %spec, "pending is only reachable through the retry path");
            return;
        }
        run.status = status;
        if let Some(agent) = agent_id {
            run.agent_id = Some(agent);
        }
        if let Some(error) = error {
            run.last_error = Some(error);
        }
    }

    /// Retry path: put a non-terminal spec back to `pending` and bump its
    /// retry counter.
    pub fn begin_retry(&self, spec: &str) {
        let mut inner = self.lock();
        if let Some(run) = inner.specs.get_mut(spec) {
            if run.status.is_terminal() {
                debug!(spec = %spec, "retry requested for terminal spec ignored");
                return;
            }
            run.status = SpecRunStatus::Pending;
            run.retry_count += 1;
            run.agent_id = None;
        }
    }

    /// Mark a spec skipped with a reason, unless it is already terminal.
    pub fn mark_skipped(&self, spec: &str, reason: &str) {
        let mut inner = self.lock();
        if let Some(run) = inner.specs.get_mut(spec) {
            if run.status.is_terminal() {
                return;
            }
            run.status = SpecRunStatus::Skipped;
            run.last_error = Some(reason.to_owned());
        }
    }

    pub fn increment_retry(&self, spec: &str) {
        if let Some(run) = self.lock().specs.get_mut(spec) {
            run.retry_count += 1;
        }
    }

    pub fn retry_count(&self, spec: &str) -> u32 {
        self.lock().specs.get(spec).map_or(0, |r| r.retry_count)
    }

    pub fn spec_status(&self, spec: &str) -> Option<SpecRunStatus> {
        self.lock().specs.get(spec).map(|r| r.status)
    }

    pub fn set_batch_info(&self, current: usize, total: usize) {
        let mut inner = self.lock();
        inner.current_batch = current;
        inner.total_batches = total;
    }

    pub fn set_run_state(&self, state: EngineState) {
        let mut inner = self.lock();
        inner.state = state;
        match state {
            EngineState::Running => {
                inner.started_at = Some(Utc::now());
                inner.completed_at = None;
            }
            EngineState::Completed | EngineState::Failed | EngineState::Stopped => {
                inner.completed_at = Some(Utc::now());
            }
            EngineState::Idle => {}
        }
    }

    pub fn run_state(&self) -> EngineState {
        self.lock().state
    }

    /// Record the validated summary for a completed spec.
    pub fn record_summary(&self, spec: &str, summary: ResultSummary) {
        self.lock().summaries.insert(spec.to_owned(), summary);
    }

    pub fn summaries(&self) -> HashMap<String, ResultSummary> {
        self.lock().summaries.clone()
    }

    /// Fold one agent stdout event into the run state. Tolerant to
    /// malformed input: anything unrecognized is silently ignored.
    pub fn handle_event(&self, agent_id: Uuid, payload: &serde_json::Value) {
        let Some(event_type) = payload.get("type").and_then(|t| t.as_str()) else {
            return;
        };

        let mut inner = self.lock();
        let Some(spec) = inner.agents.get(&agent_id).cloned() else {
            return;
        };
        let Some(run) = inner.specs.get_mut(&spec) else {
            return;
        };

        match event_type {
            "thread_started" | "started" => {
                if !run.status.is_terminal() {
                    run.status = SpecRunStatus::Running;
                }
            }
            "error" => {
                let message = payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                run.last_error = Some(message.to_owned());
            }
            "turn_started" => {
                run.turn_count += 1;
            }
            _ => {}
        }
    }

    /// Aggregate view, serializable with concurrent writers.
    pub fn snapshot(&self) -> OrchestrationStatus {
        let inner = self.lock();
        let specs: BTreeMap<String, SpecRun> = inner
            .specs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let completed = specs
            .values()
            .filter(|r| r.status == SpecRunStatus::Completed)
            .count();
        let failed = specs
            .values()
            .filter(|r| matches!(r.status, SpecRunStatus::Failed | SpecRunStatus::Timeout))
            .count();
        let running = specs
            .values()
            .filter(|r| r.status == SpecRunStatus::Running)
            .count();

        OrchestrationStatus {
            state: inner.state,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            total: specs.len(),
            completed,
            failed,
            running,
            current_batch: inner.current_batch,
            total_batches: inner.total_batches,
            specs,
        }
    }

    /// Best-effort projection of a run status onto the persisted records:
    /// `running` maps to `in-progress`, `completed` to `completed`, all
    /// other statuses are a no-op. Failures are logged, never raised.
    pub async fn sync_external(&self, spec: &str, status: SpecRunStatus) {
        let result = match status {
            SpecRunStatus::Running => self.project(spec, SpecStatus::InProgress).await,
            SpecRunStatus::Completed => self.project(spec, SpecStatus::Completed).await,
            _ => return,
        };
        if let Err(e) = result {
            warn!(spec = %spec, error = %e, "external status projection failed");
        }
    }

    async fn project(&self, spec: &str, status: SpecStatus) -> anyhow::Result<()> {
        self.store
            .atomic_update(spec, |collab| {
                collab.status.current = status;
            })
            .await?;

        let lifecycle_target = match status {
            SpecStatus::InProgress => LifecycleState::InProgress,
            SpecStatus::Completed => LifecycleState::Completed,
            _ => return Ok(()),
        };
        let current = self.store.read_lifecycle(spec).await?.status;
        if LifecycleState::is_valid_transition(current, lifecycle_target) {
            self.store.record_transition(spec, lifecycle_target).await?;
        }
        Ok(())
    }
}
