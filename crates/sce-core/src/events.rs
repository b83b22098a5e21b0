//! Process-local telemetry bus.
//!
//! Events are fanned out over a broadcast channel with a stable wire format
//! for downstream subscribers. Emission is fire-and-forget: a bus with no
//! subscribers drops events silently.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use sce_store::models::ResultSummary;

/// Default capacity of the broadcast ring buffer.
const DEFAULT_CAPACITY: usize = 256;

/// A telemetry event emitted during orchestration.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TelemetryEvent {
    #[serde(rename = "batch:start")]
    BatchStart { index: usize, specs: Vec<String> },

    #[serde(rename = "batch:complete")]
    BatchComplete { index: usize },

    #[serde(rename = "spec:start")]
    SpecStart { spec: String, agent_id: Uuid },

    #[serde(rename = "spec:complete")]
    SpecComplete {
        spec: String,
        summary: ResultSummary,
    },

    #[serde(rename = "spec:failed")]
    SpecFailed {
        spec: String,
        error: String,
        summary_contract_violation: bool,
    },

    #[serde(rename = "spec:rate-limited")]
    SpecRateLimited { spec: String, delay_ms: u64 },

    #[serde(rename = "parallel:throttled")]
    ParallelThrottled { effective_parallel: usize },

    #[serde(rename = "parallel:recovered")]
    ParallelRecovered { effective_parallel: usize },

    #[serde(rename = "launch:budget-hold")]
    LaunchBudgetHold { hold_ms: u64 },

    #[serde(rename = "launch:budget-throttled")]
    LaunchBudgetThrottled { dynamic_budget: u32 },

    #[serde(rename = "launch:budget-recovered")]
    LaunchBudgetRecovered { dynamic_budget: u32 },

    #[serde(rename = "orchestration:complete")]
    OrchestrationComplete { state: String },
}

/// Broadcast fan-out for [`TelemetryEvent`]s.
///
/// Cloning the bus clones the sender; every clone emits into the same
/// channel. Each `OrchestrationEngine` owns its own bus, so concurrent runs
/// in one process never share subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Never fails; an empty subscriber set is fine.
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
