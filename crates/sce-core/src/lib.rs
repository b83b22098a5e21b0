//! Orchestration core: dependency resolution, agent supervision, status
//! monitoring, rate-limit-aware admission control, contract gating, and the
//! engine that drives a run batch by batch.

pub mod contract;
pub mod engine;
pub mod events;
pub mod graph;
pub mod monitor;
pub mod rategate;
pub mod supervisor;

pub use contract::{ContractGate, ContractViolation};
pub use engine::{OrchestrationEngine, RunOutcome};
pub use events::{EventBus, TelemetryEvent};
pub use graph::{DependencyGraph, DependencyResolver, ExecutionPlan, ResolverError};
pub use monitor::{EngineState, OrchestrationStatus, SpecRunStatus, StatusMonitor};
pub use rategate::RateGate;
pub use supervisor::{AgentEvent, AgentSupervisor, SupervisorError, WorkerCommand};
