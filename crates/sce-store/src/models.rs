use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of spec: a master spec coordinates sub-specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecType {
    Master,
    Sub,
}

impl fmt::Display for SpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Master => "master",
            Self::Sub => "sub",
        };
        f.write_str(s)
    }
}

impl FromStr for SpecType {
    type Err = SpecTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Self::Master),
            "sub" => Ok(Self::Sub),
            other => Err(SpecTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SpecType`] string.
#[derive(Debug, Clone)]
pub struct SpecTypeParseError(pub String);

impl fmt::Display for SpecTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid spec type: {:?}", self.0)
    }
}

impl std::error::Error for SpecTypeParseError {}

// ---------------------------------------------------------------------------

/// Kind of dependency edge between two specs.
///
/// `requires-completion` gates scheduling on the dependency being completed;
/// `requires-interface` is satisfied once the dependency is at least
/// in-progress; `optional` never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    RequiresCompletion,
    RequiresInterface,
    Optional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RequiresCompletion => "requires-completion",
            Self::RequiresInterface => "requires-interface",
            Self::Optional => "optional",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyKind {
    type Err = DependencyKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requires-completion" => Ok(Self::RequiresCompletion),
            "requires-interface" => Ok(Self::RequiresInterface),
            "optional" => Ok(Self::Optional),
            other => Err(DependencyKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DependencyKind`] string.
#[derive(Debug, Clone)]
pub struct DependencyKindParseError(pub String);

impl fmt::Display for DependencyKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency kind: {:?}", self.0)
    }
}

impl std::error::Error for DependencyKindParseError {}

// ---------------------------------------------------------------------------

/// Collaboration status of a spec, as written by surrounding tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for SpecStatus {
    type Err = SpecStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-started" => Ok(Self::NotStarted),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            other => Err(SpecStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SpecStatus`] string.
#[derive(Debug, Clone)]
pub struct SpecStatusParseError(pub String);

impl fmt::Display for SpecStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid spec status: {:?}", self.0)
    }
}

impl std::error::Error for SpecStatusParseError {}

// ---------------------------------------------------------------------------

/// Persisted lifecycle state of a spec.
///
/// Enforces the valid transition graph:
///
/// ```text
/// planned     -> assigned
/// assigned    -> in-progress
/// assigned    -> planned      (unassign)
/// in-progress -> completed
/// in-progress -> assigned     (rewind for retry)
/// completed   -> released
/// released    (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Planned,
    Assigned,
    InProgress,
    Completed,
    Released,
}

impl LifecycleState {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the lifecycle graph.
    pub fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
        matches!(
            (from, to),
            (Self::Planned, Self::Assigned)
                | (Self::Assigned, Self::InProgress)
                | (Self::Assigned, Self::Planned)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Assigned)
                | (Self::Completed, Self::Released)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Assigned => "assigned",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

impl FromStr for LifecycleState {
    type Err = LifecycleStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "assigned" => Ok(Self::Assigned),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "released" => Ok(Self::Released),
            other => Err(LifecycleStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LifecycleState`] string.
#[derive(Debug, Clone)]
pub struct LifecycleStateParseError(pub String);

impl fmt::Display for LifecycleStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lifecycle state: {:?}", self.0)
    }
}

impl std::error::Error for LifecycleStateParseError {}

// ---------------------------------------------------------------------------

/// Risk level reported in an agent's result summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskLevel {
    type Err = RiskLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "unknown" => Ok(Self::Unknown),
            other => Err(RiskLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RiskLevel`] string.
#[derive(Debug, Clone)]
pub struct RiskLevelParseError(pub String);

impl fmt::Display for RiskLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid risk level: {:?}", self.0)
    }
}

impl std::error::Error for RiskLevelParseError {}

// ---------------------------------------------------------------------------
// Record structs
// ---------------------------------------------------------------------------

/// One declared dependency edge in `collaboration.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyDecl {
    /// Name of the spec this one depends on.
    pub spec: String,
    #[serde(rename = "type")]
    pub kind: DependencyKind,
    #[serde(default)]
    pub reason: String,
}

/// The `status` block of `collaboration.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBlock {
    pub current: SpecStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// Collaborator currently working the spec, when one is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// Interface identifiers a spec provides and consumes. Opaque to the
/// orchestrator core; carried for collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSet {
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
}

/// Per-spec collaboration metadata (`collaboration.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub version: String,
    #[serde(rename = "type")]
    pub spec_type: SpecType,
    #[serde(default)]
    pub dependencies: Vec<DependencyDecl>,
    pub status: StatusBlock,
    #[serde(default)]
    pub interfaces: InterfaceSet,
}

impl Collaboration {
    /// A fresh sub-spec record with `not-started` status and no edges.
    pub fn new_sub() -> Self {
        Self {
            version: "1.0.0".to_owned(),
            spec_type: SpecType::Sub,
            dependencies: Vec::new(),
            status: StatusBlock {
                current: SpecStatus::NotStarted,
                updated_at: Utc::now(),
                block_reason: None,
                assignee: None,
            },
            interfaces: InterfaceSet::default(),
        }
    }
}

/// One recorded lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: DateTime<Utc>,
}

/// Per-spec lifecycle record (`lifecycle.json`). Transitions are
/// append-only and monotonic in timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub spec_name: String,
    pub status: LifecycleState,
    #[serde(default)]
    pub transitions: Vec<LifecycleTransition>,
}

impl LifecycleRecord {
    /// The default record used when no file exists or the file is corrupted.
    pub fn planned(spec_name: impl Into<String>) -> Self {
        Self {
            spec_name: spec_name.into(),
            status: LifecycleState::Planned,
            transitions: Vec::new(),
        }
    }
}

/// The agent-to-orchestrator result contract. Extra fields in the payload
/// are permitted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub spec_id: String,
    pub changed_files: Vec<String>,
    pub tests_run: u64,
    pub tests_passed: u64,
    pub risk_level: RiskLevel,
    pub open_issues: Vec<String>,
}

impl ResultSummary {
    /// The neutral payload synthesized when no summary is required and none
    /// was produced.
    pub fn neutral(spec_id: impl Into<String>) -> Self {
        Self {
            spec_id: spec_id.into(),
            changed_files: Vec::new(),
            tests_run: 0,
            tests_passed: 0,
            risk_level: RiskLevel::Unknown,
            open_issues: Vec::new(),
        }
    }
}

/// Merge-gate policy resolved at run start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoordinationPolicy {
    #[serde(default)]
    pub require_result_summary: bool,
    #[serde(default = "default_true")]
    pub block_merge_on_failed_tests: bool,
    #[serde(default = "default_true")]
    pub block_merge_on_unresolved_conflicts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CoordinationPolicy {
    fn default() -> Self {
        Self {
            require_result_summary: false,
            block_merge_on_failed_tests: true,
            block_merge_on_unresolved_conflicts: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
