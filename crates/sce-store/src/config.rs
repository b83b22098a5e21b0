//! Orchestrator configuration.
//!
//! Loads `.sce/config/orchestrator.json` and `.sce/config/multi-agent.json`.
//! Rate-limit profiles are resolved into concrete numeric settings at load
//! time and frozen for the duration of a run; individual keys in the file
//! and runtime overrides merge on top of the selected profile. Unknown keys
//! are ignored.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Relative path of the orchestrator config file.
pub const ORCHESTRATOR_CONFIG: &str = ".sce/config/orchestrator.json";
/// Relative path of the multi-agent feature gate file.
pub const MULTI_AGENT_CONFIG: &str = ".sce/config/multi-agent.json";
/// Relative path of the coordination-policy baseline file.
pub const COORDINATION_CONFIG: &str = ".sce/config/coordination.json";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Rate-limit profiles
// ---------------------------------------------------------------------------

/// Named rate-limit profile selecting a baseline for [`RateLimitSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitProfile {
    Conservative,
    Balanced,
    Aggressive,
}

impl fmt::Display for RateLimitProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        };
        f.write_str(s)
    }
}

impl FromStr for RateLimitProfile {
    type Err = RateLimitProfileParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(RateLimitProfileParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RateLimitProfile`] string.
#[derive(Debug, Clone)]
pub struct RateLimitProfileParseError(pub String);

impl fmt::Display for RateLimitProfileParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rate limit profile: {:?}", self.0)
    }
}

impl std::error::Error for RateLimitProfileParseError {}

/// Concrete admission-control settings, resolved from a profile plus
/// overrides and frozen for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub rate_limit_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub adaptive_parallel: bool,
    pub parallel_floor: usize,
    pub cooldown_ms: u64,
    pub launch_budget_per_minute: u32,
    pub launch_budget_window_ms: u64,
    pub signal_window_ms: u64,
    pub signal_threshold: u32,
    pub signal_extra_hold_ms: u64,
    pub dynamic_budget_floor: u32,
}

impl RateLimitSettings {
    /// Baseline numbers for a profile.
    pub fn for_profile(profile: RateLimitProfile) -> Self {
        match profile {
            RateLimitProfile::Conservative => Self {
                rate_limit_max_retries: 10,
                backoff_base_ms: 2_500,
                backoff_max_ms: 120_000,
                adaptive_parallel: true,
                parallel_floor: 1,
                cooldown_ms: 90_000,
                launch_budget_per_minute: 4,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 45_000,
                signal_threshold: 2,
                signal_extra_hold_ms: 5_000,
                dynamic_budget_floor: 1,
            },
            RateLimitProfile::Balanced => Self {
                rate_limit_max_retries: 8,
                backoff_base_ms: 1_500,
                backoff_max_ms: 60_000,
                adaptive_parallel: true,
                parallel_floor: 1,
                cooldown_ms: 45_000,
                launch_budget_per_minute: 8,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 30_000,
                signal_threshold: 3,
                signal_extra_hold_ms: 3_000,
                dynamic_budget_floor: 1,
            },
            RateLimitProfile::Aggressive => Self {
                rate_limit_max_retries: 6,
                backoff_base_ms: 1_000,
                backoff_max_ms: 30_000,
                adaptive_parallel: true,
                parallel_floor: 2,
                cooldown_ms: 20_000,
                launch_budget_per_minute: 16,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 20_000,
                signal_threshold: 5,
                signal_extra_hold_ms: 1_500,
                dynamic_budget_floor: 2,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator config
// ---------------------------------------------------------------------------

/// Resolved orchestrator configuration, frozen at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_parallel: usize,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub rate_limit_profile: RateLimitProfile,
    pub rate_limit: RateLimitSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let profile = RateLimitProfile::Balanced;
        Self {
            max_parallel: 3,
            timeout_seconds: 600,
            max_retries: 2,
            rate_limit_profile: profile,
            rate_limit: RateLimitSettings::for_profile(profile),
        }
    }
}

/// The on-disk shape of `orchestrator.json`: every key optional, unknown
/// keys ignored. Individual rate-limit keys override the selected profile.
#[derive(Debug, Clone, Default, Deserialize)]
struct OrchestratorFile {
    max_parallel: Option<usize>,
    timeout_seconds: Option<u64>,
    max_retries: Option<u32>,
    rate_limit_profile: Option<RateLimitProfile>,
    rate_limit_max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    adaptive_parallel: Option<bool>,
    parallel_floor: Option<usize>,
    cooldown_ms: Option<u64>,
    launch_budget_per_minute: Option<u32>,
    launch_budget_window_ms: Option<u64>,
    signal_window_ms: Option<u64>,
    signal_threshold: Option<u32>,
    signal_extra_hold_ms: Option<u64>,
    dynamic_budget_floor: Option<u32>,
}

/// Runtime overrides merged on top of the file-resolved config at
/// `start()`. Fields left `None` keep the resolved value.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOverrides {
    pub max_parallel: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub rate_limit_profile: Option<RateLimitProfile>,
    pub require_result_summary: Option<bool>,
    pub block_merge_on_failed_tests: Option<bool>,
    pub block_merge_on_unresolved_conflicts: Option<bool>,
}

impl OrchestratorConfig {
    /// Load and resolve configuration from `<root>/.sce/config/orchestrator.json`.
    ///
    /// A missing file yields the defaults; malformed JSON is a configuration
    /// error. Resolution order: profile baseline, then individual file keys,
    /// then `overrides`.
    pub fn load(root: &Path, overrides: &OrchestratorOverrides) -> Result<Self, ConfigError> {
        let path = root.join(ORCHESTRATOR_CONFIG);
        let file: OrchestratorFile = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ConfigError::Json {
                path: path.display().to_string(),
                source: e,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OrchestratorFile::default(),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };

        let profile = overrides
            .rate_limit_profile
            .or(file.rate_limit_profile)
            .unwrap_or(RateLimitProfile::Balanced);

        let mut rl = RateLimitSettings::for_profile(profile);
        if let Some(v) = file.rate_limit_max_retries {
            rl.rate_limit_max_retries = v;
        }
        if let Some(v) = file.backoff_base_ms {
            rl.backoff_base_ms = v;
        }
        if let Some(v) = file.backoff_max_ms {
            rl.backoff_max_ms = v;
        }
        if let Some(v) = file.adaptive_parallel {
            rl.adaptive_parallel = v;
        }
        if let Some(v) = file.parallel_floor {
            rl.parallel_floor = v;
        }
        if let Some(v) = file.cooldown_ms {
            rl.cooldown_ms = v;
        }
        if let Some(v) = file.launch_budget_per_minute {
            rl.launch_budget_per_minute = v;
        }
        if let Some(v) = file.launch_budget_window_ms {
            rl.launch_budget_window_ms = v;
        }
        if let Some(v) = file.signal_window_ms {
            rl.signal_window_ms = v;
        }
        if let Some(v) = file.signal_threshold {
            rl.signal_threshold = v;
        }
        if let Some(v) = file.signal_extra_hold_ms {
            rl.signal_extra_hold_ms = v;
        }
        if let Some(v) = file.dynamic_budget_floor {
            rl.dynamic_budget_floor = v;
        }

        let mut config = Self {
            max_parallel: overrides.max_parallel.or(file.max_parallel).unwrap_or(3),
            timeout_seconds: overrides
                .timeout_seconds
                .or(file.timeout_seconds)
                .unwrap_or(600),
            max_retries: overrides.max_retries.or(file.max_retries).unwrap_or(2),
            rate_limit_profile: profile,
            rate_limit: rl,
        };
        config.normalize()?;
        Ok(config)
    }

    /// Clamp derived invariants: `max_parallel >= 1`,
    /// `1 <= parallel_floor <= max_parallel`, backoff envelope ordered,
    /// dynamic budget floor within the configured budget.
    fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be >= 1".to_owned()));
        }
        let rl = &mut self.rate_limit;
        rl.parallel_floor = rl.parallel_floor.clamp(1, self.max_parallel);
        if rl.backoff_max_ms < rl.backoff_base_ms {
            rl.backoff_max_ms = rl.backoff_base_ms;
        }
        if rl.launch_budget_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "launch_budget_per_minute must be >= 1".to_owned(),
            ));
        }
        rl.dynamic_budget_floor = rl.dynamic_budget_floor.clamp(1, rl.launch_budget_per_minute);
        // The rate-limit retry ceiling never sits below the general one.
        rl.rate_limit_max_retries = rl.rate_limit_max_retries.max(self.max_retries);
        Ok(())
    }
}

/// Load the coordination policy from `<root>/.sce/config/coordination.json`,
/// merged with runtime overrides. A missing file yields the defaults;
/// malformed JSON is a configuration error.
pub fn load_coordination_policy(
    root: &Path,
    overrides: &OrchestratorOverrides,
) -> Result<crate::models::CoordinationPolicy, ConfigError> {
    let path = root.join(COORDINATION_CONFIG);
    let mut policy: crate::models::CoordinationPolicy = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ConfigError::Json {
            path: path.display().to_string(),
            source: e,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Default::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }
    };

    if let Some(v) = overrides.require_result_summary {
        policy.require_result_summary = v;
    }
    if let Some(v) = overrides.block_merge_on_failed_tests {
        policy.block_merge_on_failed_tests = v;
    }
    if let Some(v) = overrides.block_merge_on_unresolved_conflicts {
        policy.block_merge_on_unresolved_conflicts = v;
    }
    Ok(policy)
}

// ---------------------------------------------------------------------------
// Multi-agent gate
// ---------------------------------------------------------------------------

/// Feature gate from `.sce/config/multi-agent.json`. When disabled the
/// engine clamps effective parallelism to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MultiAgentConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for MultiAgentConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MultiAgentConfig {
    /// Load the gate from `<root>/.sce/config/multi-agent.json`. Missing or
    /// unreadable files fall back to the default (enabled) with a warning;
    /// the gate is never load-bearing enough to fail a run.
    pub fn load(root: &Path) -> Self {
        let path = root.join(MULTI_AGENT_CONFIG);
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed multi-agent config, using default");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable multi-agent config, using default");
                Self::default()
            }
        }
    }
}
