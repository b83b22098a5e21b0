//! Agent supervisor: launches one external worker process per spec and
//! surfaces its lifecycle as an ordered event stream.
//!
//! Each spawned agent gets a bounded channel keyed by its `agent_id`; the
//! spec-executor that owns the handle is the single consumer. The monitor
//! task emits `Started` first and exactly one terminal event
//! (`Completed`/`Failed`/`Timeout`) last, with tolerant JSONL `Output`
//! events from the worker's stdout in between.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each per-agent event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// How long a SIGTERM'd worker gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Bytes of stderr kept for failure reports.
const STDERR_SNIPPET_MAX: usize = 4096;

/// Errors surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to read result summary at {path}")]
    SummaryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed result summary at {path}")]
    SummaryMalformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How to launch a worker. The spec context is injected through the
/// `SCE_SPEC`, `SCE_SPEC_DIR`, and `SCE_RESULT_PATH` environment variables;
/// the working directory is the spec's directory.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    /// A worker launched as `program` with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// A lifecycle event for one agent. Per agent, `Started` strictly precedes
/// the terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Started {
        agent_id: Uuid,
        spec: String,
    },
    /// One parsed JSONL line from the worker's stdout. Malformed lines are
    /// skipped with a warning and never produce an event.
    Output {
        agent_id: Uuid,
        payload: serde_json::Value,
    },
    Completed {
        agent_id: Uuid,
        spec: String,
    },
    Failed {
        agent_id: Uuid,
        spec: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    Timeout {
        agent_id: Uuid,
        spec: String,
        timeout_seconds: u64,
    },
}

impl AgentEvent {
    /// Whether this event ends the agent's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Timeout { .. }
        )
    }
}

/// Handle returned by [`AgentSupervisor::spawn`]: the agent id plus the
/// event stream owned by the calling spec-executor. Dropping the stream
/// unsubscribes; the monitor task keeps running until the process exits.
pub struct AgentHandle {
    pub agent_id: Uuid,
    pub events: ReceiverStream<AgentEvent>,
}

/// Bookkeeping for an in-flight agent.
struct LiveAgent {
    spec: String,
    kill: CancellationToken,
}

/// Launches, tracks, times out, and kills one worker process per spec.
/// Safe to share across tasks.
#[derive(Clone)]
pub struct AgentSupervisor {
    worker: WorkerCommand,
    results_dir: PathBuf,
    timeout: Duration,
    live: Arc<Mutex<HashMap<Uuid, LiveAgent>>>,
}

impl AgentSupervisor {
    /// Create a supervisor. `results_dir` is where agents are told to write
    /// their summary files (`<results_dir>/<agent_id>.json`).
    pub fn new(worker: WorkerCommand, results_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            worker,
            results_dir: results_dir.into(),
            timeout,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Path of the summary file for an agent.
    pub fn result_path(&self, agent_id: Uuid) -> PathBuf {
        self.results_dir.join(format!("{agent_id}.json"))
    }

    /// Launch a worker for `spec` rooted at `spec_dir`.
    ///
    /// Launch failures are reported through the event stream (`Failed` with
    /// no exit code), so the caller observes every outcome in one place.
    pub async fn spawn(&self, spec: &str, spec_dir: &Path) -> AgentHandle {
        let agent_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let result_path = self.result_path(agent_id);

        if let Err(e) = tokio::fs::create_dir_all(&self.results_dir).await {
            warn!(dir = %self.results_dir.display(), error = %e, "could not create results dir");
        }

        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .current_dir(spec_dir)
            .env("SCE_SPEC", spec)
            .env("SCE_SPEC_DIR", spec_dir)
            .env("SCE_RESULT_PATH", &result_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in &self.worker.envs {
            cmd.env(key, value);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Failed {
                        agent_id,
                        spec: spec.to_owned(),
                        exit_code: None,
                        stderr: format!(
                            "failed to spawn worker {:?}: {e}",
                            self.worker.program
                        ),
                    })
                    .await;
                return AgentHandle {
                    agent_id,
                    events: ReceiverStream::new(rx),
                };
            }
        };

        let kill = CancellationToken::new();
        {
            let mut live = self.live.lock().await;
            live.insert(
                agent_id,
                LiveAgent {
                    spec: spec.to_owned(),
                    kill: kill.clone(),
                },
            );
        }

        let _ = tx
            .send(AgentEvent::Started {
                agent_id,
                spec: spec.to_owned(),
            })
            .await;

        let spec = spec.to_owned();
        let timeout = self.timeout;
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let terminal = monitor_agent(child, agent_id, &spec, timeout, &kill, &tx).await;
            live.lock().await.remove(&agent_id);
            let _ = tx.send(terminal).await;
        });

        AgentHandle {
            agent_id,
            events: ReceiverStream::new(rx),
        }
    }

    /// Request graceful termination of every in-flight agent. Each worker
    /// gets SIGTERM, a short grace period, then SIGKILL. Idempotent.
    pub async fn kill_all(&self) {
        let live = self.live.lock().await;
        for (agent_id, agent) in live.iter() {
            debug!(agent_id = %agent_id, spec = %agent.spec, "requesting agent termination");
            agent.kill.cancel();
        }
    }

    /// Number of agents currently in flight.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Read an agent's result-summary payload. Absence is not an error
    /// here; the caller decides what a missing summary means.
    pub async fn get_result_summary(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<serde_json::Value>, SupervisorError> {
        let path = self.result_path(agent_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SupervisorError::SummaryIo { path, source: e }),
        };
        let payload = serde_json::from_slice(&bytes)
            .map_err(|e| SupervisorError::SummaryMalformed { path, source: e })?;
        Ok(Some(payload))
    }
}

/// Drive one agent to its terminal event: stream stdout JSONL, capture
/// stderr, enforce the timeout, honor kill requests.
async fn monitor_agent(
    mut child: Child,
    agent_id: Uuid,
    spec: &str,
    timeout: Duration,
    kill: &CancellationToken,
    tx: &mpsc::Sender<AgentEvent>,
) -> AgentEvent {
    let pid = child.id();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Stdout and stderr are drained concurrently with the wait so a chatty
    // worker can never deadlock on a full pipe buffer.
    let stream_stdout = async {
        if let Some(out) = stdout_pipe.as_mut() {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(payload) => {
                        let _ = tx.send(AgentEvent::Output { agent_id, payload }).await;
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, line = trimmed, error = %e, "skipping malformed worker output line");
                    }
                }
            }
        }
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let io_future = async {
        let (wait_result, (), stderr) = tokio::join!(child.wait(), stream_stdout, read_stderr);
        (wait_result, stderr)
    };

    let waited = tokio::select! {
        res = tokio::time::timeout(timeout, io_future) => Some(res),
        _ = kill.cancelled() => None,
    };

    match waited {
        Some(Ok((Ok(status), stderr))) => {
            if status.success() {
                AgentEvent::Completed {
                    agent_id,
                    spec: spec.to_owned(),
                }
            } else {
                AgentEvent::Failed {
                    agent_id,
                    spec: spec.to_owned(),
                    exit_code: status.code(),
                    stderr: truncate_stderr(&stderr),
                }
            }
        }
        Some(Ok((Err(e), stderr))) => AgentEvent::Failed {
            agent_id,
            spec: spec.to_owned(),
            exit_code: None,
            stderr: format!("failed to wait on worker: {e}\n{}", truncate_stderr(&stderr)),
        },
        Some(Err(_elapsed)) => {
            terminate(&mut child, pid).await;
            AgentEvent::Timeout {
                agent_id,
                spec: spec.to_owned(),
                timeout_seconds: timeout.as_secs(),
            }
        }
        None => {
            terminate(&mut child, pid).await;
            AgentEvent::Failed {
                agent_id,
                spec: spec.to_owned(),
                exit_code: None,
                stderr: "terminated by orchestrator".to_owned(),
            }
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: pid came from a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            debug!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!(?pid, "worker exited within the kill grace period");
        }
        _ => {
            let _ = child.kill().await;
        }
    }
}

fn truncate_stderr(s: &str) -> String {
    if s.len() <= STDERR_SNIPPET_MAX {
        return s.trim_end().to_owned();
    }
    let mut end = STDERR_SNIPPET_MAX;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
