//! Behavioral properties of the orchestration engine: cancellation,
//! retries, contract enforcement, lifecycle discipline, launch budgets,
//! and resume.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sce_core::{EngineState, OrchestrationEngine, WorkerCommand};
use sce_store::models::LifecycleRecord;
use sce_store::{MetadataStore, OrchestratorOverrides};
use sce_test_utils::{ProjectFixture, summary_line};

fn engine(fixture: &ProjectFixture, worker: &Path) -> OrchestrationEngine {
    OrchestrationEngine::new(
        MetadataStore::new(fixture.root()),
        WorkerCommand::new(worker.to_string_lossy()),
    )
}

fn specs(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}

fn read_lifecycle(fixture: &ProjectFixture, spec: &str) -> LifecycleRecord {
    let path = fixture
        .root()
        .join(".sce/specs")
        .join(spec)
        .join("lifecycle.json");
    let bytes = std::fs::read(&path).unwrap_or_else(|e| panic!("read {path:?}: {e}"));
    serde_json::from_slice(&bytes).expect("lifecycle record parses")
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cancels_waits_and_kills_agents_promptly() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[]);

    let engine = Arc::new(engine(&fx, &fx.hanging_worker()));
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .start(&specs(&["a", "b"]), OrchestratorOverrides::default())
                .await
        })
    };

    // Let the workers start, then stop the run.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stop_started = Instant::now();
    engine.stop().await;

    let outcome = runner.await.unwrap().unwrap();
    assert!(
        stop_started.elapsed() < Duration::from_secs(8),
        "stop did not resolve promptly: {:?}",
        stop_started.elapsed()
    );
    assert_eq!(outcome.state, EngineState::Stopped);
    assert!(outcome.completed.is_empty());
    // Every in-flight spec ends skipped, never failed.
    assert!(outcome.failed.is_empty(), "failed: {:?}", outcome.failed);
    assert_eq!(outcome.skipped.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_retry_to_success() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.write_config(r#"{"max_retries": 2}"#);

    // Fails once with a non-rate-limit error, then succeeds.
    let worker = fx.flaky_worker(1, "tests failed: 3 of 10");
    let engine = engine(&fx, &worker);

    let start = Instant::now();
    let outcome = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.completed, vec!["a"]);
    assert_eq!(outcome.result_summaries.len(), 1);
    assert_eq!(engine.status().specs["a"].retry_count, 1);
    // Transient (non-rate-limit) retries carry no admission delay.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_exhaust_to_terminal_failure() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.write_config(r#"{"max_retries": 1}"#);

    let engine = engine(&fx, &fx.failing_worker("segmentation fault"));
    let outcome = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.failed, vec!["a"]);
    assert_eq!(engine.status().specs["a"].retry_count, 1);
    let error = engine.status().specs["a"].last_error.clone().unwrap();
    assert!(error.contains("segmentation fault"), "error: {error:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn contract_violation_fails_spec_and_skips_dependents() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[("a", "requires-completion")]);
    fx.write_coordination(r#"{"require_result_summary": true}"#);
    fx.write_config(r#"{"max_retries": 3}"#);

    let engine = engine(&fx, &fx.silent_worker());
    let outcome = engine
        .start(&specs(&["a", "b"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.failed, vec!["a"]);
    assert_eq!(outcome.skipped, vec!["b"]);
    // Contract violations are not retried even with retries configured.
    assert_eq!(engine.status().specs["a"].retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_gate_blocks_failed_tests() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);

    let engine = engine(&fx, &fx.summary_worker(10, 7, "[]"));
    let outcome = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    let error = engine.status().specs["a"].last_error.clone().unwrap();
    assert!(error.contains("merge blocked"), "error: {error:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_gate_blocks_unresolved_conflicts() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);

    let engine = engine(
        &fx,
        &fx.summary_worker(3, 3, r#"["merge conflict in src/lib.rs"]"#),
    );
    let outcome = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.failed, vec!["a"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_transitions_obey_the_allowed_edges() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[("a", "requires-completion")]);

    let engine = engine(&fx, &fx.ok_worker());
    let outcome = engine
        .start(&specs(&["a", "b"]), OrchestratorOverrides::default())
        .await
        .unwrap();
    assert_eq!(outcome.state, EngineState::Completed);

    use sce_store::models::LifecycleState;
    for spec in ["a", "b"] {
        let record = read_lifecycle(&fx, spec);
        assert_eq!(record.status, LifecycleState::Completed);
        let states: Vec<(LifecycleState, LifecycleState)> = record
            .transitions
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (LifecycleState::Planned, LifecycleState::Assigned),
                (LifecycleState::Assigned, LifecycleState::InProgress),
                (LifecycleState::InProgress, LifecycleState::Completed),
            ]
        );
        // Every persisted edge is valid and chains off the prior state.
        let mut current = LifecycleState::Planned;
        for t in &record.transitions {
            assert_eq!(t.from, current, "transition from-state must match");
            assert!(LifecycleState::is_valid_transition(t.from, t.to));
            current = t.to;
        }
        // Timestamps are monotonic.
        for pair in record.transitions.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_budget_bounds_admissions_per_window() {
    let fx = ProjectFixture::new();
    for name in ["a", "b", "c", "d"] {
        fx.add_spec(name, &[]);
    }
    fx.write_config(
        r#"{
            "max_parallel": 4,
            "launch_budget_per_minute": 2,
            "launch_budget_window_ms": 500
        }"#,
    );

    let engine = engine(&fx, &fx.ok_worker());
    let start = Instant::now();
    let outcome = engine
        .start(&specs(&["a", "b", "c", "d"]), OrchestratorOverrides::default())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome.state, EngineState::Completed);
    // Four launches under a 2-per-500ms budget: the third and fourth must
    // wait for the window to roll.
    assert!(
        elapsed >= Duration::from_millis(450),
        "budget not enforced: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(5), "budget over-throttled: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_timeout_is_enforced_and_reported() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.write_config(r#"{"timeout_seconds": 1, "max_retries": 0}"#);

    let engine = engine(&fx, &fx.hanging_worker());
    let start = Instant::now();
    let outcome = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.failed, vec!["a"]);
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(
        start.elapsed() < Duration::from_secs(20),
        "the per-agent timeout, not the fallback wait, must fire"
    );
    let error = engine.status().specs["a"].last_error.clone().unwrap();
    assert!(error.contains("timed out"), "error: {error:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_spec_directory_is_a_configuration_error() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);

    let engine = engine(&fx, &fx.ok_worker());
    let outcome = engine
        .start(&specs(&["a", "ghost"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("ghost"));
    assert!(fx.launch_log_lines().is_empty(), "no agent may spawn");
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_spec_is_refused_at_start() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec_with_status("frozen", &[], "blocked", Some("waiting on design review"));

    let engine = engine(&fx, &fx.ok_worker());
    let outcome = engine
        .start(&specs(&["a", "frozen"]), OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    let error = outcome.error.unwrap_or_default();
    assert!(error.contains("frozen"), "error: {error:?}");
    assert!(error.contains("waiting on design review"), "error: {error:?}");
    assert!(fx.launch_log_lines().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_is_rejected_while_running() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);

    let engine = Arc::new(engine(&fx, &fx.hanging_worker()));
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .start(&specs(&["a"]), OrchestratorOverrides::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = engine
        .start(&specs(&["a"]), OrchestratorOverrides::default())
        .await;
    assert!(second.is_err(), "second start must be rejected");

    engine.stop().await;
    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.state, EngineState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_skips_previously_completed_specs() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[("a", "requires-completion")]);
    fx.add_spec("c", &[("b", "requires-completion")]);
    fx.write_config(r#"{"max_retries": 0}"#);

    // First run: everything after `a` fails.
    let breaking = fx.script(
        "worker-break-after-a.sh",
        &format!(
            "#!/bin/sh\n\
             echo \"$SCE_SPEC start\" >> {log}\n\
             if [ \"$SCE_SPEC\" != \"a\" ]; then\n\
             \techo 'infrastructure down' >&2\n\
             \texit 1\n\
             fi\n\
             {summary}\n\
             exit 0\n",
            log = fx.launch_log().display(),
            summary = summary_line("1", "1", "low", "[]"),
        ),
    );
    let first = engine(&fx, &breaking);
    let outcome = first
        .start(&specs(&["a", "b", "c"]), OrchestratorOverrides::default())
        .await
        .unwrap();
    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.completed, vec!["a"]);
    let prior = first.status();

    // Second run resumes: `a` is seeded and never re-dispatched.
    let second = engine(&fx, &fx.ok_worker());
    let outcome = second
        .resume(&specs(&["a", "b", "c"]), &prior, OrchestratorOverrides::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    assert!(outcome.completed.contains(&"b".to_owned()));
    assert!(outcome.completed.contains(&"c".to_owned()));

    let a_starts = fx
        .launch_log_lines()
        .iter()
        .filter(|l| l.as_str() == "a start")
        .count();
    assert_eq!(a_starts, 1, "spec a must not be re-dispatched on resume");
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_agent_gate_clamps_parallelism() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[]);
    fx.write_config(r#"{"max_parallel": 4}"#);
    fx.write_multi_agent(r#"{"enabled": false}"#);

    let engine = engine(&fx, &fx.ok_worker_sleeping(0.3));
    let outcome = engine
        .start(&specs(&["a", "b"]), OrchestratorOverrides::default())
        .await
        .unwrap();
    assert_eq!(outcome.state, EngineState::Completed);

    // With parallelism clamped to 1, the first worker finished before the
    // second started.
    let lines = fx.launch_log_lines();
    let first_end = lines.iter().position(|l| l.ends_with("end")).unwrap();
    let second_start = lines.iter().rposition(|l| l.ends_with("start")).unwrap();
    assert!(
        first_end < second_start,
        "workers overlapped despite the gate: {lines:?}"
    );
}
