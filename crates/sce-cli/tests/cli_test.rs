//! Integration tests for the `sce` binary: exit conduct and the plan /
//! status surfaces, driven against a temporary `.sce` project tree.

use std::process::Command;

use sce_test_utils::ProjectFixture;

fn sce() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sce"))
}

#[test]
fn plan_prints_topological_batches() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[("a", "requires-completion")]);

    let output = sce()
        .args(["--project-root"])
        .arg(fx.root())
        .args(["plan", "a", "b"])
        .output()
        .expect("failed to run sce");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("batch 0: a"), "stdout: {stdout}");
    assert!(stdout.contains("batch 1: b"), "stdout: {stdout}");
}

#[test]
fn plan_reports_cycles_with_nonzero_exit() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[("b", "requires-completion")]);
    fx.add_spec("b", &[("a", "requires-completion")]);

    let output = sce()
        .args(["--project-root"])
        .arg(fx.root())
        .args(["plan", "a", "b"])
        .output()
        .expect("failed to run sce");

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cycle"), "stdout: {stdout}");
}

#[test]
fn status_lists_specs() {
    let fx = ProjectFixture::new();
    fx.add_spec("auth", &[]);
    fx.add_spec("billing", &[("auth", "requires-interface")]);

    let output = sce()
        .args(["--project-root"])
        .arg(fx.root())
        .arg("status")
        .output()
        .expect("failed to run sce");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("auth"), "stdout: {stdout}");
    assert!(stdout.contains("billing"), "stdout: {stdout}");
    assert!(stdout.contains("not-started"), "stdout: {stdout}");
}

#[test]
fn run_exits_zero_on_success_and_writes_result_object() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.add_spec("b", &[("a", "requires-completion")]);
    let worker = fx.ok_worker();
    let result_path = fx.root().join("result.json");

    let output = sce()
        .args(["--project-root"])
        .arg(fx.root())
        .args(["run", "a", "b", "--worker"])
        .arg(&worker)
        .args(["--result-out"])
        .arg(&result_path)
        .output()
        .expect("failed to run sce");

    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let result: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&result_path).expect("result object written"))
            .expect("result object parses");
    assert_eq!(result["state"], "completed");
    assert_eq!(result["completed"], serde_json::json!(["a", "b"]));
}

#[test]
fn run_exits_nonzero_on_failure() {
    let fx = ProjectFixture::new();
    fx.add_spec("a", &[]);
    fx.write_config(r#"{"max_retries": 0}"#);
    let worker = fx.failing_worker("boom");

    let output = sce()
        .args(["--project-root"])
        .arg(fx.root())
        .args(["run", "a", "--worker"])
        .arg(&worker)
        .output()
        .expect("failed to run sce");

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("failed"), "stdout: {stdout}");
}
