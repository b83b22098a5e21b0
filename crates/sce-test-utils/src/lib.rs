//! Shared test utilities for sce integration tests.
//!
//! Provides a temporary `.sce` project tree plus small `#!/bin/sh` worker
//! scripts that stand in for real coding agents: they read the `SCE_SPEC` /
//! `SCE_RESULT_PATH` environment contract and behave deterministically
//! (succeed, fail with a chosen message, fail N times then succeed, sleep,
//! or exit cleanly without a summary).

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A throwaway project root with the `.sce` layout.
pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create fixture tempdir");
        std::fs::create_dir_all(dir.path().join(".sce/specs"))
            .expect("failed to create .sce/specs");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Create a spec directory with `collaboration.json`. Dependencies are
    /// `(target, kind)` pairs using the wire-format kind strings.
    pub fn add_spec(&self, name: &str, deps: &[(&str, &str)]) {
        self.add_spec_with_status(name, deps, "not-started", None);
    }

    pub fn add_spec_with_status(
        &self,
        name: &str,
        deps: &[(&str, &str)],
        status: &str,
        block_reason: Option<&str>,
    ) {
        let spec_dir = self.root().join(".sce/specs").join(name);
        std::fs::create_dir_all(&spec_dir).expect("failed to create spec dir");

        let dependencies: Vec<serde_json::Value> = deps
            .iter()
            .map(|(target, kind)| {
                serde_json::json!({
                    "spec": target,
                    "type": kind,
                    "reason": format!("{name} needs {target}")
                })
            })
            .collect();

        let mut status_block = serde_json::json!({
            "current": status,
            "updated_at": "2025-01-02T03:04:05Z"
        });
        if let Some(reason) = block_reason {
            status_block["block_reason"] = serde_json::json!(reason);
        }

        let collab = serde_json::json!({
            "version": "1.0.0",
            "type": "sub",
            "dependencies": dependencies,
            "status": status_block,
            "interfaces": {"provides": [], "consumes": []}
        });

        std::fs::write(
            spec_dir.join("collaboration.json"),
            serde_json::to_vec_pretty(&collab).expect("collab json"),
        )
        .expect("failed to write collaboration.json");
    }

    pub fn write_config(&self, json: &str) {
        let config_dir = self.root().join(".sce/config");
        std::fs::create_dir_all(&config_dir).expect("failed to create config dir");
        std::fs::write(config_dir.join("orchestrator.json"), json)
            .expect("failed to write orchestrator.json");
    }

    pub fn write_coordination(&self, json: &str) {
        let config_dir = self.root().join(".sce/config");
        std::fs::create_dir_all(&config_dir).expect("failed to create config dir");
        std::fs::write(config_dir.join("coordination.json"), json)
            .expect("failed to write coordination.json");
    }

    pub fn write_multi_agent(&self, json: &str) {
        let config_dir = self.root().join(".sce/config");
        std::fs::create_dir_all(&config_dir).expect("failed to create config dir");
        std::fs::write(config_dir.join("multi-agent.json"), json)
            .expect("failed to write multi-agent.json");
    }

    /// Path of the launch log appended to by the workers below.
    pub fn launch_log(&self) -> PathBuf {
        self.root().join("launches.log")
    }

    /// Lines of the launch log: `<spec> <start|end>` per worker phase.
    pub fn launch_log_lines(&self) -> Vec<String> {
        match std::fs::read_to_string(self.launch_log()) {
            Ok(text) => text.lines().map(str::to_owned).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Write an executable shell script into the fixture root.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, body).expect("failed to write worker script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod worker script");
        }
        path
    }

    /// A worker that logs its start/end, optionally sleeps, writes a valid
    /// summary, and exits 0.
    pub fn ok_worker(&self) -> PathBuf {
        self.ok_worker_sleeping(0.0)
    }

    pub fn ok_worker_sleeping(&self, seconds: f64) -> PathBuf {
        let log = self.launch_log();
        self.script(
            "worker-ok.sh",
            &format!(
                "#!/bin/sh\n\
                 echo \"$SCE_SPEC start\" >> {log}\n\
                 sleep {seconds}\n\
                 {summary}\n\
                 echo \"$SCE_SPEC end\" >> {log}\n\
                 exit 0\n",
                log = log.display(),
                seconds = seconds,
                summary = summary_line("10", "10", "low", "[]"),
            ),
        )
    }

    /// A worker that always fails with `message` on stderr.
    pub fn failing_worker(&self, message: &str) -> PathBuf {
        let log = self.launch_log();
        self.script(
            "worker-fail.sh",
            &format!(
                "#!/bin/sh\n\
                 echo \"$SCE_SPEC start\" >> {log}\n\
                 echo \"{message}\" >&2\n\
                 exit 1\n",
                log = log.display(),
            ),
        )
    }

    /// A worker that fails `failures` times per spec (with `message` on
    /// stderr), then succeeds. Attempt counts are kept per spec under the
    /// fixture root.
    pub fn flaky_worker(&self, failures: u32, message: &str) -> PathBuf {
        let log = self.launch_log();
        let counters = self.root().join("attempts");
        std::fs::create_dir_all(&counters).expect("failed to create attempts dir");
        self.script(
            "worker-flaky.sh",
            &format!(
                "#!/bin/sh\n\
                 echo \"$SCE_SPEC start\" >> {log}\n\
                 f=\"{counters}/$SCE_SPEC\"\n\
                 n=0\n\
                 [ -f \"$f\" ] && n=$(cat \"$f\")\n\
                 n=$((n+1))\n\
                 echo \"$n\" > \"$f\"\n\
                 if [ \"$n\" -le {failures} ]; then\n\
                 \techo \"{message}\" >&2\n\
                 \texit 1\n\
                 fi\n\
                 {summary}\n\
                 echo \"$SCE_SPEC end\" >> {log}\n\
                 exit 0\n",
                log = log.display(),
                counters = counters.display(),
                failures = failures,
                summary = summary_line("10", "10", "low", "[]"),
            ),
        )
    }

    /// A worker that exits 0 without writing any summary.
    pub fn silent_worker(&self) -> PathBuf {
        self.script("worker-silent.sh", "#!/bin/sh\nexit 0\n")
    }

    /// A worker that writes a summary with the given test counts and open
    /// issues (a JSON array literal), then exits 0.
    pub fn summary_worker(&self, tests_run: u32, tests_passed: u32, open_issues: &str) -> PathBuf {
        self.script(
            "worker-summary.sh",
            &format!(
                "#!/bin/sh\n{}\nexit 0\n",
                summary_line(
                    &tests_run.to_string(),
                    &tests_passed.to_string(),
                    "low",
                    open_issues
                ),
            ),
        )
    }

    /// A worker that sleeps far longer than any test timeout.
    pub fn hanging_worker(&self) -> PathBuf {
        let log = self.launch_log();
        self.script(
            "worker-hang.sh",
            &format!(
                "#!/bin/sh\necho \"$SCE_SPEC start\" >> {log}\nsleep 600\n",
                log = log.display()
            ),
        )
    }
}

impl Default for ProjectFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Shell line writing a well-formed result summary to `$SCE_RESULT_PATH`.
pub fn summary_line(tests_run: &str, tests_passed: &str, risk: &str, open_issues: &str) -> String {
    format!(
        "printf '{{\"spec_id\":\"%s\",\"changed_files\":[\"src/lib.rs\"],\"tests_run\":{tests_run},\"tests_passed\":{tests_passed},\"risk_level\":\"{risk}\",\"open_issues\":{open_issues}}}' \"$SCE_SPEC\" > \"$SCE_RESULT_PATH\""
    )
}
