//! `sce run` command: execute specs to completion through the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::info;

use sce_core::{EngineState, OrchestrationEngine, WorkerCommand};
use sce_store::{MetadataStore, OrchestratorOverrides, RateLimitProfile};

/// Flags collected from the command line.
pub struct RunFlags {
    pub max_parallel: Option<usize>,
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub rate_limit_profile: Option<String>,
    pub require_result_summary: bool,
    pub result_out: Option<PathBuf>,
}

pub async fn run(root: &Path, specs: Vec<String>, worker: &str, flags: RunFlags) -> Result<()> {
    let store = MetadataStore::new(root);

    let specs = if specs.is_empty() {
        let all = store.list_all().await?;
        if all.is_empty() {
            anyhow::bail!("no specs found under {}", store.specs_dir().display());
        }
        all.into_iter().map(|(name, _)| name).collect()
    } else {
        specs
    };

    let profile = flags
        .rate_limit_profile
        .as_deref()
        .map(|s| s.parse::<RateLimitProfile>())
        .transpose()
        .context("invalid --rate-limit-profile")?;

    let overrides = OrchestratorOverrides {
        max_parallel: flags.max_parallel,
        timeout_seconds: flags.timeout,
        max_retries: flags.max_retries,
        rate_limit_profile: profile,
        require_result_summary: flags.require_result_summary.then_some(true),
        ..Default::default()
    };

    let engine = Arc::new(OrchestrationEngine::new(
        store,
        WorkerCommand::new(worker),
    ));

    // Graceful shutdown: first signal stops the run, second force-exits.
    let got_first_signal = Arc::new(AtomicBool::new(false));
    {
        let engine = Arc::clone(&engine);
        let got_first = Arc::clone(&got_first_signal);
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                if got_first.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nStopping orchestration (Ctrl+C again to force)...");
                engine.stop().await;
            }
        });
    }

    info!(specs = specs.len(), worker = %worker, "starting orchestration");
    println!("Running {} spec(s) with worker {worker:?}", specs.len());

    let outcome = engine.start(&specs, overrides).await?;

    if let Some(path) = &flags.result_out {
        let json = serde_json::to_vec_pretty(&outcome)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write result object to {}", path.display()))?;
        println!("Result object written to {}", path.display());
    }

    println!();
    println!(
        "Run {}: {} completed, {} failed, {} skipped",
        outcome.state,
        outcome.completed.len(),
        outcome.failed.len(),
        outcome.skipped.len()
    );
    for spec in &outcome.failed {
        println!("  failed:  {spec}");
    }
    for spec in &outcome.skipped {
        println!("  skipped: {spec}");
    }
    if let Some(error) = &outcome.error {
        println!("Error: {error}");
    }

    match outcome.state {
        EngineState::Completed => Ok(()),
        EngineState::Stopped => std::process::exit(130),
        _ => std::process::exit(1),
    }
}
