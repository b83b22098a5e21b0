mod plan_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sce",
    about = "Batch orchestrator for spec-driven fleets of AI coding agents"
)]
struct Cli {
    /// Project root containing the .sce directory
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute specs, one agent per spec, in dependency order
    Run {
        /// Specs to run (omit to run every spec under .sce/specs)
        specs: Vec<String>,
        /// Worker program launched for each spec
        #[arg(long, default_value = "sce-worker")]
        worker: String,
        /// Maximum number of concurrent agents
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Timeout per agent in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Maximum retries per spec
        #[arg(long)]
        max_retries: Option<u32>,
        /// Rate limit profile: conservative, balanced, or aggressive
        #[arg(long)]
        rate_limit_profile: Option<String>,
        /// Fail specs whose agents do not produce a result summary
        #[arg(long)]
        require_result_summary: bool,
        /// Write the structured result object to this path
        #[arg(long)]
        result_out: Option<PathBuf>,
    },
    /// Compute and print the execution batches without launching agents
    Plan {
        /// Specs to plan (omit to plan every spec under .sce/specs)
        specs: Vec<String>,
    },
    /// Show per-spec metadata and lifecycle status from disk
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let root = cli.project_root;

    match cli.command {
        Commands::Run {
            specs,
            worker,
            max_parallel,
            timeout,
            max_retries,
            rate_limit_profile,
            require_result_summary,
            result_out,
        } => {
            run_cmd::run(
                &root,
                specs,
                &worker,
                run_cmd::RunFlags {
                    max_parallel,
                    timeout,
                    max_retries,
                    rate_limit_profile,
                    require_result_summary,
                    result_out,
                },
            )
            .await?;
        }
        Commands::Plan { specs } => {
            plan_cmd::run(&root, specs).await?;
        }
        Commands::Status => {
            status_cmd::run(&root).await?;
        }
    }

    Ok(())
}
