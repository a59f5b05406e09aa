use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobgraph_core::jobs::{register_sort_jobs, sort_workflow, RESULT_OUTPUT};
use jobgraph_core::{
    CompletionListener, LocalSubstrate, NodeEventListener, WorkflowPhase, WorkflowScheduler,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "jobgraph")]
#[command(about = "DAG workflow engine - local demo runner", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "jobgraph.toml", env = "JOBGRAPH_CONFIG")]
    config: PathBuf,

    /// Data directory for staging and attempt work directories
    #[arg(short, long, default_value = "./data", env = "JOBGRAPH_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sort a file of integers with a split/sort/merge workflow
    Sort {
        /// Input file, one integer per line; generated when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Number of integers to generate when no input is given
        #[arg(long, default_value = "1000")]
        generate: usize,

        /// Seed for generated input
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Number of parts to split the input into
        #[arg(short, long, default_value = "10")]
        parts: usize,

        /// Number of sorted files merged per merge node
        #[arg(short, long, default_value = "2")]
        group: usize,

        /// Give up (and stop the workflow) after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobgraph=info,jobgraph_core=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting jobgraph");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = CliConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::Sort {
            input,
            generate,
            seed,
            parts,
            group,
            timeout_secs,
        } => {
            let input = match input {
                Some(path) => path,
                None => generate_input(&config.data_dir, generate, seed)?,
            };
            run_sort(&config, input, parts, group, Duration::from_secs(timeout_secs)).await
        }
    }
}

async fn run_sort(
    config: &CliConfig,
    input: PathBuf,
    parts: usize,
    group: usize,
    timeout: Duration,
) -> Result<()> {
    let substrate = Arc::new(LocalSubstrate::new(config.work_dir())?);
    register_sort_jobs(&substrate);
    let scheduler = WorkflowScheduler::new(substrate, config.scheduler.clone());

    let definition = Arc::new(
        sort_workflow(config.workflows_dir(), &input, parts, group)
            .context("Failed to build sort workflow")?,
    );
    tracing::info!(
        "Built sort workflow: workflow_id={}, nodes={}, input={}",
        definition.id(),
        definition.len(),
        input.display()
    );

    let events = NodeEventListener::new()
        .before_node(|node, _| tracing::info!("Submitting node {}", node))
        .after_node(|node, snapshot| {
            tracing::info!("Node {} finished: {:?}", node, snapshot.status_of(node).ok())
        });

    let id = scheduler
        .start(definition.clone(), CompletionListener::new(), Some(events))
        .await?;

    let finished = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, stopping workflow");
                    if let Err(e) = scheduler.stop(id).await {
                        tracing::warn!("Stop failed: {}", e);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            let status = scheduler.poll(id)?;
            if status.is_terminal() {
                return Ok::<_, anyhow::Error>(status);
            }
        }
    })
    .await;

    let status = match finished {
        Ok(status) => status?,
        Err(_) => {
            tracing::error!("Workflow did not finish within {:?}, stopping", timeout);
            scheduler.stop(id).await?;
            bail!("workflow {} timed out", id);
        }
    };

    println!("{}", serde_json::to_string_pretty(status.snapshot.state())?);
    scheduler.shutdown();

    if status.phase != WorkflowPhase::Completed {
        bail!("workflow {} finished as {}", id, status.phase);
    }

    let result = definition.final_output_path(RESULT_OUTPUT)?;
    println!("Sorted output: {}", result.display());
    Ok(())
}

/// Write `count` pseudo-random integers (xorshift) and return the file path
fn generate_input(data_dir: &Path, count: usize, seed: u64) -> Result<PathBuf> {
    let mut state = seed.max(1);
    let mut text = String::with_capacity(count * 8);
    for _ in 0..count {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        text.push_str(&((state % 2_000_001) as i64 - 1_000_000).to_string());
        text.push('\n');
    }

    let path = data_dir.join(format!("input-{}-{}.txt", count, seed));
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Generated {} integers into {}", count, path.display());
    Ok(path)
}
