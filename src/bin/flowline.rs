use clap::{Parser, Subcommand};
use flowline::spec::loader::load_flow_spec;
use flowline::{value_map, Flow, FlowConfigs, FlowStateKind, ResolverMap, RunOptions, SerializedFlowRunStatus, ValueMap};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow spec file (YAML or JSON) with the built-in resolvers
    Run {
        /// Path to the flow spec
        file: PathBuf,
        /// Flow params as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        /// Name of an expected result; repeat for several
        #[arg(long = "expect")]
        expected: Vec<String>,
        /// Fail when an expected result is not provided by any task
        #[arg(long)]
        strict: bool,
        /// Where to write the flow state if the run ends paused
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Resume a paused flow from a snapshot written by `run --snapshot`
    Resume {
        /// Path to the same flow spec the snapshot was taken from
        file: PathBuf,
        /// Path to the snapshot
        #[arg(long)]
        state: PathBuf,
        /// Where to write the flow state if the run pauses again
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { file, params, expected, strict, snapshot } => {
            // 1. Load spec
            let mut spec = load_flow_spec(&file.to_string_lossy())?;
            if *strict {
                spec.configs = FlowConfigs {
                    throw_error_on_unsolvable_result: true,
                    ..spec.configs
                };
            }
            info!("Loaded flow spec with {} tasks", spec.tasks.len());

            let params: serde_json::Value = serde_json::from_str(params).context("--params must be a JSON object")?;
            if !params.is_object() {
                bail!("--params must be a JSON object");
            }

            // 2. Run
            let flow = Flow::new(spec);
            let results = flow
                .start(value_map(params), expected.iter().cloned(), ResolverMap::new(), ValueMap::new(), RunOptions::default())?
                .await?;

            // 3. Report
            finish(&flow, results, snapshot.as_deref())?;
        }
        Commands::Resume { file, state, snapshot } => {
            let spec = load_flow_spec(&file.to_string_lossy())?;
            let raw = fs::read_to_string(state)
                .with_context(|| format!("Failed to read snapshot from {}", state.display()))?;
            let saved: SerializedFlowRunStatus = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to deserialize snapshot from {}", state.display()))?;

            let flow = Flow::from_state(spec, &saved, ResolverMap::new(), ValueMap::new())?;
            let results = flow.resume()?.await?;

            finish(&flow, results, snapshot.as_deref())?;
        }
    }

    Ok(())
}

fn finish(flow: &Flow, results: ValueMap, snapshot: Option<&Path>) -> Result<()> {
    let state = flow.state_code();
    info!(%state, "Flow settled");
    println!("{}", serde_json::to_string_pretty(&results)?);

    if state == FlowStateKind::Paused {
        match snapshot {
            Some(path) => {
                let saved = flow.get_serializable_state()?;
                fs::write(path, serde_json::to_string_pretty(&saved)?)
                    .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
                info!(path = %path.display(), "Saved paused flow");
            }
            None => info!("Flow paused; pass --snapshot to keep its state"),
        }
    }
    Ok(())
}
