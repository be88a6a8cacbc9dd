use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fathom::artifacts::LocalArtifactStore;
use fathom::intake;
use fathom::metrics::Metrics;
use fathom::tools::HttpToolGateway;
use fathom::types::JobOptions;
use fathom::vector::{HttpVectorStore, NoopVectorStore, VectorStore};
use fathom::{EngineConfig, Runner, Store};

const CLI_EXAMPLES: &str = r#"Examples:
  fathom work
  fathom work --state-dir .fathom --config fathom.json
  fathom enqueue "impact of EU AI Act on model providers" --meta time_horizon="12-18 months"
  fathom status 6e3f0a9c-...
"#;

#[derive(Parser, Debug)]
#[command(name = "fathom")]
#[command(version)]
#[command(about = "Durable deep-research job engine")]
#[command(after_help = CLI_EXAMPLES)]
struct Cli {
    /// Engine state directory (database + local artifacts).
    #[arg(long, env = "FATHOM_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Path to an engine config JSON file.
    #[arg(long, env = "FATHOM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop: rescue sweeps, queue claims, pipeline execution.
    Work,
    /// Submit a research question.
    Enqueue {
        /// The natural-language research question.
        question: String,
        /// Planner step cap for this job.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Duration budget feeding the rescue threshold.
        #[arg(long)]
        max_duration_seconds: Option<u64>,
        /// Free-form tags.
        #[arg(long)]
        tag: Vec<String>,
        /// Metadata entries, key=value. Clarification keys: time_horizon,
        /// region_focus, data_modalities, integration_targets,
        /// quality_constraints.
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },
    /// Show one job's status and report summary.
    Status {
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.json"));
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let store = Store::open(&state_dir.join("fathom.sqlite")).await?;

    match cli.command {
        Command::Work => {
            let metrics = Arc::new(Metrics::new());
            let tools = Arc::new(HttpToolGateway::new(config.tools.clone(), metrics.clone()));
            let artifacts = Arc::new(LocalArtifactStore::new(state_dir.join("artifacts")));
            let vectors: Arc<dyn VectorStore> = match config.tools.vector_url.as_deref() {
                Some(url) => Arc::new(HttpVectorStore::new(
                    url,
                    config.tools.vector_collection.clone(),
                )),
                None => Arc::new(NoopVectorStore),
            };

            let shutdown = CancellationToken::new();
            let runner = Runner::new(
                store,
                tools,
                artifacts,
                vectors,
                config,
                metrics.clone(),
                shutdown.clone(),
            );

            let ctrl_c_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    ctrl_c_token.cancel();
                }
            });

            tracing::info!(state_dir = %state_dir.display(), "fathom worker starting");
            runner.run().await?;
            tracing::info!(metrics = ?metrics.snapshot(), "fathom worker stopped");
        }
        Command::Enqueue {
            question,
            max_steps,
            max_duration_seconds,
            tag,
            metadata,
        } => {
            let options = JobOptions {
                depth: None,
                max_steps,
                max_duration_seconds,
                tags: tag,
            };
            let metadata = parse_metadata(&metadata)?;
            let (job, prompts) = intake::create_job(&store, &question, options, metadata).await?;

            println!("job {} -> {}", job.id, job.status.as_str());
            if !prompts.is_empty() {
                println!("clarification needed before this job can run:");
                for prompt in prompts {
                    println!("  {}: {}", prompt.key, prompt.prompt);
                }
                println!("resupply with: fathom enqueue ... --meta key=value");
            }
        }
        Command::Status { job_id } => {
            let job = store.get_job(&job_id).await?;
            println!("job      {}", job.id);
            println!("status   {}", job.status.as_str());
            println!("question {}", job.question);
            if let Some(error) = &job.error {
                println!("error    {}", error);
            }
            if let Some(assets) = &job.report_assets {
                println!("report   {}", assets.markdown.url);
            }
            if let Some(report) = &job.final_report {
                let preview: String = report.chars().take(400).collect();
                println!("---\n{}", preview);
            }
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("fathom");
    }
    dirs::home_dir()
        .map(|home| home.join(".fathom"))
        .unwrap_or_else(|| PathBuf::from(".fathom"))
}

fn parse_metadata(
    entries: &[String],
) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let mut metadata = serde_json::Map::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("metadata entry '{}' is not key=value", entry))?;
        metadata.insert(
            key.trim().to_string(),
            serde_json::Value::String(value.trim().to_string()),
        );
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metadata_splits_on_first_equals() {
        let parsed = parse_metadata(&[
            "time_horizon=12-18 months".to_string(),
            "quality_constraints=neutral=tone".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["time_horizon"], "12-18 months");
        assert_eq!(parsed["quality_constraints"], "neutral=tone");
    }

    #[test]
    fn parse_metadata_rejects_bare_keys() {
        assert!(parse_metadata(&["oops".to_string()]).is_err());
    }
}
