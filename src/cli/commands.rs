//! CLI command definitions for roast-forge.
//!
//! `run` drives a whole batch through generation, scoring, export and
//! publication; `score`, `publish` and `history` expose the individual stages.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::clients::{
    DryRunPublisher, HttpFeedbackSink, HttpGenerator, SignalFileDetector, WebhookPublisher,
};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{publish_roast_file, Pipeline, PipelineConfig, PublicationCounts};
use crate::publish::{
    HistoryStore, PublicationGate, PublicationRecord, PublicationStatus, Publisher,
    QuotaSnapshot, SystemClock,
};
use crate::retry::CancellationToken;
use crate::scheduler::Request;
use crate::scoring::{RawSignals, ScoringEngine};

/// Default number of history records shown by `history`.
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Batch generation, defect scoring and quota-gated publication.
#[derive(Parser)]
#[command(name = "roast-forge")]
#[command(about = "Generate media in bulk, score defects and publish the worst")]
#[command(version)]
#[command(
    long_about = "roast-forge drives a batch of prompt variants through a generation service, scores each artifact for warping and melting, and publishes the worst ones under a daily quota.\n\nExample usage:\n  roast-forge run --requests prompts.txt --config roast.yaml\n  roast-forge history --config roast.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override it.
    #[arg(short, long, global = true, env = "ROAST_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the full pipeline over a requests file.
    Run(RunArgs),

    /// Score one signals file and print the analysis.
    Score(ScoreArgs),

    /// Push an exported roast file through the publication gate.
    Publish(PublishArgs),

    /// Show quota state and publication history.
    History(HistoryArgs),
}

/// Arguments for `roast-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Requests file: a JSON array of requests, or one prompt per line.
    #[arg(short, long)]
    pub requests: PathBuf,

    /// Override the number of concurrent workers.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Override the output directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Post to the configured publisher instead of a dry run.
    #[arg(long)]
    pub live: bool,

    /// Score and export only; do not publish.
    #[arg(long, conflicts_with = "live")]
    pub no_publish: bool,

    /// Report roast scores back to the configured feedback endpoint.
    #[arg(long)]
    pub feedback: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for `roast-forge score`.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// Signals JSON file.
    pub signals: PathBuf,

    /// Artifact id used in the output; defaults to the file stem.
    #[arg(long)]
    pub id: Option<String>,
}

/// Arguments for `roast-forge publish`.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Roast file written by `run`.
    pub roasts: PathBuf,

    /// Post to the configured publisher instead of a dry run.
    #[arg(long)]
    pub live: bool,
}

/// Arguments for `roast-forge history`.
#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// Number of most recent records to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub limit: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await,
        Commands::Score(args) => run_score_command(config, args),
        Commands::Publish(args) => run_publish_command(config, args).await,
        Commands::History(args) => run_history_command(config, args).await,
    }
}

async fn run_pipeline_command(mut config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.max_workers {
        config.batch.max_workers = workers;
    }
    if let Some(output) = args.output.clone() {
        config.storage.output_dir = output;
    }
    if args.live {
        config.publisher.dry_run = false;
    }
    if args.feedback {
        config.feedback.enabled = true;
    }
    config.validate().context("invalid configuration")?;

    init_metrics().context("failed to register metrics")?;

    let requests = load_requests(&args.requests)?;
    info!(
        requests = requests.len(),
        path = %args.requests.display(),
        "Loaded requests"
    );

    let generator = Arc::new(HttpGenerator::new(config.generator.clone())?);
    let detector = Arc::new(SignalFileDetector::new(&config.analysis.signals_dir));
    let mut pipeline = Pipeline::new(config.clone(), generator, detector)?;
    if !args.no_publish {
        pipeline = pipeline.with_gate(open_gate(&config).await?);
    }
    if config.feedback.enabled {
        let sink = HttpFeedbackSink::new(config.feedback.http.clone())?;
        pipeline = pipeline.with_feedback(Arc::new(sink));
    }

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let report = pipeline.run(requests, cancel).await?;

    if let Some(path) = &args.metrics_out {
        fs::write(path, export_metrics())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_score_command(config: PipelineConfig, args: ScoreArgs) -> anyhow::Result<()> {
    let content = fs::read_to_string(&args.signals)
        .with_context(|| format!("failed to read {}", args.signals.display()))?;
    let signals: RawSignals = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", args.signals.display()))?;

    let id = args.id.unwrap_or_else(|| {
        args.signals
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string())
    });

    let engine = ScoringEngine::new(config.thresholds, config.weights)?;
    let analysis = engine.score(&id, &signals)?;

    #[derive(Serialize)]
    struct ScoreOutput<'a> {
        #[serde(flatten)]
        analysis: &'a crate::scoring::AnalysisResult,
        defect_count: usize,
        defect_kind: Option<crate::scoring::DefectKind>,
    }

    let output = ScoreOutput {
        analysis: &analysis,
        defect_count: analysis.defect_count(),
        defect_kind: analysis.defect_kind(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_publish_command(mut config: PipelineConfig, args: PublishArgs) -> anyhow::Result<()> {
    if args.live {
        config.publisher.dry_run = false;
    }
    config.validate().context("invalid configuration")?;
    init_metrics().context("failed to register metrics")?;

    let gate = open_gate(&config).await?;
    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let counts = publish_roast_file(&gate, &args.roasts, &cancel).await?;

    #[derive(Serialize)]
    struct PublishOutput {
        counts: PublicationCounts,
        quota: QuotaSnapshot,
    }

    let output = PublishOutput {
        counts,
        quota: gate.quota(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    gate.history().close().await;
    Ok(())
}

async fn run_history_command(config: PipelineConfig, args: HistoryArgs) -> anyhow::Result<()> {
    let history = HistoryStore::open(&config.storage.history_path)
        .await
        .with_context(|| {
            format!(
                "failed to open history at {}",
                config.storage.history_path.display()
            )
        })?;

    let quota = history.load_quota().await?;
    let counts = history.status_counts().await?;
    let records = history.records().await?;
    let skip = records.len().saturating_sub(args.limit);

    #[derive(Serialize)]
    struct HistoryOutput<'a> {
        quota: Option<crate::publish::QuotaState>,
        daily_limit: u32,
        counts: Vec<(PublicationStatus, u64)>,
        total_records: usize,
        recent: &'a [PublicationRecord],
    }

    let output = HistoryOutput {
        quota,
        daily_limit: config.gate.daily_limit,
        counts,
        total_records: records.len(),
        recent: &records[skip..],
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    history.close().await;
    Ok(())
}

/// Opens the history and builds the gate with the configured publisher.
async fn open_gate(config: &PipelineConfig) -> anyhow::Result<PublicationGate> {
    let history = HistoryStore::open(&config.storage.history_path)
        .await
        .with_context(|| {
            format!(
                "failed to open history at {}",
                config.storage.history_path.display()
            )
        })?;

    let publisher: Arc<dyn Publisher> = if config.publisher.dry_run {
        info!("Publishing in dry-run mode");
        Arc::new(DryRunPublisher::new())
    } else {
        Arc::new(WebhookPublisher::new(config.publisher.http.clone())?)
    };

    Ok(PublicationGate::open(config.gate.clone(), history, publisher, Arc::new(SystemClock)).await?)
}

/// Cancels `cancel` on the first Ctrl-C.
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

/// Loads requests from a JSON array, or one prompt per non-empty line.
fn load_requests(path: &Path) -> anyhow::Result<Vec<Request>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read requests from {}", path.display()))?;
    parse_requests(&content)
}

fn parse_requests(content: &str) -> anyhow::Result<Vec<Request>> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content).context("failed to parse requests JSON");
    }

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(index, prompt)| Request::new(format!("req-{:05}", index + 1), prompt))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["roast-forge", "run", "--requests", "prompts.txt"])
            .expect("should parse");
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.requests, PathBuf::from("prompts.txt"));
                assert!(args.max_workers.is_none());
                assert!(!args.live);
                assert!(!args.no_publish);
                assert!(!args.feedback);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_live_conflicts_with_no_publish() {
        let result = Cli::try_parse_from([
            "roast-forge",
            "run",
            "--requests",
            "p.txt",
            "--live",
            "--no-publish",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["roast-forge", "history", "-n", "5", "--config", "r.yaml"])
            .expect("should parse");
        assert_eq!(cli.config, Some(PathBuf::from("r.yaml")));
        match cli.command {
            Commands::History(args) => assert_eq!(args.limit, 5),
            _ => panic!("Expected History command"),
        }
    }

    #[test]
    fn test_parse_prompt_lines() {
        let requests = parse_requests("a cat surfing\n\n# comment\na dog skating\n").unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, "req-00001");
        assert_eq!(requests[1].payload, "a dog skating");
    }

    #[test]
    fn test_parse_request_json() {
        let requests = parse_requests(
            r#"[{"id":"v1","payload":"a cat","metadata":{"strategy":"physics"}}]"#,
        )
        .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metadata.get("strategy").unwrap(), "physics");
    }
}
