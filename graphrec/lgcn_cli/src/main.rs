use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, Utc};
use clap::{Parser, Subcommand};
use graphrec_learning::{
    infer_embedding, recommend_k_items, Experiment, ExperimentConfig, ImplicitCf, LightGcn,
    NormalizedAdjacency, RunManifest, RunRecord, RunStatus,
};
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Runtime;

const DEFAULT_MANIFEST: &str = "runs/index.jsonl";

#[derive(Parser, Debug)]
#[command(name = "lgcn", version, about = "LightGCN training and recommendation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trains and evaluates the experiment described by a config file.
    Run(RunArgs),
    /// Lists most recent runs.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
    /// Shows the record of a run.
    Status {
        run_id: String,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
    /// Prints top-k recommendations from a saved model.
    Recommend {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        config: PathBuf,
        /// Original user ids; defaults to every test user.
        #[arg(long = "user", num_args = 1..)]
        users: Vec<u32>,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Writes user and item embeddings of a saved model.
    Export {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        users: PathBuf,
        #[arg(long)]
        items: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "runs/logs")]
    log_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::List { limit, manifest } => {
            for record in RunManifest::new(manifest).latest(limit)? {
                println!(
                    "{} | {} | {} | {}",
                    record.run_id,
                    record.status.label(),
                    record.submitted_at,
                    record.config.display()
                );
            }
            Ok(())
        }
        Commands::Status { run_id, manifest } => {
            match RunManifest::new(manifest).find(&run_id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("run {run_id} not found"),
            }
            Ok(())
        }
        Commands::Recommend {
            checkpoint,
            config,
            users,
            top_k,
        } => {
            let (model, data, config) = restore(&checkpoint, &config)?;
            let top_k = top_k.unwrap_or(config.evaluation.top_k);
            let users = if users.is_empty() {
                data.test().users().into_iter().collect()
            } else {
                users
            };
            let predictions =
                recommend_k_items(&model, &data, users, top_k, config.evaluation.remove_seen)?;
            println!("{}", serde_json::to_string_pretty(&predictions)?);
            Ok(())
        }
        Commands::Export {
            checkpoint,
            config,
            users,
            items,
        } => {
            let (model, data, _) = restore(&checkpoint, &config)?;
            infer_embedding(&model, &data, &users, &items)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "users": users, "items": items }))?
            );
            Ok(())
        }
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    anyhow::ensure!(args.config.exists(), "config file not found");
    let config = ExperimentConfig::load(&args.config)?;
    let manifest = RunManifest::new(&args.manifest);
    let log_path = compute_log_path(&args.log_dir)?;
    let record = RunRecord::queued(args.config.clone(), Some(log_path.clone()));
    manifest.append(&record)?;

    let event_sink = args.event_log.as_deref().map(EventSink::new).transpose()?;
    let submitted = json!({
        "event": "run_submitted",
        "run_id": record.run_id,
        "config": record.config,
        "log_path": log_path,
        "submitted_at": record.submitted_at,
    });
    println!("{}", serde_json::to_string_pretty(&submitted)?);
    log_run_event(
        &log_path,
        LogLevel::Info,
        "run queued",
        json!({ "run_id": record.run_id, "dataset": config.data.format }),
    )?;
    publish_run_event(
        event_sink.as_ref(),
        "experiment.submitted",
        &record,
        json!({ "config": record.config }),
    )?;

    manifest.set_status(&record.run_id, RunStatus::Running)?;
    let result = Experiment::new(config)
        .with_configured_telemetry()
        .and_then(|experiment| experiment.run());

    match result {
        Ok(outcome) => {
            let report = outcome.report;
            manifest.set_status(
                &record.run_id,
                RunStatus::Completed {
                    metrics: report.ranking,
                },
            )?;
            log_run_event(
                &log_path,
                LogLevel::Info,
                "run completed",
                json!({ "run_id": record.run_id, "summary": report.summary() }),
            )?;
            publish_run_event(
                event_sink.as_ref(),
                "experiment.run_completed",
                &record,
                json!({ "metrics": report.metrics }),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            manifest.set_status(
                &record.run_id,
                RunStatus::Failed {
                    error: format!("{err:#}"),
                },
            )?;
            log_run_event(
                &log_path,
                LogLevel::Error,
                "run failed",
                json!({ "run_id": record.run_id, "error": format!("{err:#}") }),
            )?;
            publish_run_event(
                event_sink.as_ref(),
                "experiment.run_failed",
                &record,
                json!({ "error": err.to_string() }),
            )?;
            Err(err)
        }
    }
}

/// Loads a checkpoint and rebuilds the dataset it was trained on.
fn restore(checkpoint: &Path, config: &Path) -> Result<(LightGcn, ImplicitCf, ExperimentConfig)> {
    if !checkpoint.exists() {
        bail!("checkpoint {} not found", checkpoint.display());
    }
    let config = ExperimentConfig::load(config)?;
    let data = Experiment::new(config.clone()).prepare_data()?;
    let mut model = LightGcn::load(checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    if model.n_users() != data.n_users() || model.n_items() != data.n_items() {
        bail!(
            "checkpoint has {}x{} users/items but the config yields {}x{}",
            model.n_users(),
            model.n_items(),
            data.n_users(),
            data.n_items()
        );
    }
    if !model.is_ready() {
        model.refresh(&NormalizedAdjacency::build(&data))?;
    }
    Ok((model, data, config))
}

fn compute_log_path(base: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!(
        "run-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S")
    )))
}

struct EventSink {
    runtime: Runtime,
    publisher: FileEventPublisher,
}

impl EventSink {
    fn new(path: &Path) -> Result<Self> {
        let publisher = FileEventPublisher::new(path)?;
        let runtime = Runtime::new()?;
        Ok(Self { runtime, publisher })
    }

    fn publish(&self, event: EventRecord) -> Result<()> {
        self.runtime.block_on(self.publisher.publish(event))
    }
}

fn publish_run_event(
    sink: Option<&EventSink>,
    event_type: &str,
    record: &RunRecord,
    payload: Value,
) -> Result<()> {
    if let Some(sink) = sink {
        let payload = match payload {
            Value::Object(mut map) => {
                map.insert("run_id".into(), Value::String(record.run_id.clone()));
                Value::Object(map)
            }
            other => json!({ "run_id": record.run_id, "data": other }),
        };
        sink.publish(EventRecord::new("lgcn", event_type, payload))?;
    }
    Ok(())
}

fn log_run_event(path: &Path, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let logger = JsonLogger::new(path)?;
    logger.log(&LogRecord::new("lgcn", level, message).with_metadata(metadata))
}
