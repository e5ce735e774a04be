//! `moldata-transfer`: resumable bulk upload/download of a unit list.

mod config;
mod units;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use moldata_transfer::{Direction, RunSummary, TransferEngine, TransferEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "moldata-transfer")]
#[command(about = "Resumable parallel transfer of files to and from object storage")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unit list as JSON lines (`-` for stdin)
    #[arg(short, long)]
    units: PathBuf,

    /// Transfer direction: upload or download
    #[arg(long, value_parser = ["upload", "download"])]
    direction: Option<String>,

    /// Override number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Override units per checkpoint flush
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override retries per unit
    #[arg(long)]
    max_retries: Option<u32>,

    /// Checkpoint file path
    #[arg(long, conflicts_with = "label")]
    checkpoint: Option<PathBuf>,

    /// Derive the checkpoint file from this label
    #[arg(long)]
    label: Option<String>,

    /// Keep local files after the run
    #[arg(long)]
    keep_local: bool,

    /// Print per-batch progress to stderr
    #[arg(long)]
    progress: bool,

    /// Print the summary as JSON to stdout
    #[arg(long)]
    output_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        let engine = &mut config.engine;
        match self.direction.as_deref() {
            Some("upload") => engine.direction = Direction::Upload,
            Some("download") => engine.direction = Direction::Download,
            _ => {}
        }
        if let Some(n) = self.workers {
            engine.max_workers = n;
        }
        if let Some(n) = self.batch_size {
            engine.batch_size = n;
        }
        if let Some(n) = self.max_retries {
            engine.max_retries = n;
        }
        if self.keep_local {
            engine.keep_local = true;
        }
        if let Some(path) = &self.checkpoint {
            engine.checkpoint_location = path.clone();
            config.label = None;
        }
        if let Some(label) = &self.label {
            config.label = Some(label.clone());
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let units = units::load(&cli.units)?;
    info!(units = units.len(), path = %cli.units.display(), "unit list loaded");

    let backend = config.storage.build().await?;
    let mut engine = TransferEngine::new(backend, config.engine.clone());
    if let Some(store) = config.checkpoint_store() {
        engine = engine.with_store(store);
    }

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight units");
            cancel.cancel();
        }
    });

    if let Some(mut events) = engine.take_events() {
        let progress = cli.progress;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if progress && let TransferEvent::BatchFlushed { .. } = &event {
                    eprintln!("{}", describe(&event));
                }
            }
        });
    }

    let summary = engine.run(&units).await?;
    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.cancelled {
        ExitCode::from(130)
    } else if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn describe(event: &TransferEvent) -> String {
    match event {
        TransferEvent::BatchFlushed {
            index,
            completed,
            failed,
            pending,
            units_per_sec,
        } => format!(
            "batch {index}: completed={completed} failed={failed} pending={pending} ({units_per_sec:.1} units/s)"
        ),
        other => format!("{other:?}"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("succeeded:       {}", summary.succeeded_count);
    println!("already present: {}", summary.already_present_count);
    println!("skipped:         {}", summary.skipped_count);
    println!("failed:          {}", summary.failed_count());
    println!("pending:         {}", summary.pending_count());
    if !summary.shards.is_empty() {
        let uploaded = summary.shards.iter().filter(|s| s.is_uploaded()).count();
        println!("shards:          {uploaded}/{}", summary.shards.len());
    }
    if summary.cleaned_count > 0 {
        println!("cleaned:         {}", summary.cleaned_count);
    }
    for failed in summary.permanently_failed.iter().take(20) {
        println!("  {}: {}", failed.unit_id, failed.error);
    }
    if summary.failed_count() > 20 {
        println!("  ... and {} more", summary.failed_count() - 20);
    }
    if summary.cancelled {
        println!("cancelled; rerun with the same checkpoint to resume");
    }
}

fn summary_json(summary: &RunSummary) -> serde_json::Value {
    serde_json::json!({
        "succeeded": summary.succeeded_count,
        "already_present": summary.already_present_count,
        "skipped": summary.skipped_count,
        "interrupted": summary.interrupted_count,
        "not_started": summary.not_started_count,
        "cancelled": summary.cancelled,
        "cleaned": summary.cleaned_count,
        "failed": summary.permanently_failed,
        "shards": summary.shards.iter().map(|s| serde_json::json!({
            "key": s.key,
            "members": s.member_count(),
            "already_present": s.already_present,
            "error": s.error,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use moldata_transfer::{FailedUnit, UnitId};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "moldata-transfer",
            "--units",
            "units.jsonl",
            "--direction",
            "download",
            "--workers",
            "4",
            "--checkpoint",
            "/tmp/ckpt.json",
            "--keep-local",
        ]);
        let mut config = Config {
            label: Some("pdb".into()),
            ..Config::default()
        };
        cli.apply(&mut config);
        assert_eq!(config.engine.direction, Direction::Download);
        assert_eq!(config.engine.max_workers, 4);
        assert!(config.engine.keep_local);
        assert_eq!(config.engine.checkpoint_location, PathBuf::from("/tmp/ckpt.json"));
        assert!(config.label.is_none());
    }

    #[test]
    fn label_conflicts_with_checkpoint() {
        let parsed = Cli::try_parse_from([
            "moldata-transfer",
            "-u",
            "u.jsonl",
            "--label",
            "pdb",
            "--checkpoint",
            "c.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn json_summary_lists_failures() {
        let summary = RunSummary {
            succeeded_count: 8,
            permanently_failed: vec![FailedUnit {
                unit_id: UnitId::from("unit_3"),
                error: "retries exhausted".into(),
            }],
            ..RunSummary::default()
        };
        let value = summary_json(&summary);
        assert_eq!(value["succeeded"], 8);
        assert_eq!(value["failed"][0]["unit_id"], "unit_3");
    }
}
