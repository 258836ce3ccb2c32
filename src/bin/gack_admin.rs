//! gack_admin - inspect and maintain the detection store
//!
//! Read commands print JSON to stdout. Deletion is only ever user-initiated
//! from here; the replay API cannot mutate the store.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gack::ui::{Ui, UiMode};
use gack::{
    parse_timestamp, DetectionReader, DetectionStore, GackConfig, RangeFilter, RetentionPolicy,
    SqliteDetectionReader, SqliteDetectionStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection database (defaults to DB_PATH / config file).
    #[arg(long)]
    db_path: Option<String>,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Aggregate statistics.
    Stats,
    /// Print one detection.
    Show { id: i64 },
    /// Print the most recent detections.
    Latest {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        camera: Option<String>,
    },
    /// Write detections in a time range to a JSON file.
    Export {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        camera: Option<String>,
        #[arg(long, short, default_value = "gack_export.json")]
        output: PathBuf,
    },
    /// Delete one detection.
    Delete { id: i64 },
    /// Delete every detection in a time range (inclusive).
    DeleteRange {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Required; the deletion cannot be undone.
        #[arg(long)]
        yes: bool,
    },
    /// Apply the retention policy now.
    Prune {
        /// Override the configured age limit, in days.
        #[arg(long)]
        days: Option<u64>,
        /// Override the configured count limit.
        #[arg(long)]
        max_detections: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = GackConfig::load()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let ui = Ui::detect(args.ui);
    let db_path = args.db_path.unwrap_or(config.db_path.clone());
    if !Path::new(&db_path).exists() {
        return Err(anyhow!("detection database {} does not exist", db_path));
    }

    match args.command {
        Command::Stats => {
            let reader = SqliteDetectionReader::open(&db_path)?;
            print_json(&reader.stats()?)
        }
        Command::Show { id } => {
            let reader = SqliteDetectionReader::open(&db_path)?;
            let detection = reader
                .get_by_id(id)?
                .ok_or_else(|| anyhow!("detection {} not found", id))?;
            print_json(&detection)
        }
        Command::Latest { limit, camera } => {
            let reader = SqliteDetectionReader::open(&db_path)?;
            print_json(&reader.query_latest(camera.as_deref(), limit)?)
        }
        Command::Export {
            start,
            end,
            camera,
            output,
        } => {
            let (start, end) = parse_range(&start, &end)?;
            let reader = SqliteDetectionReader::open(&db_path)?;
            let rows = {
                let _stage = ui.stage("Query detections");
                let filter = RangeFilter {
                    camera_name: camera,
                    limit: None,
                };
                reader.query_range(start, end, &filter)?
            };
            let stage = ui.stage("Write export");
            let bar = ui.counter(rows.len() as u64, "export");
            let file = File::create(&output)
                .with_context(|| format!("create export file {}", output.display()))?;
            let mut out = BufWriter::new(file);
            out.write_all(b"[\n")?;
            for (i, detection) in rows.iter().enumerate() {
                if i > 0 {
                    out.write_all(b",\n")?;
                }
                serde_json::to_writer(&mut out, detection)?;
                bar.inc(1);
            }
            out.write_all(b"\n]\n")?;
            out.flush()?;
            bar.finish_and_clear();
            stage.finish(&format!("{} detections to {}", rows.len(), output.display()));
            Ok(())
        }
        Command::Delete { id } => {
            let mut store = SqliteDetectionStore::open(&db_path)?;
            if !store.delete(id)? {
                return Err(anyhow!("detection {} not found", id));
            }
            eprintln!("deleted detection {}", id);
            Ok(())
        }
        Command::DeleteRange { start, end, yes } => {
            let (start, end) = parse_range(&start, &end)?;
            if !yes {
                return Err(anyhow!(
                    "refusing to delete detections between {} and {} without --yes",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                ));
            }
            let mut store = SqliteDetectionStore::open(&db_path)?;
            let stage = ui.stage("Delete range");
            let removed = store.delete_range(start, end)?;
            stage.finish(&format!("{} removed", removed));
            Ok(())
        }
        Command::Prune {
            days,
            max_detections,
        } => {
            let policy = RetentionPolicy {
                max_age: days
                    .map(|d| Duration::from_secs(d.saturating_mul(24 * 60 * 60)))
                    .or(config.retention.max_age),
                max_detections: max_detections.or(config.retention.max_detections),
            };
            if policy.is_unbounded() {
                return Err(anyhow!("no retention limit configured"));
            }
            if policy.max_age == Some(Duration::ZERO) || policy.max_detections == Some(0) {
                return Err(anyhow!("retention limits must be greater than zero"));
            }
            let mut store = SqliteDetectionStore::open(&db_path)?;
            let stage = ui.stage("Prune");
            let removed = store.enforce_retention(&policy, chrono::Utc::now())?;
            stage.finish(&format!("{} evicted", removed));
            Ok(())
        }
    }
}

fn parse_range(
    start: &str,
    end: &str,
) -> Result<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    if start > end {
        return Err(anyhow!("start must not be after end"));
    }
    Ok((start, end))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
