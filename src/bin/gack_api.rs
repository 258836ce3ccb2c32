//! gack_api - replay API only
//!
//! Serves an existing detection database read-only. Does NOT ingest streams.

use anyhow::{anyhow, Context, Result};
use std::sync::{mpsc, Arc};

use gack::{ApiServer, DetectionReader, GackConfig, ReaderFactory, SqliteDetectionReader, SqliteDetectionStore};

fn main() -> Result<()> {
    let config = GackConfig::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    if config.db_path == ":memory:" {
        return Err(anyhow!("gack_api needs a database file; set DB_PATH"));
    }
    // Create the schema once so a fresh install answers with empty results.
    // The write handle is dropped before any request is served.
    let db_path = {
        let store = SqliteDetectionStore::open(&config.db_path)?;
        store.db_path().to_string()
    };

    let readers: ReaderFactory = Arc::new(move || {
        let reader = SqliteDetectionReader::open(&db_path)?;
        Ok(Box::new(reader) as Box<dyn DetectionReader>)
    });
    let api_handle = ApiServer::new(config.api_config(), readers).spawn()?;
    log::info!("gack_api running. serving {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("gack_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
