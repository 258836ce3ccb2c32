//! gack - ingestion daemon with the replay API alongside
//!
//! This daemon:
//! 1. Opens (or creates) the detection store
//! 2. Serves the read-only replay API from a worker pool
//! 3. Pulls frames from the configured stream, runs pose detection and records
//!    one detection per sampled frame
//! 4. Applies the retention policy periodically
//!
//! If ingestion cannot start, or stops with an error, the API keeps serving
//! until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use gack::{
    ApiServer, DetectionReader, GackConfig, IngestPipeline, PipelineStats, ReaderFactory,
    SqliteDetectionReader, SqliteDetectionStore,
};

fn main() -> Result<()> {
    let config = GackConfig::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    if let Some(dir) = &config.faces_dir {
        log::warn!(
            "FACES_DIR={} ignored: face recognition is not supported",
            dir.display()
        );
    }

    let store = SqliteDetectionStore::open(&config.db_path)?;

    let reader_path = store.db_path().to_string();
    let readers: ReaderFactory = Arc::new(move || {
        let reader = SqliteDetectionReader::open(&reader_path)?;
        Ok(Box::new(reader) as Box<dyn DetectionReader>)
    });
    let api_handle = ApiServer::new(config.api_config(), readers).spawn()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    // From here on ingestion faults are logged; the API stays up.
    let outcome = run_ingestion(&config, store, &shutdown);
    match &outcome {
        Ok(stats) => log::info!(
            "ingestion finished: {} detections from {} frames",
            stats.detections_recorded,
            stats.frames_processed
        ),
        Err(err) => log::error!("ingestion stopped: {:#}", err),
    }

    if !shutdown.load(Ordering::SeqCst) {
        log::info!(
            "replay api still serving on {}; press Ctrl-C to exit",
            api_handle.addr
        );
        let _ = rx.recv();
    }
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    outcome.map(|_| ())
}

fn run_ingestion(
    config: &GackConfig,
    store: SqliteDetectionStore,
    shutdown: &Arc<AtomicBool>,
) -> Result<PipelineStats> {
    let mut pipeline = IngestPipeline::from_config(config, Box::new(store), shutdown.clone())?
        .on_record(|outcome| {
            log::debug!(
                "frame {} persons={} id={:?}",
                outcome.frame_number(),
                outcome.persons().len(),
                outcome.id()
            );
        });

    log::info!(
        "gack running. camera={} db={} fps={}",
        config.camera_name,
        config.db_path,
        config.stream.fps
    );
    pipeline.run(shutdown)
}
