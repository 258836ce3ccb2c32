use anyhow::{anyhow, Result};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gack::{
    ApiConfig, ApiServer, GackConfig, BackoffConfig, DetectionReader, DetectionRecorder, DetectorBackend,
    IngestPipeline, ReaderFactory, RetentionPolicy, RtspConfig, RtspSource, SqliteDetectionReader,
    SqliteDetectionStore, StubPoseDetector,
};

fn stub_source(url: &str, target_fps: u32) -> Result<RtspSource> {
    RtspSource::new(RtspConfig {
        url: url.to_string(),
        target_fps,
        reconnect: BackoffConfig {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(10),
        },
        stall_timeout: Duration::from_secs(1),
    })
}

fn detector() -> Arc<Mutex<dyn DetectorBackend>> {
    Arc::new(Mutex::new(StubPoseDetector::new()))
}

fn open_store(dir: &tempfile::TempDir) -> Result<SqliteDetectionStore> {
    let path = dir.path().join("pose_detections.db");
    SqliteDetectionStore::open(path.to_str().ok_or_else(|| anyhow!("non utf-8 path"))?)
}

#[test]
fn stream_to_store_to_api() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir)?;
    let db_path = store.db_path().to_string();

    // 90 frames at 30 fps sampled once per second: frames 1, 31 and 61.
    // The first 50 frames of the synthetic scene are bright, the rest dark.
    let source = stub_source("stub://porch?paced=false&frames=90&width=64&height=48", 1)?;
    let recorder = DetectionRecorder::new(Box::new(store), "porch");
    let mut pipeline = IngestPipeline::new(source, detector(), recorder);
    let stats = pipeline.run(&AtomicBool::new(false))?;
    assert_eq!(stats.frames_processed, 3);
    assert_eq!(stats.detections_recorded, 3);
    assert_eq!(stats.persons_seen, 2);

    let reader = SqliteDetectionReader::open(&db_path)?;
    let rows = reader.get_latest(10)?;
    let frames: Vec<u64> = rows.iter().map(|d| d.frame_number).collect();
    assert_eq!(frames, vec![61, 31, 1]);
    let persons: Vec<usize> = rows.iter().map(|d| d.persons.len()).collect();
    assert_eq!(persons, vec![0, 1, 1]);
    assert!((rows[1].video_timestamp - 1.0).abs() < 1e-6);
    assert!(rows.iter().all(|d| d.camera_name == "porch"));
    assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    let path = db_path.clone();
    let readers: ReaderFactory = Arc::new(move || {
        Ok(Box::new(SqliteDetectionReader::open(&path)?) as Box<dyn DetectionReader>)
    });
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            workers: 1,
            ..ApiConfig::default()
        },
        readers,
    )
    .spawn()?;
    let body = get(api.addr, &format!("/api/detections/{}", rows[1].id))?;
    assert_eq!(body["frame_number"], 31);
    assert_eq!(body["persons"].as_array().map(Vec::len), Some(1));
    api.stop()?;
    Ok(())
}

#[test]
fn reconnects_keep_frame_numbers_unique() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir)?;
    let db_path = store.db_path().to_string();

    let source = stub_source(
        "stub://garage?paced=false&frames=30&disconnect_every=10&width=8&height=8",
        30,
    )?;
    let recorder = DetectionRecorder::new(Box::new(store), "garage");
    let mut pipeline = IngestPipeline::new(source, detector(), recorder);
    let stats = pipeline.run(&AtomicBool::new(false))?;
    assert_eq!(stats.source.reconnects, 2);

    let reader = SqliteDetectionReader::open(&db_path)?;
    let mut frames: Vec<u64> = reader.get_latest(100)?.iter().map(|d| d.frame_number).collect();
    frames.reverse();
    assert_eq!(frames, (1..=30).collect::<Vec<u64>>());
    Ok(())
}

#[test]
fn retention_runs_at_startup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir)?;
    let db_path = store.db_path().to_string();

    let source = stub_source("stub://cam?paced=false&frames=20&width=8&height=8", 30)?;
    let recorder = DetectionRecorder::new(Box::new(store), "cam");
    let mut pipeline = IngestPipeline::new(source, detector(), recorder);
    pipeline.run(&AtomicBool::new(false))?;

    // A second run with a count cap evicts the oldest rows before ingesting more.
    let store = SqliteDetectionStore::open(&db_path)?;
    let source = stub_source("stub://cam?paced=false&frames=5&width=8&height=8", 30)?;
    let recorder = DetectionRecorder::new(Box::new(store), "cam");
    let policy = RetentionPolicy {
        max_age: None,
        max_detections: Some(10),
    };
    let mut pipeline = IngestPipeline::new(source, detector(), recorder)
        .with_retention(policy, Duration::from_secs(3600));
    let stats = pipeline.run(&AtomicBool::new(false))?;
    assert_eq!(stats.retention_evicted, 10);

    let reader = SqliteDetectionReader::open(&db_path)?;
    assert_eq!(reader.stats()?.total_count, 15);
    Ok(())
}

fn write_config(dir: &tempfile::TempDir, json: serde_json::Value) -> Result<GackConfig> {
    let path = dir.path().join("gack.json");
    std::fs::write(&path, serde_json::to_vec(&json)?)?;
    GackConfig::from_path(&path)
}

#[test]
fn unwritable_overlay_does_not_block_ingestion() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir)?;
    let db_path = store.db_path().to_string();

    // A regular file where the overlay directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory")?;
    let config = write_config(
        &dir,
        serde_json::json!({
            "camera_name": "porch",
            "stream": { "url": "stub://porch?paced=false&frames=6&width=8&height=8", "fps": 30 },
            "output": { "video": blocker.join("output.mjpeg") }
        }),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut pipeline = IngestPipeline::from_config(&config, Box::new(store), shutdown.clone())?;
    let stats = pipeline.run(&shutdown)?;
    assert_eq!(stats.detections_recorded, 6);
    assert_eq!(stats.overlay_frames, 0);
    assert_eq!(SqliteDetectionReader::open(&db_path)?.stats()?.total_count, 6);
    Ok(())
}

#[test]
fn ingestion_setup_faults_are_returned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        &dir,
        serde_json::json!({
            "stream": { "url": "stub://cam?frames=1" },
            "detector": { "backend": "no_such_backend" }
        }),
    )?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let result = IngestPipeline::from_config(&config, Box::new(open_store(&dir)?), shutdown.clone());
    assert!(result.is_err());

    let config = write_config(&dir, serde_json::json!({ "camera_name": "cam" }))?;
    let result = IngestPipeline::from_config(&config, Box::new(open_store(&dir)?), shutdown.clone());
    assert!(result.is_err(), "a missing stream url must be reported");

    #[cfg(not(any(feature = "rtsp-gstreamer", feature = "rtsp-ffmpeg")))]
    {
        let config = write_config(
            &dir,
            serde_json::json!({ "stream": { "url": "rtsp://cam.local/live" } }),
        )?;
        let result = IngestPipeline::from_config(&config, Box::new(open_store(&dir)?), shutdown);
        assert!(result.is_err());
    }
    Ok(())
}

#[cfg(feature = "overlay-video")]
#[test]
fn overlay_video_gets_one_image_per_sampled_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir)?;
    let video = dir.path().join("out").join("output.mjpeg");

    let source = stub_source("stub://cam?paced=false&frames=12&width=64&height=48", 10)?;
    let recorder = DetectionRecorder::new(Box::new(store), "cam");
    let writer = gack::render::OverlayVideoWriter::create(&video, false)?;
    let mut pipeline = IngestPipeline::new(source, detector(), recorder).with_overlay(writer);
    let stats = pipeline.run(&AtomicBool::new(false))?;
    assert_eq!(stats.frames_processed, 4);
    assert_eq!(stats.overlay_frames, 4);

    let bytes = std::fs::read(&video)?;
    let images = bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count();
    assert_eq!(images, 4);
    Ok(())
}

fn get(addr: std::net::SocketAddr, path: &str) -> Result<serde_json::Value> {
    use std::io::{Read, Write};
    let mut stream = std::net::TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow!("malformed response"))?;
    if !head.starts_with("HTTP/1.1 200") {
        return Err(anyhow!("unexpected response: {}", head));
    }
    Ok(serde_json::from_str(body)?)
}
