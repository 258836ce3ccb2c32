use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::detect::DetectorSettings;
use crate::ingest::rtsp::{validate_stream_url, RtspConfig};
use crate::ingest::BackoffConfig;
use crate::storage::RetentionPolicy;

const DEFAULT_DB_PATH: &str = "outdata/pose_detections.db";
const DEFAULT_OUTPUT_VIDEO: &str = "outdata/output.mjpeg";
const DEFAULT_CAMERA_NAME: &str = "camera";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_WEB_HOST: &str = "0.0.0.0";
const DEFAULT_WEB_PORT: u16 = 8000;
const DEFAULT_FPS: u32 = 1;
const MAX_FPS: u32 = 120;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 10;
const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[derive(Debug, Deserialize, Default)]
struct GackConfigFile {
    db_path: Option<String>,
    camera_name: Option<String>,
    log_level: Option<String>,
    faces_dir: Option<PathBuf>,
    stream: Option<StreamConfigFile>,
    output: Option<OutputConfigFile>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    fps: Option<u32>,
    stall_timeout_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    video: Option<String>,
    show_original: Option<bool>,
    save_to_db: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    days: Option<u64>,
    max_detections: Option<u64>,
}

/// Runtime configuration shared by every binary.
#[derive(Debug, Clone)]
pub struct GackConfig {
    pub db_path: String,
    pub camera_name: String,
    pub log_level: String,
    /// Recognised for compatibility; face recognition is not supported.
    pub faces_dir: Option<PathBuf>,
    pub stream: StreamSettings,
    pub output: OutputSettings,
    pub web_host: String,
    pub web_port: u16,
    pub api_workers: usize,
    pub detector: DetectorSettings,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Required only by the ingestion binary.
    pub url: Option<String>,
    pub fps: u32,
    pub stall_timeout: Duration,
    pub reconnect: BackoffConfig,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub video: Option<PathBuf>,
    pub show_original: bool,
    pub save_to_db: bool,
}

impl GackConfig {
    /// File named by `GACK_CONFIG` (if any), then environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let file_cfg = match env_value("GACK_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => GackConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GackConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let retention = file.retention.unwrap_or_default();

        let default_reconnect = BackoffConfig::default();
        let detector_defaults = DetectorSettings::default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            camera_name: file
                .camera_name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            log_level: file
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            faces_dir: file.faces_dir,
            stream: StreamSettings {
                url: stream.url,
                fps: stream.fps.unwrap_or(DEFAULT_FPS),
                stall_timeout: Duration::from_secs(
                    stream
                        .stall_timeout_secs
                        .unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
                ),
                reconnect: BackoffConfig {
                    initial: stream
                        .reconnect_initial_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default_reconnect.initial),
                    max: stream
                        .reconnect_max_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default_reconnect.max),
                },
            },
            output: OutputSettings {
                video: match output.video {
                    Some(raw) => video_path(&raw),
                    None => Some(PathBuf::from(DEFAULT_OUTPUT_VIDEO)),
                },
                show_original: output.show_original.unwrap_or(false),
                save_to_db: output.save_to_db.unwrap_or(true),
            },
            web_host: api.host.unwrap_or_else(|| DEFAULT_WEB_HOST.to_string()),
            web_port: api.port.unwrap_or(DEFAULT_WEB_PORT),
            api_workers: api.workers.unwrap_or(ApiConfig::default().workers),
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(detector_defaults.backend),
                model_path: detector.model_path,
                input_size: detector.input_size.unwrap_or(detector_defaults.input_size),
            },
            retention: RetentionPolicy {
                max_age: Some(days(retention.days.unwrap_or(DEFAULT_RETENTION_DAYS))),
                max_detections: retention.max_detections,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("RTSP_URL").or_else(|| env_value("UNIFI_RTSPS_URL")) {
            self.stream.url = Some(url);
        }
        if let Some(name) = env_value("CAMERA_NAME") {
            self.camera_name = name;
        }
        if let Some(fps) = env_value("FPS") {
            self.stream.fps = fps
                .parse()
                .map_err(|_| anyhow!("FPS must be an integer, got '{}'", fps))?;
        }
        if let Some(value) = env_value("SHOW_ORIGINAL") {
            self.output.show_original = parse_bool("SHOW_ORIGINAL", &value)?;
        }
        if let Some(value) = env_value("SAVE_TO_DB") {
            self.output.save_to_db = parse_bool("SAVE_TO_DB", &value)?;
        }
        if let Ok(raw) = std::env::var("OUTPUT_VIDEO") {
            self.output.video = video_path(&raw);
        }
        if let Some(level) = env_value("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(dir) = env_value("FACES_DIR") {
            self.faces_dir = Some(PathBuf::from(dir));
        }
        if let Some(host) = env_value("WEB_HOST") {
            self.web_host = host;
        }
        if let Some(port) = env_value("WEB_PORT") {
            self.web_port = port
                .parse()
                .map_err(|_| anyhow!("WEB_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(path) = env_value("DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_value("DETECTOR_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(value) = env_value("RETENTION_DAYS") {
            self.retention.max_age = parse_limit("RETENTION_DAYS", &value)?.map(days);
        }
        if let Some(value) = env_value("MAX_DETECTIONS") {
            self.retention.max_detections = parse_limit("MAX_DETECTIONS", &value)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.stream.fps == 0 || self.stream.fps > MAX_FPS {
            return Err(anyhow!(
                "FPS must be between 1 and {}, got {}",
                MAX_FPS,
                self.stream.fps
            ));
        }
        if let Some(url) = &self.stream.url {
            validate_stream_url(url)?;
        }
        if self.camera_name.trim().is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("database path must not be empty"));
        }
        self.log_level = self.log_level.trim().to_lowercase();
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "log level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.log_level
            ));
        }
        if self.retention.max_age == Some(Duration::ZERO) || self.retention.max_detections == Some(0) {
            return Err(anyhow!("retention limits must be greater than zero"));
        }
        if self.api_workers == 0 {
            return Err(anyhow!("api workers must be greater than zero"));
        }
        if self.stream.reconnect.initial.is_zero()
            || self.stream.reconnect.initial > self.stream.reconnect.max
        {
            return Err(anyhow!(
                "reconnect backoff must satisfy 0 < initial <= max"
            ));
        }
        Ok(())
    }

    /// Stream settings for the ingestion loop. Fails when no stream URL is configured.
    pub fn rtsp_config(&self) -> Result<RtspConfig> {
        let url = self
            .stream
            .url
            .clone()
            .ok_or_else(|| anyhow!("no stream configured: set RTSP_URL (or UNIFI_RTSPS_URL)"))?;
        Ok(RtspConfig {
            url,
            target_fps: self.stream.fps,
            reconnect: self.stream.reconnect.clone(),
            stall_timeout: self.stream.stall_timeout,
        })
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: format!("{}:{}", self.web_host, self.web_port),
            workers: self.api_workers,
            ..ApiConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<GackConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}

/// Positive integer, or `none`/`off`/`unlimited` to disable the limit.
fn parse_limit(name: &str, value: &str) -> Result<Option<u64>> {
    match value.trim().to_lowercase().as_str() {
        "none" | "off" | "unlimited" => Ok(None),
        raw => {
            let parsed: u64 = raw
                .parse()
                .map_err(|_| anyhow!("{} must be a positive integer or 'none', got '{}'", name, raw))?;
            if parsed == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
            Ok(Some(parsed))
        }
    }
}

/// Empty or `none`/`off` disables the overlay video.
fn video_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    match raw.to_lowercase().as_str() {
        "" | "none" | "off" | "false" | "0" => None,
        _ => Some(PathBuf::from(raw)),
    }
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(24 * 60 * 60))
}
