//! Read-only replay API.
//!
//! One acceptor thread hands connections to a fixed pool of workers. Each
//! worker owns its own `DetectionReader`, so queries never contend on a shared
//! connection and nothing reachable from here can write to the store.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{DetectionReader, RangeFilter};

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DATETIME_HINT: &str = "Invalid datetime format. Use ISO format (YYYY-MM-DDTHH:MM:SS)";

/// Opens one read-only store handle per worker.
pub type ReaderFactory = Arc<dyn Fn() -> Result<Box<dyn DetectionReader>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub workers: usize,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            workers: 4,
            default_limit: 50,
            max_limit: 1000,
        }
    }
}

/// Malformed query input. Always answered with 400.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("missing required parameter '{0}'")]
    Missing(&'static str),
    #[error("'{name}' must be between {min} and {max}")]
    OutOfRange {
        name: &'static str,
        min: usize,
        max: usize,
    },
    #[error("{detail}")]
    Invalid { name: &'static str, detail: String },
    #[error("start must not be after end")]
    InvertedRange,
    #[error("detection id must be an integer, got '{0}'")]
    InvalidId(String),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Missing(_) => "missing_parameter",
            QueryError::OutOfRange { .. } => "out_of_range",
            QueryError::Invalid { .. } => "invalid_parameter",
            QueryError::InvertedRange => "inverted_range",
            QueryError::InvalidId(_) => "invalid_id",
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, let workers drain queued connections, then join all threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.acceptor.take() {
            join.join()
                .map_err(|_| anyhow!("api acceptor thread panicked"))?;
        }
        for join in self.workers.drain(..) {
            join.join()
                .map_err(|_| anyhow!("api worker thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    readers: ReaderFactory,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, readers: ReaderFactory) -> Self {
        Self { cfg, readers }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        if self.cfg.workers == 0 {
            return Err(anyhow!("api needs at least one worker"));
        }
        // Open every reader up front so a missing database fails startup, not the first request.
        let mut readers = Vec::with_capacity(self.cfg.workers);
        for _ in 0..self.cfg.workers {
            readers.push((self.readers)().context("open api store reader")?);
        }

        let listener = TcpListener::bind(self.cfg.addr.as_str())
            .with_context(|| format!("bind replay api on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (tx, rx) = mpsc::channel::<TcpStream>();
        let rx = Arc::new(Mutex::new(rx));
        let cfg = Arc::new(self.cfg);

        let mut workers = Vec::with_capacity(readers.len());
        for (index, reader) in readers.into_iter().enumerate() {
            let rx = rx.clone();
            let cfg = cfg.clone();
            let join = std::thread::Builder::new()
                .name(format!("gack-api-{}", index))
                .spawn(move || run_worker(reader, rx, cfg))
                .context("spawn api worker")?;
            workers.push(join);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let acceptor = std::thread::Builder::new()
            .name("gack-api-accept".to_string())
            .spawn(move || {
                let accept = move || listener.accept().map(|(stream, _)| stream);
                if let Err(err) = run_acceptor(accept, tx, shutdown_thread) {
                    log::error!("replay api stopped: {}", err);
                }
            })
            .context("spawn api acceptor")?;

        log::info!("replay api listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            acceptor: Some(acceptor),
            workers,
        })
    }
}

fn run_acceptor<A>(mut accept: A, tx: Sender<TcpStream>, shutdown: Arc<AtomicBool>) -> Result<()>
where
    A: FnMut() -> std::io::Result<TcpStream>,
{
    while !shutdown.load(Ordering::SeqCst) {
        match accept() {
            Ok(stream) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("replay api dropped connection: {}", err);
                    continue;
                }
                if tx.send(stream).is_err() {
                    return Err(anyhow!("all api workers have exited"));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            // Aborted handshakes and descriptor exhaustion pass; keep listening.
            Err(err) => {
                log::warn!("replay api accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    Ok(())
}

fn run_worker(reader: Box<dyn DetectionReader>, rx: Arc<Mutex<Receiver<TcpStream>>>, cfg: Arc<ApiConfig>) {
    loop {
        let next = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => break,
        };
        let Ok(stream) = next else {
            break;
        };
        if let Err(err) = handle_connection(stream, reader.as_ref(), &cfg) {
            log::warn!("replay api request failed: {}", err);
        }
    }
}

fn handle_connection(mut stream: TcpStream, reader: &dyn DetectionReader, cfg: &ApiConfig) -> Result<()> {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#);
            return Err(err);
        }
    };
    let response = route(&request, reader, cfg);
    log::debug!("{} {} -> {}", request.method, request.path, response.status);
    write_response(&mut stream, response.status, "application/json", &response.body)
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(err) => {
                log::error!("serialize api response: {}", err);
                Self::error(500, "internal", None)
            }
        }
    }

    fn error(status: u16, code: &str, detail: Option<String>) -> Self {
        let body = match detail {
            Some(detail) => serde_json::json!({ "error": code, "detail": detail }),
            None => serde_json::json!({ "error": code }),
        };
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    fn bad_query(err: QueryError) -> Self {
        Self::error(400, err.code(), Some(err.to_string()))
    }

    fn store_failure(err: anyhow::Error) -> Self {
        log::error!("replay api store query failed: {:#}", err);
        Self::error(500, "internal", None)
    }
}

/// Dispatch one request against a reader. Never fails; faults become status codes.
pub(crate) fn route(request: &HttpRequest, reader: &dyn DetectionReader, cfg: &ApiConfig) -> Response {
    if request.method != "GET" {
        return Response::error(405, "method_not_allowed", None);
    }
    let query = request.query();
    let path = request.path.trim_end_matches('/');
    let result = match path {
        "/health" => Ok(Response::json(200, &serde_json::json!({ "status": "ok" }))),
        "/api/stats" => Ok(reader
            .stats()
            .map_or_else(Response::store_failure, |stats| Response::json(200, &stats))),
        "/api/cameras" => Ok(reader
            .cameras()
            .map_or_else(Response::store_failure, |names| Response::json(200, &names))),
        "/api/timeline" => timeline(&query, reader, cfg),
        "/api/detections/latest" => latest(&query, reader, cfg),
        "/api/detections/timerange" => timerange(&query, reader, cfg),
        "/api/detections/nearest" => nearest(&query, reader),
        _ => match path.strip_prefix("/api/detections/") {
            Some(raw_id) if !raw_id.contains('/') => by_id(raw_id, reader),
            _ => Ok(Response::error(404, "not_found", None)),
        },
    };
    result.unwrap_or_else(Response::bad_query)
}

fn latest(query: &Query, reader: &dyn DetectionReader, cfg: &ApiConfig) -> Result<Response, QueryError> {
    let limit = parse_limit(query, cfg)?;
    let camera = query.get("camera_name").map(String::as_str);
    Ok(reader
        .query_latest(camera, limit)
        .map_or_else(Response::store_failure, |rows| Response::json(200, &rows)))
}

/// Replay timeline points. Without `limit` the full `max_limit` window is returned.
fn timeline(query: &Query, reader: &dyn DetectionReader, cfg: &ApiConfig) -> Result<Response, QueryError> {
    let limit = match query.get("limit") {
        Some(_) => parse_limit(query, cfg)?,
        None => cfg.max_limit,
    };
    let camera = query.get("camera_name").map(String::as_str);
    Ok(reader
        .timeline(camera, limit)
        .map_or_else(Response::store_failure, |points| Response::json(200, &points)))
}

fn timerange(query: &Query, reader: &dyn DetectionReader, cfg: &ApiConfig) -> Result<Response, QueryError> {
    let start = required_timestamp(query, "start")?;
    let end = required_timestamp(query, "end")?;
    if start > end {
        return Err(QueryError::InvertedRange);
    }
    let filter = RangeFilter {
        camera_name: query.get("camera_name").cloned(),
        limit: Some(parse_limit(query, cfg)?),
    };
    Ok(reader
        .query_range(start, end, &filter)
        .map_or_else(Response::store_failure, |rows| Response::json(200, &rows)))
}

fn nearest(query: &Query, reader: &dyn DetectionReader) -> Result<Response, QueryError> {
    let timestamp = required_timestamp(query, "timestamp")?;
    let tolerance = match query.get("tolerance") {
        None => None,
        Some(raw) => Some(parse_tolerance(raw)?),
    };
    let camera = query.get("camera_name").map(String::as_str);
    Ok(match reader.query_nearest(timestamp, tolerance, camera) {
        Ok(Some(detection)) => Response::json(200, &detection),
        Ok(None) => Response::error(404, "not_found", Some("Detection not found".to_string())),
        Err(err) => Response::store_failure(err),
    })
}

fn by_id(raw_id: &str, reader: &dyn DetectionReader) -> Result<Response, QueryError> {
    let id: i64 = raw_id
        .parse()
        .map_err(|_| QueryError::InvalidId(raw_id.to_string()))?;
    Ok(match reader.get_by_id(id) {
        Ok(Some(detection)) => Response::json(200, &detection),
        Ok(None) => Response::error(404, "not_found", None),
        Err(err) => Response::store_failure(err),
    })
}

type Query = HashMap<String, String>;

fn parse_limit(query: &Query, cfg: &ApiConfig) -> Result<usize, QueryError> {
    let Some(raw) = query.get("limit") else {
        return Ok(cfg.default_limit);
    };
    let out_of_range = QueryError::OutOfRange {
        name: "limit",
        min: 0,
        max: cfg.max_limit,
    };
    let value: i64 = raw.trim().parse().map_err(|_| QueryError::Invalid {
        name: "limit",
        detail: format!("limit must be an integer, got '{}'", raw),
    })?;
    let value = usize::try_from(value).map_err(|_| out_of_range.clone())?;
    if value > cfg.max_limit {
        return Err(out_of_range);
    }
    Ok(value)
}

fn required_timestamp(query: &Query, name: &'static str) -> Result<DateTime<Utc>, QueryError> {
    let raw = query.get(name).ok_or(QueryError::Missing(name))?;
    crate::parse_timestamp(raw).map_err(|_| QueryError::Invalid {
        name,
        detail: DATETIME_HINT.to_string(),
    })
}

fn parse_tolerance(raw: &str) -> Result<Duration, QueryError> {
    let invalid = || QueryError::Invalid {
        name: "tolerance",
        detail: format!("tolerance must be a non-negative number of seconds, got '{}'", raw),
    };
    let seconds: f64 = raw.trim().parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    Ok(HttpRequest::new(method, raw_path))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
pub(crate) struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    fn new(method: &str, raw_path: &str) -> Self {
        let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
        Self {
            method: method.to_string(),
            path,
            raw_path: raw_path.to_string(),
        }
    }

    /// Decoded query parameters; the first occurrence of a repeated key wins.
    fn query(&self) -> Query {
        let mut params = Query::new();
        if let Some((_, raw)) = self.raw_path.split_once('?') {
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DetectionStore, InMemoryDetectionStore};
    use crate::tests::candidate_at;
    use serde_json::Value;

    const T0: i64 = 1_700_000_000;

    fn iso(secs: i64) -> String {
        crate::micros_to_timestamp(secs * 1_000_000)
            .expect("timestamp")
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    }

    fn seeded() -> Result<(InMemoryDetectionStore, Vec<i64>)> {
        let mut store = InMemoryDetectionStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.insert(&candidate_at(T0 + i * 10, (i + 1) as u64, i as usize % 3))?);
        }
        let mut porch = candidate_at(T0 + 25, 99, 1);
        porch.camera_name = "porch".to_string();
        ids.push(store.insert(&porch)?);
        Ok((store, ids))
    }

    fn get(store: &InMemoryDetectionStore, raw_path: &str) -> (u16, Value) {
        let response = route(&HttpRequest::new("GET", raw_path), store, &ApiConfig::default());
        let body = serde_json::from_slice(&response.body).expect("json body");
        (response.status, body)
    }

    fn ids_of(body: &Value) -> Vec<i64> {
        body.as_array()
            .expect("array body")
            .iter()
            .map(|d| d["id"].as_i64().expect("id"))
            .collect()
    }

    #[test]
    fn health_and_method_checks() -> Result<()> {
        let (store, _) = seeded()?;
        assert_eq!(get(&store, "/health"), (200, serde_json::json!({"status": "ok"})));

        let response = route(&HttpRequest::new("POST", "/api/stats"), &store, &ApiConfig::default());
        assert_eq!(response.status, 405);
        let response = route(&HttpRequest::new("DELETE", "/api/detections/1"), &store, &ApiConfig::default());
        assert_eq!(response.status, 405);

        assert_eq!(get(&store, "/nope").0, 404);
        assert_eq!(get(&store, "/api/detections/1/persons").0, 404);
        Ok(())
    }

    #[test]
    fn latest_defaults_and_limits() -> Result<()> {
        let (store, ids) = seeded()?;
        let (status, body) = get(&store, "/api/detections/latest");
        assert_eq!(status, 200);
        assert_eq!(ids_of(&body), vec![ids[4], ids[3], ids[5], ids[2], ids[1], ids[0]]);

        let (_, body) = get(&store, "/api/detections/latest?limit=2");
        assert_eq!(ids_of(&body), vec![ids[4], ids[3]]);

        let (status, body) = get(&store, "/api/detections/latest?limit=0");
        assert_eq!(status, 200);
        assert_eq!(body, serde_json::json!([]));

        let (_, body) = get(&store, "/api/detections/latest?camera_name=porch");
        assert_eq!(ids_of(&body), vec![ids[5]]);

        for bad in ["-1", "1001", "ten"] {
            let (status, body) = get(&store, &format!("/api/detections/latest?limit={}", bad));
            assert_eq!(status, 400, "limit={}", bad);
            assert!(body["detail"].is_string());
        }
        assert_eq!(get(&store, "/api/detections/latest?limit=1000").0, 200);
        Ok(())
    }

    #[test]
    fn timerange_is_inclusive_and_validated() -> Result<()> {
        let (store, ids) = seeded()?;
        let path = format!(
            "/api/detections/timerange?start={}&end={}",
            iso(T0 + 10),
            iso(T0 + 30)
        );
        let (status, body) = get(&store, &path);
        assert_eq!(status, 200);
        assert_eq!(ids_of(&body), vec![ids[1], ids[2], ids[5], ids[3]]);

        let (_, body) = get(&store, &format!("{}&camera_name=test_camera&limit=2", path));
        assert_eq!(ids_of(&body), vec![ids[1], ids[2]]);

        let rfc = format!(
            "/api/detections/timerange?start={}Z&end={}%2B00:00",
            iso(T0),
            iso(T0)
        );
        let (_, body) = get(&store, &rfc);
        assert_eq!(ids_of(&body), vec![ids[0]]);

        let inverted = format!(
            "/api/detections/timerange?start={}&end={}",
            iso(T0 + 30),
            iso(T0)
        );
        let (status, body) = get(&store, &inverted);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "inverted_range");

        let (status, body) = get(&store, "/api/detections/timerange?start=yesterday&end=today");
        assert_eq!(status, 400);
        assert_eq!(body["detail"], DATETIME_HINT);

        let (status, body) = get(&store, &format!("/api/detections/timerange?start={}", iso(T0)));
        assert_eq!(status, 400);
        assert_eq!(body["error"], "missing_parameter");
        Ok(())
    }

    #[test]
    fn nearest_respects_tolerance() -> Result<()> {
        let (store, ids) = seeded()?;
        let (status, body) = get(&store, &format!("/api/detections/nearest?timestamp={}", iso(T0 + 12)));
        assert_eq!(status, 200);
        assert_eq!(body["id"].as_i64(), Some(ids[1]));

        let path = format!("/api/detections/nearest?timestamp={}&tolerance=1.5", iso(T0 + 15));
        assert_eq!(get(&store, &path).0, 404);

        let path = format!("/api/detections/nearest?timestamp={}&tolerance=-2", iso(T0));
        assert_eq!(get(&store, &path).0, 400);

        let path = format!("/api/detections/nearest?timestamp={}&camera_name=porch", iso(T0));
        assert_eq!(get(&store, &path).1["id"].as_i64(), Some(ids[5]));

        assert_eq!(get(&store, "/api/detections/nearest").0, 400);
        Ok(())
    }

    #[test]
    fn detection_by_id() -> Result<()> {
        let (store, ids) = seeded()?;
        let (status, body) = get(&store, &format!("/api/detections/{}", ids[2]));
        assert_eq!(status, 200);
        assert_eq!(body["frame_number"], 3);
        assert_eq!(body["camera_name"], "test_camera");
        assert_eq!(body["persons"].as_array().map(Vec::len), Some(2));

        let (status, body) = get(&store, "/api/detections/999999");
        assert_eq!(status, 404);
        assert_eq!(body["error"], "not_found");

        let (status, body) = get(&store, "/api/detections/abc");
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_id");
        Ok(())
    }

    #[test]
    fn stats_and_cameras() -> Result<()> {
        let (store, _) = seeded()?;
        let (status, body) = get(&store, "/api/stats");
        assert_eq!(status, 200);
        assert_eq!(body["total_count"], 6);
        assert_eq!(body["total_persons"], 5);

        let (status, body) = get(&store, "/api/cameras");
        assert_eq!(status, 200);
        assert_eq!(body, serde_json::json!(["porch", "test_camera"]));

        let empty = InMemoryDetectionStore::new();
        let (_, body) = get(&empty, "/api/stats");
        assert_eq!(body["total_count"], 0);
        assert!(body["earliest_timestamp"].is_null());
        Ok(())
    }

    #[test]
    fn timeline_is_ascending_and_light() -> Result<()> {
        let (store, ids) = seeded()?;
        let (status, body) = get(&store, "/api/timeline");
        assert_eq!(status, 200);
        assert_eq!(ids_of(&body), vec![ids[0], ids[1], ids[2], ids[5], ids[3], ids[4]]);
        assert_eq!(body[2]["person_count"], 2);
        assert!(body[0]["timestamp"].is_string());
        assert!(body[0].get("persons").is_none());

        let (_, body) = get(&store, "/api/timeline?limit=2");
        assert_eq!(ids_of(&body), vec![ids[3], ids[4]]);

        let (_, body) = get(&store, "/api/timeline?camera_name=porch");
        assert_eq!(ids_of(&body), vec![ids[5]]);

        assert_eq!(get(&store, "/api/timeline?limit=5000").0, 400);
        Ok(())
    }

    #[test]
    fn acceptor_survives_accept_errors() -> Result<()> {
        use std::collections::VecDeque;
        use std::io::{Error, ErrorKind};

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let _client = TcpStream::connect(listener.local_addr()?)?;
        let (accepted, _) = listener.accept()?;

        let mut script: VecDeque<std::io::Result<TcpStream>> = VecDeque::from(vec![
            Err(Error::from(ErrorKind::ConnectionAborted)),
            Err(Error::new(ErrorKind::Other, "too many open files")),
            Err(Error::from(ErrorKind::Interrupted)),
            Ok(accepted),
        ]);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let accept = move || {
            script.pop_front().unwrap_or_else(|| {
                stop.store(true, Ordering::SeqCst);
                Err(Error::from(ErrorKind::WouldBlock))
            })
        };

        let (tx, rx) = mpsc::channel();
        run_acceptor(accept, tx, shutdown)?;
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[test]
    fn query_decoding_keeps_first_value() {
        let request = HttpRequest::new("GET", "/x?camera_name=front%20door&limit=3&limit=9");
        let query = request.query();
        assert_eq!(query.get("camera_name").map(String::as_str), Some("front door"));
        assert_eq!(query.get("limit").map(String::as_str), Some("3"));
        assert_eq!(request.path, "/x");
    }
}
