//! Detection store.
//!
//! `DetectionReader` covers every query; `DetectionStore` adds the write side.
//! The replay API is only ever handed readers.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::{micros_to_timestamp, CandidateDetection, Detection, PersonPose, PoseContract};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregate view of the stored history.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total_count: u64,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub total_persons: u64,
    pub average_persons_per_detection: f64,
    pub cameras: Vec<String>,
}

/// One point on the replay timeline. Carries no pose data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub person_count: u64,
}

/// Optional narrowing for time-range queries.
#[derive(Clone, Debug, Default)]
pub struct RangeFilter {
    pub camera_name: Option<String>,
    pub limit: Option<usize>,
}

/// Oldest-first eviction limits. `None` disables a limit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_detections: Option<u64>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_detections.is_none()
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let max_age = chrono::Duration::from_std(self.max_age?).ok()?;
        now.checked_sub_signed(max_age)
    }
}

pub trait DetectionReader: Send {
    fn get_by_id(&self, id: i64) -> Result<Option<Detection>>;

    /// Most recent first; ties broken by descending id.
    fn query_latest(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<Detection>>;

    /// Inclusive on both bounds, oldest first; ties broken by ascending id.
    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &RangeFilter,
    ) -> Result<Vec<Detection>>;

    /// Detection closest in time to `timestamp`, optionally no further than
    /// `tolerance`. Equidistant detections resolve to the lower id.
    fn query_nearest(
        &self,
        timestamp: DateTime<Utc>,
        tolerance: Option<Duration>,
        camera_name: Option<&str>,
    ) -> Result<Option<Detection>>;

    fn stats(&self) -> Result<DetectionStats>;

    /// Distinct camera names, sorted.
    fn cameras(&self) -> Result<Vec<String>>;

    /// The most recent `limit` detections as timeline points, oldest first.
    fn timeline(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<TimelineEntry>>;

    fn get_latest(&self, limit: usize) -> Result<Vec<Detection>> {
        self.query_latest(None, limit)
    }

    fn get_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Detection>> {
        self.query_range(start, end, &RangeFilter::default())
    }

    fn get_nearest(
        &self,
        timestamp: DateTime<Utc>,
        tolerance: Option<Duration>,
    ) -> Result<Option<Detection>> {
        self.query_nearest(timestamp, tolerance, None)
    }
}

pub trait DetectionStore: DetectionReader {
    /// Persist a detection atomically and return its id.
    ///
    /// Candidates that could not be read back unchanged are rejected: anything
    /// failing `PoseContract::check_candidate`, and timestamps finer than a
    /// microsecond (the stored precision; see `capture_timestamp`).
    fn insert(&mut self, candidate: &CandidateDetection) -> Result<i64>;

    /// Returns whether a row was removed. Deleting a missing id is not an error.
    fn delete(&mut self, id: i64) -> Result<bool>;

    /// Remove every detection in the inclusive range; returns the count removed.
    fn delete_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize>;

    /// Evict oldest detections beyond the policy; returns the count removed.
    fn enforce_retention(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize>;
}

// -------------------- Connections --------------------

/// URI for a private shared-cache in-memory database, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:gack_detections_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// SQLite busy/locked: another connection holds the lock, retrying may succeed.
pub fn is_transient(err: &anyhow::Error) -> bool {
    sqlite_code(err).is_some_and(|code| {
        matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    })
}

pub fn is_disk_full(err: &anyhow::Error) -> bool {
    sqlite_code(err) == Some(ErrorCode::DiskFull)
}

fn sqlite_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain().find_map(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => Some(e.code),
        _ => None,
    })
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Shared insert precondition for every store implementation.
fn check_storable(candidate: &CandidateDetection) -> Result<()> {
    PoseContract::check_candidate(candidate)?;
    if candidate.timestamp.timestamp_subsec_nanos() % 1_000 != 0 {
        return Err(anyhow!(
            "timestamp {} is finer than the stored microsecond precision",
            candidate.timestamp.to_rfc3339()
        ));
    }
    Ok(())
}

struct DetectionRow {
    id: i64,
    timestamp_us: i64,
    frame_number: i64,
    video_timestamp: f64,
    camera_name: String,
    persons_json: String,
}

impl DetectionRow {
    const COLUMNS: &'static str =
        "id, timestamp_us, frame_number, video_timestamp, camera_name, persons_json";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp_us: row.get(1)?,
            frame_number: row.get(2)?,
            video_timestamp: row.get(3)?,
            camera_name: row.get(4)?,
            persons_json: row.get(5)?,
        })
    }

    fn into_detection(self) -> Result<Detection> {
        let persons: Vec<PersonPose> = serde_json::from_str(&self.persons_json)
            .with_context(|| format!("corrupt persons_json for detection {}", self.id))?;
        Ok(Detection {
            id: self.id,
            timestamp: micros_to_timestamp(self.timestamp_us)?,
            frame_number: u64::try_from(self.frame_number)
                .map_err(|_| anyhow!("corrupt frame_number for detection {}", self.id))?,
            video_timestamp: self.video_timestamp,
            camera_name: self.camera_name,
            persons,
        })
    }
}

// -------------------- SQLite reader --------------------

/// Read-only handle. Each replay API worker owns one.
pub struct SqliteDetectionReader {
    conn: Connection,
}

impl SqliteDetectionReader {
    /// Open a query-only connection to an existing store.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open detection database {}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(Self { conn })
    }

    fn collect(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Detection>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, DetectionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(DetectionRow::into_detection).collect()
    }
}

impl DetectionReader for SqliteDetectionReader {
    fn get_by_id(&self, id: i64) -> Result<Option<Detection>> {
        let sql = format!(
            "SELECT {} FROM detections WHERE id = ?1",
            DetectionRow::COLUMNS
        );
        Ok(self.collect(&sql, params![id])?.into_iter().next())
    }

    fn query_latest(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<Detection>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM detections WHERE (?2 IS NULL OR camera_name = ?2) \
             ORDER BY timestamp_us DESC, id DESC LIMIT ?1",
            DetectionRow::COLUMNS
        );
        self.collect(
            &sql,
            params![i64::try_from(limit).unwrap_or(i64::MAX), camera_name],
        )
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &RangeFilter,
    ) -> Result<Vec<Detection>> {
        if filter.limit == Some(0) {
            return Ok(Vec::new());
        }
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let sql = format!(
            "SELECT {} FROM detections \
             WHERE timestamp_us BETWEEN ?1 AND ?2 AND (?3 IS NULL OR camera_name = ?3) \
             ORDER BY timestamp_us ASC, id ASC LIMIT ?4",
            DetectionRow::COLUMNS
        );
        self.collect(
            &sql,
            params![to_micros(start), to_micros(end), filter.camera_name, limit],
        )
    }

    fn query_nearest(
        &self,
        timestamp: DateTime<Utc>,
        tolerance: Option<Duration>,
        camera_name: Option<&str>,
    ) -> Result<Option<Detection>> {
        let target = to_micros(timestamp);
        let (low, high) = match tolerance {
            Some(t) => {
                let t = i64::try_from(t.as_micros()).unwrap_or(i64::MAX);
                (target.saturating_sub(t), target.saturating_add(t))
            }
            None => (i64::MIN, i64::MAX),
        };
        let sql = format!(
            "SELECT {} FROM detections WHERE timestamp_us BETWEEN ?2 AND ?3 \
             AND (?4 IS NULL OR camera_name = ?4) \
             ORDER BY ABS(timestamp_us - ?1) ASC, id ASC LIMIT 1",
            DetectionRow::COLUMNS
        );
        Ok(self
            .collect(&sql, params![target, low, high, camera_name])?
            .into_iter()
            .next())
    }

    fn stats(&self) -> Result<DetectionStats> {
        let (count, earliest, latest, persons): (i64, Option<i64>, Option<i64>, i64) =
            self.conn.query_row(
                "SELECT COUNT(*), MIN(timestamp_us), MAX(timestamp_us), \
                 COALESCE(SUM(person_count), 0) FROM detections",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let total_count = count.max(0) as u64;
        let total_persons = persons.max(0) as u64;
        Ok(DetectionStats {
            total_count,
            earliest_timestamp: earliest.map(micros_to_timestamp).transpose()?,
            latest_timestamp: latest.map(micros_to_timestamp).transpose()?,
            total_persons,
            average_persons_per_detection: average(total_persons, total_count),
            cameras: self.cameras()?,
        })
    }

    fn cameras(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT camera_name FROM detections ORDER BY camera_name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn timeline(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<TimelineEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_us, person_count FROM ( \
               SELECT id, timestamp_us, person_count FROM detections \
               WHERE (?2 IS NULL OR camera_name = ?2) \
               ORDER BY timestamp_us DESC, id DESC LIMIT ?1 \
             ) ORDER BY timestamp_us ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX), camera_name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, timestamp_us, person_count)| {
                Ok(TimelineEntry {
                    id,
                    timestamp: micros_to_timestamp(timestamp_us)?,
                    person_count: person_count.max(0) as u64,
                })
            })
            .collect()
    }
}

fn average(total_persons: u64, total_count: u64) -> f64 {
    if total_count == 0 {
        0.0
    } else {
        total_persons as f64 / total_count as f64
    }
}

// -------------------- SQLite store --------------------

/// The single writer. WAL journaling lets readers proceed while it writes.
pub struct SqliteDetectionStore {
    inner: SqliteDetectionReader,
    db_path: String,
}

impl SqliteDetectionStore {
    /// Open (creating if needed) the store at `db_path`.
    ///
    /// `":memory:"` is mapped to a fresh shared in-memory database, so readers
    /// opened through `open_reader` see the same data.
    pub fn open(db_path: &str) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        if !db_path.starts_with("file:") {
            if let Some(parent) = Path::new(&db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let conn = open_db_connection(&db_path)
            .with_context(|| format!("open detection database {}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            inner: SqliteDetectionReader { conn },
            db_path,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Path or URI this store was opened with.
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn open_reader(&self) -> Result<SqliteDetectionReader> {
        SqliteDetectionReader::open(&self.db_path)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.inner.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_us INTEGER NOT NULL,
              frame_number INTEGER NOT NULL,
              video_timestamp REAL NOT NULL,
              camera_name TEXT NOT NULL,
              person_count INTEGER NOT NULL,
              persons_json TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp_us);
            CREATE INDEX IF NOT EXISTS idx_detections_camera ON detections(camera_name, timestamp_us);
            "#,
        )?;
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        let n: i64 = self
            .inner
            .conn
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl DetectionReader for SqliteDetectionStore {
    fn get_by_id(&self, id: i64) -> Result<Option<Detection>> {
        self.inner.get_by_id(id)
    }

    fn query_latest(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<Detection>> {
        self.inner.query_latest(camera_name, limit)
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &RangeFilter,
    ) -> Result<Vec<Detection>> {
        self.inner.query_range(start, end, filter)
    }

    fn query_nearest(
        &self,
        timestamp: DateTime<Utc>,
        tolerance: Option<Duration>,
        camera_name: Option<&str>,
    ) -> Result<Option<Detection>> {
        self.inner.query_nearest(timestamp, tolerance, camera_name)
    }

    fn stats(&self) -> Result<DetectionStats> {
        self.inner.stats()
    }

    fn cameras(&self) -> Result<Vec<String>> {
        self.inner.cameras()
    }

    fn timeline(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<TimelineEntry>> {
        self.inner.timeline(camera_name, limit)
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn insert(&mut self, candidate: &CandidateDetection) -> Result<i64> {
        check_storable(candidate)?;
        let frame_number = i64::try_from(candidate.frame_number)
            .map_err(|_| anyhow!("frame_number {} exceeds i64 range", candidate.frame_number))?;
        let person_count = i64::try_from(candidate.persons.len())?;
        let persons_json = serde_json::to_string(&candidate.persons)?;

        let tx = self.inner.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO detections(timestamp_us, frame_number, video_timestamp, camera_name,
                                   person_count, persons_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                to_micros(candidate.timestamp),
                frame_number,
                candidate.video_timestamp,
                candidate.camera_name,
                person_count,
                persons_json,
                Utc::now().timestamp()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let n = self
            .inner
            .conn
            .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn delete_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        let n = self.inner.conn.execute(
            "DELETE FROM detections WHERE timestamp_us BETWEEN ?1 AND ?2",
            params![to_micros(start), to_micros(end)],
        )?;
        Ok(n)
    }

    fn enforce_retention(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize> {
        let mut evicted = 0;
        if let Some(cutoff) = policy.cutoff(now) {
            evicted += self.inner.conn.execute(
                "DELETE FROM detections WHERE timestamp_us < ?1",
                params![to_micros(cutoff)],
            )?;
        }
        if let Some(max) = policy.max_detections {
            let excess = self.count()?.saturating_sub(max);
            if excess > 0 {
                evicted += self.inner.conn.execute(
                    "DELETE FROM detections WHERE id IN \
                     (SELECT id FROM detections ORDER BY timestamp_us ASC, id ASC LIMIT ?1)",
                    params![i64::try_from(excess).unwrap_or(i64::MAX)],
                )?;
            }
        }
        Ok(evicted)
    }
}

// -------------------- In-memory store --------------------

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: i64,
    rows: Vec<Detection>,
}

/// Shared, clonable store for tests. Clones see the same rows.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&InMemoryState) -> T) -> Result<T> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("detection store lock poisoned"))?;
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut InMemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("detection store lock poisoned"))?;
        Ok(f(&mut state))
    }
}

fn in_range(d: &Detection, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    d.timestamp >= start && d.timestamp <= end
}

fn camera_matches(d: &Detection, camera_name: Option<&str>) -> bool {
    camera_name.map_or(true, |c| d.camera_name == c)
}

impl DetectionReader for InMemoryDetectionStore {
    fn get_by_id(&self, id: i64) -> Result<Option<Detection>> {
        self.read(|s| s.rows.iter().find(|d| d.id == id).cloned())
    }

    fn query_latest(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<Detection>> {
        self.read(|s| {
            let mut rows: Vec<Detection> = s
                .rows
                .iter()
                .filter(|d| camera_matches(d, camera_name))
                .cloned()
                .collect();
            rows.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
            rows.truncate(limit);
            rows
        })
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &RangeFilter,
    ) -> Result<Vec<Detection>> {
        self.read(|s| {
            let mut rows: Vec<Detection> = s
                .rows
                .iter()
                .filter(|d| in_range(d, start, end))
                .filter(|d| camera_matches(d, filter.camera_name.as_deref()))
                .cloned()
                .collect();
            rows.sort_by_key(|d| (d.timestamp, d.id));
            if let Some(limit) = filter.limit {
                rows.truncate(limit);
            }
            rows
        })
    }

    fn query_nearest(
        &self,
        timestamp: DateTime<Utc>,
        tolerance: Option<Duration>,
        camera_name: Option<&str>,
    ) -> Result<Option<Detection>> {
        let target = to_micros(timestamp);
        let tolerance = tolerance.map(|t| i64::try_from(t.as_micros()).unwrap_or(i64::MAX));
        self.read(|s| {
            s.rows
                .iter()
                .filter(|d| camera_matches(d, camera_name))
                .map(|d| ((to_micros(d.timestamp) - target).unsigned_abs(), d))
                .filter(|(gap, _)| tolerance.map_or(true, |t| *gap <= t.unsigned_abs()))
                .min_by_key(|(gap, d)| (*gap, d.id))
                .map(|(_, d)| d.clone())
        })
    }

    fn stats(&self) -> Result<DetectionStats> {
        let cameras = self.cameras()?;
        self.read(|s| {
            let total_count = s.rows.len() as u64;
            let total_persons = s.rows.iter().map(|d| d.persons.len() as u64).sum();
            DetectionStats {
                total_count,
                earliest_timestamp: s.rows.iter().map(|d| d.timestamp).min(),
                latest_timestamp: s.rows.iter().map(|d| d.timestamp).max(),
                total_persons,
                average_persons_per_detection: average(total_persons, total_count),
                cameras,
            }
        })
    }

    fn cameras(&self) -> Result<Vec<String>> {
        self.read(|s| {
            let mut names: Vec<String> = s.rows.iter().map(|d| d.camera_name.clone()).collect();
            names.sort();
            names.dedup();
            names
        })
    }

    fn timeline(&self, camera_name: Option<&str>, limit: usize) -> Result<Vec<TimelineEntry>> {
        let mut rows = self.query_latest(camera_name, limit)?;
        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|d| TimelineEntry {
                id: d.id,
                timestamp: d.timestamp,
                person_count: d.persons.len() as u64,
            })
            .collect())
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn insert(&mut self, candidate: &CandidateDetection) -> Result<i64> {
        check_storable(candidate)?;
        self.write(|s| {
            s.next_id += 1;
            let id = s.next_id;
            s.rows.push(Detection::from_candidate(id, candidate.clone()));
            id
        })
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        self.write(|s| {
            let before = s.rows.len();
            s.rows.retain(|d| d.id != id);
            s.rows.len() != before
        })
    }

    fn delete_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        self.write(|s| {
            let before = s.rows.len();
            s.rows.retain(|d| !in_range(d, start, end));
            before - s.rows.len()
        })
    }

    fn enforce_retention(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = policy.cutoff(now);
        self.write(|s| {
            let before = s.rows.len();
            if let Some(cutoff) = cutoff {
                s.rows.retain(|d| d.timestamp >= cutoff);
            }
            if let Some(max) = policy.max_detections {
                let max = usize::try_from(max).unwrap_or(usize::MAX);
                if s.rows.len() > max {
                    s.rows.sort_by_key(|d| (d.timestamp, d.id));
                    let excess = s.rows.len() - max;
                    s.rows.drain(..excess);
                }
            }
            before - s.rows.len()
        })
    }
}
