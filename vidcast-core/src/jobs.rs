use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::sqlite::configure_connection;

pub const VIDEOS_SCHEMA: &str = include_str!("../../sql/videos.sql");

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("failed to open video database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on video database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("video database path not configured")]
    MissingStore,
    #[error("invalid video status: {0}")]
    InvalidStatus(String),
    #[error("video job not found: {0}")]
    NotFound(String),
    #[error("video job {id} is no longer processing or claimed by another worker")]
    InvalidTransition { id: String },
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    Ready,
    Failed,
    Deleted,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
            VideoStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, VideoStatus::Processing)
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VideoStatus {
    type Err = JobStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(JobStoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewVideoJob {
    pub owner_id: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoJob {
    pub id: String,
    pub owner_id: String,
    pub source_url: String,
    pub status: VideoStatus,
    pub duration_s: Option<f64>,
    pub thumbnail_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            source_url: row.get("source_url")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(VideoStatus::Failed),
            duration_s: row.get("duration_s")?,
            thumbnail_url: row.get("thumbnail_url")?,
            published_at: parse_timestamp(row.get("published_at")?),
            error: row.get("error")?,
            claimed_by: row.get("claimed_by")?,
            claimed_at: parse_timestamp(row.get("claimed_at")?),
            attempts: row.get::<_, i64>("attempts")?.max(0) as u32,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }
}

/// A successfully encoded and uploaded rendition of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRendition {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub url: String,
}

/// Fields written when a job reaches Ready.
#[derive(Debug, Clone)]
pub struct ReadyUpdate {
    pub duration_s: f64,
    pub thumbnail_url: String,
    pub renditions: Vec<JobRendition>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<VideoStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteVideoStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteVideoStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> JobStoreResult<SqliteVideoStore> {
        let path = self.path.ok_or(JobStoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteVideoStore { path, flags })
    }
}

/// SQLite-backed view of the video records the transcoding pipeline owns.
///
/// Every status write is guarded by `status = 'processing'`, so a job can
/// only ever move from Processing to a terminal state.
#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteVideoStore {
    pub fn builder() -> SqliteVideoStoreBuilder {
        SqliteVideoStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JobStoreResult<Self> {
        SqliteVideoStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> JobStoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            JobStoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| JobStoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> JobStoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(VIDEOS_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, job: &NewVideoJob) -> JobStoreResult<VideoJob> {
        let conn = self.open()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        conn.execute(
            "INSERT INTO videos (id, owner_id, source_url, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'processing', ?4, ?4)",
            params![&id, &job.owner_id, &job.source_url, now],
        )?;
        self.fetch(&conn, &id)?
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))
    }

    pub fn get(&self, id: &str) -> JobStoreResult<Option<VideoJob>> {
        let conn = self.open()?;
        self.fetch(&conn, id)
    }

    pub fn list(&self, filter: &JobFilter) -> JobStoreResult<Vec<VideoJob>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM videos");
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(VideoJob::from_row(row)?);
        }
        Ok(jobs)
    }

    pub fn counts(&self) -> JobStoreResult<HashMap<VideoStatus, i64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM videos GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Ok(status) = status.parse() {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }

    /// Oldest Processing jobs that no live lease currently covers.
    pub fn pending(&self, limit: usize, lease: StdDuration) -> JobStoreResult<Vec<VideoJob>> {
        let conn = self.open()?;
        let cutoff = lease_cutoff(lease);
        let mut stmt = conn.prepare(
            "SELECT * FROM videos
             WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < ?1)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cutoff, limit as i64])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(VideoJob::from_row(row)?);
        }
        Ok(jobs)
    }

    /// Takes the processing lease on a job. Returns `false` when the job has
    /// left Processing or another worker holds an unexpired lease.
    pub fn claim(&self, id: &str, worker_id: &str, lease: StdDuration) -> JobStoreResult<bool> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        let cutoff = lease_cutoff(lease);
        let affected = conn.execute(
            "UPDATE videos
             SET claimed_by = ?1, claimed_at = ?2, attempts = attempts + 1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'
               AND (claimed_at IS NULL OR claimed_at < ?4)",
            params![worker_id, now, id, cutoff],
        )?;
        Ok(affected == 1)
    }

    pub fn mark_ready(&self, id: &str, worker_id: &str, update: &ReadyUpdate) -> JobStoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        let affected = tx.execute(
            "UPDATE videos
             SET status = 'ready', duration_s = ?1, thumbnail_url = ?2, published_at = ?3,
                 error = NULL, updated_at = ?3
             WHERE id = ?4 AND status = 'processing' AND claimed_by = ?5",
            params![update.duration_s, &update.thumbnail_url, now, id, worker_id],
        )?;
        if affected == 0 {
            return Err(JobStoreError::InvalidTransition { id: id.to_string() });
        }
        for rendition in &update.renditions {
            tx.execute(
                "INSERT OR REPLACE INTO video_renditions (job_id, name, width, height, bitrate_kbps, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    &rendition.name,
                    rendition.width,
                    rendition.height,
                    rendition.bitrate_kbps,
                    &rendition.url
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fails a Processing job. With `worker_id` set, only the lease holder may
    /// write the failure.
    pub fn mark_failed(&self, id: &str, worker_id: Option<&str>, error: &str) -> JobStoreResult<()> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        let affected = conn.execute(
            "UPDATE videos SET status = 'failed', error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing' AND (?4 IS NULL OR claimed_by = ?4)",
            params![error, now, id, worker_id],
        )?;
        if affected == 0 {
            return Err(JobStoreError::InvalidTransition { id: id.to_string() });
        }
        Ok(())
    }

    /// Fails jobs whose lease expired after they used up `max_attempts`.
    pub fn reap_stale(&self, lease: StdDuration, max_attempts: u32) -> JobStoreResult<Vec<VideoJob>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let cutoff = lease_cutoff(lease);
        let mut reaped = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT * FROM videos
                 WHERE status = 'processing' AND claimed_at IS NOT NULL
                   AND claimed_at < ?1 AND attempts >= ?2
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let mut rows = stmt.query(params![cutoff, max_attempts])?;
            while let Some(row) = rows.next()? {
                reaped.push(VideoJob::from_row(row)?);
            }
        }
        let now = Utc::now().naive_utc();
        for job in reaped.iter_mut() {
            let message = format!("processing abandoned after {} attempts", job.attempts);
            tx.execute(
                "UPDATE videos SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
                params![&message, now, &job.id],
            )?;
            job.status = VideoStatus::Failed;
            job.error = Some(message);
        }
        tx.commit()?;
        Ok(reaped)
    }

    pub fn renditions(&self, id: &str) -> JobStoreResult<Vec<JobRendition>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT name, width, height, bitrate_kbps, url FROM video_renditions
             WHERE job_id = ?1 ORDER BY height ASC",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(JobRendition {
                name: row.get(0)?,
                width: row.get(1)?,
                height: row.get(2)?,
                bitrate_kbps: row.get(3)?,
                url: row.get(4)?,
            })
        })?;
        let mut renditions = Vec::new();
        for row in rows {
            renditions.push(row?);
        }
        Ok(renditions)
    }

    fn fetch(&self, conn: &Connection, id: &str) -> JobStoreResult<Option<VideoJob>> {
        let job = conn
            .query_row("SELECT * FROM videos WHERE id = ?1", [id], VideoJob::from_row)
            .optional()?;
        Ok(job)
    }
}

fn lease_cutoff(lease: StdDuration) -> NaiveDateTime {
    let lease = Duration::from_std(lease).unwrap_or_else(|_| Duration::days(365));
    (Utc::now() - lease).naive_utc()
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
