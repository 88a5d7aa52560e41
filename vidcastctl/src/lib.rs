use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vidcast_core::{
    load_vidcast_config, notifier_from_config, storage_from_config, FfmpegEncoder,
    FfmpegIngestLauncher, JobFilter, JobRendition, NewVideoJob, RecordingHandle, RecordingManager,
    RecordingStatus, RegistrySettings, SqliteVideoStore, StreamRegistry, StreamStatus, TickReport,
    TranscodeWorker, VideoJob, VideoStatus, VidcastConfig, WorkerSettings,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vidcast_core::ConfigError),
    #[error("job store error: {0}")]
    Store(#[from] vidcast_core::JobStoreError),
    #[error("live stream error: {0}")]
    Live(#[from] vidcast_core::LiveError),
    #[error("storage error: {0}")]
    Storage(#[from] vidcast_core::StorageError),
    #[error("notifier error: {0}")]
    Notifier(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("recording {id} failed: {reason}")]
    Recording { id: String, reason: String },
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vidcast media pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to the main vidcast.toml
    #[arg(long, default_value = "configs/vidcast.toml")]
    pub config: PathBuf,
    /// Job database override (replaces paths.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Job counts by status
    Status,
    /// Inspect and submit video jobs
    #[command(subcommand)]
    Jobs(JobsCommands),
    /// Run the transcode worker
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Supervise a live stream from the terminal
    #[command(subcommand)]
    Stream(StreamCommands),
    /// Check config, database and encoder binaries
    Health,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List jobs, newest first
    List(JobsListArgs),
    /// Register an uploaded source for processing
    Submit(JobsSubmitArgs),
    /// Show a job and its renditions
    Show(JobsShowArgs),
    /// Fail jobs whose claim expired too many times
    Reap,
}

#[derive(Args, Debug)]
pub struct JobsListArgs {
    /// Filter by status (processing, ready, failed, deleted)
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct JobsSubmitArgs {
    /// Owner notified when processing ends
    #[arg(long)]
    pub owner: String,
    /// Where the uploaded source can be fetched from
    pub source_url: String,
}

#[derive(Args, Debug)]
pub struct JobsShowArgs {
    pub id: String,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Poll until Ctrl-C
    Run,
    /// Run a single tick and exit
    Once,
}

#[derive(Subcommand, Debug)]
pub enum StreamCommands {
    /// Start ingest, wait for Ctrl-C, stop
    Run(StreamRunArgs),
}

#[derive(Args, Debug)]
pub struct StreamRunArgs {
    #[arg(long)]
    pub key: String,
    /// Ingest source, e.g. rtmp://host/app/key
    #[arg(long)]
    pub input: String,
    /// Record the stream and publish the recording on stop
    #[arg(long, default_value_t = false)]
    pub record: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Jobs(JobsCommands::List(args)) => {
            let jobs = context.jobs_list(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Jobs(JobsCommands::Submit(args)) => {
            let job = context.jobs_submit(args)?;
            render(&job, cli.format)?;
        }
        Commands::Jobs(JobsCommands::Show(args)) => {
            let detail = context.jobs_show(args)?;
            render(&detail, cli.format)?;
        }
        Commands::Jobs(JobsCommands::Reap) => {
            let reaped = context.jobs_reap()?;
            render(&reaped, cli.format)?;
        }
        Commands::Worker(WorkerCommands::Once) => {
            let report = runtime()?.block_on(context.worker_once())?;
            render(&report, cli.format)?;
        }
        Commands::Worker(WorkerCommands::Run) => {
            runtime()?.block_on(context.worker_run())?;
        }
        Commands::Stream(StreamCommands::Run(args)) => {
            let summary = runtime()?.block_on(context.stream_run(args))?;
            render(&summary, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    config: VidcastConfig,
    config_path: PathBuf,
    database: PathBuf,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_vidcast_config(&config_path)?;
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| config.database_path());
        Ok(Self {
            config,
            config_path,
            database,
        })
    }

    fn store(&self) -> Result<SqliteVideoStore> {
        if let Some(parent) = self.database.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = SqliteVideoStore::new(&self.database)?;
        store.initialize()?;
        Ok(store)
    }

    pub fn gather_status(&self) -> Result<StatusReport> {
        let counts = self
            .store()?
            .counts()?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        Ok(StatusReport {
            database: self.database.clone(),
            counts,
        })
    }

    pub fn jobs_list(&self, args: &JobsListArgs) -> Result<JobList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<VideoStatus>)
            .transpose()?;
        let rows = self.store()?.list(&JobFilter {
            status,
            limit: Some(args.limit),
        })?;
        Ok(JobList { rows })
    }

    pub fn jobs_submit(&self, args: &JobsSubmitArgs) -> Result<VideoJob> {
        let job = self.store()?.create(&NewVideoJob {
            owner_id: args.owner.clone(),
            source_url: args.source_url.clone(),
        })?;
        info!(target: "vidcastctl", job_id = %job.id, owner_id = %job.owner_id, "job submitted");
        Ok(job)
    }

    pub fn jobs_show(&self, args: &JobsShowArgs) -> Result<JobDetail> {
        let store = self.store()?;
        let job = store
            .get(&args.id)?
            .ok_or_else(|| AppError::MissingResource(format!("job {} not found", args.id)))?;
        let renditions = store.renditions(&job.id)?;
        Ok(JobDetail { job, renditions })
    }

    pub fn jobs_reap(&self) -> Result<JobList> {
        let rows = self
            .store()?
            .reap_stale(self.config.worker.lease(), self.config.worker.max_attempts)?;
        Ok(JobList { rows })
    }

    fn worker(&self) -> Result<TranscodeWorker> {
        let settings = WorkerSettings::from_config(&self.config);
        fs::create_dir_all(&settings.scratch_dir)?;
        let encoder = FfmpegEncoder::new(&self.config.encoder, settings.scratch_dir.clone());
        let storage = storage_from_config(&self.config)?;
        let notifier = notifier_from_config(&self.config.notify)?;
        Ok(TranscodeWorker::new(
            self.store()?,
            Arc::new(encoder),
            storage,
            notifier,
            settings,
        ))
    }

    pub async fn worker_once(&self) -> Result<TickReport> {
        Ok(self.worker()?.run_tick().await?)
    }

    pub async fn worker_run(&self) -> Result<()> {
        let worker = self.worker()?;
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "vidcastctl", "interrupt received, finishing current tick");
            }
            on_signal.cancel();
        });
        worker.run(cancel).await;
        Ok(())
    }

    pub async fn stream_run(&self, args: &StreamRunArgs) -> Result<StreamSummary> {
        let settings = RegistrySettings::from_config(&self.config.live);
        fs::create_dir_all(&settings.output_root)?;
        let scratch = self.config.scratch_dir();
        fs::create_dir_all(&scratch)?;
        let launcher = Arc::new(FfmpegIngestLauncher::new(&self.config.encoder.ffmpeg));
        let encoder = Arc::new(FfmpegEncoder::new(&self.config.encoder, scratch));
        let storage = storage_from_config(&self.config)?;
        let registry = StreamRegistry::new(settings, launcher.clone(), encoder, storage.clone());
        let recordings = RecordingManager::new(registry.clone(), launcher, storage);

        let result = supervise_stream(&registry, &recordings, args, tokio::signal::ctrl_c()).await;
        registry.shutdown().await;
        result
    }

    pub fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("vidcast.toml", &self.config_path));
        results.push(check_database("videos.sqlite", &self.database));
        results.push(check_directory("scratch", &self.config.scratch_dir()));
        results.push(check_directory(
            "live output",
            Path::new(&self.config.live.output_root),
        ));
        results.push(check_binary("ffmpeg", &self.config.encoder.ffmpeg));
        results.push(check_binary("ffprobe", &self.config.encoder.ffprobe));
        results
    }
}

/// Runs one stream until `stop` resolves. The stream is always stopped
/// before an error is returned; stopping it also finishes its recording.
pub async fn supervise_stream<F>(
    registry: &StreamRegistry,
    recordings: &RecordingManager,
    args: &StreamRunArgs,
    stop: F,
) -> Result<StreamSummary>
where
    F: Future<Output = std::io::Result<()>>,
{
    let playback_url = registry.start_stream(&args.key, &args.input).await?;
    println!("live: {playback_url}");
    if args.record {
        match recordings.start_recording(&args.key).await {
            Ok(handle) => println!("recording: {}", handle.file_path.display()),
            Err(err) => {
                if let Err(stop_err) = registry.stop_stream(&args.key).await {
                    warn!(target: "vidcastctl", stream_key = %args.key, error = %stop_err, "stream did not stop cleanly");
                }
                return Err(err.into());
            }
        }
    }

    let waited = stop.await;
    info!(target: "vidcastctl", stream_key = %args.key, "stopping stream");
    let final_status = registry.status(&args.key).await;
    let stopped = registry.stop_stream(&args.key).await;
    waited?;
    stopped?;

    let recording = if args.record {
        recordings.recordings(&args.key).await.pop()
    } else {
        None
    };
    if let Some(handle) = &recording {
        if handle.status == RecordingStatus::Failed {
            return Err(AppError::Recording {
                id: handle.id.clone(),
                reason: handle.error.clone().unwrap_or_default(),
            });
        }
    }

    Ok(StreamSummary {
        stream_key: args.key.clone(),
        playback_url,
        final_status,
        recording,
    })
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{path} missing", path = path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(
            name,
            format!("{path} is not a directory", path = path.display()),
        ),
        Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
    }
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.eq_ignore_ascii_case("ok") => {
                    HealthEntry::ok(name, "integrity ok".to_string())
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
    }
}

fn check_binary(name: &str, program: &str) -> HealthEntry {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout.lines().next().unwrap_or(program).trim().to_string();
            HealthEntry::ok(name, version)
        }
        Ok(output) => HealthEntry::error(
            name,
            format!("{program} -version exited with {:?}", output.status.code()),
        ),
        Err(err) => HealthEntry::error(name, format!("{program} unavailable: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub counts: BTreeMap<String, i64>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Database: {}", self.database.display())];
        if self.counts.is_empty() {
            lines.push("No jobs".to_string());
        } else {
            lines.push("Jobs:".to_string());
            for (status, count) in &self.counts {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<VideoJob>,
}

fn job_line(job: &VideoJob) -> String {
    let duration = job
        .duration_s
        .map(|v| format!("{v:.1}s"))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} | owner={} | status={} | dur={} | attempts={}",
        job.id, job.owner_id, job.status, duration, job.attempts
    );
    if let Some(error) = &job.error {
        line.push_str(&format!(" | error={error}"));
    }
    line
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No jobs found".to_string();
        }
        self.rows.iter().map(job_line).collect::<Vec<_>>().join("\n")
    }
}

impl DisplayFallback for VideoJob {
    fn display(&self) -> String {
        job_line(self)
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub job: VideoJob,
    pub renditions: Vec<JobRendition>,
}

impl DisplayFallback for JobDetail {
    fn display(&self) -> String {
        let mut lines = vec![job_line(&self.job), format!("source: {}", self.job.source_url)];
        if let Some(thumbnail) = &self.job.thumbnail_url {
            lines.push(format!("thumbnail: {thumbnail}"));
        }
        for rendition in &self.renditions {
            lines.push(format!(
                "  - {} {}x{} {}k {}",
                rendition.name,
                rendition.width,
                rendition.height,
                rendition.bitrate_kbps,
                rendition.url
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TickReport {
    fn display(&self) -> String {
        format!(
            "selected={} ready={} failed={} skipped={} reaped={}",
            self.selected, self.ready, self.failed, self.skipped, self.reaped
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub stream_key: String,
    pub playback_url: String,
    pub final_status: StreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingHandle>,
}

impl DisplayFallback for StreamSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} stopped (was live: {}, viewers: {})",
            self.stream_key, self.final_status.is_live, self.final_status.viewer_count
        )];
        if let Some(recording) = &self.recording {
            lines.push(format!(
                "recording {}: {:?} {}",
                recording.id,
                recording.status,
                recording.uploaded_url.as_deref().unwrap_or("-")
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}
