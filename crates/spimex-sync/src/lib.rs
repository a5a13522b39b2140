//! Run orchestration: configuration, the bulletin pipeline and its run report.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use spimex_adapters::{parse_bulletin, BulletinLocator, ListingConfig, LocateOutcome, StopReason};
use spimex_core::{BulletinLink, DateRange, TradingRecord};
use spimex_storage::{BackoffPolicy, BulletinCache, HttpClientConfig, HttpFetcher, ResourceFetcher};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod catalog;
pub mod db;
pub mod writer;

pub use catalog::{CatalogError, CatalogRepository, NewBook};
pub use db::Database;
pub use writer::{save_records, MemorySession, PersistError, PgSession, ResultSession, StoreError};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Range the job covers when none is given on the command line.
pub fn default_range() -> DateRange {
    let start = NaiveDate::from_ymd_opt(2023, 4, 22).unwrap_or(NaiveDate::MIN);
    let end = NaiveDate::from_ymd_opt(2025, 5, 11).unwrap_or(NaiveDate::MAX);
    DateRange::new(start, end).unwrap_or_else(|_| DateRange::single(start))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error("reading listing config {path}: {message}")]
    File { path: PathBuf, message: String },
}

#[derive(Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DbSettings {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        let port = required("DB_PORT")?;
        Ok(Self {
            host: required("DB_HOST")?,
            port: port.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "DB_PORT",
                message: format!("{port:?} is not a port number"),
            })?,
            name: required("DB_NAME")?,
            user: required("DB_USER")?,
            password: required("DB_PASS")?,
        })
    }
}

/// Everything the pipeline needs apart from the database.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub http: HttpClientConfig,
    pub listing: ListingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("bulletins"),
            reports_dir: PathBuf::from("reports"),
            http: HttpClientConfig::default(),
            listing: ListingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let optional = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let mut http = defaults.http;
        if let Some(ua) = optional("SPIMEX_USER_AGENT") {
            http.user_agent = ua;
        }
        if let Some(raw) = optional("SPIMEX_HTTP_TIMEOUT_SECS") {
            http.timeout = Duration::from_secs(parse_number("SPIMEX_HTTP_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = optional("SPIMEX_HTTP_MAX_RETRIES") {
            http.backoff = BackoffPolicy {
                max_retries: parse_number("SPIMEX_HTTP_MAX_RETRIES", &raw)?,
                ..http.backoff
            };
        }
        if let Some(raw) = optional("SPIMEX_ACCEPT_INVALID_CERTS") {
            http.accept_invalid_certs = matches!(raw.trim(), "1" | "true" | "TRUE" | "True");
        }

        let listing = match optional("SPIMEX_LISTING_CONFIG") {
            Some(path) => load_listing_config(Path::new(&path))?,
            None => defaults.listing,
        };

        Ok(Self {
            output_dir: optional("SPIMEX_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            reports_dir: optional("SPIMEX_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            http,
            listing,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db: DbSettings,
    pub pipeline: PipelineConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            db: DbSettings::from_lookup(&lookup)?,
            pipeline: PipelineConfig::from_lookup(&lookup)?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        message: format!("{raw:?} is not a non-negative integer"),
    })
}

pub fn load_listing_config(path: &Path) -> Result<ListingConfig, ConfigError> {
    let file_err = |message: String| ConfigError::File {
        path: path.to_path_buf(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
    serde_yaml::from_str(&text).map_err(|e| file_err(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulletinStatus {
    Persisted { rows: usize },
    FetchFailed { reason: String },
    ParseFailed { reason: String },
    PersistFailed { reason: String },
}

impl BulletinStatus {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulletinOutcome {
    pub url: String,
    pub trade_date: NaiveDate,
    pub file: Option<String>,
    pub reused_file: bool,
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub status: BulletinStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub dry_run: bool,
    pub pages_read: usize,
    pub discovery_stop: StopReason,
    pub located: usize,
    pub persisted_bulletins: usize,
    pub failed_bulletins: usize,
    pub persisted_rows: usize,
    pub outcomes: Vec<BulletinOutcome>,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

pub struct BulletinPipeline {
    config: PipelineConfig,
    http: Box<dyn ResourceFetcher>,
    cache: BulletinCache,
    dry_run: bool,
}

impl BulletinPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http.clone()).context("building http client")?;
        Ok(Self::with_fetcher(config, Box::new(http)))
    }

    pub fn with_fetcher(config: PipelineConfig, http: Box<dyn ResourceFetcher>) -> Self {
        let cache = BulletinCache::new(config.output_dir.clone());
        Self {
            config,
            http,
            cache,
            dry_run: false,
        }
    }

    /// Marks the run report as a dry run. Has no effect on which session is used.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn locate(&self, range: DateRange) -> LocateOutcome {
        BulletinLocator::new(&*self.http, self.config.listing.clone())
            .locate(range)
            .await
    }

    pub async fn run(&self, range: DateRange, session: &mut dyn ResultSession) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, start = %range.start(), end = %range.end());
        self.run_inner(run_id, range, session).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        range: DateRange,
        session: &mut dyn ResultSession,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        self.cache
            .ensure_root()
            .await
            .with_context(|| format!("preparing output directory {}", self.cache.root().display()))?;

        let located = self.locate(range).await;
        info!(links = located.links.len(), pages = located.pages_read, stop = ?located.stop, "bulletin discovery finished");

        let mut outcomes = Vec::with_capacity(located.links.len());
        for link in &located.links {
            let span = info_span!("bulletin", date = %link.trade_date);
            let outcome = self.process_bulletin(link, session).instrument(span).await;
            outcomes.push(outcome);
        }

        let persisted_rows = outcomes
            .iter()
            .map(|o| match o.status {
                BulletinStatus::Persisted { rows } => rows,
                _ => 0,
            })
            .sum();
        let persisted_bulletins = outcomes.iter().filter(|o| o.status.is_persisted()).count();

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            range_start: range.start(),
            range_end: range.end(),
            dry_run: self.dry_run,
            pages_read: located.pages_read,
            discovery_stop: located.stop,
            located: located.links.len(),
            persisted_bulletins,
            failed_bulletins: outcomes.len() - persisted_bulletins,
            persisted_rows,
            outcomes,
            report_path: None,
        };
        summary.report_path = Some(self.write_report(&summary).await?);

        info!(
            located = summary.located,
            persisted = summary.persisted_bulletins,
            failed = summary.failed_bulletins,
            rows = summary.persisted_rows,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn process_bulletin(
        &self,
        link: &BulletinLink,
        session: &mut dyn ResultSession,
    ) -> BulletinOutcome {
        let mut outcome = BulletinOutcome {
            url: link.url.clone(),
            trade_date: link.trade_date,
            file: None,
            reused_file: false,
            content_hash: None,
            status: BulletinStatus::Persisted { rows: 0 },
        };

        let cached = match self.cache.fetch(&*self.http, link).await {
            Ok(cached) => cached,
            Err(err) => {
                error!(url = %link.url, error = %err, "bulletin download failed, skipping");
                outcome.status = BulletinStatus::FetchFailed {
                    reason: err.to_string(),
                };
                return outcome;
            }
        };
        outcome.file = Some(cached.path.display().to_string());
        outcome.reused_file = cached.reused;
        outcome.content_hash = cached.content_hash.clone();

        let records = match parse_cached(cached.path, link.trade_date).await {
            Ok(records) => records,
            Err(reason) => {
                warn!(url = %link.url, %reason, "bulletin could not be parsed, skipping");
                outcome.status = BulletinStatus::ParseFailed { reason };
                return outcome;
            }
        };

        outcome.status = match save_records(session, &records).await {
            Ok(rows) => BulletinStatus::Persisted { rows },
            Err(err) => BulletinStatus::PersistFailed {
                reason: err.to_string(),
            },
        };
        outcome
    }

    async fn write_report(&self, summary: &RunSummary) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let path = run_dir.join(RUN_SUMMARY_FILE);
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "run report written");
        Ok(path)
    }
}

async fn parse_cached(path: PathBuf, trade_date: NaiveDate) -> Result<Vec<TradingRecord>, String> {
    let processed_at = Utc::now().naive_utc();
    tokio::task::spawn_blocking(move || parse_bulletin(&path, trade_date, processed_at))
        .await
        .map_err(|e| format!("parser task failed: {e}"))?
        .map_err(|e| e.to_string())
}

/// Full run against Postgres: connect, apply migrations, sync, close.
pub async fn run_sync_from_env(range: DateRange) -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let db = Database::connect(&config.db)
        .await
        .context("connecting to postgres")?;
    db.migrate().await.context("applying migrations")?;

    let pipeline = BulletinPipeline::new(config.pipeline)?;
    let mut session = db.session();
    let summary = pipeline.run(range, &mut session).await;
    db.close().await;
    summary
}

/// Same run without a database: rows are committed to an in-memory session and discarded.
pub async fn run_dry_from_env(range: DateRange) -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let pipeline = BulletinPipeline::new(config)?.dry_run(true);
    let mut session = MemorySession::new();
    pipeline.run(range, &mut session).await
}
