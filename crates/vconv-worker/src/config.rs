//! Worker and storage configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use vconv_media::TranscoderOptions;
use vconv_models::EncodingPolicy;
use vconv_storage::{Backend, FsBackend, MemoryBackend, S3Backend, S3Config, StorageLayout};

use crate::error::{WorkerError, WorkerResult};

const DEFAULT_INPUT_PREFIX: &str = "video_conversion_workplace/input_directory/";
const DEFAULT_OUTPUT_PREFIX: &str = "video_conversion_workplace/output_directory/";
const DEFAULT_METADATA_PREFIX: &str = "video_conversion_workplace/metadata/";

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(name, default))
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity written into claims and locks
    pub worker_id: String,
    /// Parent directory of per-item scratch workspaces
    pub work_dir: PathBuf,
    /// Independent claim loops in this process
    pub concurrency: usize,
    /// Total attempts an item gets before its `failed` record is final
    pub max_attempts: u32,
    /// Claim lease; a claim not renewed for this long is abandoned
    pub claim_ttl: Duration,
    /// Interval for renewing the claim lease while processing
    pub heartbeat_interval: Duration,
    /// Lease of the bookkeeping lock
    pub lock_ttl: Duration,
    /// Lock acquisition retries before giving up with `LockBusy`
    pub lock_retries: u32,
    /// Base delay of the lock acquisition backoff
    pub lock_backoff: Duration,
    /// Maximum time without FFmpeg progress
    pub stall_timeout: Duration,
    /// Encoder settings
    pub encoding: EncodingPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            work_dir: std::env::temp_dir(),
            concurrency: 1,
            max_attempts: 1,
            claim_ttl: Duration::from_secs(1800), // 30 minutes
            heartbeat_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(60),
            lock_retries: 5,
            lock_backoff: Duration::from_millis(200),
            stall_timeout: Duration::from_secs(300),
            encoding: EncodingPolicy::default(),
        }
    }
}

/// `<hostname>-<8 hex>` so claims stay attributable to a host.
fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency).max(1),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            claim_ttl: env_secs("WORKER_CLAIM_TTL_SECS", 1800),
            heartbeat_interval: env_secs("WORKER_HEARTBEAT_SECS", 60),
            lock_ttl: env_secs("WORKER_LOCK_TTL_SECS", 60),
            lock_retries: env_or("WORKER_LOCK_RETRIES", defaults.lock_retries),
            lock_backoff: defaults.lock_backoff,
            stall_timeout: env_secs("WORKER_STALL_TIMEOUT_SECS", 300),
            encoding: EncodingPolicy {
                codec: std::env::var("FFMPEG_ENCODER").unwrap_or(defaults.encoding.codec),
                preset: std::env::var("FFMPEG_PRESET").unwrap_or(defaults.encoding.preset),
            },
        }
    }

    /// Check relations between settings.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.claim_ttl {
            return Err(WorkerError::config_error(format!(
                "heartbeat interval {:?} must be shorter than the claim TTL {:?}",
                self.heartbeat_interval, self.claim_ttl
            )));
        }
        if self.lock_ttl.is_zero() {
            return Err(WorkerError::config_error("lock TTL must be positive"));
        }
        Ok(())
    }

    /// Options for the FFmpeg transcoder.
    pub fn transcoder_options(&self) -> TranscoderOptions {
        TranscoderOptions {
            policy: self.encoding.clone(),
            stall_timeout: self.stall_timeout,
            ..Default::default()
        }
    }
}

/// Which blob store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Local,
    Memory,
}

impl FromStr for BackendKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(BackendKind::S3),
            "local" | "fs" => Ok(BackendKind::Local),
            "memory" => Ok(BackendKind::Memory),
            other => Err(WorkerError::config_error(format!(
                "unknown STORAGE_BACKEND '{}' (expected s3, local or memory)",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: BackendKind,
    pub s3: S3Config,
    /// Root directory of the local backend
    pub local_root: PathBuf,
    pub input_prefix: String,
    pub output_prefix: String,
    pub metadata_prefix: String,
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let kind = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => BackendKind::S3,
        };

        Ok(Self {
            kind,
            s3: S3Config::from_env(),
            local_root: std::env::var("LOCAL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage")),
            input_prefix: std::env::var("INPUT_PREFIX")
                .unwrap_or_else(|_| DEFAULT_INPUT_PREFIX.to_string()),
            output_prefix: std::env::var("OUTPUT_PREFIX")
                .unwrap_or_else(|_| DEFAULT_OUTPUT_PREFIX.to_string()),
            metadata_prefix: std::env::var("METADATA_PREFIX")
                .unwrap_or_else(|_| DEFAULT_METADATA_PREFIX.to_string()),
        })
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.input_prefix, &self.output_prefix, &self.metadata_prefix)
    }

    /// Build the configured backend.
    pub async fn connect(&self) -> WorkerResult<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match self.kind {
            BackendKind::S3 => {
                let s3 = S3Backend::new(self.s3.clone()).await?;
                info!(bucket = s3.bucket(), "Using S3 backend");
                Arc::new(s3)
            }
            BackendKind::Local => {
                info!(root = %self.local_root.display(), "Using local backend");
                Arc::new(FsBackend::new(&self.local_root))
            }
            BackendKind::Memory => {
                info!("Using in-memory backend");
                Arc::new(MemoryBackend::new())
            }
        };
        Ok(backend)
    }
}
