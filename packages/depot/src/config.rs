// Service configuration management
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for the metadata database, spool and local objects
    pub root: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub reclaim: ReclaimConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Lifetime of presigned download URLs when the client asks for none
    pub presign_expiry_secs: u64,
    /// Longest lifetime a client may ask for
    pub max_presign_expiry_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            presign_expiry_secs: 3_600,
            max_presign_expiry_secs: 7 * 24 * 3_600,
        }
    }
}

impl ServerConfig {
    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }

    /// Requested lifetime clamped to `1..=max_presign_expiry_secs`
    pub fn clamp_presign_expiry(&self, requested: Option<u64>) -> Duration {
        let secs = requested.unwrap_or(self.presign_expiry_secs);
        Duration::from_secs(secs.clamp(1, self.max_presign_expiry_secs))
    }
}

/// Where physical objects live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Sharded directory tree under `root/objects`
    Local,
    /// Process memory; objects vanish on exit
    Memory,
    /// S3-compatible bucket (MinIO, R2, AWS)
    S3 {
        endpoint: String,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_size: u64,
    /// Lower-case extensions rejected at upload
    pub blocked_extensions: Vec<String>,
    pub default_content_type: String,
    /// Bytes handed to the MIME sniffer
    pub sniff_prefix_len: usize,
    pub max_filename_len: usize,
    /// Files accepted in one multipart batch upload
    pub max_batch_files: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            blocked_extensions: ["exe", "bat", "cmd", "sh", "msi", "com", "scr"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_content_type: "application/octet-stream".to_string(),
            sniff_prefix_len: 8192,
            max_filename_len: 255,
            max_batch_files: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Time between background sweeps
    pub interval_secs: u64,
    /// How long an unreferenced object survives before physical deletion
    pub grace_secs: u64,
    /// Upload claims not refreshed for this long are considered abandoned
    pub claim_ttl_secs: u64,
    /// Pending records older than this belong to uploads that died
    pub pending_ttl_secs: u64,
    /// How long a losing upload waits on another upload's claim
    pub claim_wait_ms: u64,
    /// Deleted records are purged after this long; `None` keeps them forever
    pub record_retention_secs: Option<u64>,
    /// Upper bound on objects reclaimed per sweep
    pub batch_size: u32,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 3_600,
            claim_ttl_secs: 900,
            pending_ttl_secs: 24 * 3_600,
            claim_wait_ms: 5_000,
            record_retention_secs: Some(30 * 24 * 3_600),
            batch_size: 256,
        }
    }
}

impl ReclaimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    pub fn record_retention(&self) -> Option<Duration> {
        self.record_retention_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Size of the read pool; writes always go through a single connection
    pub max_read_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_read_connections: 8,
            acquire_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration with the following priority:
    /// 1. DEPOT_ROOT environment variable (root only, everything else default)
    /// 2. config.toml file (DEPOT_CONFIG or ~/.config/depot/config.toml)
    /// 3. Default: ~/.cache/depot
    pub async fn load() -> Result<Self, ConfigError> {
        if let Ok(env_path) = std::env::var("DEPOT_ROOT") {
            return Ok(Self::with_root(env_path));
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::from_file(&config_path).await;
            }
        }

        Ok(Self::default())
    }

    /// Read and validate a TOML config file
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Default settings rooted at the given directory
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            reclaim: ReclaimConfig::default(),
            database: DatabaseConfig::default(),
        }
    }

    fn config_file_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("DEPOT_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        dirs::config_dir().map(|dir| dir.join("depot").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.reclaim.interval_secs == 0 {
            return Err(ConfigError::Invalid("reclaim.interval_secs must be positive".into()));
        }
        if self.reclaim.pending_ttl_secs < self.reclaim.claim_ttl_secs {
            return Err(ConfigError::Invalid(
                "reclaim.pending_ttl_secs must not be shorter than reclaim.claim_ttl_secs".into(),
            ));
        }
        if self.server.presign_expiry_secs == 0
            || self.server.presign_expiry_secs > self.server.max_presign_expiry_secs
        {
            return Err(ConfigError::Invalid(
                "server.presign_expiry_secs must be between 1 and server.max_presign_expiry_secs"
                    .into(),
            ));
        }
        if self.reclaim.batch_size == 0 {
            return Err(ConfigError::Invalid("reclaim.batch_size must be positive".into()));
        }
        if self.limits.max_batch_files == 0 {
            return Err(ConfigError::Invalid("limits.max_batch_files must be positive".into()));
        }
        if self.limits.sniff_prefix_len == 0 {
            return Err(ConfigError::Invalid("limits.sniff_prefix_len must be positive".into()));
        }
        if self.database.max_read_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_read_connections must be positive".into(),
            ));
        }
        if let BackendConfig::S3 { endpoint, bucket, .. } = &self.backend {
            if endpoint.is_empty() || bucket.is_empty() {
                return Err(ConfigError::Invalid("s3 backend needs endpoint and bucket".into()));
            }
        }
        Ok(())
    }

    /// Directory for local objects (root/objects)
    pub fn objects_path(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Directory for in-flight upload spools (root/spool)
    pub fn spool_path(&self) -> PathBuf {
        self.root.join("spool")
    }

    /// Metadata database file (root/meta.db)
    pub fn db_path(&self) -> PathBuf {
        self.root.join("meta.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("depot");
        Self::with_root(root)
    }
}
