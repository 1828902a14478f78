//! Process configuration.
//!
//! Everything here is built once in `main` and handed to the pipeline by
//! reference; nothing reads the environment after start-up.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, ValueEnum};
use serde::Deserialize;

use crate::{
    converter::ConversionSettings,
    error::{Error, Result},
    record::PartitionKey,
};

pub const DEFAULT_DOMAIN: &str = "alibaba-live.servers8.com";
pub const DEFAULT_REGION: &str = "cn-hangzhou";
pub const DEFAULT_LISTING_ENDPOINT: &str = "cdn.aliyuncs.com";
pub const DEFAULT_PARQUET_PREFIX: &str = "alibaba-cdn/alibaba-cdn_parquet";
pub const DEFAULT_RAW_PREFIX: &str = "alibaba-cdn/alibaba-cdn_partitioned";

/// Upstream API credentials, as stored in the secret vault.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    DEFAULT_REGION.to_owned()
}

impl Credentials {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::Config(format!("invalid secret bundle: {e}")))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    /// Enough of the key id to tell keys apart in logs.
    pub fn key_id_hint(&self) -> String {
        let hint: String = self.access_key_id.chars().take(8).collect();
        format!("{hint}...")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.key_id_hint())
            .field("access_key_secret", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Settings for the CDN log-listing API and log downloads.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub list_timeout: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Args)]
pub struct UpstreamArgs {
    /// JSON secret bundle with access_key_id, access_key_secret and region.
    #[arg(long, env = "CDNLOG_SECRET_FILE")]
    pub secret_file: PathBuf,

    /// Host of the log-listing API.
    #[arg(long, default_value = DEFAULT_LISTING_ENDPOINT)]
    pub listing_endpoint: String,

    /// Timeout for one listing call, in seconds.
    #[arg(long, default_value_t = 60)]
    pub list_timeout_secs: u64,

    /// Timeout for downloading one log file, in seconds.
    #[arg(long, default_value_t = 300)]
    pub fetch_timeout_secs: u64,
}

impl UpstreamArgs {
    pub fn load(&self) -> Result<UpstreamConfig> {
        let credentials = Credentials::from_file(&self.secret_file)?;
        tracing::info!(
            "loaded upstream credentials for region {} (key {})",
            credentials.region,
            credentials.key_id_hint()
        );
        Ok(UpstreamConfig {
            endpoint: self.listing_endpoint.clone(),
            credentials,
            list_timeout: Duration::from_secs(self.list_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    S3,
    Gcs,
    Fs,
    Memory,
}

/// Where log objects and columnar output live.
#[derive(Debug, Clone, Args)]
pub struct StorageConfig {
    #[arg(long, value_enum, default_value = "s3")]
    pub backend: Backend,

    /// Bucket name (s3, gcs).
    #[arg(long, env = "CDNLOG_BUCKET", default_value = "")]
    pub bucket: String,

    #[arg(long, env = "AWS_REGION", default_value = "")]
    pub region: String,

    /// Custom S3-compatible endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Root directory (fs).
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn memory() -> Self {
        StorageConfig {
            backend: Backend::Memory,
            bucket: "memory".to_owned(),
            region: String::new(),
            endpoint: None,
            root: PathBuf::from("/"),
        }
    }

    pub fn local(root: PathBuf) -> Self {
        StorageConfig {
            backend: Backend::Fs,
            bucket: String::new(),
            region: String::new(),
            endpoint: None,
            root,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend {
            Backend::S3 | Backend::Gcs if self.bucket.is_empty() => Err(Error::Config(format!(
                "--bucket is required for the {:?} backend",
                self.backend
            ))),
            _ => Ok(()),
        }
    }

    /// URI of `prefix` as the query catalog sees it.
    pub fn location_uri(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        match self.backend {
            Backend::S3 => format!("s3://{}/{prefix}/", self.bucket),
            Backend::Gcs => format!("gs://{}/{prefix}/", self.bucket),
            Backend::Fs => format!("file://{}/{prefix}/", self.root.display()),
            Backend::Memory => format!("memory:///{prefix}/"),
        }
    }
}

/// Compression for Parquet blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCompression {
    Snappy,
    Gzip(u32),
}

impl FromStr for BlockCompression {
    type Err = String;

    /// `snappy`, `gzip` (level 6) or `gzip:<0-9>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snappy" => Ok(BlockCompression::Snappy),
            "gzip" => Ok(BlockCompression::Gzip(6)),
            other => {
                let level = other
                    .strip_prefix("gzip:")
                    .ok_or_else(|| format!("unknown compression {s:?}"))?;
                let level: u32 = level
                    .parse()
                    .map_err(|_| format!("invalid gzip level {level:?}"))?;
                if level > 9 {
                    return Err(format!("gzip level {level} out of range 0-9"));
                }
                Ok(BlockCompression::Gzip(level))
            }
        }
    }
}

/// Overrides for block size and compression.
#[derive(Debug, Clone, Default, Args)]
pub struct ConversionArgs {
    /// Maximum records per Parquet block.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// `snappy`, `gzip` or `gzip:<level>`.
    #[arg(long)]
    pub compression: Option<BlockCompression>,
}

impl ConversionArgs {
    pub fn apply(&self, mut settings: ConversionSettings) -> Result<ConversionSettings> {
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size == 0 {
                return Err(Error::Config("--chunk-size must be positive".to_owned()));
            }
            settings.chunk_size = chunk_size;
        }
        if let Some(compression) = self.compression {
            settings.compression = compression;
        }
        Ok(settings)
    }
}

/// Object naming for output layout.
#[derive(Debug, Clone, Args)]
pub struct LayoutArgs {
    /// Prefix for columnar output.
    #[arg(long, default_value = DEFAULT_PARQUET_PREFIX)]
    pub parquet_prefix: String,

    /// Also archive the compressed source under this prefix (backfill only).
    /// Without a value, the default archive prefix is used.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_RAW_PREFIX)]
    pub raw_prefix: Option<String>,
}

impl Default for LayoutArgs {
    fn default() -> Self {
        LayoutArgs {
            parquet_prefix: DEFAULT_PARQUET_PREFIX.to_owned(),
            raw_prefix: None,
        }
    }
}

impl LayoutArgs {
    /// Archive key for a compressed source file.
    pub fn raw_key(&self, key: &PartitionKey, file_name: &str) -> Option<String> {
        let prefix = self.raw_prefix.as_deref()?;
        Some(format!("{}/{}/{file_name}", prefix.trim_end_matches('/'), key.path_segment()))
    }
}

/// Query catalog used for partition registration.
#[derive(Debug, Clone, Args)]
pub struct CatalogArgs {
    /// SQLite file backing the local catalog. Registration is off without it.
    #[arg(long, env = "CDNLOG_CATALOG")]
    pub catalog: Option<PathBuf>,

    #[arg(long, default_value = "cdn_logs_alibaba_partitioned")]
    pub database: String,

    #[arg(long, default_value = "cdn_logs_parquet")]
    pub table: String,

    /// Interval between catalog status polls, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,
}

impl CatalogArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
