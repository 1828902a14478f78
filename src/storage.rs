//! Object storage access through opendal.

use anyhow::Context;
use bytes::Bytes;
use opendal::{layers::TracingLayer, Operator};

use crate::config::{Backend, StorageConfig};

pub const PARQUET_CONTENT_TYPE: &str = "application/octet-stream";
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Read/write handle on one bucket (or directory).
#[derive(Clone)]
pub struct Storage {
    operator: Operator,
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let operator = match config.backend {
            Backend::S3 => {
                let mut builder = opendal::services::S3::default();
                builder.bucket(&config.bucket);
                if !config.region.is_empty() {
                    builder.region(&config.region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder.endpoint(endpoint);
                }
                Operator::new(builder)?.layer(TracingLayer).finish()
            }
            Backend::Gcs => {
                let mut builder = opendal::services::Gcs::default();
                builder.bucket(&config.bucket);
                Operator::new(builder)?.layer(TracingLayer).finish()
            }
            Backend::Fs => {
                let root = config
                    .root
                    .to_str()
                    .context("storage root is not valid UTF-8")?;
                let mut builder = opendal::services::Fs::default();
                builder.root(root);
                Operator::new(builder)?.layer(TracingLayer).finish()
            }
            Backend::Memory => Operator::new(opendal::services::Memory::default())?
                .layer(TracingLayer)
                .finish(),
        };
        Ok(Storage {
            operator,
            config: config.clone(),
        })
    }

    /// Fresh in-memory store.
    pub fn memory() -> anyhow::Result<Self> {
        Self::new(&StorageConfig::memory())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub async fn read(&self, key: &str) -> opendal::Result<Bytes> {
        Ok(self.operator.read(key).await?.to_bytes())
    }

    /// Put `data` at `key`, replacing whatever was there.
    pub async fn write(&self, key: &str, data: Vec<u8>, content_type: &str) -> opendal::Result<()> {
        // Local backends have no object metadata.
        if self.operator.info().full_capability().write_with_content_type {
            self.operator
                .write_with(key, data)
                .content_type(content_type)
                .await?;
        } else {
            self.operator.write(key, data).await?;
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> opendal::Result<bool> {
        self.operator.is_exist(key).await
    }
}
