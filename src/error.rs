//! Failure taxonomy for the ingestion pipeline.
//!
//! Each variant names the smallest unit it aborts: a listing window, a file,
//! the remaining blocks of a file, or nothing at all (registration).
//! Lines that cannot be parsed are not errors; see [`crate::parser::ParseOutcome`].

use thiserror::Error;

use crate::record::PartitionKey;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The log-listing API failed, timed out, or answered with garbage.
    /// Aborts one discovery window.
    #[error("log listing for {domain} unavailable: {source}")]
    UpstreamUnavailable {
        domain: String,
        #[source]
        source: BoxError,
    },

    /// One file could not be downloaded or decompressed.
    #[error("fetching {locator} failed: {source}")]
    FetchFailed {
        locator: String,
        #[source]
        source: BoxError,
    },

    /// Encoding or writing block `block` of `object` failed.
    /// Later blocks of the same file are not attempted.
    #[error("converting {object} failed at block {block}: {source}")]
    ConversionFailed {
        object: String,
        block: usize,
        #[source]
        source: BoxError,
    },

    /// The catalog rejected or failed a partition registration.
    #[error("registering partition {partition} failed: {source}")]
    RegistrationFailed {
        partition: PartitionKey,
        #[source]
        source: BoxError,
    },

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn upstream(domain: &str, source: impl Into<BoxError>) -> Self {
        Error::UpstreamUnavailable {
            domain: domain.to_owned(),
            source: source.into(),
        }
    }

    pub(crate) fn fetch(locator: &str, source: impl Into<BoxError>) -> Self {
        Error::FetchFailed {
            locator: locator.to_owned(),
            source: source.into(),
        }
    }

    pub(crate) fn conversion(object: &str, block: usize, source: impl Into<BoxError>) -> Self {
        Error::ConversionFailed {
            object: object.to_owned(),
            block,
            source: source.into(),
        }
    }

    pub(crate) fn registration(partition: &PartitionKey, source: impl Into<BoxError>) -> Self {
        Error::RegistrationFailed {
            partition: partition.clone(),
            source: source.into(),
        }
    }

    /// Short label for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::FetchFailed { .. } => "fetch_failed",
            Error::ConversionFailed { .. } => "conversion_failed",
            Error::RegistrationFailed { .. } => "registration_failed",
            Error::InvalidInvocation(_) => "invalid_invocation",
            Error::Config(_) => "config",
        }
    }
}
