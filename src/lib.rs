//! CDN access-log ingestion: list, fetch, parse, and convert to partitioned Parquet.

pub mod acs;
pub mod catalog;
pub mod config;
pub mod converter;
pub mod error;
pub mod fetcher;
pub mod invocation;
pub mod listing;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod registrar;
pub mod storage;

pub use error::{Error, Result};
pub use parser::parse_line;
pub use pipeline::Pipeline;
pub use record::{derive_partition, ParsedRecord, PartitionKey};
pub use storage::Storage;
