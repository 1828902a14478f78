//! Memory-bounded conversion of parsed records into Parquet blocks.
//!
//! Records are pulled from the source into a buffer of at most `chunk_size`
//! entries; each full (or final) buffer becomes one Parquet object under the
//! partition path. A buffer is encoded and dropped before the next one is
//! filled, so peak residency is one chunk regardless of file size.

use std::sync::Arc;

use arrow_array::{ArrayRef, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, GzipLevel},
    file::properties::WriterProperties,
};
use serde::Serialize;

use crate::{
    config::{BlockCompression, DEFAULT_PARQUET_PREFIX},
    error::{BoxError, Error, Result},
    record::{ParsedRecord, PartitionKey},
    storage::{Storage, PARQUET_CONTENT_TYPE},
};

pub const BACKFILL_CHUNK_SIZE: usize = 100_000;
pub const EVENT_CHUNK_SIZE: usize = 50_000;

/// Suffix style for the blocks of one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkNaming {
    /// `_chunk_0000`, `_chunk_0001`, ... always present.
    Chunk,
    /// `_part_001`, `_part_002`, ... omitted when the file fits in one block.
    Part,
}

/// Where the output partition comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionPolicy {
    Fixed(PartitionKey),
    /// Use the partition derived from the first record's timestamp.
    FirstRecord,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub prefix: String,
    pub chunk_size: usize,
    pub compression: BlockCompression,
    pub naming: ChunkNaming,
}

impl ConversionSettings {
    /// Settings for date-range backfills: large Snappy blocks.
    pub fn backfill(prefix: &str) -> Self {
        ConversionSettings {
            prefix: prefix.to_owned(),
            chunk_size: BACKFILL_CHUNK_SIZE,
            compression: BlockCompression::Snappy,
            naming: ChunkNaming::Part,
        }
    }

    /// Settings for single-object conversion: smaller, tightly compressed blocks.
    pub fn event(prefix: &str) -> Self {
        ConversionSettings {
            prefix: prefix.to_owned(),
            chunk_size: EVENT_CHUNK_SIZE,
            compression: BlockCompression::Gzip(9),
            naming: ChunkNaming::Chunk,
        }
    }

    /// Directory holding every block of one partition.
    pub fn partition_prefix(&self, key: &PartitionKey) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), key.path_segment())
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self::backfill(DEFAULT_PARQUET_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedBlock {
    pub key: String,
    pub records: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    /// `None` when the source produced no records.
    pub partition: Option<PartitionKey>,
    pub blocks: Vec<ConvertedBlock>,
}

impl ConversionReport {
    pub fn keys(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.key.clone()).collect()
    }

    pub fn records(&self) -> usize {
        self.blocks.iter().map(|b| b.records).sum()
    }
}

/// Column names and types, in output order.
pub fn column_types() -> Vec<(&'static str, DataType)> {
    vec![
        ("date_time", DataType::Utf8),
        ("timezone", DataType::Utf8),
        ("client_ip", DataType::Utf8),
        ("proxy_ip", DataType::Utf8),
        ("response_time", DataType::Int64),
        ("referrer", DataType::Utf8),
        ("http_method", DataType::Utf8),
        ("request_url", DataType::Utf8),
        ("http_status", DataType::Int32),
        ("request_bytes", DataType::Int64),
        ("response_bytes", DataType::Int64),
        ("cache_status", DataType::Utf8),
        ("user_agent", DataType::Utf8),
        ("file_type", DataType::Utf8),
        ("access_ip", DataType::Utf8),
        ("year", DataType::Utf8),
        ("month", DataType::Utf8),
        ("day", DataType::Utf8),
    ]
}

pub fn schema() -> SchemaRef {
    let fields: Vec<Field> = column_types()
        .into_iter()
        .map(|(name, data_type)| Field::new(name, data_type, false))
        .collect();
    Arc::new(Schema::new(fields))
}

fn text<F>(records: &[ParsedRecord], field: F) -> ArrayRef
where
    F: Fn(&ParsedRecord) -> &str,
{
    Arc::new(StringArray::from_iter_values(records.iter().map(field)))
}

fn int64<F: Fn(&ParsedRecord) -> i64>(records: &[ParsedRecord], field: F) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(records.iter().map(field)))
}

pub fn to_record_batch(records: &[ParsedRecord]) -> std::result::Result<RecordBatch, arrow_schema::ArrowError> {
    let columns: Vec<ArrayRef> = vec![
        text(records, |r| r.date_time.as_str()),
        text(records, |r| r.timezone.as_str()),
        text(records, |r| r.client_ip.as_str()),
        text(records, |r| r.proxy_ip.as_str()),
        int64(records, |r| r.response_time),
        text(records, |r| r.referrer.as_str()),
        text(records, |r| r.http_method.as_str()),
        text(records, |r| r.request_url.as_str()),
        Arc::new(Int32Array::from_iter_values(records.iter().map(|r| r.http_status))),
        int64(records, |r| r.request_bytes),
        int64(records, |r| r.response_bytes),
        text(records, |r| r.cache_status.as_str()),
        text(records, |r| r.user_agent.as_str()),
        text(records, |r| r.file_type.as_str()),
        text(records, |r| r.access_ip.as_str()),
        text(records, |r| r.year.as_str()),
        text(records, |r| r.month.as_str()),
        text(records, |r| r.day.as_str()),
    ];
    RecordBatch::try_new(schema(), columns)
}

fn writer_properties(compression: BlockCompression) -> std::result::Result<WriterProperties, BoxError> {
    let compression = match compression {
        BlockCompression::Snappy => Compression::SNAPPY,
        BlockCompression::Gzip(level) => Compression::GZIP(GzipLevel::try_new(level)?),
    };
    Ok(WriterProperties::builder()
        .set_compression(compression)
        .set_dictionary_enabled(true)
        .build())
}

/// Encode one chunk as a complete Parquet file.
pub fn encode_block(
    records: &[ParsedRecord],
    compression: BlockCompression,
) -> std::result::Result<Vec<u8>, BoxError> {
    let batch = to_record_batch(records)?;
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(writer_properties(compression)?))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Source file name without its compression suffix.
pub fn source_basename(file_name: &str) -> &str {
    file_name.strip_suffix(".gz").unwrap_or(file_name)
}

/// Deterministic output key for block `index` (0-based) of a source file.
pub fn block_key(
    prefix: &str,
    partition: &PartitionKey,
    basename: &str,
    naming: ChunkNaming,
    index: usize,
    only_block: bool,
) -> String {
    let suffix = match naming {
        ChunkNaming::Chunk => format!("_chunk_{index:04}"),
        ChunkNaming::Part if only_block => String::new(),
        ChunkNaming::Part => format!("_part_{:03}", index + 1),
    };
    format!(
        "{}/{}/{basename}{suffix}.parquet",
        prefix.trim_end_matches('/'),
        partition.path_segment()
    )
}

/// Writes the records of one source file as a sequence of Parquet blocks.
pub struct ChunkedConverter<'a> {
    storage: &'a Storage,
    settings: &'a ConversionSettings,
}

impl<'a> ChunkedConverter<'a> {
    pub fn new(storage: &'a Storage, settings: &'a ConversionSettings) -> Self {
        ChunkedConverter { storage, settings }
    }

    /// Convert `records` from the file named `source_name`.
    ///
    /// A stream error aborts the file with that error; an encode or write
    /// error aborts it with [`Error::ConversionFailed`]. Blocks already
    /// written stay in place.
    #[tracing::instrument(level = "info", skip(self, records))]
    pub async fn convert<I>(
        &self,
        source_name: &str,
        records: I,
        policy: PartitionPolicy,
    ) -> Result<ConversionReport>
    where
        I: IntoIterator<Item = Result<ParsedRecord>>,
    {
        let bound = self.settings.chunk_size.max(1);
        let basename = source_basename(source_name);
        let mut records = records.into_iter().peekable();
        let mut report = ConversionReport::default();

        for index in 0.. {
            let mut buffer = Vec::with_capacity(bound.min(1 << 16));
            while buffer.len() < bound {
                match records.next() {
                    Some(record) => buffer.push(record?),
                    None => break,
                }
            }
            if buffer.is_empty() {
                break;
            }

            let partition = report
                .partition
                .get_or_insert_with(|| match &policy {
                    PartitionPolicy::Fixed(key) => key.clone(),
                    PartitionPolicy::FirstRecord => buffer[0].partition(),
                })
                .clone();
            let count = buffer.len();
            let encoded = encode_block(&buffer, self.settings.compression);
            drop(buffer);

            let last = records.peek().is_none();
            let key = block_key(
                &self.settings.prefix,
                &partition,
                basename,
                self.settings.naming,
                index,
                index == 0 && last,
            );
            let data = encoded.map_err(|e| Error::conversion(&key, index, e))?;
            let bytes = data.len();
            self.storage
                .write(&key, data, PARQUET_CONTENT_TYPE)
                .await
                .map_err(|e| Error::conversion(&key, index, e))?;
            tracing::debug!("wrote block {index} of {source_name}: {count} records, {bytes} bytes to {key}");

            report.blocks.push(ConvertedBlock {
                key,
                records: count,
                bytes,
            });
            if last {
                break;
            }
        }

        tracing::info!(
            "converted {source_name}: {} records in {} blocks",
            report.records(),
            report.blocks.len()
        );
        Ok(report)
    }
}
