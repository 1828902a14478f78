//! Drives discovery, fetch, parsing, conversion and registration.
//!
//! Files are handled strictly one after another. A failed listing window or
//! file is logged and skipped. Registration failures never abort anything.

use crate::{
    catalog::{QueryCatalog, SqliteCatalog},
    config::LayoutArgs,
    converter::{ChunkedConverter, ConversionReport, ConversionSettings, PartitionPolicy},
    error::{Error, Result},
    fetcher::{LogFileReference, LogSource},
    invocation::{BackfillPlan, ObjectRef, Summary},
    listing::{format_instant, LogListing},
    parser::LineParser,
    record::PartitionKey,
    registrar::PartitionRegistrar,
    storage::{Storage, GZIP_CONTENT_TYPE},
};

/// Result of converting one source file.
#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    /// Key of the archived compressed source, if archiving is on.
    pub archived: Option<String>,
    pub report: ConversionReport,
}

impl FileOutcome {
    /// Count this file into `summary`. Files without output do not count as converted.
    pub fn record_into(self, summary: &mut Summary) {
        if !self.report.blocks.is_empty() {
            summary.converted += 1;
        }
        summary.uploaded_files.extend(self.archived);
        summary.uploaded_files.extend(self.report.keys());
    }
}

pub struct Pipeline<'a, S, C = SqliteCatalog> {
    storage: &'a Storage,
    source: &'a S,
    layout: LayoutArgs,
    settings: ConversionSettings,
    registrar: Option<&'a PartitionRegistrar<C>>,
}

impl<'a, S: LogSource> Pipeline<'a, S> {
    /// Pipeline writing to `storage`, without partition registration.
    pub fn new(storage: &'a Storage, source: &'a S, layout: &LayoutArgs, settings: ConversionSettings) -> Self {
        Pipeline {
            storage,
            source,
            layout: layout.clone(),
            settings,
            registrar: None,
        }
    }
}

impl<'a, S: LogSource, C: QueryCatalog> Pipeline<'a, S, C> {
    pub fn with_registrar<D: QueryCatalog>(self, registrar: &'a PartitionRegistrar<D>) -> Pipeline<'a, S, D> {
        Pipeline {
            storage: self.storage,
            source: self.source,
            layout: self.layout,
            settings: self.settings,
            registrar: Some(registrar),
        }
    }

    async fn register(&self, key: &PartitionKey) {
        let Some(registrar) = self.registrar else {
            return;
        };
        let location = self
            .storage
            .config()
            .location_uri(&self.settings.partition_prefix(key));
        if let Err(e) = registrar.register_partition(key, &location).await {
            tracing::warn!("{e}");
        }
    }

    /// Fetch, parse and convert one file, then register its partition.
    ///
    /// With `partition` unset, the partition comes from the first record.
    /// With `archive` set and a raw prefix configured, the compressed file is
    /// also stored under the raw prefix.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn convert_file(
        &self,
        reference: &LogFileReference,
        partition: Option<PartitionKey>,
        archive: bool,
    ) -> Result<FileOutcome> {
        let file_name = reference.file_name();
        if file_name.is_empty() {
            return Err(Error::fetch(&reference.locator, "locator names no file"));
        }
        let mut archived = None;
        let lines = if archive && self.layout.raw_prefix.is_some() {
            let compressed = self.source.fetch(reference).await?;
            let raw_partition = partition.clone().unwrap_or_else(PartitionKey::today);
            if let Some(raw_key) = self.layout.raw_key(&raw_partition, file_name) {
                self.storage
                    .write(&raw_key, compressed.data.to_vec(), GZIP_CONTENT_TYPE)
                    .await
                    .map_err(|e| Error::conversion(&raw_key, 0, e))?;
                tracing::info!("archived {file_name} to {raw_key}");
                archived = Some(raw_key);
            }
            compressed.lines()
        } else {
            self.source.fetch_and_decompress(reference).await?
        };

        let mut parser = LineParser::new();
        let records = lines.filter_map(|line| match line {
            Ok(line) => parser.parse(&line).map(Ok),
            Err(e) => Some(Err(e)),
        });
        let policy = partition.map_or(PartitionPolicy::FirstRecord, PartitionPolicy::Fixed);
        let report = ChunkedConverter::new(self.storage, &self.settings)
            .convert(file_name, records, policy)
            .await?;

        let stats = parser.stats();
        tracing::info!(
            "parsed {file_name}: {} lines, {} canonical, {} fallback, {} skipped, {} blank",
            stats.lines(),
            stats.canonical,
            stats.fallback,
            stats.skipped(),
            stats.empty
        );
        if stats.parsed() == 0 && stats.lines() > 0 {
            tracing::warn!("no usable lines in {file_name}");
        }

        if let Some(key) = &report.partition {
            self.register(key).await;
        }
        Ok(FileOutcome { archived, report })
    }

    /// Convert every file listed for `plan`, window by window.
    pub async fn run_backfill<L: LogListing>(&self, listing: &L, plan: &BackfillPlan) -> Summary {
        let mut summary = Summary::default();
        for day in plan.days() {
            tracing::info!("processing date {day} for {}", plan.domain);
            for (start, end) in BackfillPlan::windows(day) {
                let window = format!("{}..{}", format_instant(start), format_instant(end));
                let references = match listing.list_log_files(&plan.domain, start, end).await {
                    Ok(references) => references,
                    Err(e) => {
                        tracing::warn!("skipping window {window}: {e}");
                        continue;
                    }
                };
                tracing::info!("found {} log files in window {window}", references.len());
                summary.total_found += references.len();

                for (i, reference) in references.iter().enumerate() {
                    let file_name = reference.file_name();
                    tracing::info!("processing file {}/{}: {file_name}", i + 1, references.len());
                    let partition = PartitionKey::from_file_name(file_name);
                    let result = self.convert_file(reference, partition, true).await;
                    tracing::info!(
                        "completed {file_name}, result: {}",
                        if result.is_ok() { "ok" } else { "error" }
                    );
                    match result {
                        Ok(outcome) => outcome.record_into(&mut summary),
                        Err(e) => tracing::warn!("skipping {file_name}: {e}"),
                    }
                }
            }
        }
        tracing::info!("{}", summary.message());
        summary
    }

    /// Convert the log objects named by a storage event.
    ///
    /// Objects in other buckets, without a `.gz` suffix, or without a
    /// `year=/month=/day=` segment are skipped. So are files that fail to
    /// fetch or convert.
    pub async fn run_event(&self, objects: &[ObjectRef]) -> Summary {
        let mut summary = Summary::default();
        for object in objects {
            summary.total_found += 1;
            if !object.key.ends_with(".gz") {
                tracing::info!("ignoring {}: not a compressed log", object.key);
                continue;
            }
            if object.bucket != self.storage.bucket() {
                tracing::warn!(
                    "ignoring {}/{}: expected bucket {}",
                    object.bucket,
                    object.key,
                    self.storage.bucket()
                );
                continue;
            }
            let Some(partition) = PartitionKey::from_object_key(&object.key) else {
                tracing::warn!("could not extract partition from {}", object.key);
                continue;
            };

            tracing::info!("processing {}/{}", object.bucket, object.key);
            let reference = LogFileReference::new(&object.key, &object.bucket);
            match self.convert_file(&reference, Some(partition), false).await {
                Ok(outcome) => outcome.record_into(&mut summary),
                Err(e) => tracing::warn!("skipping {}: {e}", object.key),
            }
        }
        tracing::info!("{}", summary.message());
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::{DateTime, Timelike, Utc};

    use super::*;
    use crate::{
        catalog::SqliteCatalog,
        config::DEFAULT_RAW_PREFIX,
        converter::tests::row_count,
        fetcher::{tests::gzip, StorageFetcher},
    };

    fn log_line(i: usize) -> String {
        format!(
            r#"[13/Oct/2025:00:{:02}:{:02} +0800] 203.0.113.{} - 12 "-" "GET https://cdn.example/live/seg_{i}.ts" 200 100 2048 HIT "curl/8.0" "video/mp2t" 198.51.100.20"#,
            i / 60 % 60,
            i % 60,
            i % 250
        )
    }

    fn log_file(n: usize) -> Vec<u8> {
        let text: Vec<String> = (0..n).map(log_line).collect();
        gzip(&text.join("\n"))
    }

    /// Lists `files` for the midnight window, fails the 02:00 window.
    struct FakeListing {
        files: Vec<LogFileReference>,
        calls: RefCell<Vec<DateTime<Utc>>>,
    }

    impl LogListing for FakeListing {
        async fn list_log_files(
            &self,
            domain: &str,
            start_time: DateTime<Utc>,
            _end_time: DateTime<Utc>,
        ) -> Result<Vec<LogFileReference>> {
            self.calls.borrow_mut().push(start_time);
            match start_time.hour() {
                0 => Ok(self.files.clone()),
                2 => Err(Error::upstream(domain, "throttled")),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn settings(chunk_size: usize) -> ConversionSettings {
        let mut settings = ConversionSettings::backfill("out");
        settings.chunk_size = chunk_size;
        settings
    }

    #[tokio::test]
    async fn backfill_isolates_window_and_file_failures() {
        let storage = Storage::memory().unwrap();
        storage
            .write("in/live_2025_10_13_000000_020000.gz", log_file(5), GZIP_CONTENT_TYPE)
            .await
            .unwrap();
        storage
            .write("in/live_2025_10_13_010000_020000.gz", b"not gzip".to_vec(), GZIP_CONTENT_TYPE)
            .await
            .unwrap();
        let source = StorageFetcher::new(storage.clone());
        let listing = FakeListing {
            files: vec![
                LogFileReference::new("in/live_2025_10_13_010000_020000.gz", "d"),
                LogFileReference::new("in/live_2025_10_13_000000_020000.gz", "d"),
                LogFileReference::new("in/missing.gz", "d"),
            ],
            calls: RefCell::new(Vec::new()),
        };
        let layout = LayoutArgs {
            parquet_prefix: "out".to_owned(),
            raw_prefix: Some(DEFAULT_RAW_PREFIX.to_owned()),
        };
        let catalog = PartitionRegistrar::new(
            SqliteCatalog::in_memory().unwrap(),
            "db",
            "logs",
            std::time::Duration::from_millis(1),
        );
        let pipeline = Pipeline::new(&storage, &source, &layout, settings(2)).with_registrar(&catalog);
        let plan = BackfillPlan {
            domain: "d".to_owned(),
            start: chrono::NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
            end: chrono::NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
        };

        let summary = pipeline.run_backfill(&listing, &plan).await;
        assert_eq!(listing.calls.borrow().len(), 12);
        assert_eq!(summary.total_found, 3);
        assert_eq!(summary.converted, 1);
        assert_eq!(
            summary.uploaded_files,
            vec![
                "alibaba-cdn/alibaba-cdn_partitioned/year=2025/month=10/day=13/live_2025_10_13_000000_020000.gz",
                "out/year=2025/month=10/day=13/live_2025_10_13_000000_020000_part_001.parquet",
                "out/year=2025/month=10/day=13/live_2025_10_13_000000_020000_part_002.parquet",
                "out/year=2025/month=10/day=13/live_2025_10_13_000000_020000_part_003.parquet",
            ]
        );
        // The corrupt file was archived before decompression failed.
        assert!(storage
            .exists("alibaba-cdn/alibaba-cdn_partitioned/year=2025/month=10/day=13/live_2025_10_13_010000_020000.gz")
            .await
            .unwrap());
        assert_eq!(
            catalog.catalog().partitions("db", "logs").unwrap(),
            vec![(
                PartitionKey::new("2025", "10", "13"),
                "memory:///out/year=2025/month=10/day=13/".to_owned()
            )]
        );
    }

    #[tokio::test]
    async fn event_skips_unusable_objects() {
        let storage = Storage::memory().unwrap();
        let key = "raw/year=2025/month=10/day=14/live_2025_10_13_220000_235959.gz";
        storage.write(key, log_file(3), GZIP_CONTENT_TYPE).await.unwrap();
        storage
            .write("raw/undated/live.gz", log_file(3), GZIP_CONTENT_TYPE)
            .await
            .unwrap();
        let source = StorageFetcher::new(storage.clone());
        let layout = LayoutArgs::default();
        let pipeline = Pipeline::new(&storage, &source, &layout, ConversionSettings::event("out"));

        let object = |bucket: &str, key: &str| ObjectRef {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        };
        let summary = pipeline
            .run_event(&[
                object("memory", "raw/year=2025/month=10/day=14/notes.txt"),
                object("elsewhere", key),
                object("memory", "raw/undated/live.gz"),
                object("memory", key),
            ])
            .await;

        assert_eq!(summary.total_found, 4);
        assert_eq!(summary.converted, 1);
        // The object key decides the partition, not the record timestamps.
        let output = "out/year=2025/month=10/day=14/live_2025_10_13_220000_235959_chunk_0000.parquet";
        assert_eq!(summary.uploaded_files, vec![output.to_owned()]);
        assert_eq!(row_count(&storage, output).await, 3);
    }

    #[tokio::test]
    async fn event_continues_past_failed_files() {
        let storage = Storage::memory().unwrap();
        let bad = "raw/year=2025/month=10/day=13/bad.gz";
        let good = "raw/year=2025/month=10/day=13/good.gz";
        storage
            .write(bad, b"not gzip".to_vec(), GZIP_CONTENT_TYPE)
            .await
            .unwrap();
        storage.write(good, log_file(4), GZIP_CONTENT_TYPE).await.unwrap();
        let source = StorageFetcher::new(storage.clone());
        let layout = LayoutArgs::default();
        let pipeline = Pipeline::new(&storage, &source, &layout, ConversionSettings::event("out"));

        let object = |key: &str| ObjectRef {
            bucket: "memory".to_owned(),
            key: key.to_owned(),
        };
        let summary = pipeline
            .run_event(&[
                object(bad),
                object("raw/year=2025/month=10/day=13/gone.gz"),
                object(good),
            ])
            .await;

        assert_eq!(summary.total_found, 3);
        assert_eq!(summary.converted, 1);
        let output = "out/year=2025/month=10/day=13/good_chunk_0000.parquet";
        assert_eq!(summary.uploaded_files, vec![output.to_owned()]);
        assert_eq!(row_count(&storage, output).await, 4);
    }

    #[tokio::test]
    async fn locator_without_file_name_fails_fetch() {
        let storage = Storage::memory().unwrap();
        let source = StorageFetcher::new(storage.clone());
        let layout = LayoutArgs::default();
        let pipeline = Pipeline::new(&storage, &source, &layout, settings(10));
        let err = pipeline
            .convert_file(&LogFileReference::new("cdn.example/logs/2025_10_13_/", "d"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch_failed");
    }

    #[tokio::test]
    async fn empty_file_is_not_converted() {
        let storage = Storage::memory().unwrap();
        storage
            .write("in/a_2025_10_13_000000_020000.gz", gzip("\n\n"), GZIP_CONTENT_TYPE)
            .await
            .unwrap();
        let source = StorageFetcher::new(storage.clone());
        let layout = LayoutArgs::default();
        let pipeline = Pipeline::new(&storage, &source, &layout, settings(10));
        let outcome = pipeline
            .convert_file(
                &LogFileReference::new("in/a_2025_10_13_000000_020000.gz", "d"),
                None,
                true,
            )
            .await
            .unwrap();
        assert!(outcome.archived.is_none());
        assert!(outcome.report.blocks.is_empty());
        let mut summary = Summary::default();
        outcome.record_into(&mut summary);
        assert_eq!(summary, Summary::default());
    }
}
