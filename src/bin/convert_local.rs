use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use cdnlog_cruncher::{
    catalog::SqliteCatalog,
    config::{CatalogArgs, ConversionArgs, LayoutArgs, StorageConfig},
    converter::ConversionSettings,
    fetcher::{LogFileReference, StorageFetcher},
    invocation::{Response, Summary},
    registrar::PartitionRegistrar,
    Pipeline, PartitionKey, Storage,
};
use clap::Parser;

/// Convert one local compressed log file into a local Parquet tree.
#[derive(Parser)]
#[command(name = "convert_local", version)]
struct Cli {
    /// Compressed log file.
    input: PathBuf,

    /// Directory receiving the Parquet output.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    #[command(flatten)]
    layout: LayoutArgs,

    #[command(flatten)]
    catalog: CatalogArgs,

    #[command(flatten)]
    conversion: ConversionArgs,
}

async fn run(cli: Cli) -> anyhow::Result<Summary> {
    let file_name = cli
        .input
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", cli.input.display()))?
        .to_owned();
    let input_dir = match cli.input.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("could not create {}", cli.output_dir.display()))?;

    let input = Storage::new(&StorageConfig::local(input_dir)).context("could not open input directory")?;
    let output = Storage::new(&StorageConfig::local(cli.output_dir.clone()))
        .context("could not open output directory")?;
    let source = StorageFetcher::new(input);
    let settings = cli
        .conversion
        .apply(ConversionSettings::backfill(&cli.layout.parquet_prefix))?;
    let pipeline = Pipeline::new(&output, &source, &cli.layout, settings);

    let input_path = cli.input.to_string_lossy();
    let partition = PartitionKey::from_object_key(&input_path).or_else(|| PartitionKey::from_file_name(&file_name));
    let reference = LogFileReference::new(file_name.as_str(), "local");
    let outcome = match &cli.catalog.catalog {
        Some(path) => {
            let registrar = PartitionRegistrar::from_args(SqliteCatalog::open(path)?, &cli.catalog);
            pipeline
                .with_registrar(&registrar)
                .convert_file(&reference, partition, false)
                .await?
        }
        None => pipeline.convert_file(&reference, partition, false).await?,
    };

    let mut summary = Summary {
        total_found: 1,
        ..Default::default()
    };
    outcome.record_into(&mut summary);
    Ok(summary)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start runtime")
        .and_then(|rt| rt.block_on(run(cli)));
    if let Err(e) = &result {
        tracing::error!("conversion failed: {e:#}");
    }
    Response::from_result(&result).emit()
}
