use std::process::ExitCode;

use anyhow::Context;
use cdnlog_cruncher::{
    catalog::SqliteCatalog,
    config::{CatalogArgs, ConversionArgs, LayoutArgs, StorageConfig},
    converter::ConversionSettings,
    fetcher::StorageFetcher,
    invocation::{Response, StorageEvent, Summary},
    registrar::PartitionRegistrar,
    Pipeline, Storage,
};
use clap::Parser;

/// Convert log objects named by a storage notification to Parquet, in place.
#[derive(Parser)]
#[command(name = "convert_event", version)]
struct Cli {
    /// Event JSON. Read from stdin when absent.
    #[arg(long)]
    event: Option<String>,

    #[command(flatten)]
    storage: StorageConfig,

    #[command(flatten)]
    layout: LayoutArgs,

    #[command(flatten)]
    catalog: CatalogArgs,

    #[command(flatten)]
    conversion: ConversionArgs,
}

async fn run(cli: Cli) -> anyhow::Result<Summary> {
    let event = match &cli.event {
        Some(event) => event.clone(),
        None => std::io::read_to_string(std::io::stdin()).context("could not read event from stdin")?,
    };
    let objects = StorageEvent::from_json(&event)?.objects();
    tracing::info!("event names {} objects", objects.len());

    cli.storage.validate()?;
    let storage = Storage::new(&cli.storage).context("could not open storage")?;
    let source = StorageFetcher::new(storage.clone());
    let settings = cli
        .conversion
        .apply(ConversionSettings::event(&cli.layout.parquet_prefix))?;
    let pipeline = Pipeline::new(&storage, &source, &cli.layout, settings);

    let summary = match &cli.catalog.catalog {
        Some(path) => {
            let registrar = PartitionRegistrar::from_args(SqliteCatalog::open(path)?, &cli.catalog);
            pipeline.with_registrar(&registrar).run_event(&objects).await
        }
        None => pipeline.run_event(&objects).await,
    };
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
