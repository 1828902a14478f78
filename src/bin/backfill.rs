use std::process::ExitCode;

use anyhow::Context;
use cdnlog_cruncher::{
    catalog::SqliteCatalog,
    config::{CatalogArgs, ConversionArgs, LayoutArgs, StorageConfig, UpstreamArgs},
    converter::ConversionSettings,
    fetcher::HttpFetcher,
    invocation::{BackfillRequest, Response, Summary},
    listing::CdnLogClient,
    registrar::PartitionRegistrar,
    Pipeline, Storage,
};
use clap::Parser;

/// Download CDN logs for a date range and convert them to partitioned Parquet.
#[derive(Parser)]
#[command(name = "backfill", version)]
struct Cli {
    /// Invocation JSON `{domain?, scheduled?, start_date?, end_date?}`.
    /// Overrides the individual flags below.
    #[arg(long)]
    event: Option<String>,

    #[arg(long)]
    domain: Option<String>,

    /// Process yesterday (UTC).
    #[arg(long)]
    scheduled: bool,

    /// First day, YYYY-MM-DD.
    #[arg(long)]
    start_date: Option<String>,

    /// Last day (inclusive), YYYY-MM-DD.
    #[arg(long)]
    end_date: Option<String>,

    #[command(flatten)]
    upstream: UpstreamArgs,

    #[command(flatten)]
    storage: StorageConfig,

    #[command(flatten)]
    layout: LayoutArgs,

    #[command(flatten)]
    catalog: CatalogArgs,

    #[command(flatten)]
    conversion: ConversionArgs,
}

impl Cli {
    fn request(&self) -> anyhow::Result<BackfillRequest> {
        match &self.event {
            Some(event) => serde_json::from_str(event).context("invalid --event"),
            None => Ok(BackfillRequest {
                domain: self.domain.clone(),
                scheduled: self.scheduled,
                start_date: self.start_date.clone(),
                end_date: self.end_date.clone(),
            }),
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Summary> {
    let plan = cli.request()?.resolve(chrono::Utc::now().date_naive())?;
    tracing::info!(
        "backfilling {} from {} to {}",
        plan.domain,
        plan.start,
        plan.end
    );

    cli.storage.validate()?;
    let upstream = cli.upstream.load()?;
    let storage = Storage::new(&cli.storage).context("could not open storage")?;
    let listing = CdnLogClient::new(&upstream)?;
    let source = HttpFetcher::new(upstream.fetch_timeout)?;
    let settings = cli
        .conversion
        .apply(ConversionSettings::backfill(&cli.layout.parquet_prefix))?;
    let pipeline = Pipeline::new(&storage, &source, &cli.layout, settings);

    let summary = match &cli.catalog.catalog {
        Some(path) => {
            let registrar = PartitionRegistrar::from_args(SqliteCatalog::open(path)?, &cli.catalog);
            pipeline
                .with_registrar(&registrar)
                .run_backfill(&listing, &plan)
                .await
        }
        None => pipeline.run_backfill(&listing, &plan).await,
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
        tracing::error!("backfill failed: {e:#}");
    }
    Response::from_result(&result).emit()
}
