use bom_ingest::config::Config;
use bom_ingest::db::{MemoryStore, Repository, Store};
use bom_ingest::encoding::decode_with_fallback;
use bom_ingest::fetcher::{fetch_collections, RetrievalStats};
use bom_ingest::gazetteer::{import_stations, parse_station_list};
use bom_ingest::geocoder::{geocode_missing, BatchOptions, NominatimGeocoder, StationLocator};
use bom_ingest::pipeline::{self, RunOptions, RunStats};
use bom_ingest::reconcile::{prune_stations, sync_stations};
use bom_ingest::scheduler::Scheduler;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bom-ingest")]
#[command(about = "BOM daily climate data ingestion and station reconciliation")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations and exit
    Migrate,
    /// Download the configured window of monthly files
    Fetch {
        /// Restrict to these collections (defaults to all configured)
        #[arg(long = "collection")]
        collections: Vec<String>,
    },
    /// Ingest downloaded files into the database
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Only process the first N files
        #[arg(long)]
        limit: Option<usize>,
        /// Run against an in-memory copy of the registry; nothing is written
        #[arg(long)]
        dry_run: bool,
        /// Reprocess files already ingested with identical content
        #[arg(long)]
        force: bool,
    },
    /// Look up coordinates for stations that have none
    Geocode {
        #[arg(long, default_value_t = 25)]
        batch_size: usize,
        #[arg(long)]
        max_stations: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        /// Delay between lookups (defaults to the configured minimum interval)
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long, default_value_t = 30)]
        batch_delay_secs: u64,
    },
    /// Add stations referenced by observations but missing from the registry
    SyncStations,
    /// Delete stations that have no observations
    PruneStations,
    /// Import the bureau's fixed-width station list
    ImportStations { file: PathBuf },
    /// Fetch and ingest on the configured interval until interrupted
    Watch,
    /// Print registry and ingestion log counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bom_ingest=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            cli.config.display()
        )
    })?;
    info!("Configuration loaded from {}", cli.config.display());

    let repository = connect(&config).await?;
    repository.run_migrations().await?;

    let result = execute(cli.command, config, &repository).await;
    repository.close().await;
    result
}

async fn execute(command: Commands, config: Config, repository: &Repository) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => {
            println!("migrations applied");
        }
        Commands::Fetch { collections } => {
            let collections = if collections.is_empty() {
                config.source.collections.clone()
            } else {
                collections
            };
            let stats =
                fetch_collections(&config.source, &config.ingest.data_dir, &collections).await?;
            print_retrieval(&stats);
        }
        Commands::Run {
            data_dir,
            limit,
            dry_run,
            force,
        } => {
            let data_dir = data_dir.unwrap_or_else(|| config.ingest.data_dir.clone());
            let options = RunOptions {
                limit,
                dry_run,
                force,
            };

            let stats = if dry_run {
                let snapshot = MemoryStore::with_stations(repository.load_stations().await?);
                pipeline::run(&snapshot, &config, &data_dir, options, None).await?
            } else {
                pipeline::run(repository, &config, &data_dir, options, None).await?
            };
            print_run(&stats, dry_run);
        }
        Commands::Geocode {
            batch_size,
            max_stations,
            dry_run,
            delay_ms,
            batch_delay_secs,
        } => {
            let geocoding = &config.resolver.geocoding;
            let locator = StationLocator::new(
                NominatimGeocoder::new(geocoding)?,
                geocoding.bounds,
                geocoding.country.clone(),
            );
            let options = BatchOptions {
                batch_size,
                max_stations,
                dry_run,
                per_request_delay: Duration::from_millis(
                    delay_ms.unwrap_or(geocoding.min_interval_ms),
                ),
                per_batch_delay: Duration::from_secs(batch_delay_secs),
            };

            let stats = geocode_missing(repository, &locator, &options).await?;
            println!(
                "geocode{}: candidates={} attempted={} located={} not_found={} \
                 rejected_out_of_bounds={} lookup_errors={} write_errors={} estimated_pause={}s",
                if dry_run { " (dry run)" } else { "" },
                stats.candidates,
                stats.attempted,
                stats.located,
                stats.not_found,
                stats.rejected_out_of_bounds,
                stats.lookup_errors,
                stats.write_errors,
                stats.estimated.as_secs()
            );
        }
        Commands::SyncStations => {
            let report = sync_stations(repository, &config.ingest.data_source).await?;
            println!(
                "sync complete: observed={} added={} stations={} with_coordinates={}",
                report.observed_stations,
                report.inserted,
                report.counts.stations,
                report.counts.stations_with_coordinates
            );
        }
        Commands::PruneStations => {
            let report = prune_stations(repository).await?;
            println!(
                "prune complete: deleted={} stations={} with_coordinates={}",
                report.deleted, report.counts.stations, report.counts.stations_with_coordinates
            );
        }
        Commands::ImportStations { file } => {
            let bytes = tokio::fs::read(&file).await.map_err(|e| {
                anyhow::anyhow!("Failed to read station list {}: {}", file.display(), e)
            })?;
            let decoded = decode_with_fallback(
                &bytes,
                &config.normalizer.encodings,
                config.normalizer.probe_bytes,
            );
            let list = parse_station_list(&decoded.text)?;
            let stats = import_stations(repository, list, &config.ingest.data_source).await?;
            println!(
                "import complete: entries={} created={} updated={} unparsed_lines={}",
                stats.entries, stats.created, stats.updated, stats.unparsed_lines
            );
        }
        Commands::Watch => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(true);
            });

            let mut scheduler = Scheduler::new(config, Arc::new(repository.clone()), shutdown_rx);
            if let Err(e) = scheduler.run().await {
                error!("Scheduler error: {}", e);
            }
            info!("Watch mode shutting down");
        }
        Commands::Status => {
            let counts = repository.registry_counts().await?;
            println!(
                "stations={} with_coordinates={} observations={} observed_stations={}",
                counts.stations,
                counts.stations_with_coordinates,
                counts.observations,
                counts.distinct_observed_stations
            );
            for (status, count) in repository.file_status_counts().await? {
                println!("files {}={}", status, count);
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Repository> {
    let connection_string = config.database.connection_string();
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&connection_string)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database: {}\n\n\
                 Host: {}:{}\n\
                 Database: {}\n\
                 User: {}\n\n\
                 Common fixes:\n\
                 1. Ensure PostgreSQL is running\n\
                 2. Check username/password are correct (DB_USER, DB_PASSWORD)\n\
                 3. Verify database exists: createdb {}\n\
                 4. Check host and port (DB_HOST, DB_PORT)",
                e,
                config.database.host,
                config.database.port,
                config.database.name,
                config.database.user,
                config.database.name
            )
        })?;

    info!(
        "Connected to database: {}@{}:{}/{}",
        config.database.user, config.database.host, config.database.port, config.database.name
    );

    Ok(Repository::new(pool))
}

fn print_retrieval(stats: &RetrievalStats) {
    println!(
        "fetch complete: collections={} (failed {}) locations={} succeeded={} failed={} \
         filtered={} downloaded={} existing={} unavailable={} failed_files={}",
        stats.collections,
        stats.collections_failed,
        stats.locations,
        stats.locations_succeeded,
        stats.locations_failed,
        stats.locations_filtered,
        stats.files_downloaded,
        stats.files_existing,
        stats.files_unavailable,
        stats.files_failed
    );
}

fn print_run(stats: &RunStats, dry_run: bool) {
    println!(
        "run complete{}: files found={} processed={} succeeded={} partial={} failed={} unchanged={}",
        if dry_run { " (dry run, nothing written)" } else { "" },
        stats.files_found,
        stats.files_processed,
        stats.files_succeeded,
        stats.files_partial,
        stats.files_failed,
        stats.files_skipped
    );
    println!(
        "records processed={} inserted={} updated={} skipped={} stations_created={}",
        stats.records_processed,
        stats.records_inserted,
        stats.records_updated,
        stats.records_skipped,
        stats.stations_created
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
