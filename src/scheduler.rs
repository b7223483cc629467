use crate::config::Config;
use crate::db::Repository;
use crate::error::Result;
use crate::fetcher::fetch_collections;
use crate::pipeline::{self, RunOptions};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// Runs fetch + ingest cycles on a fixed interval until shutdown.
pub struct Scheduler {
    config: Config,
    repository: Arc<Repository>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        repository: Arc<Repository>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            repository,
            shutdown_rx,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);
        let cycle_interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.scheduler.initial_delay_seconds, self.config.scheduler.interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        let mut ticker = interval(cycle_interval);
        ticker.tick().await; // First tick is immediate

        loop {
            if let Err(e) = self.run_cycle().await {
                error!("Ingestion cycle error: {}", e);
            }

            if *self.shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn run_cycle(&mut self) -> Result<()> {
        info!("Starting fetch + ingest cycle");
        let data_dir = self.config.ingest.data_dir.clone();

        let fetched = tokio::select! {
            stats = fetch_collections(&self.config.source, &data_dir, &self.config.source.collections) => stats?,
            _ = self.shutdown_rx.changed() => {
                warn!("Shutdown received during fetch, skipping ingest");
                return Ok(());
            }
        };
        info!(
            "Fetch phase: {} downloaded, {} unavailable, {} failed",
            fetched.files_downloaded, fetched.files_unavailable, fetched.files_failed
        );

        let stats = pipeline::run(
            self.repository.as_ref(),
            &self.config,
            &data_dir,
            RunOptions::default(),
            Some(self.shutdown_rx.clone()),
        )
        .await?;

        info!(
            "Cycle complete: {} files processed, {} unchanged, {} records inserted, {} updated",
            stats.files_processed, stats.files_skipped, stats.records_inserted, stats.records_updated
        );
        Ok(())
    }
}
