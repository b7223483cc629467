use crate::config::{Config, IngestConfig};
use crate::db::models::{
    FileLogOutcome, FileStatus, NewFileLog, NewObservation, Station, UpsertResult,
};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::geocoder::{Geocoder, NominatimGeocoder, StationLocator};
use crate::normalizer::{NormalizedFile, Normalizer, SourceFile};
use crate::resolver::{LabelHints, StationResolver};
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub limit: Option<usize>,
    pub dry_run: bool,
    /// Reprocess files even if an identical copy was already ingested.
    pub force: bool,
}

/// Per-file progress, logged as a file moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Pending,
    Parsing,
    Resolving,
    Writing,
    Finished(FileStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub filename: String,
    pub station_label: Option<String>,
    pub status: FileStatus,
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub stations_created: usize,
    pub error: Option<String>,
}

impl FileOutcome {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            station_label: None,
            status: FileStatus::Pending,
            processed: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            stations_created: 0,
            error: None,
        }
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.status = FileStatus::Failed;
        self.error = Some(message.into());
        self
    }

    fn settle(&mut self) {
        let written = self.inserted + self.updated;
        self.status = match (&self.error, written, self.skipped) {
            (Some(_), 0, _) => FileStatus::Failed,
            (Some(_), _, _) => FileStatus::Partial,
            (None, 0, _) => FileStatus::Failed,
            (None, _, 0) => FileStatus::Success,
            (None, _, _) => FileStatus::Partial,
        };
    }

    fn to_log(&self) -> FileLogOutcome {
        FileLogOutcome {
            station_label: self.station_label.clone(),
            status: self.status,
            finished_at: Utc::now(),
            records_processed: clamp_i32(self.processed),
            records_inserted: clamp_i32(self.inserted),
            records_updated: clamp_i32(self.updated),
            records_skipped: clamp_i32(self.skipped),
            error_message: self.error.clone(),
        }
    }
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Already ingested with identical content.
    Unchanged,
    Finished(FileOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub files_found: usize,
    pub files_processed: usize,
    pub files_succeeded: usize,
    pub files_partial: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub records_processed: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_skipped: usize,
    pub stations_created: usize,
    pub interrupted: bool,
}

impl RunStats {
    fn record(&mut self, outcome: &FileOutcome) {
        self.files_processed += 1;
        match outcome.status {
            FileStatus::Success => self.files_succeeded += 1,
            FileStatus::Partial => self.files_partial += 1,
            FileStatus::Failed | FileStatus::Pending => self.files_failed += 1,
        }
        self.records_processed += outcome.processed;
        self.records_inserted += outcome.inserted;
        self.records_updated += outcome.updated;
        self.records_skipped += outcome.skipped;
        self.stations_created += outcome.stations_created;
    }
}

/// Every `*.csv` under `data_dir`, sorted, optionally truncated.
pub fn discover_files(data_dir: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let pattern = data_dir.join("**").join("*.csv");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| AppError::Config(format!("Non UTF-8 data directory: {}", data_dir.display())))?;

    let entries = glob::glob(pattern)
        .map_err(|e| AppError::Config(format!("Invalid data directory pattern: {}", e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path: {}", e),
        }
    }

    files.sort();
    if let Some(limit) = limit {
        files.truncate(limit);
    }
    Ok(files)
}

pub fn file_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Ingest every file under `data_dir` into `store` with a resolver and
/// normalizer built from `config`. External geocoding is only wired in
/// when enabled and not a dry run.
pub async fn run<S: Store>(
    store: &S,
    config: &Config,
    data_dir: &Path,
    options: RunOptions,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<RunStats> {
    let geocoding = &config.resolver.geocoding;
    let locator = if geocoding.enabled && !options.dry_run {
        Some(StationLocator::new(
            NominatimGeocoder::new(geocoding)?,
            geocoding.bounds,
            geocoding.country.clone(),
        ))
    } else {
        None
    };

    let resolver = StationResolver::load(
        store,
        config.resolver.fuzzy_threshold,
        locator,
        config.ingest.data_source.clone(),
    )
    .await?;
    let normalizer = Normalizer::new(config.normalizer.clone())?;

    let mut pipeline = Pipeline::new(store, resolver, normalizer, config.ingest.clone());
    if let Some(rx) = shutdown {
        pipeline = pipeline.with_shutdown(rx);
    }

    pipeline.run_directory(data_dir, options).await
}

#[derive(Debug, Default)]
struct ResolvedRows {
    rows: Vec<NewObservation>,
    unresolved: usize,
    /// Repeated (station, date) rows merged into an earlier row.
    folded: usize,
    stations_created: usize,
    error: Option<String>,
}

/// Drives normalize → resolve → write for each file and keeps the audit
/// log. Files are handled strictly one after another.
pub struct Pipeline<'a, S, G> {
    store: &'a S,
    resolver: StationResolver<G>,
    normalizer: Normalizer,
    config: IngestConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a, S: Store, G: Geocoder> Pipeline<'a, S, G> {
    pub fn new(
        store: &'a S,
        resolver: StationResolver<G>,
        normalizer: Normalizer,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            normalizer,
            config,
            shutdown: None,
        }
    }

    /// Stop between files once `rx` flips to true.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub async fn run_directory(&mut self, data_dir: &Path, options: RunOptions) -> Result<RunStats> {
        let files = discover_files(data_dir, options.limit)?;
        info!(
            "Found {} files under {}{}",
            files.len(),
            data_dir.display(),
            if options.dry_run { " (dry run)" } else { "" }
        );
        self.run_files(&files, options).await
    }

    pub async fn run_files(&mut self, files: &[PathBuf], options: RunOptions) -> Result<RunStats> {
        let mut stats = RunStats {
            files_found: files.len(),
            ..Default::default()
        };
        let group_size = self.config.files_per_group.max(1);
        let group_pause = Duration::from_secs(self.config.group_pause_seconds);

        for (idx, path) in files.iter().enumerate() {
            if self.shutdown_requested() {
                warn!("Shutdown requested, stopping after {} files", idx);
                stats.interrupted = true;
                break;
            }

            if idx > 0 && idx % group_size == 0 {
                info!(
                    "Group {} done: {} succeeded, {} partial, {} failed, {} unchanged",
                    idx / group_size,
                    stats.files_succeeded,
                    stats.files_partial,
                    stats.files_failed,
                    stats.files_skipped
                );
                if !options.dry_run && !group_pause.is_zero() {
                    tokio::time::sleep(group_pause).await;
                }
            }

            match self.process_file(path, options.force).await {
                Ok(ProcessResult::Unchanged) => stats.files_skipped += 1,
                Ok(ProcessResult::Finished(outcome)) => {
                    info!(
                        "{}: {} ({} processed, {} inserted, {} updated, {} skipped)",
                        outcome.filename,
                        outcome.status,
                        outcome.processed,
                        outcome.inserted,
                        outcome.updated,
                        outcome.skipped
                    );
                    stats.record(&outcome);
                }
                Err(e) => {
                    error!("{}: could not be processed: {}", path.display(), e);
                    stats.files_processed += 1;
                    stats.files_failed += 1;
                }
            }
        }

        info!(
            "Run complete: {} files ({} succeeded, {} partial, {} failed, {} unchanged); \
             records {} processed, {} inserted, {} updated, {} skipped; {} stations created",
            stats.files_processed,
            stats.files_succeeded,
            stats.files_partial,
            stats.files_failed,
            stats.files_skipped,
            stats.records_processed,
            stats.records_inserted,
            stats.records_updated,
            stats.records_skipped,
            stats.stations_created
        );

        Ok(stats)
    }

    /// Process one file end to end. `Err` only when the audit log itself
    /// cannot be written.
    pub async fn process_file(&mut self, path: &Path, force: bool) -> Result<ProcessResult> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut stage = FileStage::Pending;
        debug!("{}: {:?}", filename, stage);

        let bytes = tokio::fs::read(path).await;
        let hash = bytes.as_ref().ok().map(|b| file_hash(b));

        if !force {
            if let (Some(hash), Some(previous)) =
                (&hash, self.store.latest_file_log(&filename).await?)
            {
                if previous.is_complete() && previous.file_hash.as_deref() == Some(hash.as_str()) {
                    debug!("{}: unchanged since last ingest, skipping", filename);
                    return Ok(ProcessResult::Unchanged);
                }
            }
        }

        let log_id = self
            .store
            .start_file_log(&NewFileLog {
                filename: filename.clone(),
                file_path: Some(path.display().to_string()),
                file_hash: hash,
                started_at: Utc::now(),
            })
            .await?;

        let outcome = match bytes {
            Ok(bytes) => self.ingest(path, &filename, &bytes, &mut stage).await,
            Err(e) => FileOutcome::new(&filename).fail(format!("Read failed: {}", e)),
        };

        stage = FileStage::Finished(outcome.status);
        debug!("{}: {:?}", filename, stage);

        self.store.finish_file_log(log_id, &outcome.to_log()).await?;
        Ok(ProcessResult::Finished(outcome))
    }

    async fn ingest(
        &mut self,
        path: &Path,
        filename: &str,
        bytes: &[u8],
        stage: &mut FileStage,
    ) -> FileOutcome {
        let mut outcome = FileOutcome::new(filename);

        *stage = FileStage::Parsing;
        debug!("{}: {:?}", filename, stage);

        let source = SourceFile {
            filename: filename.to_string(),
            parent_dir: path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
        };
        let normalized = match self.normalizer.normalize(&source, bytes) {
            Ok(normalized) => normalized,
            Err(e) => return outcome.fail(format!("Parse failed: {}", e)),
        };

        outcome.station_label = normalized.metadata.station_label.clone();
        outcome.processed = normalized.stats.data_lines;
        outcome.skipped = normalized.stats.skipped();

        if normalized.is_empty() {
            return outcome.fail("No valid data rows found");
        }

        *stage = FileStage::Resolving;
        debug!("{}: {:?}", filename, stage);

        let resolved = self.resolve_rows(filename, &normalized).await;
        outcome.skipped += resolved.unresolved;
        outcome.updated += resolved.folded;
        outcome.stations_created = resolved.stations_created;
        outcome.error = resolved.error;

        *stage = FileStage::Writing;
        debug!("{}: {:?} {} rows", filename, stage, resolved.rows.len());

        let (written, write_skipped, write_error) = self.write_rows(filename, &resolved.rows).await;
        outcome.inserted += written.inserted;
        outcome.updated += written.updated;
        outcome.skipped += write_skipped;
        if write_error.is_some() {
            outcome.error = write_error;
        }

        outcome.settle();
        outcome
    }

    /// Resolve each distinct label once and build observation rows, folding
    /// repeated (station, date) pairs with later values winning.
    async fn resolve_rows(&mut self, filename: &str, normalized: &NormalizedFile) -> ResolvedRows {
        let metadata = &normalized.metadata;
        let hints = LabelHints {
            state: metadata.state.as_deref(),
            station_code: metadata.station_code.as_deref(),
        };

        let mut stations: HashMap<String, Option<Station>> = HashMap::new();
        let mut folded_rows: BTreeMap<(String, NaiveDate), NewObservation> = BTreeMap::new();
        let mut resolved = ResolvedRows::default();

        for row in &normalized.rows {
            let Some(label) = row
                .station_label
                .as_deref()
                .or(metadata.station_label.as_deref())
            else {
                resolved.unresolved += 1;
                continue;
            };

            if !stations.contains_key(label) {
                let station = match self.resolver.resolve(self.store, label, hints).await {
                    Ok(resolution) => {
                        debug!(
                            "{}: '{}' resolved to '{}' ({:?})",
                            filename, label, resolution.station.name, resolution.method
                        );
                        if resolution.created {
                            resolved.stations_created += 1;
                        }
                        Some(resolution.station)
                    }
                    Err(e) => {
                        warn!("{}: could not resolve station '{}': {}", filename, label, e);
                        if resolved.error.is_none() {
                            resolved.error = Some(format!("Station '{}': {}", label, e));
                        }
                        None
                    }
                };
                stations.insert(label.to_string(), station);
            }

            let Some(Some(station)) = stations.get(label) else {
                resolved.unresolved += 1;
                continue;
            };

            let key = (station.normalized_key.clone(), row.date);
            match folded_rows.get_mut(&key) {
                Some(existing) => {
                    existing.measurements.merge_from(&row.measurements);
                    existing.station_label = label.to_string();
                    resolved.folded += 1;
                }
                None => {
                    folded_rows.insert(
                        key,
                        NewObservation {
                            station_key: station.normalized_key.clone(),
                            observation_date: row.date,
                            station_label: label.to_string(),
                            measurements: row.measurements,
                            source_file: filename.to_string(),
                            data_source: self.config.data_source.clone(),
                        },
                    );
                }
            }
        }

        resolved.rows = folded_rows.into_values().collect();
        resolved
    }

    /// Write rows in batches. A failed batch is rolled back by the store;
    /// it and every later batch are counted as skipped.
    async fn write_rows(
        &self,
        filename: &str,
        rows: &[NewObservation],
    ) -> (UpsertResult, usize, Option<String>) {
        let mut written = UpsertResult::default();
        let batch_size = self.config.commit_batch_size.max(1);

        for (batch_idx, batch) in rows.chunks(batch_size).enumerate() {
            match self.store.upsert_observations(batch).await {
                Ok(result) => {
                    written.inserted += result.inserted;
                    written.updated += result.updated;
                }
                Err(e) => {
                    let first_row = batch_idx * batch_size;
                    let remaining = rows.len() - first_row;
                    error!(
                        "{}: batch {} (rows {}..{}) rolled back: {}",
                        filename,
                        batch_idx + 1,
                        first_row + 1,
                        first_row + batch.len(),
                        e
                    );
                    return (
                        written,
                        remaining,
                        Some(format!("Write failed at row {}: {}", first_row + 1, e)),
                    );
                }
            }
        }

        (written, 0, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(inserted: usize, skipped: usize, error: Option<&str>) -> FileStatus {
        let mut outcome = FileOutcome::new("cobar-202301.csv");
        outcome.inserted = inserted;
        outcome.skipped = skipped;
        outcome.error = error.map(str::to_string);
        outcome.settle();
        outcome.status
    }

    #[test]
    fn test_settle_status() {
        assert_eq!(outcome(31, 0, None), FileStatus::Success);
        assert_eq!(outcome(30, 1, None), FileStatus::Partial);
        assert_eq!(outcome(0, 31, None), FileStatus::Failed);
        assert_eq!(outcome(10, 21, Some("batch rolled back")), FileStatus::Partial);
        assert_eq!(outcome(0, 31, Some("batch rolled back")), FileStatus::Failed);
    }

    #[test]
    fn test_discover_files_sorted_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vic")).unwrap();
        std::fs::create_dir_all(dir.path().join("nsw")).unwrap();
        std::fs::write(dir.path().join("vic/mildura-202301.csv"), "x").unwrap();
        std::fs::write(dir.path().join("nsw/cobar-202301.csv"), "x").unwrap();
        std::fs::write(dir.path().join("nsw/notes.txt"), "x").unwrap();

        let files = discover_files(dir.path(), None).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("nsw/cobar-202301.csv"));

        let limited = discover_files(dir.path(), Some(1)).unwrap();
        assert_eq!(limited, files[..1].to_vec());
    }

    #[test]
    fn test_file_hash_is_sha256_hex() {
        assert_eq!(
            file_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
