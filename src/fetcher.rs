use crate::config::{LocationFilter, SourceConfig};
use crate::error::{AppError, Result};
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded retry with linear backoff: attempt `n` failing waits
/// `n × backoff_step` before the next try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: Duration::from_secs(config.backoff_step_seconds),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Retry a future while it fails with a transient error.
///
/// Permanent errors (including `Unavailable`) are returned after the
/// first attempt.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                error!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    what, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// The last `months` complete calendar months before `today`, oldest
/// first, as `YYYYMM`.
pub fn month_window(today: NaiveDate, months: u32) -> Vec<String> {
    let current = today.year() * 12 + today.month0() as i32;
    (1..=months as i32)
        .rev()
        .map(|back| {
            let index = current - back;
            format!("{:04}{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
        })
        .collect()
}

pub fn archive_filename(location: &str, month: &str) -> String {
    format!("{}-{}.csv", location, month)
}

/// Remote archive of per-collection location directories.
#[allow(async_fn_in_trait)]
pub trait RemoteArchive {
    async fn list_locations(&self, collection: &str) -> Result<Vec<String>>;

    /// Fetch one dated file. A file the archive does not have is
    /// `AppError::Unavailable`.
    async fn fetch_file(&self, collection: &str, location: &str, filename: &str) -> Result<Vec<u8>>;
}

/// Archive served as plain HTTP directory listings.
pub struct HttpArchive {
    client: Client,
    base_url: String,
}

impl HttpArchive {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::Unavailable(url.to_string()));
        }
        Ok(response.error_for_status()?)
    }
}

impl RemoteArchive for HttpArchive {
    async fn list_locations(&self, collection: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}/", self.base_url, collection);
        debug!("Fetching location listing from {}", url);

        let html = self.get(&url).await?.text().await?;
        let locations = parse_listing(&html)?;

        info!("Found {} locations in {}", locations.len(), collection);
        Ok(locations)
    }

    async fn fetch_file(&self, collection: &str, location: &str, filename: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}/{}/{}", self.base_url, collection, location, filename);
        debug!("Downloading {}", url);

        let bytes = self.get(&url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Directory names linked from an HTML index page, sorted and unique.
fn parse_listing(html: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("a").map_err(|e| AppError::Parse(format!("Selector error: {:?}", e)))?;

    let mut locations = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !href.ends_with('/') || href.contains("://") || href.starts_with(['.', '?', '/']) {
            continue;
        }

        let name = href.trim_end_matches('/');
        if !name.is_empty() && !name.contains('/') {
            locations.push(name.to_string());
        }
    }

    locations.sort();
    locations.dedup();
    Ok(locations)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalStats {
    pub collections: usize,
    pub collections_failed: usize,
    pub locations: usize,
    pub locations_succeeded: usize,
    pub locations_failed: usize,
    pub locations_filtered: usize,
    pub files_downloaded: usize,
    pub files_existing: usize,
    pub files_unavailable: usize,
    pub files_failed: usize,
}

impl RetrievalStats {
    fn absorb(&mut self, other: RetrievalStats) {
        self.collections += other.collections;
        self.collections_failed += other.collections_failed;
        self.locations += other.locations;
        self.locations_succeeded += other.locations_succeeded;
        self.locations_failed += other.locations_failed;
        self.locations_filtered += other.locations_filtered;
        self.files_downloaded += other.files_downloaded;
        self.files_existing += other.files_existing;
        self.files_unavailable += other.files_unavailable;
        self.files_failed += other.files_failed;
    }
}

/// Mirrors dated files from a `RemoteArchive` into
/// `<data_dir>/<collection>/`. Files already present locally are never
/// fetched again.
pub struct Retriever<A> {
    archive: A,
    policy: RetryPolicy,
    filter: LocationFilter,
    location_delay: Duration,
    collection_delay: Duration,
    data_dir: PathBuf,
}

impl<A: RemoteArchive> Retriever<A> {
    pub fn new(archive: A, config: &SourceConfig, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive,
            policy: RetryPolicy::from_config(config),
            filter: config.locations.clone(),
            location_delay: Duration::from_millis(config.location_delay_ms),
            collection_delay: Duration::from_secs(config.collection_delay_seconds),
            data_dir: data_dir.into(),
        }
    }

    pub async fn fetch_all(&self, collections: &[String], months: &[String]) -> RetrievalStats {
        let mut stats = RetrievalStats::default();

        for (idx, collection) in collections.iter().enumerate() {
            if idx > 0 && !self.collection_delay.is_zero() {
                debug!("Pausing {:?} before next collection", self.collection_delay);
                tokio::time::sleep(self.collection_delay).await;
            }

            info!("Processing collection {}", collection);
            stats.absorb(self.fetch_collection(collection, months).await);
        }

        info!(
            "Retrieval complete: {} downloaded, {} already present, {} unavailable, {} failed; \
             {}/{} locations succeeded",
            stats.files_downloaded,
            stats.files_existing,
            stats.files_unavailable,
            stats.files_failed,
            stats.locations_succeeded,
            stats.locations
        );
        stats
    }

    pub async fn fetch_collection(&self, collection: &str, months: &[String]) -> RetrievalStats {
        let mut stats = RetrievalStats {
            collections: 1,
            ..Default::default()
        };

        let what = format!("Listing {}", collection);
        let locations = match retry_with_backoff(&self.policy, &what, || {
            self.archive.list_locations(collection)
        })
        .await
        {
            Ok(locations) => locations,
            Err(e) => {
                error!("Could not list locations for {}: {}", collection, e);
                stats.collections_failed = 1;
                return stats;
            }
        };

        let selected: Vec<&String> = locations
            .iter()
            .filter(|location| self.filter.matches_location(location))
            .collect();
        stats.locations_filtered = locations.len() - selected.len();
        stats.locations = selected.len();

        let target_dir = self.data_dir.join(collection);
        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            error!("Cannot create {}: {}", target_dir.display(), e);
            stats.collections_failed = 1;
            return stats;
        }

        for (idx, location) in selected.iter().enumerate() {
            if idx > 0 && !self.location_delay.is_zero() {
                tokio::time::sleep(self.location_delay).await;
            }

            debug!(
                "Location {}/{} in {}: {}",
                idx + 1,
                selected.len(),
                collection,
                location
            );

            if self
                .fetch_location(collection, location, months, &target_dir, &mut stats)
                .await
            {
                stats.locations_succeeded += 1;
            } else {
                stats.locations_failed += 1;
            }
        }

        stats
    }

    /// Returns false when the location had to be abandoned.
    async fn fetch_location(
        &self,
        collection: &str,
        location: &str,
        months: &[String],
        target_dir: &Path,
        stats: &mut RetrievalStats,
    ) -> bool {
        for month in months {
            let filename = archive_filename(location, month);
            let target = target_dir.join(&filename);

            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                debug!("{} already exists, skipping", filename);
                stats.files_existing += 1;
                continue;
            }

            let what = format!("Download {}", filename);
            let result = retry_with_backoff(&self.policy, &what, || {
                self.archive.fetch_file(collection, location, &filename)
            })
            .await;

            match result {
                Ok(bytes) => match write_atomically(&target, &bytes).await {
                    Ok(()) => {
                        stats.files_downloaded += 1;
                        debug!("Downloaded {} ({} bytes)", filename, bytes.len());
                    }
                    Err(e) => {
                        stats.files_failed += 1;
                        error!("Could not write {}: {}", target.display(), e);
                    }
                },
                Err(AppError::Unavailable(_)) => {
                    stats.files_unavailable += 1;
                    debug!("{} not available on remote", filename);
                }
                Err(e) if e.is_transient() => {
                    stats.files_failed += 1;
                    warn!("Giving up on location {} after {}: {}", location, filename, e);
                    return false;
                }
                Err(e) => {
                    stats.files_failed += 1;
                    warn!("Failed to fetch {}: {}", filename, e);
                }
            }
        }

        true
    }
}

/// Mirror the configured window of months for `collections` from the
/// HTTP archive into `data_dir`.
pub async fn fetch_collections(
    config: &SourceConfig,
    data_dir: &Path,
    collections: &[String],
) -> Result<RetrievalStats> {
    let months = month_window(Utc::now().date_naive(), config.months_back);
    info!(
        "Fetching {} collections for months {} to {}",
        collections.len(),
        months.first().map(String::as_str).unwrap_or("-"),
        months.last().map(String::as_str).unwrap_or("-")
    );

    let retriever = Retriever::new(HttpArchive::new(config)?, config, data_dir);
    Ok(retriever.fetch_all(collections, &months).await)
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_step: Duration::from_secs(5),
        }
    }

    fn transient() -> AppError {
        AppError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_uses_every_attempt() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let start = tokio::time::Instant::now();

        let result: Result<()> = retry_with_backoff(&policy(4), "probe", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 5 + 10 + 15 seconds of backoff between four attempts.
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: Result<()> = retry_with_backoff(&policy(5), "probe", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Unavailable("cobar-202301.csv".to_string()))
        })
        .await;

        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result = retry_with_backoff(&policy(3), "probe", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(transient())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_month_window() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(month_window(today, 3), vec!["202312", "202401", "202402"]);

        let january = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let window = month_window(january, 12);
        assert_eq!(window.len(), 12);
        assert_eq!(window.first().map(String::as_str), Some("202301"));
        assert_eq!(window.last().map(String::as_str), Some("202312"));
    }

    #[test]
    fn test_parse_listing() {
        let html = r#"
            <html><body>
            <a href="../">Parent Directory</a>
            <a href="?C=N;O=D">Name</a>
            <a href="sydney_airport/">sydney_airport/</a>
            <a href="cobar/">cobar/</a>
            <a href="cobar/">cobar/</a>
            <a href="readme.txt">readme.txt</a>
            <a href="https://elsewhere.example/">elsewhere</a>
            </body></html>
        "#;

        assert_eq!(parse_listing(html).unwrap(), vec!["cobar", "sydney_airport"]);
    }

    #[derive(Default)]
    struct FakeArchive {
        locations: Vec<String>,
        files: HashMap<String, Vec<u8>>,
        broken_location: Option<String>,
        fetches: Mutex<Vec<String>>,
    }

    impl RemoteArchive for FakeArchive {
        async fn list_locations(&self, _collection: &str) -> Result<Vec<String>> {
            Ok(self.locations.clone())
        }

        async fn fetch_file(&self, _collection: &str, location: &str, filename: &str) -> Result<Vec<u8>> {
            self.fetches.lock().unwrap().push(filename.to_string());
            if self.broken_location.as_deref() == Some(location) {
                return Err(transient());
            }
            self.files
                .get(filename)
                .cloned()
                .ok_or_else(|| AppError::Unavailable(filename.to_string()))
        }
    }

    fn source_config(patterns: Vec<String>) -> SourceConfig {
        SourceConfig {
            base_url: "http://archive.test".to_string(),
            collections: vec!["nsw".to_string()],
            months_back: 2,
            max_attempts: 2,
            backoff_step_seconds: 1,
            timeout_seconds: 5,
            location_delay_ms: 0,
            collection_delay_seconds: 0,
            user_agent: "test".to_string(),
            locations: LocationFilter { patterns },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriever_skips_existing_and_counts_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let nsw = dir.path().join("nsw");
        std::fs::create_dir_all(&nsw).unwrap();
        std::fs::write(nsw.join("cobar-202301.csv"), b"already here").unwrap();

        let archive = FakeArchive {
            locations: vec!["cobar".to_string(), "bourke".to_string()],
            files: HashMap::from([
                ("cobar-202301.csv".to_string(), b"remote".to_vec()),
                ("bourke-202301.csv".to_string(), b"bourke jan".to_vec()),
            ]),
            ..Default::default()
        };

        let retriever = Retriever::new(archive, &source_config(Vec::new()), dir.path());
        let months = vec!["202301".to_string(), "202302".to_string()];
        let stats = retriever.fetch_all(&["nsw".to_string()], &months).await;

        assert_eq!(stats.locations, 2);
        assert_eq!(stats.locations_succeeded, 2);
        assert_eq!(stats.files_existing, 1);
        assert_eq!(stats.files_downloaded, 1);
        assert_eq!(stats.files_unavailable, 2);

        assert_eq!(
            std::fs::read(nsw.join("cobar-202301.csv")).unwrap(),
            b"already here"
        );
        assert_eq!(
            std::fs::read(nsw.join("bourke-202301.csv")).unwrap(),
            b"bourke jan"
        );
        assert!(!nsw.join("bourke-202301.csv.part").exists());

        let fetched = retriever.archive.fetches.lock().unwrap().clone();
        assert!(!fetched.contains(&"cobar-202301.csv".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_location_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FakeArchive {
            locations: vec!["broken".to_string(), "cobar".to_string()],
            files: HashMap::from([("cobar-202301.csv".to_string(), b"ok".to_vec())]),
            broken_location: Some("broken".to_string()),
            ..Default::default()
        };

        let retriever = Retriever::new(archive, &source_config(Vec::new()), dir.path());
        let stats = retriever
            .fetch_all(&["nsw".to_string()], &["202301".to_string()])
            .await;

        assert_eq!(stats.locations_failed, 1);
        assert_eq!(stats.locations_succeeded, 1);
        assert_eq!(stats.files_downloaded, 1);

        let fetched = retriever.archive.fetches.lock().unwrap().clone();
        let broken_attempts = fetched.iter().filter(|f| f.starts_with("broken")).count();
        assert_eq!(broken_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_filter_applied() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FakeArchive {
            locations: vec!["sydney_airport".to_string(), "cobar".to_string()],
            ..Default::default()
        };

        let retriever = Retriever::new(
            archive,
            &source_config(vec!["sydney*".to_string()]),
            dir.path(),
        );
        let stats = retriever
            .fetch_all(&["nsw".to_string()], &["202301".to_string()])
            .await;

        assert_eq!(stats.locations, 1);
        assert_eq!(stats.locations_filtered, 1);
        let fetched = retriever.archive.fetches.lock().unwrap().clone();
        assert_eq!(fetched, vec!["sydney_airport-202301.csv"]);
    }
}
