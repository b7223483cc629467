pub mod memory;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::Repository;

use crate::error::Result;
use models::{
    FileLog, FileLogOutcome, NewFileLog, NewObservation, NewStation, RegistryCounts, Station,
    UpsertResult,
};

/// Storage operations the ingestion pipeline depends on.
///
/// `Repository` backs this with PostgreSQL; `MemoryStore` keeps everything in
/// process for dry runs and tests. Both must honour the same merge rules:
/// station coordinates are only ever filled in, and observation fields that
/// are missing in an incoming row never overwrite stored values.
#[allow(async_fn_in_trait)]
pub trait Store {
    /// Full station registry, used to build the in-memory match cache.
    async fn load_stations(&self) -> Result<Vec<Station>>;

    /// Insert a station keyed by its normalized key, or enrich the existing
    /// one. Returns the stored station and whether it was newly created.
    async fn upsert_station(&self, station: &NewStation) -> Result<(Station, bool)>;

    async fn set_station_coordinates(
        &self,
        station_id: i32,
        latitude: f64,
        longitude: f64,
    ) -> Result<Station>;

    async fn stations_missing_coordinates(&self, limit: Option<usize>) -> Result<Vec<Station>>;

    /// Upsert one batch atomically: either every row lands or none does.
    /// Rows must be unique by `(station_key, observation_date)`.
    async fn upsert_observations(&self, rows: &[NewObservation]) -> Result<UpsertResult>;

    /// Distinct `(station_key, station_label)` pairs referenced by
    /// observations, one label per key.
    async fn distinct_observed_stations(&self) -> Result<Vec<(String, String)>>;

    /// Remove registry stations that no observation references.
    async fn delete_stations_without_observations(&self) -> Result<u64>;

    async fn registry_counts(&self) -> Result<RegistryCounts>;

    async fn latest_file_log(&self, filename: &str) -> Result<Option<FileLog>>;

    async fn start_file_log(&self, log: &NewFileLog) -> Result<i64>;

    /// Finalize a log entry. Entries that are already finalized are left as
    /// they are.
    async fn finish_file_log(&self, id: i64, outcome: &FileLogOutcome) -> Result<()>;

    async fn file_status_counts(&self) -> Result<Vec<(String, i64)>>;
}
