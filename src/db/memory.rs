use crate::db::models::{
    FileLog, FileLogOutcome, NewFileLog, NewObservation, NewStation, Observation, RegistryCounts,
    Station, UpsertResult,
};
use crate::db::Store;
use crate::error::{AppError, Result};
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    stations: Vec<Station>,
    next_station_id: i32,
    observations: BTreeMap<(String, NaiveDate), Observation>,
    next_observation_id: i64,
    logs: Vec<FileLog>,
}

/// In-process store with the same merge semantics as the PostgreSQL
/// repository. Backs dry runs (seeded from a registry snapshot) and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing registry snapshot.
    pub fn with_stations(stations: Vec<Station>) -> Self {
        let next_station_id = stations.iter().map(|s| s.id).max().unwrap_or(0);
        Self {
            inner: Mutex::new(Inner {
                stations,
                next_station_id,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stations(&self) -> Vec<Station> {
        self.lock().stations.clone()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.lock().observations.values().cloned().collect()
    }

    pub fn observation(&self, station_key: &str, date: NaiveDate) -> Option<Observation> {
        self.lock()
            .observations
            .get(&(station_key.to_string(), date))
            .cloned()
    }

    pub fn file_logs(&self) -> Vec<FileLog> {
        self.lock().logs.clone()
    }
}

impl Store for MemoryStore {
    async fn load_stations(&self) -> Result<Vec<Station>> {
        Ok(self.stations())
    }

    async fn upsert_station(&self, station: &NewStation) -> Result<(Station, bool)> {
        let mut inner = self.lock();
        let now = Utc::now();

        if let Some(existing) = inner
            .stations
            .iter_mut()
            .find(|s| s.normalized_key == station.normalized_key)
        {
            if existing.station_code.is_none() {
                existing.station_code = station.station_code.clone();
            }
            if existing.state.is_none() {
                existing.state = station.state.clone();
            }
            if station.has_coordinates() {
                existing.latitude = station.latitude;
                existing.longitude = station.longitude;
                existing.needs_geocoding = false;
            }
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        inner.next_station_id += 1;
        let created = Station {
            id: inner.next_station_id,
            name: station.name.clone(),
            normalized_key: station.normalized_key.clone(),
            station_code: station.station_code.clone(),
            state: station.state.clone(),
            latitude: station.latitude,
            longitude: station.longitude,
            data_source: station.data_source.clone(),
            is_active: true,
            needs_geocoding: !station.has_coordinates(),
            created_at: now,
            updated_at: now,
        };
        inner.stations.push(created.clone());

        Ok((created, true))
    }

    async fn set_station_coordinates(
        &self,
        station_id: i32,
        latitude: f64,
        longitude: f64,
    ) -> Result<Station> {
        let mut inner = self.lock();
        let station = inner
            .stations
            .iter_mut()
            .find(|s| s.id == station_id)
            .ok_or_else(|| AppError::InvalidData(format!("Station {} does not exist", station_id)))?;

        station.latitude = Some(latitude);
        station.longitude = Some(longitude);
        station.needs_geocoding = false;
        station.updated_at = Utc::now();

        Ok(station.clone())
    }

    async fn stations_missing_coordinates(&self, limit: Option<usize>) -> Result<Vec<Station>> {
        let inner = self.lock();
        let missing = inner
            .stations
            .iter()
            .filter(|s| !s.has_coordinates())
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(missing)
    }

    async fn upsert_observations(&self, rows: &[NewObservation]) -> Result<UpsertResult> {
        let mut seen = HashSet::new();
        for row in rows {
            if !seen.insert((&row.station_key, row.observation_date)) {
                return Err(AppError::InvalidData(format!(
                    "Batch contains ({}, {}) more than once",
                    row.station_key, row.observation_date
                )));
            }
        }

        let mut inner = self.lock();
        let mut result = UpsertResult::default();

        for row in rows {
            let key = (row.station_key.clone(), row.observation_date);
            if let Some(existing) = inner.observations.get_mut(&key) {
                existing.measurements.merge_from(&row.measurements);
                existing.station_label = row.station_label.clone();
                existing.source_file = row.source_file.clone();
                existing.data_source = row.data_source.clone();
                result.updated += 1;
                continue;
            }

            inner.next_observation_id += 1;
            let observation = Observation {
                id: inner.next_observation_id,
                station_key: row.station_key.clone(),
                observation_date: row.observation_date,
                station_label: row.station_label.clone(),
                measurements: row.measurements,
                source_file: row.source_file.clone(),
                data_source: row.data_source.clone(),
                ingested_at: Utc::now(),
            };
            inner.observations.insert(key, observation);
            result.inserted += 1;
        }

        Ok(result)
    }

    async fn distinct_observed_stations(&self) -> Result<Vec<(String, String)>> {
        let inner = self.lock();
        let mut latest: BTreeMap<&str, (&NaiveDate, &str)> = BTreeMap::new();
        for obs in inner.observations.values() {
            let entry = latest
                .entry(obs.station_key.as_str())
                .or_insert((&obs.observation_date, obs.station_label.as_str()));
            if obs.observation_date > *entry.0 {
                *entry = (&obs.observation_date, obs.station_label.as_str());
            }
        }

        Ok(latest
            .into_iter()
            .map(|(key, (_, label))| (key.to_string(), label.to_string()))
            .collect())
    }

    async fn delete_stations_without_observations(&self) -> Result<u64> {
        let mut inner = self.lock();
        let observed: HashSet<String> = inner
            .observations
            .keys()
            .map(|(key, _)| key.clone())
            .collect();

        let before = inner.stations.len();
        inner
            .stations
            .retain(|s| observed.contains(&s.normalized_key));

        Ok((before - inner.stations.len()) as u64)
    }

    async fn registry_counts(&self) -> Result<RegistryCounts> {
        let inner = self.lock();
        let distinct: HashSet<&str> = inner
            .observations
            .keys()
            .map(|(key, _)| key.as_str())
            .collect();

        Ok(RegistryCounts {
            stations: inner.stations.len() as i64,
            stations_with_coordinates: inner.stations.iter().filter(|s| s.has_coordinates()).count()
                as i64,
            observations: inner.observations.len() as i64,
            distinct_observed_stations: distinct.len() as i64,
        })
    }

    async fn latest_file_log(&self, filename: &str) -> Result<Option<FileLog>> {
        let inner = self.lock();
        Ok(inner
            .logs
            .iter()
            .rev()
            .find(|log| log.filename == filename)
            .cloned())
    }

    async fn start_file_log(&self, log: &NewFileLog) -> Result<i64> {
        let mut inner = self.lock();
        let id = inner.logs.len() as i64 + 1;
        inner.logs.push(FileLog {
            id,
            filename: log.filename.clone(),
            file_path: log.file_path.clone(),
            file_hash: log.file_hash.clone(),
            station_label: None,
            status: "pending".to_string(),
            started_at: log.started_at,
            finished_at: None,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_skipped: 0,
            error_message: None,
        });
        Ok(id)
    }

    async fn finish_file_log(&self, id: i64, outcome: &FileLogOutcome) -> Result<()> {
        let mut inner = self.lock();
        let log = inner
            .logs
            .iter_mut()
            .find(|log| log.id == id)
            .ok_or_else(|| AppError::InvalidData(format!("Ingestion log {} does not exist", id)))?;

        if log.finished_at.is_some() {
            return Ok(());
        }

        log.station_label = outcome.station_label.clone();
        log.status = outcome.status.as_str().to_string();
        log.finished_at = Some(outcome.finished_at);
        log.records_processed = outcome.records_processed;
        log.records_inserted = outcome.records_inserted;
        log.records_updated = outcome.records_updated;
        log.records_skipped = outcome.records_skipped;
        log.error_message = outcome.error_message.clone();

        Ok(())
    }

    async fn file_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let inner = self.lock();
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for log in &inner.logs {
            *counts.entry(log.status.clone()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}
