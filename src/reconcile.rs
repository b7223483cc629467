use crate::db::models::{NewStation, RegistryCounts};
use crate::db::Store;
use crate::error::Result;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub observed_stations: usize,
    pub inserted: usize,
    pub counts: RegistryCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: u64,
    pub counts: RegistryCounts,
}

/// Make the registry a superset of the stations observations refer to.
/// Missing stations are added without coordinates, pending geocoding.
pub async fn sync_stations<S: Store>(store: &S, data_source: &str) -> Result<SyncReport> {
    let registered: HashSet<String> = store
        .load_stations()
        .await?
        .into_iter()
        .map(|s| s.normalized_key)
        .collect();

    let observed = store.distinct_observed_stations().await?;
    let mut report = SyncReport {
        observed_stations: observed.len(),
        ..Default::default()
    };

    for (key, label) in observed {
        if registered.contains(&key) {
            continue;
        }

        let (station, created) = store
            .upsert_station(&NewStation {
                name: label,
                normalized_key: key,
                station_code: None,
                state: None,
                latitude: None,
                longitude: None,
                data_source: data_source.to_string(),
            })
            .await?;

        if created {
            report.inserted += 1;
            debug!("Added missing station '{}'", station.name);
        }
    }

    report.counts = store.registry_counts().await?;
    info!(
        "Station sync: {} observed, {} added; registry {} stations, {} with coordinates",
        report.observed_stations,
        report.inserted,
        report.counts.stations,
        report.counts.stations_with_coordinates
    );

    Ok(report)
}

/// Delete registry stations no observation refers to. Never run as part of
/// ingestion.
pub async fn prune_stations<S: Store>(store: &S) -> Result<PruneReport> {
    let deleted = store.delete_stations_without_observations().await?;
    let counts = store.registry_counts().await?;

    info!(
        "Station prune: {} deleted; registry {} stations, {} with coordinates",
        deleted, counts.stations, counts.stations_with_coordinates
    );

    Ok(PruneReport { deleted, counts })
}
