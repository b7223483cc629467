use crate::db::models::{
    FileLog, FileLogOutcome, NewFileLog, NewObservation, NewStation, RegistryCounts, Station,
    UpsertResult,
};
use crate::db::Store;
use crate::error::{AppError, Result};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, info};

const STATION_COLUMNS: &str = "id, name, normalized_key, station_code, state, latitude, longitude, \
     data_source, is_active, needs_geocoding, created_at, updated_at";

#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Release pooled connections. Called once the command is done.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Store for Repository {
    async fn load_stations(&self) -> Result<Vec<Station>> {
        let stations = sqlx::query_as::<_, Station>(&format!(
            "SELECT {} FROM stations ORDER BY id",
            STATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        debug!("Loaded {} stations from registry", stations.len());
        Ok(stations)
    }

    /// Coordinates are replaced only by a complete pair and never cleared;
    /// code and state keep their first known value.
    async fn upsert_station(&self, station: &NewStation) -> Result<(Station, bool)> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO stations
                (name, normalized_key, station_code, state, latitude, longitude,
                 data_source, needs_geocoding)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (normalized_key) DO UPDATE SET
                station_code = COALESCE(stations.station_code, EXCLUDED.station_code),
                state = COALESCE(stations.state, EXCLUDED.state),
                latitude = CASE
                    WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL
                    THEN EXCLUDED.latitude ELSE stations.latitude END,
                longitude = CASE
                    WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL
                    THEN EXCLUDED.longitude ELSE stations.longitude END,
                needs_geocoding = stations.needs_geocoding
                    AND (EXCLUDED.latitude IS NULL OR EXCLUDED.longitude IS NULL),
                updated_at = NOW()
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            STATION_COLUMNS
        ))
        .bind(&station.name)
        .bind(&station.normalized_key)
        .bind(&station.station_code)
        .bind(&station.state)
        .bind(station.latitude)
        .bind(station.longitude)
        .bind(&station.data_source)
        .bind(!station.has_coordinates())
        .fetch_one(&self.pool)
        .await?;

        let stored = Station::from_row(&row)?;
        let inserted: bool = row.try_get("inserted")?;

        Ok((stored, inserted))
    }

    async fn set_station_coordinates(
        &self,
        station_id: i32,
        latitude: f64,
        longitude: f64,
    ) -> Result<Station> {
        let station = sqlx::query_as::<_, Station>(&format!(
            r#"
            UPDATE stations
            SET latitude = $2, longitude = $3, needs_geocoding = FALSE, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            STATION_COLUMNS
        ))
        .bind(station_id)
        .bind(latitude)
        .bind(longitude)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::InvalidData(format!("Station {} does not exist", station_id)))?;

        Ok(station)
    }

    async fn stations_missing_coordinates(&self, limit: Option<usize>) -> Result<Vec<Station>> {
        let stations = sqlx::query_as::<_, Station>(&format!(
            r#"
            SELECT {} FROM stations
            WHERE latitude IS NULL OR longitude IS NULL
            ORDER BY id
            LIMIT $1
            "#,
            STATION_COLUMNS
        ))
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(stations)
    }

    /// Upsert a batch of observations inside one transaction.
    ///
    /// `RETURNING (xmax = 0)` tells fresh inserts apart from conflict updates.
    /// Each measurement is merged with `COALESCE(EXCLUDED.x, observations.x)`
    /// so a blank re-read never erases a known value.
    async fn upsert_observations(&self, rows: &[NewObservation]) -> Result<UpsertResult> {
        if rows.is_empty() {
            return Ok(UpsertResult::default());
        }

        let mut tx = self.pool.begin().await?;

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO observations (
                station_key, observation_date, station_label,
                max_temperature, min_temperature, rainfall_mm, evapotranspiration_mm,
                max_relative_humidity, min_relative_humidity, wind_speed_ms,
                solar_radiation_mj, pan_evaporation_mm,
                source_file, data_source
            ) ",
        );

        query_builder.push_values(rows, |mut b, obs| {
            let m = &obs.measurements;
            b.push_bind(&obs.station_key)
                .push_bind(obs.observation_date)
                .push_bind(&obs.station_label)
                .push_bind(m.max_temperature)
                .push_bind(m.min_temperature)
                .push_bind(m.rainfall_mm)
                .push_bind(m.evapotranspiration_mm)
                .push_bind(m.max_relative_humidity)
                .push_bind(m.min_relative_humidity)
                .push_bind(m.wind_speed_ms)
                .push_bind(m.solar_radiation_mj)
                .push_bind(m.pan_evaporation_mm)
                .push_bind(&obs.source_file)
                .push_bind(&obs.data_source);
        });

        query_builder.push(
            " ON CONFLICT (station_key, observation_date) DO UPDATE SET \
            station_label = EXCLUDED.station_label, \
            max_temperature = COALESCE(EXCLUDED.max_temperature, observations.max_temperature), \
            min_temperature = COALESCE(EXCLUDED.min_temperature, observations.min_temperature), \
            rainfall_mm = COALESCE(EXCLUDED.rainfall_mm, observations.rainfall_mm), \
            evapotranspiration_mm = COALESCE(EXCLUDED.evapotranspiration_mm, observations.evapotranspiration_mm), \
            max_relative_humidity = COALESCE(EXCLUDED.max_relative_humidity, observations.max_relative_humidity), \
            min_relative_humidity = COALESCE(EXCLUDED.min_relative_humidity, observations.min_relative_humidity), \
            wind_speed_ms = COALESCE(EXCLUDED.wind_speed_ms, observations.wind_speed_ms), \
            solar_radiation_mj = COALESCE(EXCLUDED.solar_radiation_mj, observations.solar_radiation_mj), \
            pan_evaporation_mm = COALESCE(EXCLUDED.pan_evaporation_mm, observations.pan_evaporation_mm), \
            source_file = EXCLUDED.source_file, \
            data_source = EXCLUDED.data_source \
            RETURNING (xmax = 0) AS inserted",
        );

        let flags = query_builder.build().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let mut result = UpsertResult::default();
        for row in flags {
            if row.try_get::<bool, _>("inserted")? {
                result.inserted += 1;
            } else {
                result.updated += 1;
            }
        }

        debug!(
            "Upserted {} observations: {} inserted, {} updated",
            rows.len(),
            result.inserted,
            result.updated
        );

        Ok(result)
    }

    async fn distinct_observed_stations(&self) -> Result<Vec<(String, String)>> {
        let pairs = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT ON (station_key) station_key, station_label
            FROM observations
            ORDER BY station_key, observation_date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(pairs)
    }

    async fn delete_stations_without_observations(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stations s
            WHERE NOT EXISTS (
                SELECT 1 FROM observations o WHERE o.station_key = s.normalized_key
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn registry_counts(&self) -> Result<RegistryCounts> {
        let (stations, stations_with_coordinates) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE latitude IS NOT NULL AND longitude IS NOT NULL)
            FROM stations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (observations, distinct_observed_stations) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COUNT(DISTINCT station_key) FROM observations",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RegistryCounts {
            stations,
            stations_with_coordinates,
            observations,
            distinct_observed_stations,
        })
    }

    async fn latest_file_log(&self, filename: &str) -> Result<Option<FileLog>> {
        let log = sqlx::query_as::<_, FileLog>(
            r#"
            SELECT * FROM ingestion_logs
            WHERE filename = $1
            ORDER BY started_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        Ok(log)
    }

    async fn start_file_log(&self, log: &NewFileLog) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ingestion_logs (filename, file_path, file_hash, status, started_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING id
            "#,
        )
        .bind(&log.filename)
        .bind(&log.file_path)
        .bind(&log.file_hash)
        .bind(log.started_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn finish_file_log(&self, id: i64, outcome: &FileLogOutcome) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_logs SET
                station_label = $2,
                status = $3,
                finished_at = $4,
                records_processed = $5,
                records_inserted = $6,
                records_updated = $7,
                records_skipped = $8,
                error_message = $9
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(id)
        .bind(&outcome.station_label)
        .bind(outcome.status.as_str())
        .bind(outcome.finished_at)
        .bind(outcome.records_processed)
        .bind(outcome.records_inserted)
        .bind(outcome.records_updated)
        .bind(outcome.records_skipped)
        .bind(&outcome.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Ingestion log {} already finalized, left unchanged", id);
        }

        Ok(())
    }

    async fn file_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM ingestion_logs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }
}
