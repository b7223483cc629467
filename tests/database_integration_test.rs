use bom_ingest::db::models::{
    FileLogOutcome, FileStatus, Measurements, NewFileLog, NewObservation, NewStation,
};
use bom_ingest::db::{Repository, Store};
use bom_ingest::reconcile::{prune_stations, sync_stations};
use chrono::{NaiveDate, Utc};
use sqlx::PgPool;

fn station(name: &str, key: &str, coords: Option<(f64, f64)>) -> NewStation {
    NewStation {
        name: name.to_string(),
        normalized_key: key.to_string(),
        station_code: None,
        state: Some("NSW".to_string()),
        latitude: coords.map(|c| c.0),
        longitude: coords.map(|c| c.1),
        data_source: "BOM".to_string(),
    }
}

fn observation(key: &str, day: u32, measurements: Measurements) -> NewObservation {
    NewObservation {
        station_key: key.to_string(),
        observation_date: NaiveDate::from_ymd_opt(2023, 1, day).unwrap(),
        station_label: key.to_uppercase(),
        measurements,
        source_file: format!("{}-202301.csv", key),
        data_source: "BOM".to_string(),
    }
}

/// Test station upsert - insert new station
#[sqlx::test]
async fn test_upsert_new_station(pool: PgPool) {
    let repo = Repository::new(pool.clone());

    let (stored, created) = repo
        .upsert_station(&station("COBAR MO", "cobar mo", None))
        .await
        .expect("Failed to insert station");

    assert!(created);
    assert!(stored.needs_geocoding);
    assert!(stored.is_active);

    let (name, key) = sqlx::query_as::<_, (String, String)>(
        "SELECT name, normalized_key FROM stations WHERE id = $1",
    )
    .bind(stored.id)
    .fetch_one(&pool)
    .await
    .expect("Failed to fetch station");

    assert_eq!(name, "COBAR MO");
    assert_eq!(key, "cobar mo");
}

/// Test that a later upsert without coordinates keeps the stored pair
#[sqlx::test]
async fn test_upsert_never_erases_coordinates(pool: PgPool) {
    let repo = Repository::new(pool);

    let (first, _) = repo
        .upsert_station(&station("SYDNEY AIRPORT AMO", "sydney", Some((-33.95, 151.17))))
        .await
        .unwrap();

    let (second, created) = repo
        .upsert_station(&station("Sydney (Airport)", "sydney", None))
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.name, "SYDNEY AIRPORT AMO");
    assert_eq!(second.latitude, Some(-33.95));
    assert_eq!(second.longitude, Some(151.17));
    assert!(!second.needs_geocoding);
}

/// Test that a provisional station is filled in by a later upsert with
/// coordinates
#[sqlx::test]
async fn test_upsert_fills_missing_coordinates(pool: PgPool) {
    let repo = Repository::new(pool);

    repo.upsert_station(&station("COBAR", "cobar", None))
        .await
        .unwrap();
    let (filled, created) = repo
        .upsert_station(&station("COBAR", "cobar", Some((-31.49, 145.83))))
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(filled.latitude, Some(-31.49));
    assert!(!filled.needs_geocoding);
    assert!(repo.stations_missing_coordinates(None).await.unwrap().is_empty());
}

/// Test setting coordinates on a known and an unknown station
#[sqlx::test]
async fn test_set_station_coordinates(pool: PgPool) {
    let repo = Repository::new(pool);

    let (stored, _) = repo
        .upsert_station(&station("MILDURA", "mildura", None))
        .await
        .unwrap();
    assert_eq!(repo.stations_missing_coordinates(Some(10)).await.unwrap().len(), 1);

    let updated = repo
        .set_station_coordinates(stored.id, -34.23, 142.08)
        .await
        .unwrap();
    assert_eq!(updated.latitude, Some(-34.23));
    assert!(!updated.needs_geocoding);

    assert!(repo.set_station_coordinates(9999, 0.0, 0.0).await.is_err());
}

/// Test observation upsert merges fields instead of replacing the row
#[sqlx::test]
async fn test_observation_upsert_merges_fields(pool: PgPool) {
    let repo = Repository::new(pool.clone());

    let first = repo
        .upsert_observations(&[observation(
            "melbourne olympic park",
            1,
            Measurements {
                max_temperature: Some(30.0),
                ..Default::default()
            },
        )])
        .await
        .unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(first.updated, 0);

    let second = repo
        .upsert_observations(&[
            observation(
                "melbourne olympic park",
                1,
                Measurements {
                    rainfall_mm: Some(5.0),
                    ..Default::default()
                },
            ),
            observation(
                "melbourne olympic park",
                2,
                Measurements {
                    rainfall_mm: Some(0.0),
                    ..Default::default()
                },
            ),
        ])
        .await
        .unwrap();
    assert_eq!(second.inserted, 1);
    assert_eq!(second.updated, 1);

    let (max_temp, rain) = sqlx::query_as::<_, (Option<f64>, Option<f64>)>(
        "SELECT max_temperature, rainfall_mm FROM observations \
         WHERE station_key = $1 AND observation_date = $2",
    )
    .bind("melbourne olympic park")
    .bind(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap())
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(max_temp, Some(30.0));
    assert_eq!(rain, Some(5.0));
}

/// Test that a batch repeating a key is rolled back entirely
#[sqlx::test]
async fn test_duplicate_key_batch_is_rolled_back(pool: PgPool) {
    let repo = Repository::new(pool.clone());
    let row = observation(
        "cobar",
        1,
        Measurements {
            rainfall_mm: Some(1.0),
            ..Default::default()
        },
    );

    let result = repo
        .upsert_observations(&[observation("cobar", 2, row.measurements), row.clone(), row])
        .await;
    assert!(result.is_err());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

/// Test that a finalized log entry cannot be rewritten
#[sqlx::test]
async fn test_finalized_log_is_immutable(pool: PgPool) {
    let repo = Repository::new(pool);

    let id = repo
        .start_file_log(&NewFileLog {
            filename: "cobar-202301.csv".to_string(),
            file_path: Some("data/nsw/cobar-202301.csv".to_string()),
            file_hash: Some("abc123".to_string()),
            started_at: Utc::now(),
        })
        .await
        .unwrap();

    let pending = repo.latest_file_log("cobar-202301.csv").await.unwrap().unwrap();
    assert_eq!(pending.status, "pending");
    assert!(!pending.is_complete());

    let outcome = FileLogOutcome {
        station_label: Some("COBAR MO".to_string()),
        status: FileStatus::Success,
        finished_at: Utc::now(),
        records_processed: 31,
        records_inserted: 31,
        records_updated: 0,
        records_skipped: 0,
        error_message: None,
    };
    repo.finish_file_log(id, &outcome).await.unwrap();
    repo.finish_file_log(
        id,
        &FileLogOutcome {
            status: FileStatus::Failed,
            error_message: Some("late failure".to_string()),
            ..outcome
        },
    )
    .await
    .unwrap();

    let log = repo.latest_file_log("cobar-202301.csv").await.unwrap().unwrap();
    assert_eq!(log.status, "success");
    assert_eq!(log.records_inserted, 31);
    assert_eq!(log.file_hash.as_deref(), Some("abc123"));
    assert!(log.error_message.is_none());
    assert!(log.is_complete());

    let counts = repo.file_status_counts().await.unwrap();
    assert_eq!(counts, vec![("success".to_string(), 1)]);
}

/// Test that sync adds observed stations and prune removes unobserved ones
#[sqlx::test]
async fn test_sync_and_prune_registry(pool: PgPool) {
    let repo = Repository::new(pool);

    repo.upsert_station(&station("COBAR MO", "cobar mo", Some((-31.48, 145.83))))
        .await
        .unwrap();
    repo.upsert_station(&station("NOWHERE", "nowhere", None))
        .await
        .unwrap();

    let rain = Measurements {
        rainfall_mm: Some(0.4),
        ..Default::default()
    };
    repo.upsert_observations(&[
        observation("cobar mo", 1, rain),
        observation("mildura", 1, rain),
        observation("mildura", 2, rain),
    ])
    .await
    .unwrap();

    let synced = sync_stations(&repo, "BOM").await.unwrap();
    assert_eq!(synced.observed_stations, 2);
    assert_eq!(synced.inserted, 1);
    assert_eq!(synced.counts.stations, 3);
    assert_eq!(synced.counts.stations_with_coordinates, 1);
    assert_eq!(synced.counts.observations, 3);
    assert_eq!(synced.counts.distinct_observed_stations, 2);

    // A second sync finds nothing to add.
    assert_eq!(sync_stations(&repo, "BOM").await.unwrap().inserted, 0);

    let pruned = prune_stations(&repo).await.unwrap();
    assert_eq!(pruned.deleted, 1);
    assert_eq!(pruned.counts.stations, 2);

    let keys: Vec<String> = repo
        .load_stations()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.normalized_key)
        .collect();
    assert_eq!(keys, vec!["cobar mo", "mildura"]);
}
