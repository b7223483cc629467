use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Station {
    pub id: i32,
    pub name: String,
    pub normalized_key: String,
    pub station_code: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub data_source: String,
    pub is_active: bool,
    pub needs_geocoding: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Station {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStation {
    pub name: String,
    pub normalized_key: String,
    pub station_code: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub data_source: String,
}

impl NewStation {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// The canonical daily measurement set. Every field is optional; `None`
/// means the source had no usable value.
#[derive(Debug, Clone, Copy, Default, PartialEq, FromRow)]
pub struct Measurements {
    pub max_temperature: Option<f64>,
    pub min_temperature: Option<f64>,
    pub rainfall_mm: Option<f64>,
    pub evapotranspiration_mm: Option<f64>,
    pub max_relative_humidity: Option<f64>,
    pub min_relative_humidity: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub solar_radiation_mj: Option<f64>,
    pub pan_evaporation_mm: Option<f64>,
}

impl Measurements {
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(Option::is_none)
    }

    fn fields(&self) -> [Option<f64>; 9] {
        [
            self.max_temperature,
            self.min_temperature,
            self.rainfall_mm,
            self.evapotranspiration_mm,
            self.max_relative_humidity,
            self.min_relative_humidity,
            self.wind_speed_ms,
            self.solar_radiation_mj,
            self.pan_evaporation_mm,
        ]
    }

    /// Overlay `incoming` onto `self`: present values replace, missing
    /// values leave the stored value alone.
    pub fn merge_from(&mut self, incoming: &Measurements) {
        fn overlay(stored: &mut Option<f64>, incoming: Option<f64>) {
            if incoming.is_some() {
                *stored = incoming;
            }
        }

        overlay(&mut self.max_temperature, incoming.max_temperature);
        overlay(&mut self.min_temperature, incoming.min_temperature);
        overlay(&mut self.rainfall_mm, incoming.rainfall_mm);
        overlay(&mut self.evapotranspiration_mm, incoming.evapotranspiration_mm);
        overlay(&mut self.max_relative_humidity, incoming.max_relative_humidity);
        overlay(&mut self.min_relative_humidity, incoming.min_relative_humidity);
        overlay(&mut self.wind_speed_ms, incoming.wind_speed_ms);
        overlay(&mut self.solar_radiation_mj, incoming.solar_radiation_mj);
        overlay(&mut self.pan_evaporation_mm, incoming.pan_evaporation_mm);
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Observation {
    pub id: i64,
    pub station_key: String,
    pub observation_date: NaiveDate,
    pub station_label: String,
    #[sqlx(flatten)]
    pub measurements: Measurements,
    pub source_file: String,
    pub data_source: String,
    pub ingested_at: DateTime<Utc>,
}

/// One row bound for the observations table. `station_key` is the owning
/// station's normalized key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub station_key: String,
    pub observation_date: NaiveDate,
    pub station_label: String,
    pub measurements: Measurements,
    pub source_file: String,
    pub data_source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertResult {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Success,
    Partial,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Success => "success",
            FileStatus::Partial => "partial",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "success" => Ok(FileStatus::Success),
            "partial" => Ok(FileStatus::Partial),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileLog {
    pub id: i64,
    pub filename: String,
    pub file_path: Option<String>,
    pub file_hash: Option<String>,
    pub station_label: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: i32,
    pub records_inserted: i32,
    pub records_updated: i32,
    pub records_skipped: i32,
    pub error_message: Option<String>,
}

impl FileLog {
    /// A finalized success, or a partial whose only losses were bad rows.
    /// Files in this state need no reprocessing unless their content
    /// changes.
    pub fn is_complete(&self) -> bool {
        self.finished_at.is_some()
            && match self.status.parse::<FileStatus>() {
                Ok(FileStatus::Success) => true,
                Ok(FileStatus::Partial) => self.error_message.is_none(),
                _ => false,
            }
    }
}

#[derive(Debug, Clone)]
pub struct NewFileLog {
    pub filename: String,
    pub file_path: Option<String>,
    pub file_hash: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Final figures written once when a file finishes.
#[derive(Debug, Clone)]
pub struct FileLogOutcome {
    pub station_label: Option<String>,
    pub status: FileStatus,
    pub finished_at: DateTime<Utc>,
    pub records_processed: i32,
    pub records_inserted: i32,
    pub records_updated: i32,
    pub records_skipped: i32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub stations: i64,
    pub stations_with_coordinates: i64,
    pub observations: i64,
    pub distinct_observed_stations: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_stored_values_for_missing_fields() {
        let mut stored = Measurements {
            max_temperature: Some(30.0),
            ..Default::default()
        };
        let incoming = Measurements {
            rainfall_mm: Some(5.0),
            ..Default::default()
        };

        stored.merge_from(&incoming);

        assert_eq!(stored.max_temperature, Some(30.0));
        assert_eq!(stored.rainfall_mm, Some(5.0));
    }

    #[test]
    fn test_merge_overwrites_present_values() {
        let mut stored = Measurements {
            max_temperature: Some(30.0),
            ..Default::default()
        };
        stored.merge_from(&Measurements {
            max_temperature: Some(31.5),
            ..Default::default()
        });
        assert_eq!(stored.max_temperature, Some(31.5));
    }

    #[test]
    fn test_partial_with_error_is_not_complete() {
        let log = FileLog {
            id: 1,
            filename: "cobar-202301.csv".to_string(),
            file_path: None,
            file_hash: None,
            station_label: Some("COBAR".to_string()),
            status: "partial".to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            records_processed: 31,
            records_inserted: 20,
            records_updated: 0,
            records_skipped: 11,
            error_message: Some("connection reset".to_string()),
        };
        assert!(!log.is_complete());

        let clean = FileLog {
            error_message: None,
            ..log
        };
        assert!(clean.is_complete());
    }
}
