//! Import of the bureau's fixed-width station list (`stations.txt`).
//!
//! Layout, after a header block ending in a dashed separator line:
//!
//! ```text
//!    Site  Dist  Site name                                 Start     End      Lat       Lon Source  STA ...
//! ------- ----- ---------------------------------------- ------- ------- -------- -------- ------- --- ...
//!   66037    66 SYDNEY AIRPORT AMO                         1929      ..  -33.9465  151.1731 GPS     NSW ...
//! ```

use crate::db::models::NewStation;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::normalizer::state_code_from_dir;
use crate::resolver::normalize_name;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct GazetteerEntry {
    pub site: String,
    pub district: String,
    pub name: String,
    pub start_year: Option<i32>,
    /// `None` while the station is still open.
    pub end_year: Option<i32>,
    pub latitude: f64,
    pub longitude: f64,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedList {
    pub entries: Vec<GazetteerEntry>,
    pub unparsed_lines: usize,
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("---") && trimmed.chars().all(|c| c == '-' || c.is_whitespace())
}

fn parse_year(raw: &str) -> Option<i32> {
    raw.parse().ok()
}

pub fn parse_station_list(text: &str) -> Result<ParsedList> {
    let pattern = regex_lite::Regex::new(
        r"^\s*(\d+)\s+(\d+)\s+(.{1,40}?)\s+(\d{4}|\.\.)\s+(\d{4}|\.\.)\s+(-?\d+\.\d+)\s+(-?\d+\.\d+)(.*)$",
    )
    .map_err(|e| AppError::Config(format!("Invalid station list pattern: {}", e)))?;

    let mut parsed = ParsedList::default();
    let mut started = false;

    for line in text.lines() {
        if !started {
            started = is_separator(line);
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let Some(caps) = pattern.captures(line) else {
            parsed.unparsed_lines += 1;
            debug!("Unparsed station list line: {}", line.trim_end());
            continue;
        };

        let (Ok(latitude), Ok(longitude)) = (caps[6].parse::<f64>(), caps[7].parse::<f64>()) else {
            parsed.unparsed_lines += 1;
            continue;
        };

        let state = caps[8]
            .split_whitespace()
            .find_map(state_code_from_dir)
            .map(str::to_string);

        parsed.entries.push(GazetteerEntry {
            site: caps[1].to_string(),
            district: caps[2].to_string(),
            name: caps[3].trim().to_string(),
            start_year: parse_year(&caps[4]),
            end_year: parse_year(&caps[5]),
            latitude,
            longitude,
            state,
        });
    }

    if !started {
        warn!("No separator line found; station list looks empty or malformed");
    }

    Ok(parsed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub entries: usize,
    pub unparsed_lines: usize,
    pub created: usize,
    pub updated: usize,
}

/// Upsert every listed station by normalized key with its coordinates.
///
/// Closed stations are applied before open ones, so when several entries
/// share a key the open station's coordinates are the ones kept.
pub async fn import_stations<S: Store>(
    store: &S,
    mut list: ParsedList,
    data_source: &str,
) -> Result<ImportStats> {
    list.entries.sort_by_key(|entry| entry.end_year.is_none());

    let mut stats = ImportStats {
        entries: list.entries.len(),
        unparsed_lines: list.unparsed_lines,
        ..Default::default()
    };

    for entry in &list.entries {
        let key = normalize_name(&entry.name);
        if key.is_empty() {
            continue;
        }

        let (_, created) = store
            .upsert_station(&NewStation {
                name: entry.name.clone(),
                normalized_key: key,
                station_code: Some(entry.site.clone()),
                state: entry.state.clone(),
                latitude: Some(entry.latitude),
                longitude: Some(entry.longitude),
                data_source: data_source.to_string(),
            })
            .await?;

        if created {
            stats.created += 1;
        } else {
            stats.updated += 1;
        }
    }

    info!(
        "Station list import: {} entries, {} created, {} updated, {} unparsed lines",
        stats.entries, stats.created, stats.updated, stats.unparsed_lines
    );

    Ok(stats)
}
