use crate::config::NormalizerConfig;
use crate::db::models::Measurements;
use crate::encoding::{decode_with_fallback, Encoding};
use crate::error::{AppError, Result};
use chrono::NaiveDate;
use tracing::{debug, warn};

/// Placeholder tokens that stand for "no value" across export versions.
const MISSING_TOKENS: &[&str] = &["", "-", "--", "n/a", "na", "##", "null", "nan"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalColumn {
    StationName,
    Date,
    Evapotranspiration,
    Rainfall,
    PanEvaporation,
    MaxTemperature,
    MinTemperature,
    MaxHumidity,
    MinHumidity,
    WindSpeed,
    SolarRadiation,
}

impl CanonicalColumn {
    fn is_measurement(&self) -> bool {
        !matches!(self, CanonicalColumn::StationName | CanonicalColumn::Date)
    }
}

/// Column aliases keyed by `column_key` output.
const COLUMN_ALIASES: &[(&str, CanonicalColumn)] = &[
    ("station name", CanonicalColumn::StationName),
    ("station", CanonicalColumn::StationName),
    ("date", CanonicalColumn::Date),
    ("observation date", CanonicalColumn::Date),
    ("evapotranspiration", CanonicalColumn::Evapotranspiration),
    ("daily evapotranspiration", CanonicalColumn::Evapotranspiration),
    ("rain", CanonicalColumn::Rainfall),
    ("rainfall", CanonicalColumn::Rainfall),
    ("precipitation", CanonicalColumn::Rainfall),
    ("pan evaporation", CanonicalColumn::PanEvaporation),
    ("evaporation", CanonicalColumn::PanEvaporation),
    ("maximum temperature", CanonicalColumn::MaxTemperature),
    ("max temperature", CanonicalColumn::MaxTemperature),
    ("max temp", CanonicalColumn::MaxTemperature),
    ("minimum temperature", CanonicalColumn::MinTemperature),
    ("min temperature", CanonicalColumn::MinTemperature),
    ("min temp", CanonicalColumn::MinTemperature),
    ("maximum relative humidity", CanonicalColumn::MaxHumidity),
    ("max relative humidity", CanonicalColumn::MaxHumidity),
    ("max humidity", CanonicalColumn::MaxHumidity),
    ("minimum relative humidity", CanonicalColumn::MinHumidity),
    ("min relative humidity", CanonicalColumn::MinHumidity),
    ("min humidity", CanonicalColumn::MinHumidity),
    ("average 10m wind speed", CanonicalColumn::WindSpeed),
    ("average wind speed", CanonicalColumn::WindSpeed),
    ("wind speed", CanonicalColumn::WindSpeed),
    ("solar radiation", CanonicalColumn::SolarRadiation),
];

/// Column order of the standard daily export, used when no header line
/// can be found.
const DEFAULT_LAYOUT: [CanonicalColumn; 11] = [
    CanonicalColumn::StationName,
    CanonicalColumn::Date,
    CanonicalColumn::Evapotranspiration,
    CanonicalColumn::Rainfall,
    CanonicalColumn::PanEvaporation,
    CanonicalColumn::MaxTemperature,
    CanonicalColumn::MinTemperature,
    CanonicalColumn::MaxHumidity,
    CanonicalColumn::MinHumidity,
    CanonicalColumn::WindSpeed,
    CanonicalColumn::SolarRadiation,
];

const STATE_NAMES: &[(&str, &str)] = &[
    ("new south wales", "NSW"),
    ("victoria", "VIC"),
    ("queensland", "QLD"),
    ("western australia", "WA"),
    ("south australia", "SA"),
    ("tasmania", "TAS"),
    ("northern territory", "NT"),
    ("australian capital territory", "ACT"),
];

const STATE_CODES: &[&str] = &["NSW", "VIC", "QLD", "WA", "SA", "TAS", "NT", "ACT"];

/// Reduce a free-text column name to its lookup key: text before any
/// parenthesised unit, lowercased, punctuation dropped, numeric-only
/// tokens (time windows such as `0900-0900`) removed.
pub fn column_key(raw: &str) -> String {
    let head = raw.split('(').next().unwrap_or("");
    let cleaned: String = head
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '-' | '\'' => None,
            c if c.is_alphanumeric() => Some(c),
            _ => Some(' '),
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn canonical_column(raw: &str) -> Option<CanonicalColumn> {
    let key = column_key(raw);
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, column)| *column)
}

/// Clean one measurement cell. Returns the value and whether a non-empty,
/// non-placeholder cell had to be discarded as unparsable.
pub fn parse_measurement(raw: &str) -> (Option<f64>, bool) {
    let trimmed = raw.trim();
    if MISSING_TOKENS.contains(&trimmed.to_lowercase().as_str()) {
        return (None, false);
    }

    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => (Some(value), false),
        _ => (None, true),
    }
}

/// Try each date format in order; the first that parses wins.
pub fn parse_date(raw: &str, formats: &[String]) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// `<location>-<YYYYMM>.<ext>` split into its location and month.
pub fn parse_filename(filename: &str) -> Option<(String, String)> {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    let (location, month) = stem.rsplit_once('-')?;

    if location.is_empty() || month.len() != 6 || !month.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some((location.to_string(), month.to_string()))
}

pub fn state_code_from_name(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_lowercase();
    STATE_NAMES
        .iter()
        .find(|(full, _)| *full == lowered)
        .map(|(_, code)| *code)
}

pub fn state_code_from_dir(dir: &str) -> Option<&'static str> {
    let upper = dir.trim().to_uppercase();
    STATE_CODES.iter().find(|code| **code == upper).copied()
}

/// Where a file came from, as far as the normalizer needs to know.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub filename: String,
    /// Name of the directory holding the file, used as a state hint.
    pub parent_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    pub station_label: Option<String>,
    pub date: NaiveDate,
    pub measurements: Measurements,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    pub station_label: Option<String>,
    pub station_code: Option<String>,
    pub state: Option<String>,
    pub year_month: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRegion {
    /// Header found at this zero-based line; `units_line` says whether the
    /// following line was skipped as a units row.
    Header { line: usize, units_line: bool },
    DefaultOffset(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub data_lines: usize,
    pub parsed_successfully: usize,
    pub bad_dates: usize,
    pub empty_rows: usize,
    pub malformed_rows: usize,
    pub coerced_values: usize,
}

impl ParseStats {
    pub fn skipped(&self) -> usize {
        self.bad_dates + self.empty_rows + self.malformed_rows
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedFile {
    pub metadata: FileMetadata,
    pub rows: Vec<CanonicalRow>,
    pub stats: ParseStats,
    pub encoding: Option<Encoding>,
    pub region: DataRegion,
}

impl NormalizedFile {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct Normalizer {
    config: NormalizerConfig,
    title_pattern: regex_lite::Regex,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        let title_pattern = regex_lite::Regex::new(
            r"(?i)\bfor\s+(.+?),?\s+(New South Wales|Victoria|Queensland|Western Australia|South Australia|Tasmania|Northern Territory|Australian Capital Territory)",
        )
        .map_err(|e| AppError::Config(format!("Invalid title pattern: {}", e)))?;

        Ok(Self {
            config,
            title_pattern,
        })
    }

    /// Decode and normalize one raw export into canonical rows.
    ///
    /// Bad rows are counted and skipped; a file with no valid rows comes
    /// back empty rather than as an error.
    pub fn normalize(&self, source: &SourceFile, bytes: &[u8]) -> Result<NormalizedFile> {
        let decoded = decode_with_fallback(bytes, &self.config.encodings, self.config.probe_bytes);
        let lines: Vec<&str> = decoded.text.lines().collect();

        let scan = &lines[..lines.len().min(self.config.header_scan_lines)];
        let (region, layout) = self.locate_data(scan, &lines);
        let start = match region {
            DataRegion::Header { line, units_line } => line + 1 + usize::from(units_line),
            DataRegion::DefaultOffset(offset) => offset,
        };

        debug!(
            "{}: encoding {:?}, data region {:?}, {} columns mapped",
            source.filename,
            decoded.encoding,
            region,
            layout.iter().filter(|c| c.is_some()).count()
        );

        let data = lines.get(start..).unwrap_or(&[]).join("\n");
        let (rows, stats) = self.parse_rows(&source.filename, &data, &layout)?;

        let metadata = self.metadata(source, scan, &rows);

        if rows.is_empty() {
            warn!(
                "{}: no valid rows ({} bad dates, {} empty, {} malformed)",
                source.filename, stats.bad_dates, stats.empty_rows, stats.malformed_rows
            );
        }

        Ok(NormalizedFile {
            metadata,
            rows,
            stats,
            encoding: decoded.encoding,
            region,
        })
    }

    fn locate_data(
        &self,
        scan: &[&str],
        lines: &[&str],
    ) -> (DataRegion, Vec<Option<CanonicalColumn>>) {
        for (idx, line) in scan.iter().enumerate() {
            let Some(layout) = header_layout(line) else {
                continue;
            };

            let units_line = lines
                .get(idx + 1)
                .map(|next| self.is_units_line(next, &layout))
                .unwrap_or(false);

            return (
                DataRegion::Header {
                    line: idx,
                    units_line,
                },
                layout,
            );
        }

        warn!(
            "No header line found in first {} lines, using default offset {}",
            scan.len(),
            self.config.default_data_offset
        );
        (
            DataRegion::DefaultOffset(self.config.default_data_offset),
            DEFAULT_LAYOUT.iter().copied().map(Some).collect(),
        )
    }

    /// A units row has neither a parsable date nor any numeric measurement.
    fn is_units_line(&self, line: &str, layout: &[Option<CanonicalColumn>]) -> bool {
        let fields = split_record(line);
        if fields.is_empty() {
            return false;
        }

        let has_date = layout
            .iter()
            .position(|c| *c == Some(CanonicalColumn::Date))
            .and_then(|idx| fields.get(idx))
            .and_then(|value| parse_date(value, &self.config.date_formats))
            .is_some();

        let has_number = layout.iter().enumerate().any(|(idx, column)| {
            column.is_some_and(|c| c.is_measurement())
                && fields
                    .get(idx)
                    .is_some_and(|value| parse_measurement(value).0.is_some())
        });

        !has_date && !has_number
    }

    fn parse_rows(
        &self,
        filename: &str,
        data: &str,
        layout: &[Option<CanonicalColumn>],
    ) -> Result<(Vec<CanonicalRow>, ParseStats)> {
        let mut stats = ParseStats::default();
        let mut rows = Vec::new();

        let date_idx = layout
            .iter()
            .position(|c| *c == Some(CanonicalColumn::Date))
            .ok_or_else(|| AppError::Parse(format!("{}: no date column in layout", filename)))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());

        for (record_num, record) in reader.records().enumerate() {
            stats.data_lines += 1;

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    stats.malformed_rows += 1;
                    debug!("{}: malformed record {}: {}", filename, record_num + 1, e);
                    continue;
                }
            };

            if record.iter().all(|field| field.is_empty()) {
                stats.data_lines -= 1;
                continue;
            }

            let raw_date = record.get(date_idx).unwrap_or("");
            let Some(date) = parse_date(raw_date, &self.config.date_formats) else {
                stats.bad_dates += 1;
                debug!(
                    "{}: record {} has unparsable date '{}'",
                    filename,
                    record_num + 1,
                    raw_date
                );
                continue;
            };

            let mut measurements = Measurements::default();
            let mut station_label = None;

            for (idx, column) in layout.iter().enumerate() {
                let Some(column) = column else { continue };
                let raw = record.get(idx).unwrap_or("");

                if *column == CanonicalColumn::StationName {
                    if !raw.is_empty() {
                        station_label = Some(raw.to_string());
                    }
                    continue;
                }
                if !column.is_measurement() {
                    continue;
                }

                let (value, coerced) = parse_measurement(raw);
                if coerced {
                    stats.coerced_values += 1;
                }
                set_measurement(&mut measurements, *column, value);
            }

            if measurements.is_empty() {
                stats.empty_rows += 1;
                continue;
            }

            stats.parsed_successfully += 1;
            rows.push(CanonicalRow {
                station_label,
                date,
                measurements,
            });
        }

        Ok((rows, stats))
    }

    fn metadata(&self, source: &SourceFile, scan: &[&str], rows: &[CanonicalRow]) -> FileMetadata {
        let from_filename = parse_filename(&source.filename);
        let title = scan
            .iter()
            .find_map(|line| self.title_pattern.captures(line))
            .map(|caps| {
                (
                    caps[1].trim().trim_end_matches(',').trim().to_string(),
                    state_code_from_name(&caps[2]),
                )
            });

        let station_label = rows
            .iter()
            .find_map(|row| row.station_label.clone())
            .or_else(|| title.as_ref().map(|(name, _)| name.clone()))
            .or_else(|| {
                from_filename
                    .as_ref()
                    .map(|(location, _)| location.replace('_', " ").to_uppercase())
            });

        let state = title
            .as_ref()
            .and_then(|(_, state)| *state)
            .or_else(|| source.parent_dir.as_deref().and_then(state_code_from_dir))
            .map(str::to_string);

        FileMetadata {
            station_label,
            station_code: from_filename
                .as_ref()
                .map(|(location, _)| location.to_uppercase()),
            state,
            year_month: from_filename.map(|(_, month)| month),
        }
    }
}

/// Map a candidate header line to a column layout. A line qualifies when
/// it names a date column and at least one station or measurement column.
fn header_layout(line: &str) -> Option<Vec<Option<CanonicalColumn>>> {
    let mut layout: Vec<Option<CanonicalColumn>> = Vec::new();
    for field in split_record(line) {
        let column = canonical_column(&field).filter(|c| !layout.contains(&Some(*c)));
        layout.push(column);
    }

    let has_date = layout.contains(&Some(CanonicalColumn::Date));
    let has_other = layout
        .iter()
        .flatten()
        .any(|c| *c != CanonicalColumn::Date);

    (has_date && has_other).then_some(layout)
}

fn split_record(line: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());

    reader
        .records()
        .next()
        .and_then(|r| r.ok())
        .map(|record| record.iter().map(str::to_string).collect())
        .unwrap_or_default()
}

fn set_measurement(m: &mut Measurements, column: CanonicalColumn, value: Option<f64>) {
    let slot = match column {
        CanonicalColumn::Evapotranspiration => &mut m.evapotranspiration_mm,
        CanonicalColumn::Rainfall => &mut m.rainfall_mm,
        CanonicalColumn::PanEvaporation => &mut m.pan_evaporation_mm,
        CanonicalColumn::MaxTemperature => &mut m.max_temperature,
        CanonicalColumn::MinTemperature => &mut m.min_temperature,
        CanonicalColumn::MaxHumidity => &mut m.max_relative_humidity,
        CanonicalColumn::MinHumidity => &mut m.min_relative_humidity,
        CanonicalColumn::WindSpeed => &mut m.wind_speed_ms,
        CanonicalColumn::SolarRadiation => &mut m.solar_radiation_mj,
        CanonicalColumn::StationName | CanonicalColumn::Date => return,
    };
    *slot = value;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig::default()).unwrap()
    }

    fn source(name: &str) -> SourceFile {
        SourceFile {
            filename: name.to_string(),
            parent_dir: Some("nsw".to_string()),
        }
    }

    #[test]
    fn test_column_key_strips_units_and_windows() {
        assert_eq!(column_key("  Rain (mm) 0900-0900 "), "rain");
        assert_eq!(column_key("Maximum temperature (°C)"), "maximum temperature");
        assert_eq!(column_key("Evapo-transpiration (mm) 0000-2400"), "evapotranspiration");
        assert_eq!(column_key("Average 10m wind speed (m/sec)"), "average 10m wind speed");
    }

    #[test]
    fn test_unknown_columns_ignored() {
        assert_eq!(canonical_column("Quality flag"), None);
        assert_eq!(
            canonical_column("Solar radiation (MJ/sq m)"),
            Some(CanonicalColumn::SolarRadiation)
        );
    }

    #[test]
    fn test_parse_measurement_placeholders() {
        assert_eq!(parse_measurement(""), (None, false));
        assert_eq!(parse_measurement(" - "), (None, false));
        assert_eq!(parse_measurement("N/A"), (None, false));
        assert_eq!(parse_measurement("##"), (None, false));
        assert_eq!(parse_measurement("12.4"), (Some(12.4), false));
        assert_eq!(parse_measurement("12.4*"), (None, true));
        assert_eq!(parse_measurement("inf"), (None, true));
    }

    #[test]
    fn test_parse_date_fallback_order() {
        let formats = NormalizerConfig::default().date_formats;
        assert_eq!(
            parse_date("01/02/2023", &formats),
            NaiveDate::from_ymd_opt(2023, 2, 1)
        );
        assert_eq!(
            parse_date("2023-02-01", &formats),
            NaiveDate::from_ymd_opt(2023, 2, 1)
        );
        // Day 13 cannot be a month, so only the US format accepts it.
        assert_eq!(
            parse_date("02/13/2023", &formats),
            NaiveDate::from_ymd_opt(2023, 2, 13)
        );
        assert_eq!(parse_date("Totals:", &formats), None);
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("sydney_airport-202301.csv"),
            Some(("sydney_airport".to_string(), "202301".to_string()))
        );
        assert_eq!(
            parse_filename("albion_park-shellharbour-202212.csv"),
            Some(("albion_park-shellharbour".to_string(), "202212".to_string()))
        );
        assert_eq!(parse_filename("readme.txt"), None);
    }

    #[test]
    fn test_header_with_units_line() {
        let content = "\
Daily Weather Observations for SYDNEY AIRPORT AMO, New South Wales for January 2023
Prepared at 10:00 UTC

Station Name,Date,Evapotranspiration (mm) 0000-2400,Rain (mm) 0900-0900,Pan evaporation (mm) 0900-0900,Maximum temperature (°C),Minimum temperature (°C),Maximum relative humidity (%),Minimum relative humidity (%),Average 10m wind speed (m/sec),Solar radiation (MJ/sq m)
,,(mm),(mm),(mm),(°C),(°C),(%),(%),(m/sec),(MJ/sq m)
SYDNEY AIRPORT AMO,01/01/2023,6.2,0.0,,30.1,19.5,88,45,5.1,29.4
SYDNEY AIRPORT AMO,02/01/2023,5.1,3.2,,26.0,20.2,95,60,4.2,21.0
";
        let result = normalizer()
            .normalize(&source("sydney_airport-202301.csv"), content.as_bytes())
            .unwrap();

        assert_eq!(
            result.region,
            DataRegion::Header {
                line: 3,
                units_line: true
            }
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.stats.skipped(), 0);

        let first = &result.rows[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(first.measurements.max_temperature, Some(30.1));
        assert_eq!(first.measurements.rainfall_mm, Some(0.0));
        assert_eq!(first.measurements.pan_evaporation_mm, None);
        assert_eq!(first.measurements.solar_radiation_mj, Some(29.4));

        assert_eq!(
            result.metadata.station_label.as_deref(),
            Some("SYDNEY AIRPORT AMO")
        );
        assert_eq!(result.metadata.state.as_deref(), Some("NSW"));
        assert_eq!(result.metadata.station_code.as_deref(), Some("SYDNEY_AIRPORT"));
        assert_eq!(result.metadata.year_month.as_deref(), Some("202301"));
    }

    #[test]
    fn test_header_without_units_line() {
        let content = "\
Date,Rain (mm),Maximum temperature (°C)
2023-01-01,1.0,25.0
2023-01-02,,26.5
";
        let result = normalizer()
            .normalize(&source("cobar-202301.csv"), content.as_bytes())
            .unwrap();

        assert_eq!(
            result.region,
            DataRegion::Header {
                line: 0,
                units_line: false
            }
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1].measurements.rainfall_mm, None);
        // No station column and no title: the label comes from the filename.
        assert_eq!(result.metadata.station_label.as_deref(), Some("COBAR"));
    }

    #[test]
    fn test_default_offset_when_no_header() {
        let mut content = String::new();
        for i in 0..8 {
            content.push_str(&format!("preamble line {}\n", i));
        }
        content.push_str("COBAR MO,15/01/2023,7.0,0.2,9.8,35.2,21.0,60,18,3.3,30.1\n");

        let result = normalizer()
            .normalize(&source("cobar-202301.csv"), content.as_bytes())
            .unwrap();

        assert_eq!(result.region, DataRegion::DefaultOffset(8));
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].measurements.max_temperature, Some(35.2));
        assert_eq!(result.rows[0].station_label.as_deref(), Some("COBAR MO"));
    }

    #[test]
    fn test_bad_rows_are_counted_not_fatal() {
        let content = "\
Station Name,Date,Rain (mm),Maximum temperature (°C)
COBAR,01/01/2023,1.0,30.0
COBAR,not-a-date,1.0,30.0
COBAR,03/01/2023,,
COBAR,04/01/2023,abc,31.0

Totals:,,2.0,
";
        let result = normalizer()
            .normalize(&source("cobar-202301.csv"), content.as_bytes())
            .unwrap();

        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.stats.bad_dates, 2);
        assert_eq!(result.stats.empty_rows, 1);
        assert_eq!(result.stats.coerced_values, 1);
        assert_eq!(result.rows[1].measurements.rainfall_mm, None);
        assert_eq!(result.rows[1].measurements.max_temperature, Some(31.0));
    }

    #[test]
    fn test_file_without_valid_rows_is_empty_not_error() {
        let content = "Station Name,Date,Rain (mm)\nCOBAR,??,1.0\n";
        let result = normalizer()
            .normalize(&source("cobar-202301.csv"), content.as_bytes())
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.stats.bad_dates, 1);
    }

    #[test]
    fn test_latin1_degree_sign_in_header() {
        let mut bytes = b"Station Name,Date,Maximum temperature (\xB0C)\n".to_vec();
        bytes.extend_from_slice(b"COBAR,01/01/2023,30.0\n");

        let result = normalizer()
            .normalize(&source("cobar-202301.csv"), &bytes)
            .unwrap();
        assert_eq!(result.encoding, Some(Encoding::Windows1252));
        assert_eq!(result.rows.len(), 1);
    }
}
