use crate::encoding::Encoding;
use crate::error::{AppError, Result};
use crate::geocoder::GeoBounds;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Remote archive settings: where the per-state collections live and how
/// politely to walk them.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub collections: Vec<String>,
    #[serde(default = "default_months_back")]
    pub months_back: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_seconds")]
    pub backoff_step_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_location_delay_ms")]
    pub location_delay_ms: u64,
    #[serde(default = "default_collection_delay_seconds")]
    pub collection_delay_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub locations: LocationFilter,
}

fn default_months_back() -> u32 {
    12
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_step_seconds() -> u64 {
    5
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_location_delay_ms() -> u64 {
    2000
}

fn default_collection_delay_seconds() -> u64 {
    30
}

fn default_user_agent() -> String {
    "bom-ingest/0.1.0".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocationFilter {
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl LocationFilter {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Location directory names are matched case-insensitively against the
    /// configured glob patterns. An empty filter accepts everything.
    pub fn matches_location(&self, location: &str) -> bool {
        if self.is_empty() {
            return true;
        }

        let location = location.to_lowercase();
        self.patterns.iter().any(|pattern| {
            glob::Pattern::new(&pattern.to_lowercase())
                .map(|p| p.matches(&location))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_encodings")]
    pub encodings: Vec<Encoding>,
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,
    #[serde(default = "default_header_scan_lines")]
    pub header_scan_lines: usize,
    #[serde(default = "default_data_offset")]
    pub default_data_offset: usize,
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
}

fn default_encodings() -> Vec<Encoding> {
    vec![Encoding::Utf8, Encoding::Windows1252, Encoding::Latin1]
}

fn default_probe_bytes() -> usize {
    1024
}

fn default_header_scan_lines() -> usize {
    15
}

fn default_data_offset() -> usize {
    8
}

fn default_date_formats() -> Vec<String> {
    ["%d/%m/%Y", "%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            encodings: default_encodings(),
            probe_bytes: default_probe_bytes(),
            header_scan_lines: default_header_scan_lines(),
            default_data_offset: default_data_offset(),
            date_formats: default_date_formats(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    #[serde(default)]
    pub geocoding: GeocodingConfig,
}

/// Acceptance threshold for fuzzy registry matches.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;

fn default_fuzzy_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
            geocoding: GeocodingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,
    #[serde(default = "default_geocoder_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_geocoder_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub bounds: GeoBounds,
}

fn default_geocoder_url() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

fn default_geocoder_user_agent() -> String {
    "bom-ingest/0.1.0 (station geocoding)".to_string()
}

fn default_country() -> String {
    "Australia".to_string()
}

fn default_country_code() -> String {
    "au".to_string()
}

/// Nominatim's usage policy allows at most one request per second.
fn default_min_interval_ms() -> u64 {
    1000
}

fn default_geocoder_timeout() -> u64 {
    10
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_geocoder_url(),
            user_agent: default_geocoder_user_agent(),
            country: default_country(),
            country_code: default_country_code(),
            min_interval_ms: default_min_interval_ms(),
            timeout_seconds: default_geocoder_timeout(),
            bounds: GeoBounds::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: usize,
    #[serde(default = "default_files_per_group")]
    pub files_per_group: usize,
    #[serde(default = "default_group_pause_seconds")]
    pub group_pause_seconds: u64,
    #[serde(default = "default_data_source")]
    pub data_source: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/bom_data")
}

fn default_commit_batch_size() -> usize {
    500
}

fn default_files_per_group() -> usize {
    50
}

fn default_group_pause_seconds() -> u64 {
    5
}

fn default_data_source() -> String {
    "BOM".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            commit_batch_size: default_commit_batch_size(),
            files_per_group: default_files_per_group(),
            group_pause_seconds: default_group_pause_seconds(),
            data_source: default_data_source(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
}

fn default_interval_minutes() -> u64 {
    24 * 60
}

fn default_initial_delay() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            initial_delay_seconds: default_initial_delay(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding `${VAR}` placeholders
    /// from the environment before deserializing.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Valid port ranges and connection bounds
    /// - Valid URL formats for the archive and the geocoder
    /// - Thresholds, bounding box and batch sizes within range
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        validate_http_url("source base_url", &self.source.base_url)?;

        if self.source.collections.is_empty() {
            return Err(AppError::Config(
                "At least one source collection must be configured (e.g. 'nsw')".to_string(),
            ));
        }

        if self.source.max_attempts == 0 {
            return Err(AppError::Config(
                "Source max_attempts must be at least 1".to_string(),
            ));
        }

        if self.source.months_back == 0 {
            return Err(AppError::Config(
                "Source months_back must be at least 1".to_string(),
            ));
        }

        for pattern in &self.source.locations.patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(AppError::Config(format!(
                    "Invalid location pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        if self.normalizer.encodings.is_empty() {
            return Err(AppError::Config(
                "At least one candidate encoding is required".to_string(),
            ));
        }

        if self.normalizer.date_formats.is_empty() {
            return Err(AppError::Config(
                "At least one date format is required".to_string(),
            ));
        }

        let threshold = self.resolver.fuzzy_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(AppError::Config(format!(
                "Resolver fuzzy_threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        let geocoding = &self.resolver.geocoding;
        validate_http_url("geocoding base_url", &geocoding.base_url)?;

        if geocoding.min_interval_ms < 1000 {
            return Err(AppError::Config(format!(
                "Geocoding min_interval_ms must be at least 1000, got {}",
                geocoding.min_interval_ms
            )));
        }

        if !geocoding.bounds.is_valid() {
            return Err(AppError::Config(format!(
                "Geocoding bounds are not a valid envelope: {:?}",
                geocoding.bounds
            )));
        }

        if self.ingest.commit_batch_size == 0 {
            return Err(AppError::Config(
                "Ingest commit_batch_size must be at least 1".to_string(),
            ));
        }

        if self.ingest.files_per_group == 0 {
            return Err(AppError::Config(
                "Ingest files_per_group must be at least 1".to_string(),
            ));
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_http_url(label: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::Config(format!("Invalid {} '{}': {}", label, value, e)))?;

    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(AppError::Config(format!(
            "{} must use http or https, got: {}",
            label,
            parsed.scheme()
        )));
    }

    Ok(())
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid placeholder pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
