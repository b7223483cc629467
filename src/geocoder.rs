use crate::config::GeocodingConfig;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::resolver::strip_parentheses;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Latitude/longitude envelope a geocoding hit must fall inside to be
/// believed. Defaults to mainland Australia plus Tasmania.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Default for GeoBounds {
    fn default() -> Self {
        Self {
            min_lat: -45.0,
            max_lat: -10.0,
            min_lon: 110.0,
            max_lon: 155.0,
        }
    }
}

impl GeoBounds {
    pub fn is_valid(&self) -> bool {
        self.min_lat < self.max_lat
            && self.min_lon < self.max_lon
            && (-90.0..=90.0).contains(&self.min_lat)
            && (-90.0..=90.0).contains(&self.max_lat)
            && (-180.0..=180.0).contains(&self.min_lon)
            && (-180.0..=180.0).contains(&self.max_lon)
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

/// A free-text place lookup. Implementations return the provider's best
/// hit, if any, without judging whether it is plausible.
#[allow(async_fn_in_trait)]
pub trait Geocoder {
    async fn search(&self, query: &str) -> Result<Option<GeocodeHit>>;
}

/// Enforces a minimum spacing between consecutive requests by sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Wait until at least `min_interval` has passed since the previous
    /// call returned.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last {
            let ready_at = last + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

/// Client for a Nominatim-compatible search endpoint.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    country_code: String,
    limiter: Mutex<RateLimiter>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            country_code: config.country_code.clone(),
            limiter: Mutex::new(RateLimiter::new(Duration::from_millis(
                config.min_interval_ms,
            ))),
        })
    }
}

impl Geocoder for NominatimGeocoder {
    async fn search(&self, query: &str) -> Result<Option<GeocodeHit>> {
        self.limiter.lock().await.acquire().await;

        debug!("Geocoding query '{}'", query);

        let places: Vec<Place> = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", self.country_code.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let latitude = place
            .lat
            .parse::<f64>()
            .map_err(|_| AppError::Geocode(format!("Invalid latitude '{}'", place.lat)))?;
        let longitude = place
            .lon
            .parse::<f64>()
            .map_err(|_| AppError::Geocode(format!("Invalid longitude '{}'", place.lon)))?;

        Ok(Some(GeocodeHit {
            latitude,
            longitude,
            display_name: place.display_name,
        }))
    }
}

const AIRPORT_WORDS: &[&str] = &["airport", "aero", "aerodrome", "amo", "raaf"];

/// Lookup queries for one station, most specific first, without repeats.
pub fn search_queries(label: &str, state: Option<&str>, country: &str) -> Vec<String> {
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    if label.is_empty() {
        return Vec::new();
    }

    let without_airport = label
        .split_whitespace()
        .filter(|word| {
            let bare: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            !AIRPORT_WORDS.contains(&bare.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ");

    let without_parens = strip_parentheses(&label);

    let mut candidates = vec![
        format!("{}, {}", label, country),
        format!("{} weather station, {}", label, country),
        format!("{} airport, {}", label, country),
    ];
    if let Some(state) = state.filter(|s| !s.trim().is_empty()) {
        candidates.push(format!("{}, {}, {}", label, state.trim(), country));
    }
    if !without_airport.is_empty() {
        candidates.push(format!("{}, {}", without_airport, country));
    }
    if !without_parens.is_empty() {
        candidates.push(format!("{}, {}", without_parens, country));
    }

    let mut queries: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !queries.contains(&candidate) {
            queries.push(candidate);
        }
    }
    queries
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupOutcome {
    pub hit: Option<GeocodeHit>,
    pub queries_tried: usize,
    pub rejected_out_of_bounds: usize,
    pub errors: usize,
}

/// Runs the query sequence for a station and applies the envelope check.
pub struct StationLocator<G> {
    geocoder: G,
    bounds: GeoBounds,
    country: String,
}

impl<G: Geocoder> StationLocator<G> {
    pub fn new(geocoder: G, bounds: GeoBounds, country: impl Into<String>) -> Self {
        Self {
            geocoder,
            bounds,
            country: country.into(),
        }
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }

    /// Try each query until one returns a hit inside the envelope. Lookup
    /// errors are logged and count as "not found" for that query.
    pub async fn locate(&self, label: &str, state: Option<&str>) -> LookupOutcome {
        let mut outcome = LookupOutcome::default();

        for query in search_queries(label, state, &self.country) {
            outcome.queries_tried += 1;

            match self.geocoder.search(&query).await {
                Ok(Some(hit)) if self.bounds.contains(hit.latitude, hit.longitude) => {
                    debug!(
                        "Geocoded '{}' via '{}' to ({:.4}, {:.4}) {}",
                        label, query, hit.latitude, hit.longitude, hit.display_name
                    );
                    outcome.hit = Some(hit);
                    return outcome;
                }
                Ok(Some(hit)) => {
                    outcome.rejected_out_of_bounds += 1;
                    debug!(
                        "Discarding out-of-bounds hit for '{}': ({:.4}, {:.4}) {}",
                        query, hit.latitude, hit.longitude, hit.display_name
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    outcome.errors += 1;
                    warn!("Geocoding lookup '{}' failed: {}", query, e);
                }
            }
        }

        outcome
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_stations: Option<usize>,
    pub dry_run: bool,
    pub per_request_delay: Duration,
    pub per_batch_delay: Duration,
}

impl BatchOptions {
    /// Wall-clock time spent in deliberate pauses for `stations` lookups,
    /// excluding the lookups themselves.
    pub fn estimated_duration(&self, stations: usize) -> Duration {
        if stations == 0 {
            return Duration::ZERO;
        }
        let batch_size = self.batch_size.max(1);
        let gaps = (stations - 1) as u32;
        let batch_gaps = ((stations - 1) / batch_size) as u32;

        self.per_request_delay * (gaps - batch_gaps) + self.per_batch_delay * batch_gaps
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodeStats {
    pub candidates: usize,
    pub attempted: usize,
    pub located: usize,
    pub not_found: usize,
    pub rejected_out_of_bounds: usize,
    pub lookup_errors: usize,
    /// Stations located but whose coordinates could not be stored.
    pub write_errors: usize,
    pub estimated: Duration,
}

/// Fill in coordinates for registry stations that lack them.
///
/// Stations are visited in batches; `per_request_delay` separates
/// consecutive stations and `per_batch_delay` replaces it at batch
/// boundaries. A dry run reports candidates and the estimated duration
/// without calling the provider or writing anything.
pub async fn geocode_missing<S: Store, G: Geocoder>(
    store: &S,
    locator: &StationLocator<G>,
    options: &BatchOptions,
) -> Result<GeocodeStats> {
    let stations = store.stations_missing_coordinates(options.max_stations).await?;
    let batch_size = options.batch_size.max(1);

    let mut stats = GeocodeStats {
        candidates: stations.len(),
        estimated: options.estimated_duration(stations.len()),
        ..Default::default()
    };

    info!(
        "{} stations without coordinates, batch size {}, estimated pause time {:?}",
        stats.candidates, batch_size, stats.estimated
    );

    if options.dry_run {
        for station in &stations {
            info!(
                "[dry run] would geocode '{}' ({})",
                station.name,
                station.state.as_deref().unwrap_or("-")
            );
        }
        return Ok(stats);
    }

    for (idx, station) in stations.iter().enumerate() {
        if idx > 0 {
            let delay = if idx % batch_size == 0 {
                info!(
                    "Batch {} done ({} located so far), pausing {:?}",
                    idx / batch_size,
                    stats.located,
                    options.per_batch_delay
                );
                options.per_batch_delay
            } else {
                options.per_request_delay
            };
            tokio::time::sleep(delay).await;
        }

        stats.attempted += 1;
        let outcome = locator.locate(&station.name, station.state.as_deref()).await;
        stats.rejected_out_of_bounds += outcome.rejected_out_of_bounds;
        stats.lookup_errors += outcome.errors;

        match outcome.hit {
            Some(hit) => {
                match store
                    .set_station_coordinates(station.id, hit.latitude, hit.longitude)
                    .await
                {
                    Ok(_) => {
                        stats.located += 1;
                        info!(
                            "Located '{}' at ({:.4}, {:.4})",
                            station.name, hit.latitude, hit.longitude
                        );
                    }
                    Err(e) => {
                        stats.write_errors += 1;
                        error!("Could not store coordinates for '{}': {}", station.name, e);
                    }
                }
            }
            None => {
                stats.not_found += 1;
                warn!(
                    "No in-bounds result for '{}' after {} queries",
                    station.name, outcome.queries_tried
                );
            }
        }
    }

    Ok(stats)
}
