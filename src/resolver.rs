use crate::db::models::{NewStation, Station};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::geocoder::{Geocoder, StationLocator};
use std::collections::HashMap;
use tracing::{debug, info};

/// Words that vary between sources without changing which site is meant.
pub const NOISE_TOKENS: &[&str] = &[
    "airport",
    "aero",
    "aerodrome",
    "raaf",
    "amo",
    "defence",
    "station",
    "research",
    "centre",
    "center",
];

/// Matching key for a station label.
///
/// Lowercases, drops parenthetical qualifiers with their contents, strips
/// punctuation, removes noise tokens as whole words and collapses
/// whitespace. A label made only of a qualifier or only of noise keeps
/// those words so the key is never empty for non-empty input.
pub fn normalize_name(label: &str) -> String {
    let lowered = label.to_lowercase();
    let unqualified = strip_parentheses(&lowered);
    let base = if tokenize(&unqualified).is_empty() {
        lowered.as_str()
    } else {
        unqualified.as_str()
    };

    let tokens = tokenize(base);
    let meaningful: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect();

    if meaningful.is_empty() {
        tokens.join(" ")
    } else {
        meaningful.join(" ")
    }
}

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Remove every `(...)` group, nested or not, and collapse whitespace.
pub fn strip_parentheses(label: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two keys in [0, 1]; 1.0 means identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Best registry candidate at or above `threshold`. Candidates with
/// coordinates win over those without, then higher similarity wins.
pub fn best_fuzzy_match<'a, I>(key: &str, candidates: I, threshold: f64) -> Option<(&'a Station, f64)>
where
    I: IntoIterator<Item = &'a Station>,
{
    let mut best_located: Option<(&Station, f64)> = None;
    let mut best_any: Option<(&Station, f64)> = None;

    for station in candidates {
        let score = similarity(key, &station.normalized_key);
        if score < threshold {
            continue;
        }

        let slot = if station.has_coordinates() {
            &mut best_located
        } else {
            &mut best_any
        };
        if slot.map_or(true, |(_, best)| score > best) {
            *slot = Some((station, score));
        }
    }

    best_located.or(best_any)
}

/// In-memory view of the station registry keyed by normalized key.
#[derive(Debug, Default)]
pub struct StationRegistry {
    by_key: HashMap<String, Station>,
    /// Label keys already resolved by fuzzy match, mapped to the
    /// registry key they resolved to.
    aliases: HashMap<String, String>,
}

impl StationRegistry {
    pub fn from_stations(stations: Vec<Station>) -> Self {
        Self {
            by_key: stations
                .into_iter()
                .map(|s| (s.normalized_key.clone(), s))
                .collect(),
            aliases: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Station> {
        self.by_key
            .get(key)
            .or_else(|| self.aliases.get(key).and_then(|k| self.by_key.get(k)))
    }

    pub fn insert(&mut self, station: Station) {
        self.by_key.insert(station.normalized_key.clone(), station);
    }

    fn remember_alias(&mut self, alias: String, key: String) {
        self.aliases.insert(alias, key);
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.by_key.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchMethod {
    Exact,
    Fuzzy { score: f64 },
    Geocoded,
    Provisional,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub station: Station,
    pub method: MatchMethod,
    pub created: bool,
}

/// Hints about a label taken from the file it appeared in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelHints<'a> {
    pub state: Option<&'a str>,
    pub station_code: Option<&'a str>,
}

pub struct StationResolver<G> {
    registry: StationRegistry,
    threshold: f64,
    locator: Option<StationLocator<G>>,
    data_source: String,
}

impl<G: Geocoder> StationResolver<G> {
    pub fn new(
        registry: StationRegistry,
        threshold: f64,
        locator: Option<StationLocator<G>>,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            threshold,
            locator,
            data_source: data_source.into(),
        }
    }

    /// Build the registry cache from the store once for a run.
    pub async fn load<S: Store>(
        store: &S,
        threshold: f64,
        locator: Option<StationLocator<G>>,
        data_source: impl Into<String>,
    ) -> Result<Self> {
        let registry = StationRegistry::from_stations(store.load_stations().await?);
        info!("Station registry loaded: {} stations", registry.len());
        Ok(Self::new(registry, threshold, locator, data_source))
    }

    pub fn registry(&self) -> &StationRegistry {
        &self.registry
    }

    /// Map a raw label to a canonical station: exact key, fuzzy match,
    /// external lookup, then a provisional station, first success wins.
    pub async fn resolve<S: Store>(
        &mut self,
        store: &S,
        label: &str,
        hints: LabelHints<'_>,
    ) -> Result<Resolution> {
        let key = normalize_name(label);
        if key.is_empty() {
            return Err(AppError::InvalidData(format!(
                "Station label '{}' has no usable characters",
                label
            )));
        }

        if let Some(station) = self.registry.get(&key) {
            return Ok(Resolution {
                station: station.clone(),
                method: MatchMethod::Exact,
                created: false,
            });
        }

        if let Some((station, score)) =
            best_fuzzy_match(&key, self.registry.stations(), self.threshold)
        {
            let station = station.clone();
            debug!(
                "Fuzzy matched '{}' to '{}' (score {:.3})",
                label, station.name, score
            );
            self.registry
                .remember_alias(key, station.normalized_key.clone());
            return Ok(Resolution {
                station,
                method: MatchMethod::Fuzzy { score },
                created: false,
            });
        }

        let located = match &self.locator {
            Some(locator) => locator.locate(label, hints.state).await.hit,
            None => None,
        };

        let (method, latitude, longitude) = match &located {
            Some(hit) => (MatchMethod::Geocoded, Some(hit.latitude), Some(hit.longitude)),
            None => (MatchMethod::Provisional, None, None),
        };

        let (station, created) = store
            .upsert_station(&NewStation {
                name: label.trim().to_string(),
                normalized_key: key,
                station_code: hints.station_code.map(str::to_string),
                state: hints.state.map(str::to_string),
                latitude,
                longitude,
                data_source: self.data_source.clone(),
            })
            .await?;

        info!(
            "Registered station '{}' ({:?}, key '{}')",
            station.name, method, station.normalized_key
        );
        self.registry.insert(station.clone());

        Ok(Resolution {
            station,
            method,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::geocoder::{GeoBounds, GeocodeHit};
    use chrono::Utc;

    struct FixedGeocoder(Option<GeocodeHit>);

    impl Geocoder for FixedGeocoder {
        async fn search(&self, _query: &str) -> Result<Option<GeocodeHit>> {
            Ok(self.0.clone())
        }
    }

    fn station(id: i32, name: &str, coords: Option<(f64, f64)>) -> Station {
        Station {
            id,
            name: name.to_string(),
            normalized_key: normalize_name(name),
            station_code: None,
            state: Some("NSW".to_string()),
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
            data_source: "BOM".to_string(),
            is_active: true,
            needs_geocoding: coords.is_none(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn resolver(stations: Vec<Station>) -> StationResolver<FixedGeocoder> {
        StationResolver::new(StationRegistry::from_stations(stations), 0.85, None, "BOM")
    }

    #[test]
    fn test_normalization_is_deterministic_across_spellings() {
        assert_eq!(normalize_name("Sydney Airport"), normalize_name("SYDNEY (AIRPORT)"));
        assert_eq!(normalize_name("Sydney Airport"), "sydney");
        assert_eq!(normalize_name("  Wagga Wagga AMO "), "wagga wagga");
        assert_eq!(normalize_name("Williamtown RAAF"), "williamtown");
    }

    #[test]
    fn test_parenthetical_qualifier_removed() {
        assert_eq!(normalize_name("MELBOURNE (OLYMPIC PARK)"), "melbourne");
        assert_eq!(
            normalize_name("MELBOURNE (OLYMPIC PARK)"),
            normalize_name("Melbourne")
        );
        assert_eq!(normalize_name("Mount Buller (Ski (Village))"), "mount buller");
    }

    #[test]
    fn test_qualifier_only_label_keeps_its_words() {
        assert_eq!(normalize_name("(Olympic Park)"), "olympic park");
        assert_eq!(normalize_name("(Airport)"), "airport");
    }

    #[test]
    fn test_noise_only_label_keeps_tokens() {
        assert_eq!(normalize_name("Research Station"), "research station");
        assert_eq!(normalize_name("---"), "");
    }

    #[test]
    fn test_noise_tokens_are_whole_words() {
        // "aerodrome" must not eat into "aeronautical".
        assert_eq!(normalize_name("Aeronautical Park"), "aeronautical park");
    }

    #[test]
    fn test_similarity_range() {
        assert_eq!(similarity("cobar", "cobar"), 1.0);
        assert!(similarity("moruya heads", "moruya head") > 0.9);
        assert!(similarity("cobar", "moruya heads") < 0.5);
    }

    #[test]
    fn test_best_match_prefers_coordinates() {
        let stations = vec![
            station(1, "PORT MACQUARIES", None),
            station(2, "PORT MACQUARIE W", Some((-31.43, 152.86))),
        ];

        let (matched, score) = best_fuzzy_match("port macquarie", &stations, 0.85).unwrap();
        assert_eq!(matched.id, 2);
        assert!(score >= 0.85);

        let coordless = vec![station(1, "PORT MACQUARIES", None)];
        let (matched, _) = best_fuzzy_match("port macquarie", &coordless, 0.85).unwrap();
        assert_eq!(matched.id, 1);
    }

    #[tokio::test]
    async fn test_close_label_resolves_to_registry_station() {
        let store = MemoryStore::new();
        let mut resolver = resolver(vec![station(1, "MORUYA HEADS", Some((-35.9, 150.15)))]);

        let resolution = resolver
            .resolve(&store, "Moruya Head", LabelHints::default())
            .await
            .unwrap();

        assert!(matches!(resolution.method, MatchMethod::Fuzzy { score } if score > 0.9));
        assert_eq!(resolution.station.id, 1);
        assert!(!resolution.created);
        assert!(store.stations().is_empty());

        let again = resolver
            .resolve(&store, "Moruya Head", LabelHints::default())
            .await
            .unwrap();
        assert_eq!(again.method, MatchMethod::Exact);
        assert_eq!(again.station.id, 1);
    }

    #[tokio::test]
    async fn test_distant_label_creates_provisional_station() {
        let store = MemoryStore::new();
        let mut resolver = resolver(vec![station(1, "MORUYA HEADS", Some((-35.9, 150.15)))]);

        let resolution = resolver
            .resolve(
                &store,
                "COBAR MO",
                LabelHints {
                    state: Some("NSW"),
                    station_code: Some("COBAR"),
                },
            )
            .await
            .unwrap();

        assert_eq!(resolution.method, MatchMethod::Provisional);
        assert!(resolution.created);
        assert!(resolution.station.needs_geocoding);
        assert_eq!(resolution.station.normalized_key, "cobar mo");
        assert_eq!(resolution.station.station_code.as_deref(), Some("COBAR"));

        let again = resolver
            .resolve(&store, "Cobar MO", LabelHints::default())
            .await
            .unwrap();
        assert_eq!(again.method, MatchMethod::Exact);
        assert_eq!(store.stations().len(), 1);
    }

    #[tokio::test]
    async fn test_geocoded_station_created_with_coordinates() {
        let store = MemoryStore::new();
        let locator = StationLocator::new(
            FixedGeocoder(Some(GeocodeHit {
                latitude: -30.09,
                longitude: 145.94,
                display_name: "Bourke, New South Wales, Australia".to_string(),
            })),
            GeoBounds::default(),
            "Australia",
        );
        let mut resolver =
            StationResolver::new(StationRegistry::default(), 0.85, Some(locator), "BOM");

        let resolution = resolver
            .resolve(&store, "BOURKE AIRPORT AWS", LabelHints::default())
            .await
            .unwrap();

        assert_eq!(resolution.method, MatchMethod::Geocoded);
        assert_eq!(resolution.station.latitude, Some(-30.09));
        assert!(!resolution.station.needs_geocoding);
    }

    #[tokio::test]
    async fn test_out_of_bounds_geocode_falls_back_to_provisional() {
        let store = MemoryStore::new();
        let locator = StationLocator::new(
            FixedGeocoder(Some(GeocodeHit {
                latitude: 51.5,
                longitude: -0.12,
                display_name: "London".to_string(),
            })),
            GeoBounds::default(),
            "Australia",
        );
        let mut resolver =
            StationResolver::new(StationRegistry::default(), 0.85, Some(locator), "BOM");

        let resolution = resolver
            .resolve(&store, "KEW", LabelHints::default())
            .await
            .unwrap();

        assert_eq!(resolution.method, MatchMethod::Provisional);
        assert!(resolution.station.latitude.is_none());
    }

    #[tokio::test]
    async fn test_empty_label_rejected() {
        let store = MemoryStore::new();
        let mut resolver = resolver(Vec::new());
        let result = resolver.resolve(&store, " () ", LabelHints::default()).await;
        assert!(matches!(result, Err(AppError::InvalidData(_))));
    }
}
