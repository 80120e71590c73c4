//! Resolve coordinates to a human-readable place name.

use std::fmt;

use metrics::{counter, describe_counter};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    cities::CountryCode,
    country_cache::{CountryCache, LoadedCountries},
    loader::LoadError,
    nearest::find_nearest_within_radius,
};

/// Errors returned by [`Resolver::resolve`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The caller asked for something that makes no sense.
    #[error("{0}")]
    InvalidRequest(String),

    /// We couldn't load any of our default countries.
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// The answer to a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaceLabel {
    /// We found a city close enough to the query.
    Found {
        name: String,
        country: CountryCode,
        distance_km: f64,
    },
    /// Nothing was close enough. This is a normal answer, not an error.
    Unknown,
}

impl PlaceLabel {
    pub fn is_found(&self) -> bool {
        matches!(self, PlaceLabel::Found { .. })
    }
}

impl fmt::Display for PlaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceLabel::Found { name, country, .. } => write!(f, "{}, {}", name, country),
            PlaceLabel::Unknown => "Unknown".fmt(f),
        }
    }
}

/// Answers "where is this?" using our cached gazetteers.
pub struct Resolver {
    /// Our loaded countries.
    cache: CountryCache,

    /// Countries to search when the caller doesn't say.
    default_countries: Vec<CountryCode>,

    /// How far away a city may be when the caller doesn't say.
    default_max_radius_km: f64,
}

impl Resolver {
    /// Create a new resolver.
    pub fn new(
        cache: CountryCache,
        default_countries: Vec<CountryCode>,
        default_max_radius_km: f64,
    ) -> Resolver {
        describe_counter!("reversegeocoder.lookups.total", "Coordinates resolved");
        Resolver {
            cache,
            default_countries,
            default_max_radius_km,
        }
    }

    /// The countries we search by default.
    pub fn default_countries(&self) -> &[CountryCode] {
        &self.default_countries
    }

    /// Load our default countries now, so the first requests don't have to
    /// wait.
    pub async fn preload(&self) -> Result<LoadedCountries, LoadError> {
        self.cache.get_or_load_many(&self.default_countries).await
    }

    /// Find the name of the place nearest to `(latitude, longitude)`.
    ///
    /// `countries` and `max_radius_km` override our defaults. An empty country
    /// list also means "use the defaults".
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(
        &self,
        latitude: f64,
        longitude: f64,
        countries: Option<&[CountryCode]>,
        max_radius_km: Option<f64>,
    ) -> Result<PlaceLabel, ResolveError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ResolveError::InvalidRequest(format!(
                "latitude must be between -90 and 90, got {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ResolveError::InvalidRequest(format!(
                "longitude must be between -180 and 180, got {}",
                longitude
            )));
        }
        let max_radius_km = max_radius_km.unwrap_or(self.default_max_radius_km);
        if max_radius_km.is_nan() || max_radius_km < 0.0 {
            return Err(ResolveError::InvalidRequest(format!(
                "max_radius_km must be a non-negative number, got {}",
                max_radius_km
            )));
        }
        let (countries, overridden) = match countries {
            Some(countries) if !countries.is_empty() => (countries, true),
            _ => (&self.default_countries[..], false),
        };

        let loaded = match self.cache.get_or_load_many(countries).await {
            Ok(loaded) => loaded,
            // Only countries the caller picked failed, so it's a bad request.
            Err(err @ LoadError::AllCountriesFailed { .. }) if overridden => {
                return Err(ResolveError::InvalidRequest(err.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let label =
            match find_nearest_within_radius(loaded.cities(), latitude, longitude, max_radius_km)
            {
                Some(nearest) => PlaceLabel::Found {
                    name: nearest.city.name.clone(),
                    country: nearest.city.country,
                    distance_km: nearest.distance_km,
                },
                None => PlaceLabel::Unknown,
            };

        let result = if label.is_found() { "found" } else { "unknown" };
        counter!("reversegeocoder.lookups.total", 1, "result" => result);
        debug!(%label, "resolved");
        Ok(label)
    }
}

#[cfg(test)]
use crate::country_cache::CountingSource;

#[cfg(test)]
fn test_resolver(default_countries: &str) -> Resolver {
    let cache = CountryCache::new(Box::new(CountingSource::default()));
    Resolver::new(
        cache,
        CountryCode::parse_list(default_countries).unwrap(),
        100.0,
    )
}

#[tokio::test]
async fn resolves_capitals() {
    let resolver = test_resolver("DE");
    let de = CountryCode::parse_list("DE").unwrap();
    let fr = CountryCode::parse_list("FR").unwrap();

    let label = resolver
        .resolve(52.5200, 13.4050, Some(&de[..]), None)
        .await
        .unwrap();
    assert_eq!(label.to_string(), "Berlin, DE");

    let label = resolver
        .resolve(48.8566, 2.3522, Some(&fr[..]), None)
        .await
        .unwrap();
    assert!(label.to_string().contains("Paris"));
    assert_eq!(label.to_string(), "Paris, FR");
}

#[tokio::test]
async fn uses_default_countries() {
    let resolver = test_resolver("FR,DE");
    let label = resolver.resolve(52.5200, 13.4050, None, None).await.unwrap();
    assert_eq!(label.to_string(), "Berlin, DE");
    let label = resolver
        .resolve(48.8566, 2.3522, Some(&[][..]), None)
        .await
        .unwrap();
    assert_eq!(label.to_string(), "Paris, FR");
}

#[tokio::test]
async fn far_away_coordinates_are_unknown() {
    let resolver = test_resolver("DE");
    // The middle of the Atlantic.
    let label = resolver.resolve(30.0, -40.0, None, None).await.unwrap();
    assert_eq!(label, PlaceLabel::Unknown);
    assert_eq!(label.to_string(), "Unknown");

    // But a big enough radius will find something.
    let label = resolver
        .resolve(30.0, -40.0, None, Some(10_000.0))
        .await
        .unwrap();
    assert!(label.is_found());
}

#[tokio::test]
async fn zero_radius_matches_exact_coordinates() {
    let resolver = test_resolver("DE");
    let label = resolver
        .resolve(52.52437, 13.41053, None, Some(0.0))
        .await
        .unwrap();
    assert_eq!(label.to_string(), "Berlin, DE");
}

#[tokio::test]
async fn rejects_invalid_coordinates() {
    let resolver = test_resolver("DE");
    for (lat, lon, radius) in [
        (90.1, 0.0, None),
        (-91.0, 0.0, None),
        (0.0, 180.5, None),
        (f64::NAN, 0.0, None),
        (0.0, f64::INFINITY, None),
        (0.0, 0.0, Some(-1.0)),
        (0.0, 0.0, Some(f64::NAN)),
    ] {
        let result = resolver.resolve(lat, lon, None, radius).await;
        assert!(
            matches!(result, Err(ResolveError::InvalidRequest(_))),
            "accepted {} {} {:?}",
            lat,
            lon,
            radius
        );
    }
}

#[tokio::test]
async fn missing_default_data_is_an_error() {
    let resolver = test_resolver("ZZ");
    let result = resolver.resolve(52.52, 13.405, None, None).await;
    assert!(matches!(
        result,
        Err(ResolveError::Load(LoadError::AllCountriesFailed { .. }))
    ));

    // A partial failure still answers.
    let mixed = CountryCode::parse_list("ZZ,DE").unwrap();
    let label = resolver
        .resolve(52.52, 13.405, Some(&mixed[..]), None)
        .await
        .unwrap();
    assert_eq!(label.to_string(), "Berlin, DE");
}

#[tokio::test]
async fn requesting_only_missing_countries_is_invalid() {
    let resolver = test_resolver("DE");
    let missing = CountryCode::parse_list("ZZ,YY").unwrap();
    match resolver
        .resolve(52.52, 13.405, Some(&missing[..]), None)
        .await
    {
        Err(ResolveError::InvalidRequest(message)) => {
            assert!(message.contains("ZZ"), "{}", message);
            assert!(message.contains("YY"), "{}", message);
        }
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
}
