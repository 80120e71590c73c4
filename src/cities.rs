//! Places from the gazetteer, and the per-country collections that hold them.

use std::{fmt, str::FromStr};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::memory_used::MemoryUsed;

/// A country code that is not two ASCII letters.
#[derive(Debug, Error)]
#[error("invalid country code {code:?} (expected two ASCII letters)")]
pub struct CountryCodeError {
    code: String,
}

/// An ISO-3166 alpha-2 country code, stored upper-cased.
///
/// Because this can only ever contain two ASCII letters, it's also safe to use
/// when building file names.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    /// The code as a string, like `"DE"`.
    pub fn as_str(&self) -> &str {
        // We only ever store ASCII letters.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }

    /// Parse a comma-separated list of country codes, ignoring blank entries.
    pub fn parse_list(s: &str) -> Result<Vec<CountryCode>, CountryCodeError> {
        s.split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(CountryCode::from_str)
            .collect()
    }
}

impl FromStr for CountryCode {
    type Err = CountryCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            &[a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Ok(CountryCode([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => Err(CountryCodeError { code: s.to_owned() }),
        }
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl fmt::Debug for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for CountryCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A named place. We may hold tens of thousands of these per country, so we
/// only keep what a lookup needs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct City {
    /// The place name. Never empty.
    pub name: String,
    /// The country this place belongs to.
    pub country: CountryCode,
    /// Degrees north, in `-90.0..=90.0`.
    pub latitude: f64,
    /// Degrees east, in `-180.0..=180.0`.
    pub longitude: f64,
}

impl City {
    /// Build a `City`, returning `None` if any field is out of range.
    pub fn new(
        name: &str,
        country: CountryCode,
        latitude: f64,
        longitude: f64,
    ) -> Option<City> {
        if name.is_empty()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return None;
        }
        Some(City {
            name: name.to_owned(),
            country,
            latitude,
            longitude,
        })
    }
}

/// Counts collected while loading a country.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoadStats {
    /// Rows seen in the source.
    pub rows_read: usize,
    /// Rows dropped because they were truncated or had unparsable fields.
    pub rows_malformed: usize,
    /// Well-formed rows rejected by the loader policy.
    pub rows_filtered: usize,
    /// Rows dropped because an identical place was already present.
    pub duplicates_removed: usize,
}

/// All the cities we know about for a single country, sorted by name.
///
/// Immutable once built.
#[derive(Debug)]
pub struct CityCollection {
    country: CountryCode,
    cities: Vec<City>,
    stats: LoadStats,
}

impl CityCollection {
    /// Build a collection from unsorted cities. We sort by name (then by
    /// coordinates, so the order is fully deterministic) and collapse exact
    /// duplicates.
    pub fn new(
        country: CountryCode,
        mut cities: Vec<City>,
        mut stats: LoadStats,
    ) -> CityCollection {
        cities.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then(a.latitude.total_cmp(&b.latitude))
                .then(a.longitude.total_cmp(&b.longitude))
        });
        let before = cities.len();
        cities.dedup();
        stats.duplicates_removed += before - cities.len();
        cities.shrink_to_fit();
        CityCollection {
            country,
            cities,
            stats,
        }
    }

    /// The country this collection was loaded for.
    pub fn country(&self) -> CountryCode {
        self.country
    }

    /// Iterate over our cities in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, City> {
        self.cities.iter()
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }

    /// What happened while loading this collection.
    pub fn stats(&self) -> LoadStats {
        self.stats
    }
}

impl MemoryUsed for CityCollection {
    fn memory_owned(&self) -> usize {
        self.cities.memory_owned()
    }
}

impl<'a> IntoIterator for &'a CityCollection {
    type Item = &'a City;
    type IntoIter = std::slice::Iter<'a, City>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
pub(crate) fn city(name: &str, country: &str, latitude: f64, longitude: f64) -> City {
    City::new(name, country.parse().unwrap(), latitude, longitude).unwrap()
}

#[test]
fn country_codes_are_normalized_and_validated() {
    assert_eq!("de".parse::<CountryCode>().unwrap().as_str(), "DE");
    assert_eq!("Fr".parse::<CountryCode>().unwrap().to_string(), "FR");
    for bad in ["", "D", "DEU", "1A", "../", "É"] {
        assert!(bad.parse::<CountryCode>().is_err(), "accepted {:?}", bad);
    }
}

#[test]
fn country_code_lists_skip_blanks() {
    let codes = CountryCode::parse_list(" de, ,fr,").unwrap();
    assert_eq!(
        codes.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        ["DE", "FR"]
    );
    assert!(CountryCode::parse_list("DE,XYZ").is_err());
}

#[test]
fn city_rejects_out_of_range_values() {
    let de = "DE".parse().unwrap();
    assert!(City::new("", de, 0.0, 0.0).is_none());
    assert!(City::new("X", de, 90.5, 0.0).is_none());
    assert!(City::new("X", de, 0.0, -180.5).is_none());
    assert!(City::new("X", de, f64::NAN, 0.0).is_none());
    assert!(City::new("X", de, -90.0, 180.0).is_some());
}

#[test]
fn collections_are_sorted_and_deduplicated() {
    let collection = CityCollection::new(
        "DE".parse().unwrap(),
        vec![
            city("Munich", "DE", 48.137, 11.575),
            city("Berlin", "DE", 52.52, 13.405),
            city("Munich", "DE", 48.137, 11.575),
            city("Aachen", "DE", 50.776, 6.084),
        ],
        LoadStats::default(),
    );
    let names = collection.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["Aachen", "Berlin", "Munich"]);
    assert_eq!(collection.stats().duplicates_removed, 1);
}
