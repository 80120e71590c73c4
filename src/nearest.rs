//! Nearest-city search.
//!
//! We do a plain linear scan with the haversine formula. Our loader keeps each
//! country down to tens of thousands of places, so this is fast enough, and it
//! makes tie-breaking easy to reason about: the first city we see wins, and
//! collections are sorted by name.

use crate::cities::City;

/// Mean radius of the Earth, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points, in kilometers.
///
/// This treats the Earth as a sphere, which is fine for city-level answers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair past 1 for antipodal points.
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// The closest city to a query point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Nearest<'a> {
    /// The city we found.
    pub city: &'a City,
    /// How far away it is, in kilometers.
    pub distance_km: f64,
}

/// Find the city closest to `(latitude, longitude)`.
///
/// Returns `None` only if `cities` is empty. Ties go to whichever city comes
/// first.
pub fn find_nearest<'a, I>(cities: I, latitude: f64, longitude: f64) -> Option<Nearest<'a>>
where
    I: IntoIterator<Item = &'a City>,
{
    let mut best: Option<Nearest<'a>> = None;
    for city in cities {
        let distance_km = haversine_km(latitude, longitude, city.latitude, city.longitude);
        match best {
            // Keep what we have on ties, so earlier cities win.
            Some(ref current) if current.distance_km <= distance_km => {}
            _ => best = Some(Nearest { city, distance_km }),
        }
    }
    best
}

/// Find the city closest to `(latitude, longitude)`, but only if it's within
/// `max_km`.
///
/// If the nearest city is too far away, we return `None`. We never fall back
/// to some other city.
pub fn find_nearest_within_radius<'a, I>(
    cities: I,
    latitude: f64,
    longitude: f64,
    max_km: f64,
) -> Option<Nearest<'a>>
where
    I: IntoIterator<Item = &'a City>,
{
    find_nearest(cities, latitude, longitude).filter(|nearest| nearest.distance_km <= max_km)
}

#[cfg(test)]
use crate::{
    cities::{city, CityCollection},
    loader::{parse_fixture, FRANCE, GERMANY},
};

#[test]
fn haversine_matches_known_distances() {
    // Berlin to Paris is roughly 878 km.
    let d = haversine_km(52.52, 13.405, 48.8566, 2.3522);
    assert!((d - 878.0).abs() < 5.0, "got {}", d);
    assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);
    // Half the circumference, pole to pole.
    let d = haversine_km(90.0, 0.0, -90.0, 0.0);
    assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    // Antipodal points should not produce NaN.
    assert!(!haversine_km(0.0, 0.0, 0.0, 180.0).is_nan());
}

#[test]
fn finds_berlin_and_paris() {
    let germany = parse_fixture("DE", GERMANY);
    let nearest = find_nearest(&germany, 52.5200, 13.4050).unwrap();
    assert_eq!(nearest.city.name, "Berlin");
    assert!(nearest.distance_km < 2.0);

    let france = parse_fixture("FR", FRANCE);
    let nearest = find_nearest(&france, 48.8566, 2.3522).unwrap();
    assert_eq!(nearest.city.name, "Paris");
}

#[test]
fn nearest_is_deterministic() {
    let germany = parse_fixture("DE", GERMANY);
    let first = find_nearest(&germany, 51.0, 10.0).unwrap();
    for _ in 0..10 {
        assert_eq!(find_nearest(&germany, 51.0, 10.0).unwrap(), first);
    }
}

#[test]
fn ties_go_to_first_city_in_name_order() {
    let collection = CityCollection::new(
        "DE".parse().unwrap(),
        vec![
            city("Zeta", "DE", 50.0, 10.0),
            city("Alpha", "DE", 50.0, 10.0),
            city("Mu", "DE", 50.0, 10.0),
        ],
        Default::default(),
    );
    let nearest = find_nearest(&collection, 50.1, 10.0).unwrap();
    assert_eq!(nearest.city.name, "Alpha");
}

#[test]
fn radius_cuts_off_far_cities() {
    let germany = parse_fixture("DE", GERMANY);
    // Somewhere in the North Sea.
    assert!(find_nearest_within_radius(&germany, 55.0, 5.0, 50.0).is_none());
    assert!(find_nearest_within_radius(&germany, 55.0, 5.0, 1000.0).is_some());
}

#[test]
fn radius_is_monotonic() {
    let germany = parse_fixture("DE", GERMANY);
    let queries = [(52.52, 13.405), (48.0, 11.0), (51.0, 7.5), (54.0, 9.0)];
    let radii = [1.0, 10.0, 50.0, 100.0, 500.0, 2000.0];
    for (lat, lon) in queries {
        let mut found: Option<&City> = None;
        for r in radii {
            let hit = find_nearest_within_radius(&germany, lat, lon, r).map(|n| n.city);
            if let Some(previous) = found {
                assert_eq!(hit, Some(previous));
            }
            found = found.or(hit);
        }
    }
}

#[test]
fn empty_collection_finds_nothing() {
    let empty = CityCollection::new("DE".parse().unwrap(), vec![], Default::default());
    assert!(find_nearest(&empty, 0.0, 0.0).is_none());
    assert!(find_nearest_within_radius(&empty, 52.52, 13.405, f64::INFINITY).is_none());
}
