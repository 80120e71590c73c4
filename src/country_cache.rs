//! In-memory cache of loaded countries.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use futures::future::join_all;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::{
    cities::{City, CityCollection, CountryCode},
    loader::{GazetteerSource, LoadError},
    memory_used::MemoryUsed,
};

/// A cache slot for one country. The `OnceCell` makes sure that only one
/// caller parses a country, while everybody else waits for the result.
type Slot = Arc<OnceCell<Arc<CityCollection>>>;

/// Countries we've already loaded, so we only ever parse each one once.
///
/// Entries are never evicted. Failed loads are not cached, so a missing
/// country will be retried the next time somebody asks for it.
pub struct CountryCache {
    /// Where we load countries from.
    source: Box<dyn GazetteerSource>,

    /// One slot per country we've been asked for. We only hold this lock long
    /// enough to find or create a slot, and never across an `.await`. Lookups
    /// of countries we already know about only need a read lock.
    slots: RwLock<HashMap<CountryCode, Slot>>,

    /// Approximate memory used by everything we've loaded.
    bytes_loaded: AtomicUsize,
}

impl CountryCache {
    /// Create a new, empty cache which loads countries from `source`.
    pub fn new(source: Box<dyn GazetteerSource>) -> CountryCache {
        describe_counter!(
            "reversegeocoder.countries_loaded.total",
            "Countries parsed and cached"
        );
        describe_counter!(
            "reversegeocoder.country_load_failures.total",
            "Countries which could not be loaded"
        );
        describe_gauge!(
            "reversegeocoder.cities_loaded.bytes",
            "Approximate memory used by cached cities"
        );
        CountryCache {
            source,
            slots: RwLock::new(HashMap::new()),
            bytes_loaded: AtomicUsize::new(0),
        }
    }

    /// Get the cities for `country`, loading them if we haven't already.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_or_load(
        &self,
        country: CountryCode,
    ) -> Result<Arc<CityCollection>, LoadError> {
        let slot = self.slot(country);
        let collection = slot.get_or_try_init(|| self.load(country)).await?;
        Ok(collection.clone())
    }

    /// Find or create the slot for `country`.
    fn slot(&self, country: CountryCode) -> Slot {
        // A panic while holding this lock can't leave the map half-updated, so
        // poisoning is safe to ignore.
        let existing = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&country)
            .cloned();
        match existing {
            Some(slot) => slot,
            None => self
                .slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(country)
                .or_default()
                .clone(),
        }
    }

    /// Get the cities for several countries at once.
    ///
    /// Countries which fail to load are logged and skipped. We only return an
    /// error if every country we were asked for failed.
    pub async fn get_or_load_many(
        &self,
        countries: &[CountryCode],
    ) -> Result<LoadedCountries, LoadError> {
        let mut unique = Vec::with_capacity(countries.len());
        for &country in countries {
            if !unique.contains(&country) {
                unique.push(country);
            }
        }

        let results = join_all(unique.iter().map(|&c| self.get_or_load(c))).await;

        let mut collections = Vec::with_capacity(unique.len());
        let mut failed = vec![];
        for (&country, result) in unique.iter().zip(results) {
            match result {
                Ok(collection) => collections.push(collection),
                Err(err) => {
                    warn!("skipping country {}: {}", country, err);
                    failed.push(country);
                }
            }
        }

        if collections.is_empty() && !failed.is_empty() {
            return Err(LoadError::AllCountriesFailed { countries: failed });
        }
        Ok(LoadedCountries {
            collections,
            failed,
        })
    }

    /// Actually load a country. Only ever called from inside a slot.
    async fn load(&self, country: CountryCode) -> Result<Arc<CityCollection>, LoadError> {
        let collection = match self.source.load_country(country).await {
            Ok(collection) => collection,
            Err(err) => {
                counter!("reversegeocoder.country_load_failures.total", 1);
                return Err(err);
            }
        };

        let bytes = collection.memory_used();
        let total_bytes = self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let stats = collection.stats();
        if collection.is_empty() {
            warn!("no cities in {} passed our loader policy", country);
        }
        info!(
            country = %collection.country(),
            cities = collection.len(),
            bytes,
            rows_read = stats.rows_read,
            rows_malformed = stats.rows_malformed,
            rows_filtered = stats.rows_filtered,
            duplicates_removed = stats.duplicates_removed,
            "loaded country"
        );
        counter!("reversegeocoder.countries_loaded.total", 1);
        gauge!("reversegeocoder.cities_loaded.bytes", total_bytes as f64);

        Ok(Arc::new(collection))
    }
}

/// Several countries' worth of cities, in the order they were requested.
#[derive(Debug)]
pub struct LoadedCountries {
    collections: Vec<Arc<CityCollection>>,
    failed: Vec<CountryCode>,
}

impl LoadedCountries {
    /// All our cities, one country after another.
    pub fn cities(&self) -> impl Iterator<Item = &City> + '_ {
        self.collections.iter().flat_map(|collection| collection.iter())
    }

    /// The collections we loaded.
    pub fn collections(&self) -> &[Arc<CityCollection>] {
        &self.collections
    }

    /// Countries we were asked for but couldn't load.
    pub fn failed(&self) -> &[CountryCode] {
        &self.failed
    }
}

#[cfg(test)]
use crate::loader::{parse_fixture, FRANCE, GERMANY};

/// A fake gazetteer which counts how often it's asked to load something.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CountingSource {
    pub(crate) loads: Arc<AtomicUsize>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl GazetteerSource for CountingSource {
    async fn load_country(
        &self,
        country: CountryCode,
    ) -> Result<CityCollection, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Give any concurrent callers a chance to pile up.
        tokio::task::yield_now().await;
        match country.as_str() {
            "DE" => Ok(parse_fixture("DE", GERMANY)),
            "FR" => Ok(parse_fixture("FR", FRANCE)),
            _ => Err(LoadError::DataUnavailable {
                country,
                path: format!("{}.txt", country).into(),
                source: std::io::ErrorKind::NotFound.into(),
            }),
        }
    }
}

/// A fake gazetteer which won't finish loading France until we open the gate.
#[cfg(test)]
struct GatedSource {
    gate: Arc<tokio::sync::Semaphore>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl GazetteerSource for GatedSource {
    async fn load_country(
        &self,
        country: CountryCode,
    ) -> Result<CityCollection, LoadError> {
        if country.as_str() == "FR" {
            let _permit = self.gate.acquire().await.unwrap();
        }
        CountingSource::default().load_country(country).await
    }
}

#[cfg(test)]
fn counting_cache() -> (CountryCache, Arc<AtomicUsize>) {
    let source = CountingSource::default();
    let loads = source.loads.clone();
    (CountryCache::new(Box::new(source)), loads)
}

#[tokio::test]
async fn second_load_is_served_from_cache() {
    let (cache, loads) = counting_cache();
    let de = "DE".parse().unwrap();
    let first = cache.get_or_load(de).await.unwrap();
    let second = cache.get_or_load(de).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        first.iter().collect::<Vec<_>>(),
        second.iter().collect::<Vec<_>>()
    );
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_loads_parse_once() {
    let (cache, loads) = counting_cache();
    let cache = Arc::new(cache);
    let de: CountryCode = "DE".parse().unwrap();
    let handles = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_load(de).await.unwrap() })
        })
        .collect::<Vec<_>>();
    let collections = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect::<Vec<_>>();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    for collection in &collections[1..] {
        assert!(Arc::ptr_eq(&collections[0], collection));
    }
}

#[tokio::test]
async fn loaded_countries_are_served_while_another_loads() {
    use futures::FutureExt;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let source = GatedSource { gate: gate.clone() };
    let cache = Arc::new(CountryCache::new(Box::new(source)));
    let de: CountryCode = "DE".parse().unwrap();
    let fr: CountryCode = "FR".parse().unwrap();
    let germany = cache.get_or_load(de).await.unwrap();

    // Start loading France, and let it get stuck behind the gate.
    let slow = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_load(fr).await }
    });
    tokio::task::yield_now().await;

    // Germany is already loaded, so we shouldn't have to wait at all.
    let again = cache
        .get_or_load(de)
        .now_or_never()
        .expect("lookup of a loaded country had to wait")
        .unwrap();
    assert!(Arc::ptr_eq(&germany, &again));

    gate.add_permits(1);
    let france = slow.await.unwrap().unwrap();
    assert_eq!(france.country(), fr);
}

#[tokio::test]
async fn countries_are_cached_independently() {
    let (cache, loads) = counting_cache();
    cache.get_or_load("DE".parse().unwrap()).await.unwrap();
    cache.get_or_load("FR".parse().unwrap()).await.unwrap();
    cache.get_or_load("de".parse().unwrap()).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failures_are_retried() {
    let (cache, loads) = counting_cache();
    let zz = "ZZ".parse().unwrap();
    assert!(matches!(
        cache.get_or_load(zz).await,
        Err(LoadError::DataUnavailable { .. })
    ));
    assert!(cache.get_or_load(zz).await.is_err());
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn many_countries_skip_failures() {
    let (cache, loads) = counting_cache();
    let requested = CountryCode::parse_list("DE,ZZ,FR,DE").unwrap();
    let loaded = cache.get_or_load_many(&requested).await.unwrap();
    let countries = loaded
        .collections()
        .iter()
        .map(|c| c.country().to_string())
        .collect::<Vec<_>>();
    assert_eq!(countries, ["DE", "FR"]);
    assert_eq!(loaded.failed(), &["ZZ".parse::<CountryCode>().unwrap()]);
    assert_eq!(loaded.cities().count(), 6 + 5);
    assert_eq!(loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn many_countries_fail_only_if_all_fail() {
    let (cache, _) = counting_cache();
    let requested = CountryCode::parse_list("ZZ,YY").unwrap();
    match cache.get_or_load_many(&requested).await {
        Err(LoadError::AllCountriesFailed { countries }) => {
            assert_eq!(countries, requested);
        }
        other => panic!("expected AllCountriesFailed, got {:?}", other),
    }

    let loaded = cache.get_or_load_many(&[]).await.unwrap();
    assert_eq!(loaded.cities().count(), 0);
}
