//! Loading per-country gazetteer files.
//!
//! Each country lives in its own tab-separated file, `<data_dir>/<CC>.txt`,
//! in the standard gazetteer export layout. The columns are positional:
//!
//! ```text
//! 0: id           1: name          2: ascii name     3: alternate names
//! 4: latitude     5: longitude     6: feature class  7: feature code
//! 8: country      9: cc2           10-13: admin codes
//! 14: population  15: elevation    16: dem           17: timezone  18: modified
//! ```
//!
//! Dumps routinely contain truncated or garbled rows. We skip those one at a
//! time and count them, and we only give up on a country if nothing in it is
//! usable.

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord};
use metrics::{counter, describe_counter};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::cities::{City, CityCollection, CountryCode, LoadStats};

/// Rows with fewer columns than this are truncated.
const MIN_COLUMNS: usize = 15;

const NAME_COLUMN: usize = 1;
const ASCII_NAME_COLUMN: usize = 2;
const LATITUDE_COLUMN: usize = 4;
const LONGITUDE_COLUMN: usize = 5;
const FEATURE_CLASS_COLUMN: usize = 6;
const FEATURE_CODE_COLUMN: usize = 7;
const POPULATION_COLUMN: usize = 14;

/// The feature class for cities, towns, villages and the like.
const POPULATED_PLACE: &str = "P";

/// Capitals and seats of administrative divisions, down to the fourth level.
const ADMINISTRATIVE_FEATURE_CODES: &[&str] = &["PPLC", "PPLA", "PPLA2", "PPLA3", "PPLA4"];

/// Our default feature-code allow-list: administrative seats, plus generic
/// populated places and farm villages.
pub const DEFAULT_FEATURE_CODES: &[&str] =
    &["PPLC", "PPLA", "PPLA2", "PPLA3", "PPLA4", "PPL", "PPLF"];

/// Which gazetteer rows we keep in memory.
///
/// The defaults trade recall for memory: only ASCII names of reasonable
/// length, only a few kinds of populated places, and only places with at least
/// 1000 inhabitants unless they're an administrative seat.
#[derive(Clone, Debug)]
pub struct LoaderPolicy {
    /// Keep places with at least this many inhabitants.
    pub min_population: u64,
    /// Feature codes we're willing to keep.
    pub feature_codes: Vec<String>,
    /// Drop any place whose preferred name contains non-ASCII characters.
    pub ascii_only: bool,
    /// Drop any place whose preferred name is longer than this (in
    /// characters).
    pub max_name_length: usize,
}

impl Default for LoaderPolicy {
    fn default() -> Self {
        LoaderPolicy {
            min_population: 1000,
            feature_codes: DEFAULT_FEATURE_CODES
                .iter()
                .map(|&code| code.to_owned())
                .collect(),
            ascii_only: true,
            max_name_length: 50,
        }
    }
}

impl LoaderPolicy {
    fn allows_feature_code(&self, code: &str) -> bool {
        self.feature_codes.iter().any(|allowed| allowed == code)
    }

    fn allows_name(&self, name: &str) -> bool {
        if self.ascii_only && !name.is_ascii() {
            return false;
        }
        name.chars().count() <= self.max_name_length
    }
}

/// Errors that can occur while loading a country.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// We have no gazetteer for this country.
    #[error("no gazetteer data for {country} at {}", path.display())]
    DataUnavailable {
        country: CountryCode,
        path: PathBuf,
        source: io::Error,
    },

    /// The gazetteer exists, but not a single row in it was usable.
    #[error("gazetteer data for {country} at {} contains no parsable rows", path.display())]
    MalformedSource { country: CountryCode, path: PathBuf },

    /// We failed partway through reading the gazetteer.
    #[error("could not read gazetteer data for {country}")]
    Read {
        country: CountryCode,
        source: csv::Error,
    },

    /// Our background loading task died.
    #[error("loading {country} failed: {reason}")]
    TaskFailed { country: CountryCode, reason: String },

    /// None of the requested countries could be loaded.
    #[error("could not load any of the requested countries: {}", join_codes(countries))]
    AllCountriesFailed { countries: Vec<CountryCode> },
}

fn join_codes(countries: &[CountryCode]) -> String {
    countries
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Somewhere we can load per-country gazetteers from.
#[async_trait]
pub trait GazetteerSource: Send + Sync + 'static {
    /// Load and filter all the cities for `country`.
    async fn load_country(
        &self,
        country: CountryCode,
    ) -> Result<CityCollection, LoadError>;
}

/// Gazetteer files stored in a local directory, one per country.
pub struct DirectorySource {
    data_dir: PathBuf,
    policy: Arc<LoaderPolicy>,
}

impl DirectorySource {
    /// Read `<data_dir>/<CC>.txt` files, filtering them using `policy`.
    pub fn new(data_dir: PathBuf, policy: LoaderPolicy) -> DirectorySource {
        describe_counter!(
            "reversegeocoder.rows_skipped.total",
            "Gazetteer rows not kept in memory"
        );
        DirectorySource {
            data_dir,
            policy: Arc::new(policy),
        }
    }
}

#[async_trait]
impl GazetteerSource for DirectorySource {
    async fn load_country(
        &self,
        country: CountryCode,
    ) -> Result<CityCollection, LoadError> {
        // Parsing is CPU-bound and uses blocking I/O, so keep it off our async
        // workers.
        let data_dir = self.data_dir.clone();
        let policy = self.policy.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            load_country(&data_dir, country, &policy)
        })
        .await;
        match loaded {
            Ok(result) => result,
            Err(err) => Err(LoadError::TaskFailed {
                country,
                reason: err.to_string(),
            }),
        }
    }
}

/// The gazetteer file for `country` in `data_dir`.
pub fn country_path(data_dir: &Path, country: CountryCode) -> PathBuf {
    data_dir.join(format!("{}.txt", country))
}

/// Load the gazetteer for `country` from `data_dir`.
#[instrument(level = "debug", skip(data_dir, policy))]
pub fn load_country(
    data_dir: &Path,
    country: CountryCode,
    policy: &LoaderPolicy,
) -> Result<CityCollection, LoadError> {
    let path = country_path(data_dir, country);
    let file = File::open(&path).map_err(|source| LoadError::DataUnavailable {
        country,
        path: path.clone(),
        source,
    })?;
    debug!("reading {}", path.display());
    parse_gazetteer(country, &path, BufReader::new(file), policy)
}

/// Parse a gazetteer for `country` from `rdr`. We only use `path` in error
/// messages.
pub fn parse_gazetteer<R: io::Read>(
    country: CountryCode,
    path: &Path,
    rdr: R,
    policy: &LoaderPolicy,
) -> Result<CityCollection, LoadError> {
    // Gazetteer dumps are not real CSV. Quotes appear inside names, and row
    // lengths vary.
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(rdr);

    let mut stats = LoadStats::default();
    let mut usable_rows = 0;
    let mut cities = vec![];
    let mut record = StringRecord::new();
    loop {
        match rdr.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if err.is_io_error() => {
                return Err(LoadError::Read {
                    country,
                    source: err,
                });
            }
            Err(err) => {
                // Usually invalid UTF-8. The reader has already moved past
                // this row.
                trace!("skipping unreadable row: {}", err);
                stats.rows_read += 1;
                stats.rows_malformed += 1;
                continue;
            }
        }
        stats.rows_read += 1;
        match parse_row(&record, country, policy) {
            RowOutcome::Keep(city) => {
                usable_rows += 1;
                cities.push(city);
            }
            RowOutcome::Filtered => {
                usable_rows += 1;
                stats.rows_filtered += 1;
            }
            RowOutcome::Malformed => {
                trace!("skipping malformed row: {:?}", record);
                stats.rows_malformed += 1;
            }
        }
    }

    counter!(
        "reversegeocoder.rows_skipped.total",
        stats.rows_malformed as u64,
        "reason" => "malformed"
    );
    counter!(
        "reversegeocoder.rows_skipped.total",
        stats.rows_filtered as u64,
        "reason" => "filtered"
    );

    if usable_rows == 0 {
        return Err(LoadError::MalformedSource {
            country,
            path: path.to_owned(),
        });
    }
    Ok(CityCollection::new(country, cities, stats))
}

/// What to do with a single gazetteer row.
#[derive(Debug, PartialEq)]
enum RowOutcome {
    /// Keep this city.
    Keep(City),
    /// A well-formed row that our policy doesn't want.
    Filtered,
    /// A row we couldn't make sense of.
    Malformed,
}

fn parse_row(
    record: &StringRecord,
    country: CountryCode,
    policy: &LoaderPolicy,
) -> RowOutcome {
    if record.len() < MIN_COLUMNS {
        return RowOutcome::Malformed;
    }

    let (latitude, longitude) = match (
        record[LATITUDE_COLUMN].trim().parse::<f64>(),
        record[LONGITUDE_COLUMN].trim().parse::<f64>(),
    ) {
        (Ok(latitude), Ok(longitude)) => (latitude, longitude),
        _ => return RowOutcome::Malformed,
    };
    let population = match record[POPULATION_COLUMN].trim() {
        "" => 0,
        population => match population.parse::<u64>() {
            Ok(population) => population,
            Err(_) => return RowOutcome::Malformed,
        },
    };

    if &record[FEATURE_CLASS_COLUMN] != POPULATED_PLACE {
        return RowOutcome::Filtered;
    }
    let feature_code = &record[FEATURE_CODE_COLUMN];
    if !policy.allows_feature_code(feature_code) {
        return RowOutcome::Filtered;
    }

    let name = match record[ASCII_NAME_COLUMN].trim() {
        "" => record[NAME_COLUMN].trim(),
        ascii_name => ascii_name,
    };
    if name.is_empty() {
        return RowOutcome::Malformed;
    }
    if !policy.allows_name(name) {
        return RowOutcome::Filtered;
    }

    // Administrative seats are kept whatever their population.
    let is_administrative = ADMINISTRATIVE_FEATURE_CODES.contains(&feature_code);
    if population < policy.min_population && !is_administrative {
        return RowOutcome::Filtered;
    }

    match City::new(name, country, latitude, longitude) {
        Some(city) => RowOutcome::Keep(city),
        None => RowOutcome::Malformed,
    }
}

#[cfg(test)]
pub(crate) const GERMANY: &str = include_str!("../tests/fixtures/DE.txt");

#[cfg(test)]
pub(crate) const FRANCE: &str = include_str!("../tests/fixtures/FR.txt");

#[cfg(test)]
pub(crate) fn parse_fixture(country: &str, data: &str) -> CityCollection {
    parse_gazetteer(
        country.parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &LoaderPolicy::default(),
    )
    .unwrap()
}

/// Build a full-width gazetteer row.
#[cfg(test)]
fn gazetteer_row(
    name: &str,
    ascii_name: &str,
    latitude: &str,
    longitude: &str,
    feature_code: &str,
    population: &str,
) -> String {
    [
        "1", name, ascii_name, "", latitude, longitude, "P", feature_code, "DE",
        "", "01", "", "", "", population, "", "34", "Europe/Berlin",
        "2023-01-01",
    ]
    .join("\t")
}

#[test]
fn loads_fixture_with_default_policy() {
    let germany = parse_fixture("DE", GERMANY);
    let names = germany.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        ["Amtsdorf", "Berlin", "Hamburg", "Koeln", "Munich", "Potsdam"]
    );
    assert_eq!(
        germany.stats(),
        LoadStats {
            rows_read: 12,
            rows_malformed: 2,
            rows_filtered: 4,
            duplicates_removed: 0,
        }
    );
}

#[test]
fn loaded_cities_satisfy_record_invariants() {
    for (country, data) in [("DE", GERMANY), ("FR", FRANCE)] {
        let collection = parse_fixture(country, data);
        assert!(!collection.is_empty());
        for city in &collection {
            assert!((-90.0..=90.0).contains(&city.latitude));
            assert!((-180.0..=180.0).contains(&city.longitude));
            assert_eq!(city.country.as_str().len(), 2);
            assert!(city.country.as_str().bytes().all(|b| b.is_ascii_uppercase()));
            assert!(!city.name.is_empty());
            assert!(city.name.is_ascii());
            assert!(city.name.len() <= 50);
        }
    }
}

#[test]
fn truncated_rows_are_skipped_not_fatal() {
    let data = format!(
        "{}\n{}\n",
        gazetteer_row("Berlin", "Berlin", "52.52437", "13.41053", "PPLC", "3426354"),
        "2\tShort\tShort\t\t52.5\t13.4\tP\tPPL",
    );
    let collection = parse_gazetteer(
        "DE".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &LoaderPolicy::default(),
    )
    .unwrap();
    assert_eq!(collection.len(), 1);
    assert_eq!(collection.stats().rows_malformed, 1);
}

#[test]
fn bad_numbers_only_skip_their_row() {
    let data = [
        gazetteer_row("Berlin", "Berlin", "52.52437", "13.41053", "PPLC", "3426354"),
        gazetteer_row("BadLat", "BadLat", "north", "13.0", "PPL", "5000"),
        gazetteer_row("BadLon", "BadLon", "52.0", "", "PPL", "5000"),
        gazetteer_row("BadPop", "BadPop", "52.0", "13.0", "PPL", "lots"),
        gazetteer_row("OffMap", "OffMap", "91.0", "13.0", "PPL", "5000"),
        gazetteer_row("NoPop", "NoPop", "52.0", "13.0", "PPL", ""),
    ]
    .join("\n");
    let collection = parse_gazetteer(
        "DE".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &LoaderPolicy::default(),
    )
    .unwrap();
    let names = collection.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["Berlin"]);
    // A blank population is zero, which is a policy decision, not an error.
    assert_eq!(collection.stats().rows_malformed, 4);
    assert_eq!(collection.stats().rows_filtered, 1);
}

#[test]
fn name_policy_is_configurable() {
    let data = [
        gazetteer_row("Łódź", "", "51.75", "19.46667", "PPLA", "768755"),
        gazetteer_row(&"A".repeat(51), "", "51.0", "19.0", "PPLA", "5000"),
        gazetteer_row(&"B".repeat(50), "", "51.1", "19.1", "PPLA", "5000"),
    ]
    .join("\n");

    let strict = parse_gazetteer(
        "PL".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &LoaderPolicy::default(),
    )
    .unwrap();
    assert_eq!(strict.len(), 1);
    assert_eq!(strict.iter().next().unwrap().name, "B".repeat(50));

    let relaxed_policy = LoaderPolicy {
        ascii_only: false,
        max_name_length: 60,
        ..LoaderPolicy::default()
    };
    let relaxed = parse_gazetteer(
        "PL".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &relaxed_policy,
    )
    .unwrap();
    assert_eq!(relaxed.len(), 3);
    assert!(relaxed.iter().any(|c| c.name == "Łódź"));
}

#[test]
fn population_threshold_spares_administrative_seats() {
    let data = [
        gazetteer_row("Hamlet", "Hamlet", "50.0", "10.0", "PPL", "999"),
        gazetteer_row("Town", "Town", "50.1", "10.1", "PPL", "1000"),
        gazetteer_row("Seat", "Seat", "50.2", "10.2", "PPLA4", "12"),
        gazetteer_row("Farm", "Farm", "50.3", "10.3", "PPLF", "0"),
    ]
    .join("\n");
    let collection = parse_gazetteer(
        "DE".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &LoaderPolicy::default(),
    )
    .unwrap();
    let names = collection.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["Seat", "Town"]);

    let everything = LoaderPolicy {
        min_population: 0,
        ..LoaderPolicy::default()
    };
    let collection = parse_gazetteer(
        "DE".parse().unwrap(),
        Path::new("test.txt"),
        data.as_bytes(),
        &everything,
    )
    .unwrap();
    assert_eq!(collection.len(), 4);
}

#[test]
fn feature_codes_are_configurable() {
    let capitals_only = LoaderPolicy {
        feature_codes: vec!["PPLC".to_owned()],
        ..LoaderPolicy::default()
    };
    let germany = parse_gazetteer(
        "DE".parse().unwrap(),
        Path::new("test.txt"),
        GERMANY.as_bytes(),
        &capitals_only,
    )
    .unwrap();
    let names = germany.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["Berlin"]);
}

#[test]
fn empty_or_garbage_sources_are_malformed() {
    for data in ["", "just some text\nand more\n", "1\t2\t3\n"] {
        let result = parse_gazetteer(
            "DE".parse().unwrap(),
            Path::new("test.txt"),
            data.as_bytes(),
            &LoaderPolicy::default(),
        );
        assert!(
            matches!(result, Err(LoadError::MalformedSource { .. })),
            "unexpected result for {:?}: {:?}",
            data,
            result
        );
    }
}

#[test]
fn malformed_country_file_names_its_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("DE.txt"), "not\ta\tgazetteer\n").unwrap();
    let err = load_country(dir.path(), "DE".parse().unwrap(), &LoaderPolicy::default())
        .unwrap_err();
    assert!(err.to_string().contains("DE.txt"), "{}", err);
    match err {
        LoadError::MalformedSource { path, .. } => {
            assert_eq!(path, dir.path().join("DE.txt"));
        }
        other => panic!("expected MalformedSource, got {:?}", other),
    }
}

#[test]
fn missing_country_file_is_data_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_country(dir.path(), "ZZ".parse().unwrap(), &LoaderPolicy::default());
    match result {
        Err(LoadError::DataUnavailable { path, .. }) => {
            assert_eq!(path, dir.path().join("ZZ.txt"));
        }
        other => panic!("expected DataUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn directory_source_reads_country_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("FR.txt"), FRANCE).unwrap();
    let source = DirectorySource::new(dir.path().to_owned(), LoaderPolicy::default());
    let france = source.load_country("fr".parse().unwrap()).await.unwrap();
    assert_eq!(france.country().as_str(), "FR");
    assert_eq!(france.len(), 5);
}
