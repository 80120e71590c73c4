//! Offline reverse geocoding: turn coordinates into the name of the nearest
//! place, using per-country gazetteer files stored on local disk.

use std::{path::PathBuf, process::exit, sync::Arc};

use anyhow::{format_err, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cities;
mod country_cache;
mod errors;
mod loader;
mod memory_used;
mod nearest;
mod resolver;
mod server;

use crate::cities::CountryCode;
use crate::country_cache::CountryCache;
use crate::errors::log_causes_and_backtrace;
use crate::loader::{DirectorySource, LoaderPolicy};
use crate::resolver::Resolver;

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    version,
    about = "resolve latitude/longitude to the nearest named place, offline"
)]
struct Opt {
    /// Directory containing one tab-separated gazetteer file per country,
    /// named like `DE.txt`.
    #[arg(long, env = "REVERSE_GEOCODER_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Countries to search when a request doesn't specify any, separated by
    /// commas.
    #[arg(
        long,
        env = "REVERSE_GEOCODER_COUNTRIES",
        value_delimiter = ',',
        default_value = "US"
    )]
    countries: Vec<CountryCode>,

    /// Only keep places with at least this many inhabitants (administrative
    /// seats are always kept).
    #[arg(long, env = "REVERSE_GEOCODER_MIN_POPULATION", default_value_t = 1000)]
    min_population: u64,

    /// Feature codes to keep, separated by commas. [default:
    /// PPLC,PPLA,PPLA2,PPLA3,PPLA4,PPL,PPLF]
    #[arg(long, env = "REVERSE_GEOCODER_FEATURE_CODES", value_delimiter = ',')]
    feature_codes: Vec<String>,

    /// Keep places whose names contain non-ASCII characters. This uses more
    /// memory.
    #[arg(long, env = "REVERSE_GEOCODER_ALLOW_NON_ASCII")]
    allow_non_ascii: bool,

    /// Drop places with names longer than this.
    #[arg(long, env = "REVERSE_GEOCODER_MAX_NAME_LENGTH", default_value_t = 50)]
    max_name_length: usize,

    /// Report "Unknown" if the nearest place is farther away than this many
    /// kilometers.
    #[arg(long, env = "REVERSE_GEOCODER_MAX_RADIUS_KM", default_value_t = 100.0)]
    max_radius_km: f64,

    #[command(subcommand)]
    cmd: Command,
}

impl Opt {
    /// Build our loader policy from our command-line arguments.
    fn loader_policy(&self) -> LoaderPolicy {
        let mut policy = LoaderPolicy {
            min_population: self.min_population,
            ascii_only: !self.allow_non_ascii,
            max_name_length: self.max_name_length,
            ..LoaderPolicy::default()
        };
        if !self.feature_codes.is_empty() {
            policy.feature_codes = self.feature_codes.clone();
        }
        policy
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load our default countries and answer HTTP requests.
    Server {
        /// Address and port to listen on.
        #[arg(
            long,
            env = "REVERSE_GEOCODER_LISTEN_ADDR",
            default_value = "0.0.0.0:8787"
        )]
        listen_addr: String,
    },

    /// Print the name of the place nearest to a single coordinate.
    #[command(allow_negative_numbers = true)]
    Lookup {
        /// Latitude, in decimal degrees.
        #[arg(long)]
        lat: f64,

        /// Longitude, in decimal degrees.
        #[arg(long)]
        lon: f64,

        /// Countries to search instead of the defaults.
        #[arg(long = "country", value_delimiter = ',')]
        countries: Vec<CountryCode>,

        /// Report "Unknown" if the nearest place is farther away than this
        /// many kilometers, instead of using our default radius.
        #[arg(long)]
        max_radius_km: Option<f64>,
    },
}

fn main() {
    // Log to standard error, so `lookup` output stays clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        log_causes_and_backtrace(&err);
        exit(1);
    }
}

/// Our main entry point.
#[tokio::main]
async fn run() -> Result<()> {
    // Parse our command-line arguments.
    let opt = Opt::parse();
    if opt.max_radius_km.is_nan() || opt.max_radius_km < 0.0 {
        return Err(format_err!(
            "--max-radius-km must be a non-negative number, got {}",
            opt.max_radius_km
        ));
    }

    // Install our metrics recorder before anything describes its metrics.
    let metrics = match &opt.cmd {
        Command::Server { .. } => Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("could not install metrics recorder")?,
        ),
        Command::Lookup { .. } => None,
    };

    let source = DirectorySource::new(opt.data_dir.clone(), opt.loader_policy());
    let cache = CountryCache::new(Box::new(source));
    let resolver = Arc::new(Resolver::new(
        cache,
        opt.countries.clone(),
        opt.max_radius_km,
    ));

    match opt.cmd {
        Command::Server { listen_addr } => {
            // Get our data into memory before we accept any requests.
            let loaded = resolver.preload().await.with_context(|| {
                format!(
                    "could not load default countries from {}",
                    opt.data_dir.display()
                )
            })?;
            if !loaded.failed().is_empty() {
                warn!(
                    "serving without {} countries: {:?}",
                    loaded.failed().len(),
                    loaded.failed()
                );
            }
            info!(
                "preloaded {} of {:?}",
                loaded.collections().len(),
                resolver.default_countries()
            );
            server::run_server(&listen_addr, resolver, metrics).await
        }
        Command::Lookup {
            lat,
            lon,
            countries,
            max_radius_km,
        } => {
            let label = resolver
                .resolve(lat, lon, Some(&countries[..]), max_radius_km)
                .await?;
            println!("{}", label);
            Ok(())
        }
    }
}
