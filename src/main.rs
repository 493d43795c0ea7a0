//! listing-map-engine: search a listing catalog, cluster it for a map, serve it.

mod browse;
mod cluster;
mod config;
mod error;
mod filter;
mod geo;
mod geocode;
mod listing;
mod map;
mod reconcile;
mod server;
mod session;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::browse::Collaborators;
use crate::config::EngineConfig;
use crate::geo::Coordinates;
use crate::geocode::{FixedGeolocator, HttpGeocoder};
use crate::listing::{Category, SortBy};
use crate::map::Viewport;
use crate::server::{AppState, SearchQuery};
use crate::store::{fetch_all, HttpListingStore, InMemoryStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_CATALOG_PATH: &str = "catalog.json";

#[derive(Parser)]
#[command(name = "listing-map-engine")]
#[command(about = "Search listings, cluster them for a map, serve a search API")]
struct Cli {
    /// Engine settings (JSON). Defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a catalog and start the search API.
    Serve {
        /// Catalog file path.
        #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
        catalog: PathBuf,

        /// Port to listen on.
        #[arg(long, short, default_value_t = 3000)]
        port: u16,
    },

    /// Run one search over a catalog and print the page as JSON.
    Search {
        #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
        catalog: PathBuf,

        /// Keyword matched against title, description and provider.
        #[arg(long, short = 'q', default_value = "")]
        keyword: String,

        /// Category filter; repeat for several.
        #[arg(long = "category")]
        categories: Vec<Category>,

        #[arg(long, default_value = "relevance")]
        sort: SortBy,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long, requires_all = ["lng", "radius_km"])]
        lat: Option<f64>,

        #[arg(long, requires_all = ["lat", "radius_km"])]
        lng: Option<f64>,

        #[arg(long, requires_all = ["lat", "lng"])]
        radius_km: Option<f64>,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,

        #[arg(long)]
        rating_min: Option<f64>,

        /// Keep listings scheduled on or after this date (YYYY-MM-DD).
        #[arg(long)]
        date_from: Option<NaiveDate>,

        /// Keep listings scheduled on or before this date.
        #[arg(long)]
        date_to: Option<NaiveDate>,

        /// Only listings with free capacity.
        #[arg(long)]
        available_only: bool,
    },

    /// Cluster every located listing in a catalog at one zoom level.
    Cluster {
        #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
        catalog: PathBuf,

        #[arg(long, short)]
        zoom: u8,
    },

    /// Interactive console: search, page, and watch the map markers change.
    Browse {
        /// Catalog file; ignored when the config names a remote backend.
        #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
        catalog: PathBuf,

        /// Initial map center and reported device position.
        #[arg(long, default_value_t = 35.0116)]
        lat: f64,

        #[arg(long, default_value_t = 135.7681)]
        lng: f64,

        #[arg(long, short, default_value_t = 12)]
        zoom: u8,

        /// Behave as if the user refused location access.
        #[arg(long)]
        deny_location: bool,
    },

    /// Download every listing from the configured backend into a catalog file.
    Fetch {
        /// Backend base URL; overrides the config.
        #[arg(long)]
        backend: Option<String>,

        #[arg(long, short, default_value = DEFAULT_CATALOG_PATH)]
        output: PathBuf,
    },
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("listing_map_engine=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Serve { catalog, port } => run_serve(&catalog, port, &config)?,
        Command::Search {
            catalog,
            keyword,
            categories,
            sort,
            page,
            page_size,
            lat,
            lng,
            radius_km,
            min_price,
            max_price,
            rating_min,
            date_from,
            date_to,
            available_only,
        } => {
            let category = (!categories.is_empty()).then(|| {
                categories.iter().map(Category::as_str).collect::<Vec<_>>().join(",")
            });
            let query = SearchQuery {
                q: keyword,
                category,
                sort: Some(sort.as_str().to_string()),
                page: Some(page),
                page_size,
                lat,
                lng,
                radius_km,
                min_price,
                max_price,
                rating_min,
                date_from,
                date_to,
                available_only,
            };
            run_search(&catalog, query, &config)?;
        }
        Command::Cluster { catalog, zoom } => run_cluster(&catalog, zoom, &config)?,
        Command::Browse { catalog, lat, lng, zoom, deny_location } => {
            let center = Coordinates::new(lat, lng)?;
            run_browse(&catalog, Viewport { center, zoom }, deny_location, &config)?;
        }
        Command::Fetch { backend, output } => run_fetch(backend, &output, &config)?,
    }
    Ok(())
}

fn run_serve(catalog: &Path, port: u16, config: &EngineConfig) -> Result<(), BoxError> {
    let store = InMemoryStore::load(catalog)?;
    info!(listings = store.listings().len(), catalog = %catalog.display(), "catalog loaded");
    let state = Arc::new(AppState {
        store,
        clustering: config.clustering,
        page_size: config.page_size,
    });

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let addr = format!("127.0.0.1:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        println!("Listening on http://{}", addr);
        axum::serve(listener, server::router(state)).await?;
        Ok::<(), BoxError>(())
    })?;
    Ok(())
}

fn run_search(catalog: &Path, query: SearchQuery, config: &EngineConfig) -> Result<(), BoxError> {
    let store = InMemoryStore::load(catalog)?;
    let params = query.into_params(config.page_size)?;
    let response = server::run_search(&store, &params)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn run_cluster(catalog: &Path, zoom: u8, config: &EngineConfig) -> Result<(), BoxError> {
    let store = InMemoryStore::load(catalog)?;
    let entries = cluster::cluster(store.listings(), zoom, &config.clustering)?;
    info!(listings = store.listings().len(), markers = entries.len(), zoom, "clustered");
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn run_browse(
    catalog: &Path,
    start: Viewport,
    deny_location: bool,
    config: &EngineConfig,
) -> Result<(), BoxError> {
    let geocoder = config
        .geocoder
        .as_ref()
        .map(|g| HttpGeocoder::new(&g.url, g.timeout()))
        .transpose()?;
    let geolocator = if deny_location {
        FixedGeolocator::denied()
    } else {
        FixedGeolocator::at(start.center)
    };
    let collaborators = Collaborators { geocoder, geolocator };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match &config.backend {
            Some(backend) => {
                let store = HttpListingStore::new(&backend.url, backend.timeout())?;
                info!(endpoint = %store.endpoint(), "browsing remote backend");
                browse::run(Arc::new(store), config, start, collaborators).await?;
            }
            None => {
                let store = InMemoryStore::load(catalog)?;
                info!(listings = store.listings().len(), "browsing local catalog");
                browse::run(Arc::new(store), config, start, collaborators).await?;
            }
        }
        Ok::<(), BoxError>(())
    })?;
    Ok(())
}

fn run_fetch(backend: Option<String>, output: &Path, config: &EngineConfig) -> Result<(), BoxError> {
    let (url, timeout) = match (backend, &config.backend) {
        (Some(url), configured) => (url, configured.as_ref().map(|b| b.timeout())),
        (None, Some(configured)) => (configured.url.clone(), Some(configured.timeout())),
        (None, None) => return Err("no backend given: pass --backend or set `backend` in the config".into()),
    };
    let store = HttpListingStore::new(&url, timeout.unwrap_or(std::time::Duration::from_secs(5)))?;

    let rt = tokio::runtime::Runtime::new()?;
    let listings = rt.block_on(fetch_all(&store, config.page_size))?;
    let count = listings.len();
    InMemoryStore::new(listings).save(output)?;
    println!("Fetched {} listings from {}, catalog saved to {:?}", count, store.endpoint(), output);
    Ok(())
}
