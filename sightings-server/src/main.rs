//! sightings: CLI + web server for satellite next-pass lookups.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::info;

use sightings_core::config::{self, Config};
use sightings_core::elements::current_element_set;
use sightings_core::marker::MarkerIndex;
use sightings_core::types::ObservationPoint;

mod cache;
mod db;
mod fetch;
mod geoip;
mod logging;
mod orbit;
mod resolver;
mod web;

use cache::FeedCache;
use db::{Database, MarkerInput, SqliteStore};
use fetch::{Fetcher, HttpFetcher};

#[derive(Parser)]
#[command(name = "sightings", version, about = "Satellite next-pass service")]
struct Cli {
    /// Config file (default: ~/.cimon-sightings/config.toml)
    #[arg(long, global = true, env = "SIGHTINGS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path, overrides the config file
    #[arg(long, global = true, env = "SIGHTINGS_DB")]
    db_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SIGHTINGS_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the JSON API server
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        host: Option<String>,

        /// Port, overrides the config file
        #[arg(long)]
        port: Option<u16>,
    },

    /// Insert observation points from a JSON file
    LoadMarkers {
        /// JSON array of {label, lat, lon, country, state, town, timezone}
        file: PathBuf,
    },

    /// List the sightings of the point nearest to a coordinate
    Sightings {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },

    /// Force a feed fetch for one observation point
    Refresh {
        #[arg(long)]
        marker: i64,
    },

    /// Drop a stored feed so the next request refetches it
    Expire {
        #[arg(long)]
        marker: i64,
    },

    /// Show database statistics
    Stats,

    /// Fetch and print the orbital element set valid now
    Elements,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => config::load_config().context("loading config")?,
    };
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(config).await
        }
        Commands::LoadMarkers { file } => cmd_load_markers(&config, &file),
        Commands::Sightings { lat, lon } => cmd_sightings(&config, lat, lon).await,
        Commands::Refresh { marker } => cmd_refresh(&config, marker).await,
        Commands::Expire { marker } => cmd_expire(&config, marker).await,
        Commands::Stats => cmd_stats(&config).await,
        Commands::Elements => cmd_elements(&config).await,
    }
}

async fn marker_index(store: &SqliteStore) -> anyhow::Result<MarkerIndex> {
    let points = store
        .load_markers()
        .await
        .with_context(|| format!("reading markers from {}", store.path()))?;
    MarkerIndex::new(points).context("run `sightings load-markers` first")
}

fn find_marker(index: &MarkerIndex, id: i64) -> anyhow::Result<ObservationPoint> {
    index
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow!("no marker with id {id}"))
}

fn http_fetcher() -> anyhow::Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(HttpFetcher::new().context("building HTTP client")?))
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database.path.clone());
    let markers = marker_index(&store).await?;
    info!(
        "Loaded {} observation points from {}",
        markers.len(),
        store.path()
    );

    let fetcher = http_fetcher()?;
    let cache = FeedCache::new(store.clone(), fetcher.clone(), &config.feeds.url_template);

    let elements = Arc::new(orbit::ElementStore::new(fetcher, &config.elements.url));
    let refresh_every = Duration::from_secs(config.elements.refresh_hours.max(1) * 3600);
    let _refresher = elements.clone().start_refresher(refresh_every);

    let resolver = resolver::Resolver::new(markers, store, cache, elements);
    let state = Arc::new(web::AppState {
        resolver: Arc::new(resolver),
        geo: Arc::new(geoip::FixedLocator::from_config(&config.geoip)),
    });

    web::serve(state, &config.server.host, config.server.port)
        .await
        .context("web server failed")
}

fn cmd_load_markers(config: &Config, file: &PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let inputs: Vec<MarkerInput> = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    if inputs.is_empty() {
        bail!("{} contains no markers", file.display());
    }

    let mut db = Database::open(&config.database.path)?;
    let inserted = db.insert_markers(&inputs)?;

    println!();
    println!("Loaded {inserted} markers into {}", config.database.path);
    println!();
    Ok(())
}

async fn cmd_sightings(config: &Config, lat: f64, lon: f64) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database.path.clone());
    let index = marker_index(&store).await?;
    let nearest = index.nearest(lat, lon);

    let cache = FeedCache::new(store.clone(), http_fetcher()?, &config.feeds.url_template);
    if let Err(e) = cache.ensure_fresh(&nearest.point).await {
        eprintln!("Feed load failed, showing stored sightings: {e}");
    }
    let records = store.get_sightings(nearest.point.id).await?;
    let published = store.get_feed(nearest.point.id).await?.map(|doc| doc.published);

    println!();
    println!(
        "{} ({}), {:.1} km away",
        nearest.point.label, nearest.point.name, nearest.dist
    );
    if let Some(published) = published {
        println!("  Feed published {}", published.format("%Y-%m-%d %H:%M UTC"));
    }
    println!();

    if records.is_empty() {
        println!("  No sightings stored.");
        println!();
        return Ok(());
    }

    let now = Utc::now();
    let mut table = Table::new();
    table.set_header(vec!["When (UTC)", "In (h)", "Duration", "Max elev", "Approach"]);
    for rec in &records {
        let field = |key: &str| rec.info.get(key).cloned().unwrap_or_else(|| "-".into());
        let hours = (rec.datetime - now).num_minutes() as f64 / 60.0;
        table.add_row(vec![
            Cell::new(rec.datetime.format("%Y-%m-%d %H:%M")),
            Cell::new(format!("{hours:.1}")),
            Cell::new(field("duration")),
            Cell::new(field("maximum_elevation")),
            Cell::new(field("approach")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_refresh(config: &Config, marker: i64) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database.path.clone());
    let point = find_marker(&marker_index(&store).await?, marker)?;

    let cache = FeedCache::new(store.clone(), http_fetcher()?, &config.feeds.url_template);
    cache
        .refresh(&point)
        .await
        .map_err(|e| anyhow!("refreshing {}: {e}", point.name))?;

    let count = store.get_sightings(point.id).await?.len();
    println!("Refreshed {} ({count} sightings)", point.name);
    Ok(())
}

async fn cmd_expire(config: &Config, marker: i64) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database.path.clone());
    let point = find_marker(&marker_index(&store).await?, marker)?;

    if store.delete_feed(point.id).await? {
        println!("Expired feed for {}", point.name);
    } else {
        println!("No stored feed for {}", point.name);
    }
    Ok(())
}

async fn cmd_stats(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database.path.clone());
    let stats = store.stats().await?;

    println!();
    println!("Database: {}", store.path());
    println!();
    println!("  Markers:    {}", stats.markers);
    println!("  Feeds:      {}", stats.feeds);
    println!("  Sightings:  {}", stats.sightings);
    println!();
    Ok(())
}

async fn cmd_elements(config: &Config) -> anyhow::Result<()> {
    let page = http_fetcher()?
        .fetch(&config.elements.url)
        .await
        .with_context(|| format!("fetching {}", config.elements.url))?;
    let set = current_element_set(&page, Utc::now())?;

    println!();
    println!("{}", set.name);
    println!("{}", set.line1);
    println!("{}", set.line2);
    println!();
    println!("  Valid from: {}", set.valid_from.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    Ok(())
}
