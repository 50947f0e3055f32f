mod api;
mod config;
mod db;
mod ingest;
mod models;
mod providers;
mod sync;
mod timeline;

#[cfg(test)]
mod test_support;

use axum::http::{header, HeaderValue, Method};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, ServerConfig};
use models::Coordinate;
use sync::{outcome_of, BatchKind, SyncManager};
use timeline::{TimelineEntry, TimelineFilter, TimelineQuery};

#[derive(Debug, Parser)]
#[command(name = "bridgeping", version, about = "Bridge opening sync and timeline")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(long, env = "BRIDGEPING_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch the opening feed once and merge it
    SyncOpenings,
    /// Import bridges from Overpass for every configured area
    ImportBridges,
    /// Name unnamed bridges by reverse geocoding
    Enrich {
        /// Stop after this many bridges
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print openings around now
    Timeline {
        #[arg(long, default_value_t = 24)]
        past_hours: i64,
        #[arg(long, default_value_t = 168)]
        future_hours: i64,
        #[arg(long, requires_all = ["lon", "radius_m"], conflicts_with = "bridges")]
        lat: Option<f64>,
        #[arg(long, requires_all = ["lat", "radius_m"])]
        lon: Option<f64>,
        #[arg(long, requires_all = ["lat", "lon"])]
        radius_m: Option<f64>,
        /// Only these bridge keys (comma separated)
        #[arg(long, value_delimiter = ',')]
        bridges: Vec<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API and run the scheduled batches
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridgeping=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = load_config(&cli.config)?;
    if let Ok(path) = std::env::var("DATABASE_PATH") {
        config.database_path = PathBuf::from(path);
    }

    let pool = db::connect(&config.database_path).await?;
    let shutdown = shutdown_signal();

    match cli.command {
        Command::SyncOpenings => run_batch(pool, config, shutdown, BatchKind::OpeningSync).await,
        Command::ImportBridges => run_batch(pool, config, shutdown, BatchKind::GeoImport).await,
        Command::Enrich { limit } => {
            if limit.is_some() {
                config.geocoder.max_per_run = limit;
            }
            run_batch(pool, config, shutdown, BatchKind::Enrichment).await
        }
        Command::Timeline {
            past_hours,
            future_hours,
            lat,
            lon,
            radius_m,
            bridges,
            json,
        } => {
            let filter = match (lat, lon, radius_m) {
                (Some(lat), Some(lon), Some(radius_m)) => TimelineFilter::Near {
                    center: Coordinate::new(lat, lon),
                    radius_m,
                },
                _ if !bridges.is_empty() => {
                    TimelineFilter::Bridges(bridges.into_iter().collect::<BTreeSet<_>>())
                }
                _ => TimelineFilter::All,
            };
            let query = TimelineQuery {
                now: Utc::now(),
                window_past: timeline::window_hours(past_hours)?,
                window_future: timeline::window_hours(future_hours)?,
                filter,
            };

            let entries = timeline::query_timeline(&pool, &query).await?;
            let sections = timeline::sections(entries);
            if json {
                println!("{}", serde_json::to_string_pretty(&sections)?);
            } else {
                print_section("Now", &sections.active);
                print_section("Upcoming", &sections.upcoming);
                print_section("Recent", &sections.past);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            serve(pool, config, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> Result<Config, config::ConfigError> {
    if path.exists() {
        info!(path = %path.display(), "Loading configuration");
        Config::load(path)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Flips to true on Ctrl-C. Batches observe it between records.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

async fn run_batch(
    pool: sqlx::SqlitePool,
    config: Config,
    shutdown: watch::Receiver<bool>,
    kind: BatchKind,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let manager = SyncManager::new(pool, config, shutdown)?;
    let result = manager.run(kind).await;
    let outcome = outcome_of(&result);

    info!(kind = %kind, outcome = outcome.as_str(), "Batch complete");
    Ok(ExitCode::from(outcome.exit_code()))
}

async fn serve(
    pool: sqlx::SqlitePool,
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cors = cors_layer(&config.server);
    let bind = config.server.bind.clone();

    let manager = Arc::new(SyncManager::new(pool.clone(), config, shutdown.clone())?);
    let scheduler = tokio::spawn(manager.start());

    let app = api::router(pool)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "Serving API");

    let mut server_shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    scheduler.await?;
    Ok(())
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    if server.cors_permissive {
        warn!("CORS is permissive, allowing all origins");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin
                .parse()
                .map_err(|e| warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin"))
                .ok()
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

fn print_section(title: &str, entries: &[TimelineEntry]) {
    println!("{title} ({})", entries.len());
    for entry in entries {
        let end = entry
            .opening
            .end
            .map(|end| end.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "open".to_string());
        let label = entry
            .bridge
            .as_ref()
            .map(|b| b.label())
            .unwrap_or_else(|| format!("Unknown bridge at {}", entry.opening.site_key));
        println!(
            "  {} -> {}  {}",
            entry.opening.start.format("%Y-%m-%d %H:%M"),
            end,
            label
        );
    }
}
