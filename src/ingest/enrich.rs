//! Location enricher: names unnamed bridges by reverse geocoding, helped by
//! the streets and waterways OSM knows around them.
//!
//! Resumable by construction. Only `name IS NULL` rows are selected and each
//! result is committed on its own, so an interrupted pass loses at most the
//! bridge in flight.

use crate::ingest::merge::{record_enrichment, BridgeEnrichment, MergeError};
use crate::models::Coordinate;
use crate::providers::nominatim::{GeocodeError, NominatimClient, Place};
use crate::providers::osm::{NearbyNames, OsmClient, OsmError};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reverse geocoding seam, implemented by the Nominatim client
pub trait ReverseGeocoder {
    fn reverse(
        &self,
        coordinate: Coordinate,
    ) -> impl Future<Output = Result<Place, GeocodeError>> + Send;
}

impl ReverseGeocoder for NominatimClient {
    async fn reverse(&self, coordinate: Coordinate) -> Result<Place, GeocodeError> {
        NominatimClient::reverse(self, coordinate).await
    }
}

/// Street and waterway lookup around a bridge, implemented by the Overpass client
pub trait NearbyFeatures {
    fn nearby(
        &self,
        coordinate: Coordinate,
    ) -> impl Future<Output = Result<NearbyNames, OsmError>> + Send;
}

impl NearbyFeatures for OsmClient {
    async fn nearby(&self, coordinate: Coordinate) -> Result<NearbyNames, OsmError> {
        self.nearby_names(coordinate).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    /// Maximum bridges looked up in one pass
    pub limit: Option<usize>,
    /// Pause between consecutive lookups
    pub pause: Duration,
}

#[derive(Debug, Default, PartialEq)]
pub struct EnrichReport {
    pub selected: usize,
    pub enriched: usize,
    /// Named by someone else between selection and write
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, FromRow)]
struct PendingBridge {
    external_key: String,
    lat: f64,
    lon: f64,
    tags: Option<String>,
}

impl PendingBridge {
    fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }

    /// `addr:street` from the OSM tags stored at import
    fn tagged_street(&self) -> Option<String> {
        let tags: HashMap<String, String> = serde_json::from_str(self.tags.as_deref()?).ok()?;
        tags.get("addr:street")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Run one enrichment pass over bridges without a name
pub async fn enrich_bridges<G: ReverseGeocoder, N: NearbyFeatures>(
    pool: &SqlitePool,
    geocoder: &G,
    nearby: &N,
    options: &EnrichOptions,
    shutdown: &watch::Receiver<bool>,
) -> Result<EnrichReport, EnrichError> {
    let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
    let pending: Vec<PendingBridge> = sqlx::query_as(
        r#"
        SELECT external_key, lat, lon, tags
        FROM bridges
        WHERE name IS NULL
        ORDER BY external_key
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| EnrichError::Database(e.to_string()))?;

    let mut report = EnrichReport {
        selected: pending.len(),
        ..Default::default()
    };
    info!(pending = report.selected, "Starting enrichment pass");

    for (index, bridge) in pending.iter().enumerate() {
        if *shutdown.borrow() {
            info!(enriched = report.enriched, "Enrichment cancelled");
            report.cancelled = true;
            break;
        }

        if index > 0 && !options.pause.is_zero() {
            tokio::time::sleep(options.pause).await;
        }

        let place = match geocoder.reverse(bridge.coordinate()).await {
            Ok(place) => place,
            Err(source) => {
                warn!(
                    key = %bridge.external_key,
                    error = %source,
                    "Reverse geocoding failed, aborting pass"
                );
                return Err(EnrichError::Geocode {
                    enriched: report.enriched,
                    source,
                });
            }
        };

        let tagged_street = bridge.tagged_street();
        let around = if place.street.is_some() && place.water.is_some() {
            NearbyNames::default()
        } else {
            // Best effort: a failed lookup only costs the nicer name
            nearby
                .nearby(bridge.coordinate())
                .await
                .inspect_err(|e| {
                    warn!(key = %bridge.external_key, error = %e, "Nearby feature lookup failed");
                })
                .unwrap_or_default()
        };

        let enrichment = enrichment_for(bridge.coordinate(), place, tagged_street, around);
        debug!(
            key = %bridge.external_key,
            name = %enrichment.name,
            street = ?enrichment.street_name,
            water = ?enrichment.water_name,
            "Enriched bridge"
        );

        let written = record_enrichment(pool, &bridge.external_key, &enrichment)
            .await
            .map_err(|MergeError::Database(e)| EnrichError::Database(e))?;
        if written {
            report.enriched += 1;
        } else {
            report.skipped += 1;
        }
    }

    info!(
        enriched = report.enriched,
        skipped = report.skipped,
        "Completed enrichment pass"
    );
    Ok(report)
}

/// Street: geocoder, then the bridge's own address tag, then nearby ways.
/// Water: geocoder, then nearby waterways.
fn enrichment_for(
    coordinate: Coordinate,
    place: Place,
    tagged_street: Option<String>,
    around: NearbyNames,
) -> BridgeEnrichment {
    let street_name = place.street.or(tagged_street).or(around.street);
    let water_name = place.water.or(around.water);

    BridgeEnrichment {
        name: derive_name(
            street_name.as_deref(),
            water_name.as_deref(),
            place.display_name.as_deref(),
            coordinate,
        ),
        address: place.display_name,
        neighborhood: place.neighborhood,
        city: place.city,
        street_name,
        water_name,
    }
}

/// Best human-readable name the known parts allow
pub fn derive_name(
    street: Option<&str>,
    water: Option<&str>,
    display_name: Option<&str>,
    coordinate: Coordinate,
) -> String {
    match (street, water) {
        (Some(street), Some(water)) => return format!("{street} over {water}"),
        (Some(street), None) => return format!("{street} Bridge"),
        _ => {}
    }

    display_name
        .and_then(|d| d.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Bridge at {:.5}, {:.5}", coordinate.lat, coordinate.lon))
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("Reverse geocoding failed after {enriched} bridges: {source}")]
    Geocode {
        enriched: usize,
        source: GeocodeError,
    },
    #[error("Database error: {0}")]
    Database(String),
}
