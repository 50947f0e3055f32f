use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::api::{internal_error, not_found, ApiError, ErrorResponse};
use crate::models::Bridge;
use crate::timeline::{query_timeline, TimelineEntry, TimelineFilter, TimelineQuery};

/// Window of openings returned with a bridge
const DETAIL_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Serialize, ToSchema)]
pub struct BridgeDetail {
    #[serde(flatten)]
    pub bridge: Bridge,
    pub label: String,
    /// Feed sites linked to this bridge
    pub sites: Vec<String>,
    /// Openings within 30 days of now
    pub openings: Vec<TimelineEntry>,
}

/// Get a bridge with its recent and upcoming openings
#[utoipa::path(
    get,
    path = "/api/bridges/{key}",
    params(
        ("key" = String, Path, description = "Bridge key, URL encoded (e.g. way%2F123)")
    ),
    responses(
        (status = 200, description = "Bridge details", body = BridgeDetail),
        (status = 404, description = "Bridge not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "bridges"
)]
pub async fn get_bridge(
    State(pool): State<SqlitePool>,
    Path(key): Path<String>,
) -> Result<Json<BridgeDetail>, ApiError> {
    let bridge: Option<Bridge> = sqlx::query_as(
        r#"
        SELECT external_key, name, address, neighborhood, city, street_name, water_name, lat, lon
        FROM bridges
        WHERE external_key = ?
        "#,
    )
    .bind(&key)
    .fetch_optional(&pool)
    .await
    .map_err(internal_error)?;

    let bridge = bridge.ok_or_else(|| not_found(format!("Bridge {key} not found")))?;

    let sites: Vec<String> = sqlx::query_scalar(
        "SELECT site_key FROM opening_sites WHERE bridge_key = ? ORDER BY site_key",
    )
    .bind(&key)
    .fetch_all(&pool)
    .await
    .map_err(internal_error)?;

    let openings = query_timeline(
        &pool,
        &TimelineQuery {
            now: Utc::now(),
            window_past: Duration::days(DETAIL_WINDOW_DAYS),
            window_future: Duration::days(DETAIL_WINDOW_DAYS),
            filter: TimelineFilter::Bridges(BTreeSet::from([key])),
        },
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(BridgeDetail {
        label: bridge.label(),
        bridge,
        sites,
        openings,
    }))
}
