use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use utoipa::{IntoParams, ToSchema};

use crate::api::{bad_request, internal_error, ApiError, ErrorResponse};
use crate::models::Coordinate;
use crate::timeline::{
    query_timeline, window_hours, TimelineEntry, TimelineError, TimelineFilter, TimelineQuery,
    MAX_WINDOW_HOURS,
};

const DEFAULT_PAST_HOURS: i64 = 24;
const DEFAULT_FUTURE_HOURS: i64 = 7 * 24;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct TimelineParams {
    /// Hours before now to include (default 24)
    pub past_hours: Option<i64>,
    /// Hours after now to include (default 168)
    pub future_hours: Option<i64>,
    /// Latitude of the search center; requires `lon` and `radius_m`
    pub lat: Option<f64>,
    /// Longitude of the search center
    pub lon: Option<f64>,
    /// Search radius in meters (inclusive)
    pub radius_m: Option<f64>,
    /// Comma separated bridge keys, e.g. "way/123,node/456"
    pub bridges: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TimelineResponse {
    pub now: DateTime<Utc>,
    pub entries: Vec<TimelineEntry>,
}

/// Bridge openings overlapping a window around now
#[utoipa::path(
    get,
    path = "/api/timeline",
    params(TimelineParams),
    responses(
        (status = 200, description = "Openings ordered by start time", body = TimelineResponse),
        (status = 400, description = "Invalid window or filter", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "timeline"
)]
pub async fn get_timeline(
    State(pool): State<SqlitePool>,
    Query(params): Query<TimelineParams>,
) -> Result<Json<TimelineResponse>, ApiError> {
    let query = timeline_query(&params, Utc::now()).map_err(bad_request)?;

    let entries = query_timeline(&pool, &query).await.map_err(|e| match e {
        TimelineError::InvalidWindow
        | TimelineError::WindowOutOfRange(_)
        | TimelineError::InvalidRadius(_) => {
            bad_request(e.to_string())
        }
        _ => internal_error(e),
    })?;

    Ok(Json(TimelineResponse {
        now: query.now,
        entries,
    }))
}

fn timeline_query(params: &TimelineParams, now: DateTime<Utc>) -> Result<TimelineQuery, String> {
    let window = |name: &str, hours: i64| {
        window_hours(hours).map_err(|_| format!("{name} must be between 0 and {MAX_WINDOW_HOURS}"))
    };

    Ok(TimelineQuery {
        now,
        window_past: window("past_hours", params.past_hours.unwrap_or(DEFAULT_PAST_HOURS))?,
        window_future: window("future_hours", params.future_hours.unwrap_or(DEFAULT_FUTURE_HOURS))?,
        filter: timeline_filter(params)?,
    })
}

fn timeline_filter(params: &TimelineParams) -> Result<TimelineFilter, String> {
    let geographic = (params.lat, params.lon, params.radius_m);
    let keys = params.bridges.as_deref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
    });

    match (geographic, keys) {
        ((None, None, None), None) => Ok(TimelineFilter::All),
        ((None, None, None), Some(keys)) => Ok(TimelineFilter::Bridges(keys)),
        ((Some(lat), Some(lon), Some(radius_m)), None) => {
            let center = Coordinate::new(lat, lon);
            if !center.is_valid() {
                return Err("lat/lon out of range".to_string());
            }
            Ok(TimelineFilter::Near { center, radius_m })
        }
        (_, Some(_)) => Err("bridges cannot be combined with a geographic filter".to_string()),
        _ => Err("lat, lon and radius_m must be given together".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[test]
    fn filters_are_mutually_exclusive() {
        let near = TimelineParams {
            lat: Some(52.37),
            lon: Some(4.9),
            radius_m: Some(500.0),
            ..Default::default()
        };
        assert_eq!(
            timeline_filter(&near),
            Ok(TimelineFilter::Near {
                center: Coordinate::new(52.37, 4.9),
                radius_m: 500.0
            })
        );

        let watched = TimelineParams {
            bridges: Some("way/2, way/1,,".to_string()),
            ..Default::default()
        };
        assert_eq!(
            timeline_filter(&watched),
            Ok(TimelineFilter::Bridges(BTreeSet::from([
                "way/1".to_string(),
                "way/2".to_string()
            ])))
        );

        let mixed = TimelineParams {
            bridges: Some("way/1".to_string()),
            ..near
        };
        assert!(timeline_filter(&mixed).is_err());

        let partial = TimelineParams {
            lat: Some(52.37),
            ..Default::default()
        };
        assert!(timeline_filter(&partial).is_err());
        assert_eq!(timeline_filter(&TimelineParams::default()), Ok(TimelineFilter::All));
    }

    #[test]
    fn window_defaults_and_bounds() {
        let now = Utc::now();
        let query = timeline_query(&TimelineParams::default(), now).unwrap();
        assert_eq!(query.window_past, Duration::hours(24));
        assert_eq!(query.window_future, Duration::hours(168));

        let negative = TimelineParams {
            past_hours: Some(-1),
            ..Default::default()
        };
        assert!(timeline_query(&negative, now).is_err());

        let huge = TimelineParams {
            future_hours: Some(i64::MAX),
            ..Default::default()
        };
        assert_eq!(
            timeline_query(&huge, now).map(|_| ()),
            Err(format!("future_hours must be between 0 and {MAX_WINDOW_HOURS}"))
        );
    }
}
