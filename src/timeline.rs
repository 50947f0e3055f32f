//! Timeline query engine: openings overlapping a window around `now`, joined
//! with the bridge they belong to.
//!
//! Status is derived here on every read and never stored.

use crate::models::{Bridge, Coordinate, OpeningEvent, OpeningLink};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use utoipa::ToSchema;

/// Most recent past openings kept by [`sections`]
pub const PAST_SECTION_LIMIT: usize = 50;

/// Longest window side accepted from callers
pub const MAX_WINDOW_HOURS: i64 = 366 * 24;

#[derive(Debug, Clone)]
pub struct TimelineQuery {
    pub now: DateTime<Utc>,
    pub window_past: Duration,
    pub window_future: Duration,
    pub filter: TimelineFilter,
}

/// Geographic and key-set filters are mutually exclusive
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineFilter {
    All,
    Near { center: Coordinate, radius_m: f64 },
    Bridges(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OpeningStatus {
    Past,
    Active,
    Upcoming,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TimelineEntry {
    /// Null when the opening's site is not linked to a known bridge
    pub bridge: Option<Bridge>,
    pub opening: OpeningEvent,
    pub status: OpeningStatus,
    /// Only set for geographic queries
    pub distance_meters: Option<f64>,
}

#[derive(Debug, Default, PartialEq, Serialize, ToSchema)]
pub struct TimelineSections {
    /// Most recent first
    pub past: Vec<TimelineEntry>,
    pub active: Vec<TimelineEntry>,
    pub upcoming: Vec<TimelineEntry>,
}

#[derive(Debug, FromRow)]
struct TimelineRow {
    id: i64,
    site_key: String,
    site_lat: f64,
    site_lon: f64,
    record_id: String,
    start_ts: i64,
    end_ts: Option<i64>,
    source: Option<String>,
    operator_status: Option<String>,
    bridge_key: Option<String>,
    bridge_name: Option<String>,
    bridge_address: Option<String>,
    bridge_neighborhood: Option<String>,
    bridge_city: Option<String>,
    bridge_street: Option<String>,
    bridge_water: Option<String>,
    bridge_lat: Option<f64>,
    bridge_lon: Option<f64>,
}

/// One side of the query window from a caller-supplied hour count
pub fn window_hours(hours: i64) -> Result<Duration, TimelineError> {
    if !(0..=MAX_WINDOW_HOURS).contains(&hours) {
        return Err(TimelineError::WindowOutOfRange(hours));
    }
    Ok(Duration::hours(hours))
}

/// Derive the status of an opening at `now`
pub fn classify(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> OpeningStatus {
    if start > now {
        return OpeningStatus::Upcoming;
    }
    match end {
        Some(end) if end < now => OpeningStatus::Past,
        _ => OpeningStatus::Active,
    }
}

/// Openings overlapping `[now - window_past, now + window_future]`, ordered by
/// start, then bridge key (orphans last), site key, record id and row id.
pub async fn query_timeline(
    pool: &SqlitePool,
    query: &TimelineQuery,
) -> Result<Vec<TimelineEntry>, TimelineError> {
    if query.window_past < Duration::zero() || query.window_future < Duration::zero() {
        return Err(TimelineError::InvalidWindow);
    }
    if let TimelineFilter::Near { radius_m, .. } = query.filter {
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(TimelineError::InvalidRadius(radius_m));
        }
    }

    // Stored timestamps are whole seconds: round the lower bound up and the
    // upper bound down so sub-second `now` values never widen the window.
    let lower = query
        .now
        .checked_sub_signed(query.window_past)
        .ok_or(TimelineError::InvalidWindow)?;
    let lower = lower.timestamp() + i64::from(lower.timestamp_subsec_nanos() > 0);
    let upper = query
        .now
        .checked_add_signed(query.window_future)
        .ok_or(TimelineError::InvalidWindow)?
        .timestamp();

    // Open-ended openings have no end to test against the lower bound
    let rows: Vec<TimelineRow> = sqlx::query_as(
        r#"
        SELECT
            e.id,
            e.site_key,
            s.lat AS site_lat,
            s.lon AS site_lon,
            e.record_id,
            e.start_ts,
            e.end_ts,
            e.source,
            e.operator_status,
            b.external_key AS bridge_key,
            b.name AS bridge_name,
            b.address AS bridge_address,
            b.neighborhood AS bridge_neighborhood,
            b.city AS bridge_city,
            b.street_name AS bridge_street,
            b.water_name AS bridge_water,
            b.lat AS bridge_lat,
            b.lon AS bridge_lon
        FROM opening_events e
        JOIN opening_sites s ON s.site_key = e.site_key
        LEFT JOIN bridges b ON b.external_key = s.bridge_key
        WHERE e.start_ts <= ?
          AND (e.end_ts IS NULL OR e.end_ts >= ?)
        "#,
    )
    .bind(upper)
    .bind(lower)
    .fetch_all(pool)
    .await
    .map_err(|e| TimelineError::Database(e.to_string()))?;

    let mut links = load_links(pool, lower, upper).await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let bridge = match (&row.bridge_key, row.bridge_lat, row.bridge_lon) {
            (Some(key), Some(lat), Some(lon)) => Some(Bridge {
                external_key: key.clone(),
                name: row.bridge_name.clone(),
                address: row.bridge_address.clone(),
                neighborhood: row.bridge_neighborhood.clone(),
                city: row.bridge_city.clone(),
                street_name: row.bridge_street.clone(),
                water_name: row.bridge_water.clone(),
                lat,
                lon,
            }),
            _ => None,
        };
        let site = Coordinate::new(row.site_lat, row.site_lon);

        let distance_meters = match &query.filter {
            TimelineFilter::All => None,
            TimelineFilter::Near { center, radius_m } => {
                let target = bridge.as_ref().map(Bridge::coordinate).unwrap_or(site);
                let distance = center.distance_to(&target);
                if distance > *radius_m {
                    continue;
                }
                Some(distance)
            }
            TimelineFilter::Bridges(keys) => {
                match &bridge {
                    Some(b) if keys.contains(&b.external_key) => {}
                    _ => continue,
                }
                None
            }
        };

        let start = timestamp(row.start_ts)?;
        let end = row.end_ts.map(timestamp).transpose()?;
        let opening = OpeningEvent {
            id: row.id,
            site_key: row.site_key,
            site,
            record_id: Some(row.record_id).filter(|r| !r.is_empty()),
            start,
            end,
            source: row.source,
            operator_status: row.operator_status,
            links: links.remove(&row.id).unwrap_or_default(),
        };

        entries.push(TimelineEntry {
            status: classify(start, end, query.now),
            bridge,
            opening,
            distance_meters,
        });
    }

    entries.sort_by(compare_entries);
    Ok(entries)
}

/// Split an ordered timeline into the past, active and upcoming lists shown
/// to users. Past openings come most recent first and are capped.
pub fn sections(entries: Vec<TimelineEntry>) -> TimelineSections {
    let mut result = TimelineSections::default();
    for entry in entries {
        match entry.status {
            OpeningStatus::Past => result.past.push(entry),
            OpeningStatus::Active => result.active.push(entry),
            OpeningStatus::Upcoming => result.upcoming.push(entry),
        }
    }
    result.past.reverse();
    result.past.truncate(PAST_SECTION_LIMIT);
    result
}

fn compare_entries(a: &TimelineEntry, b: &TimelineEntry) -> Ordering {
    let bridge_key = |e: &TimelineEntry| e.bridge.as_ref().map(|b| b.external_key.clone());

    a.opening
        .start
        .cmp(&b.opening.start)
        .then_with(|| match (bridge_key(a), bridge_key(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.opening.site_key.cmp(&b.opening.site_key))
        .then_with(|| a.opening.record_id.cmp(&b.opening.record_id))
        .then_with(|| a.opening.id.cmp(&b.opening.id))
}

async fn load_links(
    pool: &SqlitePool,
    lower: i64,
    upper: i64,
) -> Result<HashMap<i64, Vec<OpeningLink>>, TimelineError> {
    let rows: Vec<(i64, Option<String>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT l.opening_id, l.url, l.description
        FROM opening_links l
        JOIN opening_events e ON e.id = l.opening_id
        WHERE e.start_ts <= ?
          AND (e.end_ts IS NULL OR e.end_ts >= ?)
        ORDER BY l.opening_id, l.position
        "#,
    )
    .bind(upper)
    .bind(lower)
    .fetch_all(pool)
    .await
    .map_err(|e| TimelineError::Database(e.to_string()))?;

    let mut links: HashMap<i64, Vec<OpeningLink>> = HashMap::new();
    for (opening_id, url, description) in rows {
        links
            .entry(opening_id)
            .or_default()
            .push(OpeningLink { url, description });
    }
    Ok(links)
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, TimelineError> {
    DateTime::from_timestamp(secs, 0).ok_or(TimelineError::InvalidTimestamp(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Time window must be non-negative and representable")]
    InvalidWindow,
    #[error("Window of {0} hours is outside 0..={MAX_WINDOW_HOURS}")]
    WindowOutOfRange(i64),
    #[error("Radius must be a non-negative number of meters, got {0}")]
    InvalidRadius(f64),
    #[error("Stored timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("Database error: {0}")]
    Database(String),
}
