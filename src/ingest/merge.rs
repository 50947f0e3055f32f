//! Idempotent upserts of bridges and openings by natural key.
//!
//! Every batch is one transaction. Identity fields (bridge key and
//! coordinates, opening site/start/record id) are never rewritten; running
//! the same batch twice only bumps `last_seen_at`.

use crate::models::{BridgeRecord, Coordinate, OpeningLink, OpeningRecord, EARTH_RADIUS_M};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

/// Maximum distance between a feed site and the bridge it is linked to
pub const SITE_MATCH_RADIUS_M: f64 = 100.0;

/// Tolerance for treating stored and incoming bridge coordinates as equal
const COORDINATE_EPSILON: f64 = 1e-6;

#[derive(Debug, Default)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: Vec<MergeConflictError>,
    pub sites_created: usize,
    pub sites_linked: usize,
}

enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Conflict(MergeConflictError),
}

impl MergeReport {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Conflict(conflict) => {
                warn!(error = %conflict, "Skipping conflicting record");
                self.conflicts.push(conflict);
            }
        }
    }
}

/// Values an enrichment pass writes onto an unnamed bridge
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEnrichment {
    pub name: String,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub street_name: Option<String>,
    pub water_name: Option<String>,
}

/// Upsert bridge identities, then link any feed sites that are now in range
pub async fn merge_bridges(
    pool: &SqlitePool,
    records: &[BridgeRecord],
) -> Result<MergeReport, MergeError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

    let mut report = MergeReport::default();
    for record in records {
        let outcome = upsert_bridge(&mut tx, record).await?;
        report.record(outcome);
    }

    report.sites_linked = link_unmatched_sites(&mut tx).await?;

    tx.commit()
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        conflicts = report.conflicts.len(),
        sites_linked = report.sites_linked,
        "Merged bridges"
    );
    Ok(report)
}

/// Upsert openings. Each opening's site is written first, in the same
/// transaction, so no opening ever references an unknown site.
pub async fn merge_openings(
    pool: &SqlitePool,
    records: &[OpeningRecord],
) -> Result<MergeReport, MergeError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

    let mut report = MergeReport::default();
    for record in records {
        let site_key = record.site_key();
        if ensure_site(&mut tx, &site_key, record.site).await? {
            report.sites_created += 1;
        }
        let outcome = upsert_opening(&mut tx, &site_key, record).await?;
        report.record(outcome);
    }

    report.sites_linked = link_unmatched_sites(&mut tx).await?;

    tx.commit()
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        sites_created = report.sites_created,
        sites_linked = report.sites_linked,
        "Merged openings"
    );
    Ok(report)
}

/// Store enrichment results. Only applies while the bridge is still unnamed,
/// so a concurrent or repeated pass never overwrites an earlier result.
pub async fn record_enrichment(
    pool: &SqlitePool,
    external_key: &str,
    enrichment: &BridgeEnrichment,
) -> Result<bool, MergeError> {
    let result = sqlx::query(
        r#"
        UPDATE bridges SET
            name = ?,
            address = ?,
            neighborhood = ?,
            city = COALESCE(city, ?),
            street_name = ?,
            water_name = ?,
            enriched_at = datetime('now'),
            updated_at = datetime('now')
        WHERE external_key = ? AND name IS NULL
        "#,
    )
    .bind(&enrichment.name)
    .bind(&enrichment.address)
    .bind(&enrichment.neighborhood)
    .bind(&enrichment.city)
    .bind(&enrichment.street_name)
    .bind(&enrichment.water_name)
    .bind(external_key)
    .execute(pool)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

async fn upsert_bridge(
    tx: &mut Transaction<'_, Sqlite>,
    record: &BridgeRecord,
) -> Result<UpsertOutcome, MergeError> {
    type StoredBridge = (f64, f64, Option<String>, Option<String>, Option<String>, Option<String>);

    let existing: Option<StoredBridge> = sqlx::query_as(
        "SELECT lat, lon, name, city, bridge_type, tags FROM bridges WHERE external_key = ?",
    )
    .bind(&record.external_key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    let Some((lat, lon, name, city, bridge_type, tags)) = existing else {
        sqlx::query(
            r#"
            INSERT INTO bridges (external_key, name, city, lat, lon, bridge_type, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.external_key)
        .bind(&record.name)
        .bind(&record.city)
        .bind(record.coordinate.lat)
        .bind(record.coordinate.lon)
        .bind(&record.bridge_type)
        .bind(&record.tags)
        .execute(&mut **tx)
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

        return Ok(UpsertOutcome::Inserted);
    };

    if (lat - record.coordinate.lat).abs() > COORDINATE_EPSILON
        || (lon - record.coordinate.lon).abs() > COORDINATE_EPSILON
    {
        return Ok(UpsertOutcome::Conflict(MergeConflictError::BridgeMoved {
            external_key: record.external_key.clone(),
            stored: Coordinate::new(lat, lon),
            incoming: record.coordinate,
        }));
    }

    // Absent incoming values never clear stored ones
    let new_name = record.name.clone().or(name.clone());
    let new_city = record.city.clone().or(city.clone());
    let new_type = record.bridge_type.clone().or(bridge_type.clone());
    let new_tags = record.tags.clone().or(tags.clone());

    if new_name == name && new_city == city && new_type == bridge_type && new_tags == tags {
        return Ok(UpsertOutcome::Unchanged);
    }

    sqlx::query(
        r#"
        UPDATE bridges SET
            name = ?,
            city = ?,
            bridge_type = ?,
            tags = ?,
            updated_at = datetime('now')
        WHERE external_key = ?
        "#,
    )
    .bind(&new_name)
    .bind(&new_city)
    .bind(&new_type)
    .bind(&new_tags)
    .bind(&record.external_key)
    .execute(&mut **tx)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    Ok(UpsertOutcome::Updated)
}

/// Insert the site if unknown. Returns true when it was created.
async fn ensure_site(
    tx: &mut Transaction<'_, Sqlite>,
    site_key: &str,
    coordinate: Coordinate,
) -> Result<bool, MergeError> {
    let result = sqlx::query(
        r#"
        INSERT INTO opening_sites (site_key, lat, lon)
        VALUES (?, ?, ?)
        ON CONFLICT(site_key) DO NOTHING
        "#,
    )
    .bind(site_key)
    .bind(coordinate.lat)
    .bind(coordinate.lon)
    .execute(&mut **tx)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

async fn upsert_opening(
    tx: &mut Transaction<'_, Sqlite>,
    site_key: &str,
    record: &OpeningRecord,
) -> Result<UpsertOutcome, MergeError> {
    let start_ts = record.start.timestamp();
    let end_ts = record.end.map(|end| end.timestamp());
    let record_id = record.record_id.as_deref().unwrap_or("");

    let existing: Option<(i64, Option<i64>, Option<String>, Option<String>, Option<String>)> =
        sqlx::query_as(
            r#"
            SELECT id, end_ts, record_version, source, operator_status
            FROM opening_events
            WHERE site_key = ? AND start_ts = ? AND record_id = ?
            "#,
        )
        .bind(site_key)
        .bind(start_ts)
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

    let Some((id, stored_end, stored_version, stored_source, stored_status)) = existing else {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO opening_events
                (site_key, start_ts, end_ts, record_id, record_version, source, operator_status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(site_key)
        .bind(start_ts)
        .bind(end_ts)
        .bind(record_id)
        .bind(&record.record_version)
        .bind(&record.source)
        .bind(&record.operator_status)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

        insert_links(tx, id, &record.links).await?;
        return Ok(UpsertOutcome::Inserted);
    };

    let stored_links = load_links(tx, id).await?;
    let links_changed = stored_links != record.links;
    let changed = links_changed
        || stored_end != end_ts
        || stored_version != record.record_version
        || stored_source != record.source
        || stored_status != record.operator_status;

    sqlx::query(
        r#"
        UPDATE opening_events SET
            end_ts = ?,
            record_version = ?,
            source = ?,
            operator_status = ?,
            last_seen_at = datetime('now')
        WHERE id = ?
        "#,
    )
    .bind(end_ts)
    .bind(&record.record_version)
    .bind(&record.source)
    .bind(&record.operator_status)
    .bind(id)
    .execute(&mut **tx)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    if links_changed {
        debug!(opening_id = id, "Replacing opening links");
        sqlx::query("DELETE FROM opening_links WHERE opening_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| MergeError::Database(e.to_string()))?;
        insert_links(tx, id, &record.links).await?;
    }

    Ok(if changed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    })
}

async fn load_links(
    tx: &mut Transaction<'_, Sqlite>,
    opening_id: i64,
) -> Result<Vec<OpeningLink>, MergeError> {
    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT url, description FROM opening_links WHERE opening_id = ? ORDER BY position",
    )
    .bind(opening_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| MergeError::Database(e.to_string()))?;

    Ok(rows
        .into_iter()
        .map(|(url, description)| OpeningLink { url, description })
        .collect())
}

async fn insert_links(
    tx: &mut Transaction<'_, Sqlite>,
    opening_id: i64,
    links: &[OpeningLink],
) -> Result<(), MergeError> {
    for (position, link) in links.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO opening_links (opening_id, position, url, description)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(opening_id)
        .bind(position as i64)
        .bind(&link.url)
        .bind(&link.description)
        .execute(&mut **tx)
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;
    }
    Ok(())
}

/// Link every unlinked site to the nearest bridge within
/// `SITE_MATCH_RADIUS_M`. Established links are never rewritten.
async fn link_unmatched_sites(tx: &mut Transaction<'_, Sqlite>) -> Result<usize, MergeError> {
    let sites: Vec<(String, f64, f64)> =
        sqlx::query_as("SELECT site_key, lat, lon FROM opening_sites WHERE bridge_key IS NULL")
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| MergeError::Database(e.to_string()))?;

    // Same sphere as the haversine check, so the box never cuts into the radius
    let lat_delta = (SITE_MATCH_RADIUS_M / EARTH_RADIUS_M).to_degrees();

    let mut linked = 0;
    for (site_key, lat, lon) in sites {
        let site = Coordinate::new(lat, lon);
        let lon_delta = lat_delta / lat.to_radians().cos().abs().max(0.01);

        let candidates: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT external_key, lat, lon FROM bridges
            WHERE lat BETWEEN ? AND ? AND lon BETWEEN ? AND ?
            "#,
        )
        .bind(lat - lat_delta)
        .bind(lat + lat_delta)
        .bind(lon - lon_delta)
        .bind(lon + lon_delta)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| MergeError::Database(e.to_string()))?;

        let nearest = candidates
            .iter()
            .map(|(key, blat, blon)| (key, site.distance_to(&Coordinate::new(*blat, *blon))))
            .filter(|(_, distance)| *distance <= SITE_MATCH_RADIUS_M)
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        if let Some((bridge_key, distance)) = nearest {
            sqlx::query(
                r#"
                UPDATE opening_sites SET bridge_key = ?, linked_at = datetime('now')
                WHERE site_key = ? AND bridge_key IS NULL
                "#,
            )
            .bind(bridge_key)
            .bind(&site_key)
            .execute(&mut **tx)
            .await
            .map_err(|e| MergeError::Database(e.to_string()))?;

            debug!(
                site = %site_key,
                bridge = %bridge_key,
                distance_m = distance,
                "Linked feed site to bridge"
            );
            linked += 1;
        }
    }

    Ok(linked)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeConflictError {
    #[error("bridge {external_key} moved from {stored:?} to {incoming:?}")]
    BridgeMoved {
        external_key: String,
        stored: Coordinate,
        incoming: Coordinate,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, insert_bridge, memory_pool};
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn opening(record_id: &str, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> OpeningRecord {
        OpeningRecord {
            site: Coordinate::new(52.3700, 4.8900),
            record_id: Some(record_id.to_string()),
            record_version: Some("1".to_string()),
            start,
            end,
            source: Some("NDW".to_string()),
            operator_status: Some("approved".to_string()),
            links: Vec::new(),
        }
    }

    fn bridge(key: &str, name: Option<&str>, lat: f64, lon: f64) -> BridgeRecord {
        BridgeRecord {
            external_key: key.to_string(),
            name: name.map(str::to_string),
            city: Some("Amsterdam".to_string()),
            coordinate: Coordinate::new(lat, lon),
            bridge_type: Some("movable".to_string()),
            tags: Some(r#"{"bridge":"movable"}"#.to_string()),
        }
    }

    #[tokio::test]
    async fn merging_the_same_batch_twice_is_a_no_op() {
        let pool = memory_pool().await;
        let batch = vec![
            opening("a", at(10, 0), Some(at(10, 15))),
            opening("b", at(12, 0), None),
        ];

        let first = merge_openings(&pool, &batch).await.unwrap();
        assert_eq!((first.inserted, first.sites_created), (2, 1));

        let second = merge_openings(&pool, &batch).await.unwrap();
        assert_eq!((second.inserted, second.updated, second.unchanged), (0, 0, 2));
        assert_eq!(second.sites_created, 0);

        assert_eq!(count(&pool, "opening_events").await, 2);
        assert_eq!(count(&pool, "opening_sites").await, 1);

        let starts: Vec<i64> =
            sqlx::query_scalar("SELECT start_ts FROM opening_events ORDER BY start_ts")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(starts, vec![at(10, 0).timestamp(), at(12, 0).timestamp()]);
    }

    #[tokio::test]
    async fn changed_end_time_updates_in_place() {
        let pool = memory_pool().await;
        merge_openings(&pool, &[opening("a", at(10, 0), Some(at(10, 15)))])
            .await
            .unwrap();

        let report = merge_openings(&pool, &[opening("a", at(10, 0), Some(at(10, 40)))])
            .await
            .unwrap();
        assert_eq!((report.inserted, report.updated), (0, 1));

        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT start_ts, end_ts FROM opening_events WHERE site_key = '52.3700,4.8900'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows, vec![(at(10, 0).timestamp(), Some(at(10, 40).timestamp()))]);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_collapse() {
        let pool = memory_pool().await;
        let record = opening("a", at(10, 0), Some(at(10, 15)));

        let report = merge_openings(&pool, &[record.clone(), record]).await.unwrap();

        assert_eq!((report.inserted, report.unchanged), (1, 1));
        assert_eq!(count(&pool, "opening_events").await, 1);
    }

    #[tokio::test]
    async fn missing_record_id_still_deduplicates() {
        let pool = memory_pool().await;
        let mut record = opening("a", at(10, 0), None);
        record.record_id = None;

        merge_openings(&pool, &[record.clone()]).await.unwrap();
        merge_openings(&pool, &[record]).await.unwrap();

        assert_eq!(count(&pool, "opening_events").await, 1);
    }

    #[tokio::test]
    async fn links_are_replaced_only_when_changed() {
        let pool = memory_pool().await;
        let mut record = opening("a", at(10, 0), None);
        record.links = vec![OpeningLink {
            url: Some("https://example.org/1".to_string()),
            description: None,
        }];
        merge_openings(&pool, &[record.clone()]).await.unwrap();

        let first_id: i64 = sqlx::query_scalar("SELECT id FROM opening_links")
            .fetch_one(&pool)
            .await
            .unwrap();

        merge_openings(&pool, &[record.clone()]).await.unwrap();
        let same_id: i64 = sqlx::query_scalar("SELECT id FROM opening_links")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(first_id, same_id);

        record.links[0].url = Some("https://example.org/2".to_string());
        let report = merge_openings(&pool, &[record]).await.unwrap();
        assert_eq!(report.updated, 1);

        let urls: Vec<Option<String>> = sqlx::query_scalar("SELECT url FROM opening_links")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(urls, vec![Some("https://example.org/2".to_string())]);
    }

    #[tokio::test]
    async fn sites_link_to_nearest_bridge_in_range() {
        let pool = memory_pool().await;
        // ~45 m and ~30 m north of the site; a third bridge far away
        insert_bridge(&pool, "way/far", None, 52.40, 4.89).await;
        insert_bridge(&pool, "way/near", None, 52.3704, 4.8900).await;
        insert_bridge(&pool, "way/nearest", None, 52.370_27, 4.8900).await;

        let report = merge_openings(&pool, &[opening("a", at(10, 0), None)])
            .await
            .unwrap();
        assert_eq!(report.sites_linked, 1);

        let linked: Option<String> =
            sqlx::query_scalar("SELECT bridge_key FROM opening_sites")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(linked.as_deref(), Some("way/nearest"));
    }

    #[tokio::test]
    async fn bridge_just_inside_radius_is_linked() {
        let pool = memory_pool().await;
        let site = Coordinate::new(52.3700, 4.8900);
        // Due north, 99.9 m along the great circle
        let lat = site.lat + (99.9 / EARTH_RADIUS_M).to_degrees();
        insert_bridge(&pool, "way/edge", None, lat, site.lon).await;
        let distance = site.distance_to(&Coordinate::new(lat, site.lon));
        assert!(distance > 99.8 && distance < 100.0, "{distance}");

        let report = merge_openings(&pool, &[opening("a", at(10, 0), None)])
            .await
            .unwrap();
        assert_eq!(report.sites_linked, 1);
    }

    #[tokio::test]
    async fn failing_record_rolls_back_the_whole_batch() {
        let pool = memory_pool().await;
        let valid = opening("a", at(10, 0), Some(at(10, 15)));
        // Rejected by the end >= start check constraint
        let reversed = opening("b", at(11, 0), Some(at(10, 0)));

        let result = merge_openings(&pool, &[valid, reversed]).await;

        assert!(matches!(result, Err(MergeError::Database(_))));
        assert_eq!(count(&pool, "opening_events").await, 0);
        assert_eq!(count(&pool, "opening_sites").await, 0);
    }

    #[tokio::test]
    async fn site_without_bridge_stays_pending_until_import() {
        let pool = memory_pool().await;
        merge_openings(&pool, &[opening("a", at(10, 0), None)])
            .await
            .unwrap();

        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM opening_sites WHERE bridge_key IS NULL")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(pending, 1);

        let report = merge_bridges(&pool, &[bridge("way/1", None, 52.3701, 4.8901)])
            .await
            .unwrap();
        assert_eq!(report.sites_linked, 1);
    }

    #[tokio::test]
    async fn bridge_reimport_keeps_enriched_name_and_rejects_moves() {
        let pool = memory_pool().await;
        merge_bridges(&pool, &[bridge("way/1", None, 52.36, 4.90)])
            .await
            .unwrap();

        let enrichment = BridgeEnrichment {
            name: "Amstel Bridge".to_string(),
            address: Some("Amstel, Amsterdam".to_string()),
            neighborhood: Some("Centrum".to_string()),
            city: None,
            street_name: Some("Amstel".to_string()),
            water_name: None,
        };
        assert!(record_enrichment(&pool, "way/1", &enrichment).await.unwrap());
        // Second pass must not overwrite
        assert!(!record_enrichment(&pool, "way/1", &enrichment).await.unwrap());

        let again = merge_bridges(&pool, &[bridge("way/1", None, 52.36, 4.90)])
            .await
            .unwrap();
        assert_eq!(again.unchanged, 1);

        let moved = merge_bridges(&pool, &[bridge("way/1", Some("Other"), 52.50, 4.90)])
            .await
            .unwrap();
        assert_eq!(moved.conflicts.len(), 1);
        assert!(matches!(
            moved.conflicts[0],
            MergeConflictError::BridgeMoved { ref external_key, .. } if external_key == "way/1"
        ));

        let stored: (String, f64, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT name, lat, address, street_name FROM bridges WHERE external_key = 'way/1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(
            stored,
            (
                "Amstel Bridge".to_string(),
                52.36,
                Some("Amstel, Amsterdam".to_string()),
                Some("Amstel".to_string())
            )
        );
    }

    #[tokio::test]
    async fn named_reimport_refreshes_name() {
        let pool = memory_pool().await;
        merge_bridges(&pool, &[bridge("way/1", None, 52.36, 4.90)])
            .await
            .unwrap();

        let report = merge_bridges(&pool, &[bridge("way/1", Some("Magere Brug"), 52.36, 4.90)])
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(count(&pool, "bridges").await, 1);
    }
}
