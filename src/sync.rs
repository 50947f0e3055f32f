use crate::config::Config;
use crate::ingest::bridges::{bridges_from_elements, dedup_bridges};
use crate::ingest::datex::{self, FeedFormatError};
use crate::ingest::enrich::{enrich_bridges, EnrichError, EnrichOptions};
use crate::ingest::merge::{merge_bridges, merge_openings, MergeError};
use crate::providers::ndw::{FeedClient, FetchError};
use crate::providers::nominatim::{GeocodeError, NominatimClient};
use crate::providers::osm::{OsmClient, OsmError};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Pause between Overpass queries for consecutive areas
const AREA_PAUSE: Duration = Duration::from_secs(2);

/// Delay before the first scheduled enrichment after startup
const ENRICHMENT_STARTUP_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    OpeningSync,
    GeoImport,
    Enrichment,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::OpeningSync => "opening-sync",
            BatchKind::GeoImport => "geo-import",
            BatchKind::Enrichment => "enrichment",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    /// Committed, but some records were dropped, conflicted or left for later
    Partial,
    FetchFailed,
    FormatFailed,
    AlreadyRunning,
    Failed,
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOutcome::Success => "success",
            BatchOutcome::Partial => "partial",
            BatchOutcome::FetchFailed => "fetch_failed",
            BatchOutcome::FormatFailed => "format_failed",
            BatchOutcome::AlreadyRunning => "already_running",
            BatchOutcome::Failed => "failed",
        }
    }

    /// Process exit status for command line runs
    pub fn exit_code(&self) -> u8 {
        match self {
            BatchOutcome::Success => 0,
            BatchOutcome::Failed => 1,
            BatchOutcome::Partial => 2,
            BatchOutcome::FetchFailed => 3,
            BatchOutcome::FormatFailed => 4,
            BatchOutcome::AlreadyRunning => 5,
        }
    }
}

/// Counters of one committed batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub accepted: usize,
    pub dropped: usize,
    pub ignored: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub sites_linked: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn outcome(&self) -> BatchOutcome {
        if self.dropped > 0 || self.conflicts > 0 || self.cancelled {
            BatchOutcome::Partial
        } else {
            BatchOutcome::Success
        }
    }
}

/// Outcome of a finished or refused batch
pub fn outcome_of(result: &Result<BatchReport, SyncError>) -> BatchOutcome {
    match result {
        Ok(report) => report.outcome(),
        Err(e) => e.outcome(),
    }
}

/// Runs the three batch jobs, at most one of each kind at a time
pub struct SyncManager {
    pool: SqlitePool,
    config: Config,
    feed_client: FeedClient,
    osm_client: OsmClient,
    geocoder: NominatimClient,
    opening_guard: Mutex<()>,
    geo_guard: Mutex<()>,
    enrichment_guard: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl SyncManager {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SyncError> {
        let feed_client = FeedClient::new()?;
        let osm_client = OsmClient::new(&config.overpass.url, config.overpass.timeout())?;
        let geocoder = NominatimClient::new(
            &config.geocoder.url,
            &config.geocoder.user_agent,
            config.geocoder.timeout(),
        )?;

        Ok(Self {
            pool,
            config,
            feed_client,
            osm_client,
            geocoder,
            opening_guard: Mutex::new(()),
            geo_guard: Mutex::new(()),
            enrichment_guard: Mutex::new(()),
            shutdown,
        })
    }

    fn guard(&self, kind: BatchKind) -> &Mutex<()> {
        match kind {
            BatchKind::OpeningSync => &self.opening_guard,
            BatchKind::GeoImport => &self.geo_guard,
            BatchKind::Enrichment => &self.enrichment_guard,
        }
    }

    fn try_acquire(&self, kind: BatchKind) -> Result<MutexGuard<'_, ()>, SyncError> {
        self.guard(kind)
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning(kind))
    }

    /// Run one batch now and record it in `sync_runs`. A batch of the same
    /// kind already in progress is refused without touching the store.
    pub async fn run(&self, kind: BatchKind) -> Result<BatchReport, SyncError> {
        let _guard = self.try_acquire(kind).inspect_err(|_| {
            warn!(kind = %kind, "Batch already running, skipping");
        })?;

        let started_at = Utc::now();
        info!(kind = %kind, "Starting batch");

        let result = match kind {
            BatchKind::OpeningSync => self.sync_openings().await,
            BatchKind::GeoImport => self.import_bridges().await,
            BatchKind::Enrichment => self.enrich().await,
        };

        match &result {
            Ok(report) => info!(
                kind = %kind,
                outcome = outcome_of(&result).as_str(),
                accepted = report.accepted,
                dropped = report.dropped,
                ignored = report.ignored,
                inserted = report.inserted,
                updated = report.updated,
                unchanged = report.unchanged,
                conflicts = report.conflicts,
                sites_linked = report.sites_linked,
                "Batch finished"
            ),
            Err(e) => error!(kind = %kind, error = %e, "Batch failed"),
        }

        if let Err(e) = record_run(&self.pool, kind, started_at, &result).await {
            error!(kind = %kind, error = %e, "Failed to record batch run");
        }

        result
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn sync_openings(&self) -> Result<BatchReport, SyncError> {
        let payload = self
            .feed_client
            .fetch(&self.config.feed.url, self.config.feed.timeout())
            .await?;
        info!(
            fetched_at = %payload.fetched_at,
            bytes = payload.body.len(),
            "Applying feed document"
        );

        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }

        apply_feed_document(&self.pool, &payload.body).await
    }

    /// Full snapshot of all configured areas. Any failed area aborts the
    /// batch before the first write.
    async fn import_bridges(&self) -> Result<BatchReport, SyncError> {
        let mut records = Vec::new();

        for (index, area) in self.config.overpass.areas.iter().enumerate() {
            if self.cancelled() {
                return Err(SyncError::Cancelled);
            }
            if index > 0 {
                tokio::time::sleep(AREA_PAUSE).await;
            }

            let elements = self.osm_client.fetch_bridges(area).await.inspect_err(|e| {
                error!(area = %area.name, error = %e, "Failed to fetch bridges for area");
            })?;
            let area_records = bridges_from_elements(&elements, area);
            info!(
                area = %area.name,
                elements = elements.len(),
                bridges = area_records.len(),
                "Fetched bridges from Overpass"
            );
            records.extend(area_records);
        }

        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }

        let records = dedup_bridges(records);
        let merged = merge_bridges(&self.pool, &records).await?;

        Ok(BatchReport {
            accepted: records.len(),
            inserted: merged.inserted,
            updated: merged.updated,
            unchanged: merged.unchanged,
            conflicts: merged.conflicts.len(),
            sites_linked: merged.sites_linked,
            ..Default::default()
        })
    }

    async fn enrich(&self) -> Result<BatchReport, SyncError> {
        let options = EnrichOptions {
            limit: self.config.geocoder.max_per_run,
            pause: self.config.geocoder.request_interval(),
        };
        let report = enrich_bridges(
            &self.pool,
            &self.geocoder,
            &self.osm_client,
            &options,
            &self.shutdown,
        )
        .await?;

        Ok(BatchReport {
            accepted: report.selected,
            updated: report.enriched,
            unchanged: report.skipped,
            cancelled: report.cancelled,
            ..Default::default()
        })
    }

    /// Start the background sync loops. Returns once shutdown is signalled.
    pub async fn start(self: Arc<Self>) {
        info!("Starting sync manager");

        let bridge_count: Result<i64, _> = sqlx::query_scalar("SELECT COUNT(*) FROM bridges")
            .fetch_one(&self.pool)
            .await;
        let bridges_known = match bridge_count {
            Ok(count) => count > 0,
            Err(e) => {
                error!(error = %e, "Failed to count bridges, assuming none");
                false
            }
        };

        let schedule = &self.config.schedule;
        let geo_period = schedule.geo_import_interval();
        let loops = [
            (
                BatchKind::OpeningSync,
                Duration::ZERO,
                schedule.opening_sync_interval(),
            ),
            (
                BatchKind::GeoImport,
                // Import right away on an empty database
                if bridges_known { geo_period } else { Duration::ZERO },
                geo_period,
            ),
            (
                BatchKind::Enrichment,
                ENRICHMENT_STARTUP_DELAY,
                schedule.enrichment_interval(),
            ),
        ];

        let handles = loops.map(|(kind, first_delay, period)| {
            let manager = self.clone();
            tokio::spawn(async move { manager.schedule_loop(kind, first_delay, period).await })
        });

        futures::future::join_all(handles).await;
        info!("Sync manager stopped");
    }

    async fn schedule_loop(&self, kind: BatchKind, first_delay: Duration, period: Duration) {
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval_at(Instant::now() + first_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            kind = %kind,
            first_run_in_secs = first_delay.as_secs(),
            period_secs = period.as_secs(),
            "Scheduled batch"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged and recorded; the next tick is the retry
                    let _ = self.run(kind).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Normalize and merge one downloaded feed document. A document that cannot
/// be parsed leaves the store untouched.
pub async fn apply_feed_document(
    pool: &SqlitePool,
    payload: &[u8],
) -> Result<BatchReport, SyncError> {
    let feed = datex::normalize(payload)?;
    for dropped in &feed.dropped {
        warn!(
            record = dropped.record_id.as_deref().unwrap_or("<none>"),
            reason = %dropped.reason,
            "Dropped feed record"
        );
    }

    let merged = merge_openings(pool, &feed.records).await?;

    Ok(BatchReport {
        accepted: feed.records.len(),
        dropped: feed.dropped_count(),
        ignored: feed.ignored,
        inserted: merged.inserted,
        updated: merged.updated,
        unchanged: merged.unchanged,
        conflicts: merged.conflicts.len(),
        sites_linked: merged.sites_linked,
        cancelled: false,
    })
}

/// Append a finished batch to `sync_runs`
pub async fn record_run(
    pool: &SqlitePool,
    kind: BatchKind,
    started_at: DateTime<Utc>,
    result: &Result<BatchReport, SyncError>,
) -> Result<(), SyncError> {
    let default_report = BatchReport::default();
    let (report, message) = match result {
        Ok(report) => (report, report.cancelled.then(|| "cancelled".to_string())),
        Err(e) => (&default_report, Some(e.to_string())),
    };

    sqlx::query(
        r#"
        INSERT INTO sync_runs
            (kind, started_at, finished_at, outcome, accepted, dropped,
             inserted, updated, unchanged, conflicts, message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(kind.as_str())
    .bind(started_at.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .bind(outcome_of(result).as_str())
    .bind(report.accepted as i64)
    .bind(report.dropped as i64)
    .bind(report.inserted as i64)
    .bind(report.updated as i64)
    .bind(report.unchanged as i64)
    .bind(report.conflicts as i64)
    .bind(message)
    .execute(pool)
    .await
    .map_err(|e| SyncError::Database(e.to_string()))?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("A {0} batch is already running")]
    AlreadyRunning(BatchKind),
    #[error("Feed fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Feed document rejected: {0}")]
    Format(#[from] FeedFormatError),
    #[error("Overpass error: {0}")]
    Overpass(#[from] OsmError),
    #[error("Geocoding error: {0}")]
    Geocode(#[from] GeocodeError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl SyncError {
    pub fn outcome(&self) -> BatchOutcome {
        match self {
            SyncError::AlreadyRunning(_) => BatchOutcome::AlreadyRunning,
            SyncError::Fetch(_) => BatchOutcome::FetchFailed,
            SyncError::Format(_) => BatchOutcome::FormatFailed,
            SyncError::Overpass(OsmError::ParseError(_)) => BatchOutcome::FormatFailed,
            SyncError::Overpass(_) => BatchOutcome::FetchFailed,
            SyncError::Geocode(GeocodeError::Parse(_)) => BatchOutcome::FormatFailed,
            SyncError::Geocode(_) => BatchOutcome::FetchFailed,
            SyncError::Database(_) | SyncError::Cancelled => BatchOutcome::Failed,
        }
    }
}

impl From<MergeError> for SyncError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Database(message) => SyncError::Database(message),
        }
    }
}

impl From<EnrichError> for SyncError {
    fn from(e: EnrichError) -> Self {
        match e {
            EnrichError::Geocode { enriched, source } => {
                info!(enriched, "Enriched bridges are kept for the next pass");
                SyncError::Geocode(source)
            }
            EnrichError::Database(message) => SyncError::Database(message),
        }
    }
}
