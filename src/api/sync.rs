use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::{IntoParams, ToSchema};

use crate::api::{internal_error, ApiError, ErrorResponse};

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Serialize, ToSchema, FromRow)]
pub struct SyncRun {
    pub id: i64,
    pub kind: String,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: String,
    pub accepted: i64,
    pub dropped: i64,
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub conflicts: i64,
    pub message: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SyncRunListResponse {
    pub runs: Vec<SyncRun>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SyncRunQuery {
    /// Filter by batch kind ("opening-sync", "geo-import", "enrichment")
    pub kind: Option<String>,
    /// Maximum runs returned, newest first (default 20, max 200)
    pub limit: Option<i64>,
}

/// Recent batch runs, newest first
#[utoipa::path(
    get,
    path = "/api/sync/runs",
    params(SyncRunQuery),
    responses(
        (status = 200, description = "Recent sync runs", body = SyncRunListResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "sync"
)]
pub async fn list_runs(
    State(pool): State<SqlitePool>,
    Query(query): Query<SyncRunQuery>,
) -> Result<Json<SyncRunListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let runs: Vec<SyncRun> = sqlx::query_as(
        r#"
        SELECT id, kind, started_at, finished_at, outcome, accepted, dropped,
               inserted, updated, unchanged, conflicts, message
        FROM sync_runs
        WHERE ? IS NULL OR kind = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(&query.kind)
    .bind(&query.kind)
    .bind(limit)
    .fetch_all(&pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(SyncRunListResponse { runs }))
}
