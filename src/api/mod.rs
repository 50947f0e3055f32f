pub mod bridges;
pub mod error;
pub mod sync;
pub mod timeline;

pub use error::{bad_request, internal_error, not_found, ApiError, ErrorResponse};

use axum::Router;
use sqlx::SqlitePool;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "bridgeping",
        description = "Read-only access to bridge openings and sync history"
    ),
    tags(
        (name = "timeline", description = "Openings around now"),
        (name = "bridges", description = "Bridge identities"),
        (name = "sync", description = "Batch job history")
    )
)]
pub struct ApiDoc;

/// All API routes plus Swagger UI at `/swagger-ui`
pub fn router(pool: SqlitePool) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(timeline::get_timeline))
        .routes(routes!(bridges::get_bridge))
        .routes(routes!(sync::list_runs))
        .with_state(pool)
        .split_for_parts();

    router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::merge::merge_openings;
    use crate::models::{Coordinate, OpeningRecord};
    use crate::test_support::{insert_bridge, memory_pool};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn seeded() -> SqlitePool {
        let pool = memory_pool().await;
        insert_bridge(&pool, "way/1", Some("Magere Brug"), 52.3633, 4.9023).await;

        let start = Utc::now() + Duration::hours(1);
        merge_openings(
            &pool,
            &[OpeningRecord {
                site: Coordinate::new(52.3633, 4.9023),
                record_id: Some("r1".to_string()),
                record_version: None,
                start,
                end: None,
                source: None,
                operator_status: None,
                links: Vec::new(),
            }],
        )
        .await
        .unwrap();
        pool
    }

    async fn get(pool: &SqlitePool, uri: &str) -> (StatusCode, Value) {
        let response = router(pool.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn timeline_returns_joined_openings() {
        let pool = seeded().await;

        let (status, body) = get(&pool, "/api/timeline").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"][0]["bridge"]["external_key"], "way/1");
        assert_eq!(body["entries"][0]["status"], "upcoming");

        let (status, body) = get(&pool, "/api/timeline?lat=52.0&lon=4.0&radius_m=100").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn invalid_filters_are_rejected() {
        let pool = seeded().await;

        let (status, body) = get(&pool, "/api/timeline?lat=52.0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some());

        let (status, _) = get(&pool, "/api/timeline?lat=52.0&lon=4.0&radius_m=-5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bridge_detail_by_encoded_key() {
        let pool = seeded().await;

        let (status, body) = get(&pool, "/api/bridges/way%2F1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "Magere Brug");
        assert_eq!(body["sites"][0], "52.3633,4.9023");
        assert_eq!(body["openings"].as_array().map(Vec::len), Some(1));

        let (status, _) = get(&pool, "/api/bridges/way%2F999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_runs_list_is_empty_initially() {
        let pool = seeded().await;

        let (status, body) = get(&pool, "/api/sync/runs?kind=geo-import").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runs"], serde_json::json!([]));
    }
}
