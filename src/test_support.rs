//! Shared helpers for the in-crate test modules.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// In-memory database with the full schema.
///
/// A single connection that never expires: every pooled connection to
/// `:memory:` would otherwise see its own empty database.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();

    crate::db::migrate(&pool).await.unwrap();
    pool
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn insert_bridge(pool: &SqlitePool, key: &str, name: Option<&str>, lat: f64, lon: f64) {
    sqlx::query("INSERT INTO bridges (external_key, name, lat, lon) VALUES (?, ?, ?, ?)")
        .bind(key)
        .bind(name)
        .bind(lat)
        .bind(lon)
        .execute(pool)
        .await
        .unwrap();
}

/// Serve `router` on an ephemeral local port for the rest of the test.
/// Returns the base URL, ending in `/`.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/")
}
