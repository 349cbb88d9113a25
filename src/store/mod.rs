//! The SQLite-backed feed store (spec.md §4.3): schema versioning,
//! hash-based feed reuse, and transactional CSV ingestion.

mod ingest;
pub mod schema;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::error::{Error, Result};
use crate::http_client::HttpClient;

pub use ingest::ingest_feed;

/// A connected, schema-checked feed store. Cheap to clone — wraps a pool.
#[derive(Clone)]
pub struct FeedStore {
    pool: SqlitePool,
}

impl FeedStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        let row = sqlx::query("PRAGMA user_version").fetch_one(&self.pool).await?;
        let version: i64 = row.try_get(0)?;

        if version == 0 {
            let mut tx = self.pool.begin().await?;
            for statement in schema::SCHEMA_SQL.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query(&format!("PRAGMA user_version = {}", schema::SCHEMA_VERSION))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version = schema::SCHEMA_VERSION, "initialized feed store schema");
            return Ok(());
        }

        if version < schema::SCHEMA_VERSION {
            return Err(Error::SchemaUpgradeRequired);
        }
        if version > schema::SCHEMA_VERSION {
            return Err(Error::SchemaUnknown);
        }
        Ok(())
    }

    /// Fetch (if stale or uncached) and ingest a feed bundle, returning its
    /// `feed_id`. Reuses the existing feed row unchanged when the bundle's
    /// content hash is already on record for this URL.
    pub async fn load_feed(&self, url: &str, http: &HttpClient) -> Result<i64> {
        let bundle = http.get_bundle(url).await?;
        ingest::ingest_feed(&self.pool, url, &bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_initializes_schema_once() {
        let store = FeedStore::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let version: i64 = row.try_get(0).unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn rejects_newer_schema_version() {
        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::from_str("sqlite::memory:")
                    .unwrap()
                    .create_if_missing(true),
            )
            .await
            .unwrap();
        sqlx::query(&format!("PRAGMA user_version = {}", schema::SCHEMA_VERSION + 1))
            .execute(&pool)
            .await
            .unwrap();
        let store = FeedStore { pool };
        let err = store.ensure_schema().await.unwrap_err();
        assert!(matches!(err, Error::SchemaUnknown));
    }
}
