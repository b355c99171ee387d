//! SQLite-backed listing store, deduplicated on `external_id`

use crate::error::StoreError;
use crate::models::Listing;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CREATE_LISTINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS listings (
        external_id TEXT PRIMARY KEY NOT NULL,
        title TEXT,
        price REAL,
        location TEXT,
        url TEXT,
        first_seen TEXT,
        last_seen TEXT,
        raw_attributes TEXT
    )
"#;

const UPSERT_LISTING: &str = r#"
    INSERT INTO listings (
        external_id, title, price, location, url, first_seen, last_seen, raw_attributes
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(external_id) DO UPDATE SET
        title = excluded.title,
        price = excluded.price,
        location = excluded.location,
        url = excluded.url,
        last_seen = excluded.last_seen,
        raw_attributes = excluded.raw_attributes
"#;

const SELECT_LISTING: &str = "SELECT external_id, title, price, location, url, first_seen, last_seen, raw_attributes FROM listings";

/// Whether an upsert created the row or refreshed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    external_id: String,
    title: Option<String>,
    price: Option<f64>,
    location: Option<String>,
    url: Option<String>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    raw_attributes: Option<String>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        let raw_attributes = row
            .raw_attributes
            .as_deref()
            .map(|json| {
                serde_json::from_str::<BTreeMap<String, String>>(json).unwrap_or_else(|e| {
                    warn!(external_id = %row.external_id, "Unreadable raw_attributes: {}", e);
                    BTreeMap::new()
                })
            })
            .unwrap_or_default();

        Listing {
            external_id: row.external_id,
            title: row.title,
            price: row.price,
            location: row.location,
            url: row.url.unwrap_or_default(),
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            raw_attributes,
        }
    }
}

/// The one resource shared by all crawl workers.
///
/// Writes go through `write_lock`, so the existence check and the upsert
/// statement of one listing never interleave with another writer.
pub struct ListingStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl ListingStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::new("connect", sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::new("connect", e))?;

        info!(path = %path.display(), "Opened listing store");
        Self::with_pool(pool).await
    }

    /// A private in-memory database, gone when the store is dropped
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::new("connect", e))?;

        // every pooled connection would otherwise get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::new("connect", e))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_LISTINGS)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::new("create schema", e))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Readiness check run before any crawl task starts
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::new("ping", e))?;
        Ok(())
    }

    /// Insert the listing, or refresh the mutable fields of the existing row.
    ///
    /// `first_seen` of an existing row is never touched.
    pub async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome, StoreError> {
        let attributes = serde_json::to_string(&listing.raw_attributes)
            .map_err(|e| StoreError::new("upsert", sqlx::Error::Encode(Box::new(e))))?;

        let _guard = self.write_lock.lock().await;
        let existed = self.exists(&listing.external_id).await?;

        sqlx::query(UPSERT_LISTING)
            .bind(&listing.external_id)
            .bind(&listing.title)
            .bind(listing.price)
            .bind(&listing.location)
            .bind(&listing.url)
            .bind(listing.first_seen)
            .bind(listing.last_seen)
            .bind(attributes)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::new("upsert", e))?;

        let outcome = if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        debug!(external_id = %listing.external_id, ?outcome, "Stored listing");
        Ok(outcome)
    }

    pub async fn exists(&self, external_id: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM listings WHERE external_id = ?1")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::new("exists", e))?;
        Ok(count > 0)
    }

    /// Advance `last_seen` without touching anything else.
    /// Returns `false` when no such listing is stored.
    pub async fn record_seen(
        &self,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE listings SET last_seen = ?1 WHERE external_id = ?2")
            .bind(at)
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::new("record seen", e))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, external_id: &str) -> Result<Option<Listing>, StoreError> {
        let row: Option<ListingRow> =
            sqlx::query_as(&format!("{SELECT_LISTING} WHERE external_id = ?1"))
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::new("get", e))?;
        Ok(row.map(Listing::from))
    }

    /// Every stored listing, oldest first
    pub async fn all(&self) -> Result<Vec<Listing>, StoreError> {
        let rows: Vec<ListingRow> =
            sqlx::query_as(&format!("{SELECT_LISTING} ORDER BY first_seen, external_id"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::new("list", e))?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::new("count", e))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
