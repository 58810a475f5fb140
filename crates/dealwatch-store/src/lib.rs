//! Embedded SQLite table of latest-known discounts.

use std::path::Path;

use chrono::{DateTime, Utc};
use dealwatch_core::DiscountRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dealwatch-store";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS discounts (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    price        REAL NOT NULL,
    discount     REAL NOT NULL,
    last_updated TEXT NOT NULL
)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored timestamp for product {id} is not RFC 3339")]
    Timestamp {
        id: i64,
        #[source]
        source: chrono::ParseError,
    },
}

/// Keyed store of the latest known record per product id.
///
/// Rows are upserted (last write wins) and never deleted; the backing file
/// outlives the process, so the table is a durable cache of "latest known"
/// prices.
#[derive(Debug, Clone)]
pub struct DiscountStore {
    pool: SqlitePool,
}

impl DiscountStore {
    /// Open (creating if missing) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Write or replace each record keyed by id. Atomic per record; calling
    /// twice with the same batch leaves the table unchanged.
    pub async fn upsert_all(&self, records: &[DiscountRecord]) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO discounts (id, name, price, discount, last_updated)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    price = excluded.price,
                    discount = excluded.discount,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(record.id)
            .bind(&record.name)
            .bind(record.price)
            .bind(record.discount)
            .bind(record.last_updated.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        debug!(records = records.len(), "upserted discount batch");
        Ok(())
    }

    /// All records whose discount meets or exceeds the cutoff, ordered by id.
    pub async fn find_at_or_above(&self, threshold: f64) -> Result<Vec<DiscountRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, price, discount, last_updated FROM discounts WHERE discount >= ? ORDER BY id",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// The full table, ordered by id.
    pub async fn all(&self) -> Result<Vec<DiscountRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, name, price, discount, last_updated FROM discounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn len(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM discounts")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<DiscountRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let raw: String = row.try_get("last_updated")?;
    let last_updated: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw)
        .map_err(|source| StoreError::Timestamp { id, source })?
        .with_timezone(&Utc);
    Ok(DiscountRecord {
        id,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        discount: row.try_get("discount")?,
        last_updated,
    })
}
