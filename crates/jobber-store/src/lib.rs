//! Repository facade for jobber.
//!
//! All SQL lives here, behind [`Store`]. The engine only ever sees typed
//! operations and [`StoreError`] kinds. Timestamps are stored as RFC 3339
//! TEXT in UTC with fixed precision, so range filters compare
//! lexicographically.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use jobber_core::{Offer, OfferParams, Query, QueryView, OFFER_WINDOW_DAYS};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const CRATE_NAME: &str = "jobber-store";

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid timestamp in column {column}: {value}")]
    Timestamp { column: &'static str, value: String },
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db)
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                StoreError::UniqueViolation
            }
            _ => StoreError::Database(err),
        }
    }
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database at `url` and apply the
    /// schema. WAL mode and a generous busy timeout keep concurrent
    /// scheduler ticks from tripping over each other.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the whole
    /// database on one handle.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new query. Fails with [`StoreError::UniqueViolation`] when
    /// the `(keywords, location)` pair already exists.
    pub async fn create_query(
        &self,
        cancel: &CancellationToken,
        keywords: &str,
        location: &str,
    ) -> Result<Query, StoreError> {
        guard(cancel, async {
            let now = fmt_ts(Utc::now());
            let result = sqlx::query(
                "INSERT INTO queries (keywords, location, created_at, queried_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(keywords)
            .bind(location)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            self.query_by_id(result.last_insert_rowid()).await
        })
        .await
    }

    pub async fn get_query(
        &self,
        cancel: &CancellationToken,
        keywords: &str,
        location: &str,
    ) -> Result<Query, StoreError> {
        guard(cancel, async {
            let row = sqlx::query(
                "SELECT id, keywords, location, created_at, queried_at, updated_at
                 FROM queries
                 WHERE keywords = ? AND location = ?",
            )
            .bind(keywords)
            .bind(location)
            .fetch_optional(&self.pool)
            .await?;

            row.ok_or(StoreError::NotFound).and_then(|r| query_from_row(&r))
        })
        .await
    }

    /// Fetch a query joined with one source's bookkeeping row, creating the
    /// bookkeeping row on first use. Both steps run in one transaction.
    pub async fn get_query_with_source_status(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
        source: &str,
    ) -> Result<QueryView, StoreError> {
        guard(cancel, async {
            let mut tx = self.pool.begin().await?;

            let ensure = sqlx::query(
                "INSERT INTO query_scraper_status (query_id, source)
                 VALUES (?, ?)
                 ON CONFLICT (query_id, source) DO NOTHING",
            )
            .bind(query_id)
            .bind(source)
            .execute(&mut *tx)
            .await;
            if let Err(sqlx::Error::Database(db)) = &ensure {
                // The query was deleted under us.
                if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) {
                    return Err(StoreError::NotFound);
                }
            }
            ensure?;

            let row = sqlx::query(
                "SELECT q.id, q.keywords, q.location, q.created_at, q.queried_at,
                        q.updated_at, s.scraped_at
                 FROM queries q
                 JOIN query_scraper_status s ON s.query_id = q.id AND s.source = ?
                 WHERE q.id = ?",
            )
            .bind(source)
            .bind(query_id)
            .fetch_optional(&mut *tx)
            .await?;

            tx.commit().await?;

            let row = row.ok_or(StoreError::NotFound)?;
            Ok(QueryView {
                id: row.try_get("id")?,
                keywords: row.try_get("keywords")?,
                location: row.try_get("location")?,
                created_at: parse_ts(&row, "created_at")?,
                queried_at: parse_ts(&row, "queried_at")?,
                updated_at: parse_opt_ts(&row, "updated_at")?,
                scraped_at: parse_opt_ts(&row, "scraped_at")?,
            })
        })
        .await
    }

    pub async fn list_queries(&self, cancel: &CancellationToken) -> Result<Vec<Query>, StoreError> {
        guard(cancel, async {
            let rows = sqlx::query(
                "SELECT id, keywords, location, created_at, queried_at, updated_at
                 FROM queries
                 ORDER BY id ASC",
            )
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(query_from_row).collect()
        })
        .await
    }

    /// Stamp the query as freshly consumed. Drives expiration.
    pub async fn update_queried_at(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
    ) -> Result<(), StoreError> {
        guard(cancel, async {
            let result = sqlx::query("UPDATE queries SET queried_at = ? WHERE id = ?")
                .bind(fmt_ts(Utc::now()))
                .bind(query_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Record a successful scrape: bump the per-source `scraped_at` and the
    /// query-wide freshness timestamp together.
    pub async fn update_source_scraped_at(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
        source: &str,
    ) -> Result<(), StoreError> {
        guard(cancel, async {
            let now = fmt_ts(Utc::now());
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE query_scraper_status SET scraped_at = ?
                 WHERE query_id = ? AND source = ?",
            )
            .bind(&now)
            .bind(query_id)
            .bind(source)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE queries SET updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(query_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Insert-or-ignore on the offer's source-provided primary key.
    pub async fn create_offer(
        &self,
        cancel: &CancellationToken,
        params: &OfferParams,
    ) -> Result<(), StoreError> {
        guard(cancel, async {
            sqlx::query(
                "INSERT INTO offers (id, title, company, location, posted_at, description, source, url, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&params.id)
            .bind(&params.title)
            .bind(&params.company)
            .bind(&params.location)
            .bind(fmt_ts(params.posted_at))
            .bind(&params.description)
            .bind(&params.source)
            .bind(&params.url)
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn create_query_offer_assoc(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
        offer_id: &str,
    ) -> Result<(), StoreError> {
        guard(cancel, async {
            sqlx::query(
                "INSERT INTO query_offers (query_id, offer_id)
                 VALUES (?, ?)
                 ON CONFLICT (query_id, offer_id) DO NOTHING",
            )
            .bind(query_id)
            .bind(offer_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Offers associated with the query, newest first, limited to the feed
    /// window.
    pub async fn list_offers(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
    ) -> Result<Vec<Offer>, StoreError> {
        guard(cancel, async {
            let cutoff = fmt_ts(Utc::now() - chrono::Duration::days(OFFER_WINDOW_DAYS));
            let rows = sqlx::query(
                "SELECT o.id, o.title, o.company, o.location, o.posted_at,
                        o.description, o.source, o.url, o.created_at
                 FROM offers o
                 JOIN query_offers qo ON qo.offer_id = o.id
                 WHERE qo.query_id = ? AND o.posted_at >= ?
                 ORDER BY o.posted_at DESC",
            )
            .bind(query_id)
            .bind(&cutoff)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(offer_from_row).collect()
        })
        .await
    }

    /// Delete the query; `query_offers` and `query_scraper_status` rows go
    /// with it via FK cascade.
    pub async fn delete_query(
        &self,
        cancel: &CancellationToken,
        query_id: i64,
    ) -> Result<(), StoreError> {
        guard(cancel, async {
            sqlx::query("DELETE FROM queries WHERE id = ?")
                .bind(query_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Remove offers that fell out of the feed window. Returns the number
    /// of rows deleted.
    pub async fn delete_old_offers(&self, cancel: &CancellationToken) -> Result<u64, StoreError> {
        guard(cancel, async {
            let cutoff = fmt_ts(Utc::now() - chrono::Duration::days(OFFER_WINDOW_DAYS));
            let result = sqlx::query("DELETE FROM offers WHERE posted_at < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn query_by_id(&self, id: i64) -> Result<Query, StoreError> {
        let row = sqlx::query(
            "SELECT id, keywords, location, created_at, queried_at, updated_at
             FROM queries
             WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound).and_then(|r| query_from_row(&r))
    }
}

async fn guard<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &SqliteRow, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    let value: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp { column, value })
}

fn parse_opt_ts(
    row: &SqliteRow,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let value: Option<String> = row.try_get(column)?;
    match value {
        None => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(&value)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StoreError::Timestamp { column, value }),
    }
}

fn query_from_row(row: &SqliteRow) -> Result<Query, StoreError> {
    Ok(Query {
        id: row.try_get("id")?,
        keywords: row.try_get("keywords")?,
        location: row.try_get("location")?,
        created_at: parse_ts(row, "created_at")?,
        queried_at: parse_ts(row, "queried_at")?,
        updated_at: parse_opt_ts(row, "updated_at")?,
    })
}

fn offer_from_row(row: &SqliteRow) -> Result<Offer, StoreError> {
    Ok(Offer {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        posted_at: parse_ts(row, "posted_at")?,
        description: row.try_get("description")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        created_at: parse_ts(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn make_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn make_params(id: &str, posted_days_ago: i64) -> OfferParams {
        OfferParams {
            id: id.to_string(),
            title: format!("title {id}"),
            company: "Späti GmbH".to_string(),
            location: "berlin".to_string(),
            posted_at: Utc::now() - ChronoDuration::days(posted_days_ago),
            description: String::new(),
            source: "LinkedIn".to_string(),
            url: format!("https://example.com/{id}"),
        }
    }

    #[tokio::test]
    async fn create_and_get_query_roundtrip() {
        let store = make_store().await;
        let cancel = token();

        let created = store.create_query(&cancel, "golang", "berlin").await.unwrap();
        let fetched = store.get_query(&cancel, "golang", "berlin").await.unwrap();

        assert_eq!(created.id, fetched.id);
        assert_eq!(fetched.keywords, "golang");
        assert_eq!(fetched.location, "berlin");
        assert!(fetched.updated_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_query_is_a_unique_violation() {
        let store = make_store().await;
        let cancel = token();

        store.create_query(&cancel, "golang", "berlin").await.unwrap();
        let err = store.create_query(&cancel, "golang", "berlin").await.unwrap_err();

        assert!(matches!(err, StoreError::UniqueViolation));
    }

    #[tokio::test]
    async fn get_missing_query_is_not_found() {
        let store = make_store().await;
        let err = store.get_query(&token(), "cuak", "squeek").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn source_status_row_is_created_lazily() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();

        let view = store
            .get_query_with_source_status(&cancel, q.id, "LinkedIn")
            .await
            .unwrap();
        assert_eq!(view.id, q.id);
        assert!(view.scraped_at.is_none());

        // Second read hits the same row.
        let again = store
            .get_query_with_source_status(&cancel, q.id, "LinkedIn")
            .await
            .unwrap();
        assert_eq!(again.scraped_at, view.scraped_at);
    }

    #[tokio::test]
    async fn source_status_for_deleted_query_is_not_found() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();
        store.delete_query(&cancel, q.id).await.unwrap();

        let err = store
            .get_query_with_source_status(&cancel, q.id, "LinkedIn")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn scraped_at_update_bumps_both_timestamps() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();
        store
            .get_query_with_source_status(&cancel, q.id, "LinkedIn")
            .await
            .unwrap();

        store
            .update_source_scraped_at(&cancel, q.id, "LinkedIn")
            .await
            .unwrap();

        let view = store
            .get_query_with_source_status(&cancel, q.id, "LinkedIn")
            .await
            .unwrap();
        assert!(view.scraped_at.is_some());
        assert!(view.updated_at.is_some());
    }

    #[tokio::test]
    async fn offer_insert_is_idempotent() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();

        let params = make_params("offer_1", 0);
        store.create_offer(&cancel, &params).await.unwrap();
        store.create_offer(&cancel, &params).await.unwrap();
        store.create_query_offer_assoc(&cancel, q.id, "offer_1").await.unwrap();
        store.create_query_offer_assoc(&cancel, q.id, "offer_1").await.unwrap();

        let offers = store.list_offers(&cancel, q.id).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].id, "offer_1");
    }

    #[tokio::test]
    async fn one_offer_row_can_serve_many_queries() {
        let store = make_store().await;
        let cancel = token();
        let a = store.create_query(&cancel, "golang", "berlin").await.unwrap();
        let b = store.create_query(&cancel, "rust", "berlin").await.unwrap();

        store.create_offer(&cancel, &make_params("shared", 0)).await.unwrap();
        store.create_query_offer_assoc(&cancel, a.id, "shared").await.unwrap();
        store.create_query_offer_assoc(&cancel, b.id, "shared").await.unwrap();

        assert_eq!(store.list_offers(&cancel, a.id).await.unwrap().len(), 1);
        assert_eq!(store.list_offers(&cancel, b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_offers_filters_window_and_orders_newest_first() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();

        for (id, age) in [("old", 8), ("newer", 1), ("newest", 0)] {
            store.create_offer(&cancel, &make_params(id, age)).await.unwrap();
            store.create_query_offer_assoc(&cancel, q.id, id).await.unwrap();
        }

        let offers = store.list_offers(&cancel, q.id).await.unwrap();
        let ids: Vec<_> = offers.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "newer"]);
    }

    #[tokio::test]
    async fn delete_query_cascades_associations() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();
        store.create_offer(&cancel, &make_params("offer_1", 0)).await.unwrap();
        store.create_query_offer_assoc(&cancel, q.id, "offer_1").await.unwrap();

        store.delete_query(&cancel, q.id).await.unwrap();

        let err = store.get_query(&cancel, "golang", "berlin").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let assoc: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_offers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(assoc, 0);

        // The offer row itself survives until the pruner takes it.
        let offers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn delete_old_offers_prunes_expired_rows() {
        let store = make_store().await;
        let cancel = token();
        store.create_offer(&cancel, &make_params("old", 8)).await.unwrap();
        store.create_offer(&cancel, &make_params("fresh", 1)).await.unwrap();

        let deleted = store.delete_old_offers(&cancel).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn update_queried_at_moves_the_timestamp_forward() {
        let store = make_store().await;
        let cancel = token();
        let q = store.create_query(&cancel, "golang", "berlin").await.unwrap();

        sqlx::query("UPDATE queries SET queried_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now() - ChronoDuration::days(8)))
            .bind(q.id)
            .execute(store.pool())
            .await
            .unwrap();

        store.update_queried_at(&cancel, q.id).await.unwrap();

        let refreshed = store.get_query(&cancel, "golang", "berlin").await.unwrap();
        assert!(Utc::now() - refreshed.queried_at < ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let store = make_store().await;
        let cancel = token();
        cancel.cancel();

        let err = store.get_query(&cancel, "golang", "berlin").await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
