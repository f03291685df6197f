//! Core domain model for jobber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobber-core";

/// Offers older than this never show up in a feed and are pruned nightly.
pub const OFFER_WINDOW_DAYS: i64 = 7;

/// Queries whose feed hasn't been read for this long are deleted.
pub const QUERY_TTL_DAYS: i64 = 7;

/// A persisted `(keywords, location)` search term.
///
/// The natural key is unique and expected to be trimmed and lowercased by
/// the boundary before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: i64,
    pub keywords: String,
    pub location: String,
    /// Immutable; its minute-of-hour places the query's cron jobs.
    pub created_at: DateTime<Utc>,
    /// Last time the feed was consumed. Drives expiration.
    pub queried_at: DateTime<Utc>,
    /// Last time any source produced offers. Exposed to clients as freshness.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Query {
    /// Composite tag used to address all of this query's scheduled jobs.
    pub fn tag(&self) -> String {
        format!("{}{}", self.keywords, self.location)
    }
}

/// A query joined with one source's scrape bookkeeping, handed to adapters
/// so they can pick a lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryView {
    pub id: i64,
    pub keywords: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub queried_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// When this particular source last produced offers for the query.
    pub scraped_at: Option<DateTime<Utc>>,
}

impl QueryView {
    pub fn tag(&self) -> String {
        format!("{}{}", self.keywords, self.location)
    }
}

/// A persisted job posting. `id` is the source-provided identifier and is
/// globally unique across queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: DateTime<Utc>,
    pub description: String,
    pub source: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Insertion payload produced by adapters, before the store stamps
/// `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferParams {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: DateTime<Utc>,
    pub description: String,
    pub source: String,
    pub url: String,
}
