//! Stepstone adapter.
//!
//! Talks to the public result-list API: a POST whose JSON body carries the
//! search URL we want results for. Pagination walks `pageCount`; the
//! response pads pages with non-relevant offers, so the final list is
//! truncated to `totalCount`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobber_core::{OfferParams, QueryView};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Request};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::retry::RetryClient;
use crate::{ScrapeError, Source};

pub const NAME: &str = "Stepstone";

const BASE_URL: &str = "https://www.stepstone.de";
const API_ENDPOINT: &str = "/public-api/resultlist/unifiedResultlist";

const PARAM_PAGE: &str = "page";
const PARAM_SORT: &str = "sort";
/// sort=2 is by age.
const SORT_BY_AGE: &str = "2";
const PARAM_AGE: &str = "ag";
/// ag=age_1 is one day ago.
const AGE_ONE_DAY: &str = "age_1";
/// ag=age_7 is one week ago.
const AGE_ONE_WEEK: &str = "age_7";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Pagination {
    #[allow(dead_code)]
    page: i64,
    /// Total amount of pages for the search.
    page_count: i64,
    /// The number of relevant offers. The response may still carry more
    /// items than this; the excess is filler to keep you doomscrolling.
    total_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    company_name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    text_snippet: String,
    date_posted: Option<DateTime<Utc>>,
}

pub struct Stepstone {
    client: RetryClient,
}

impl Default for Stepstone {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepstone {
    pub fn new() -> Self {
        Self {
            client: RetryClient::new(),
        }
    }

    async fn fetch_offers(
        &self,
        cancel: &CancellationToken,
        query: &QueryView,
        page: i64,
    ) -> Result<SearchResponse, ScrapeError> {
        let search_url = search_url(query, page)?;

        let body = serde_json::json!({
            "url": search_url.as_str(),
            "lang": "en",
            "siteId": 250,
            "userData": { "userHashId": Uuid::new_v4().to_string() },
            "fields": ["items", "pagination"],
        });

        let api_url = Url::parse(&format!("{BASE_URL}{API_ENDPOINT}"))
            .map_err(|err| ScrapeError::Message(format!("parsing api url: {err}")))?;
        let mut request = Request::new(Method::POST, api_url);
        let headers = request.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // The default user agent breaks the Stepstone endpoint.
        headers.insert(USER_AGENT, HeaderValue::from_static("CustomUserAgent/1.0"));
        *request.body_mut() = Some(serde_json::to_vec(&body)?.into());

        let response = self.client.execute(request, cancel).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Source for Stepstone {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn scrape(
        &self,
        cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        let mut total: Vec<OfferParams> = Vec::new();
        let mut total_count: usize = 0;
        let mut error = None;

        let mut page = 1;
        loop {
            let response = match self.fetch_offers(&cancel, query, page).await {
                Ok(response) => response,
                Err(err) => {
                    // Keep the offers accumulated so far.
                    error = Some(err);
                    break;
                }
            };
            if total_count == 0 {
                total_count = response.pagination.total_count.max(0) as usize;
            }
            total.extend(response.items.into_iter().map(offer_params));
            if page >= response.pagination.page_count {
                break;
            }
            page += 1;
        }

        // Drop the non-relevant padding past totalCount. When pagination
        // failed early we may hold fewer offers than that; return them all.
        if total_count < total.len() {
            total.truncate(total_count);
        }

        (total, error)
    }
}

/// Stepstone takes the keywords and the location as path parameters, query
/// escaped so spaces become '+' (percent-encoding gets worse results).
fn search_url(query: &QueryView, page: i64) -> Result<Url, ScrapeError> {
    let mut url = Url::parse(&format!(
        "{BASE_URL}/work/{}/in-{}",
        query_escape(&query.keywords),
        query_escape(&query.location),
    ))
    .map_err(|err| ScrapeError::Message(format!("parsing search url: {err}")))?;

    // The endpoint accepts a lookback of either one day or one week. Ask
    // for one day only when the previous run is recent enough to cover it.
    let age = match query.updated_at {
        Some(updated_at) if Utc::now() - updated_at < chrono::Duration::hours(24) => AGE_ONE_DAY,
        _ => AGE_ONE_WEEK,
    };

    url.query_pairs_mut()
        .append_pair(PARAM_SORT, SORT_BY_AGE)
        .append_pair(PARAM_PAGE, &page.to_string())
        .append_pair(PARAM_AGE, age);

    Ok(url)
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn offer_params(item: Item) -> OfferParams {
    OfferParams {
        id: item.id.to_string(),
        title: item.title,
        company: item.company_name,
        location: item.location,
        posted_at: item.date_posted.unwrap_or_else(Utc::now),
        description: item.text_snippet,
        source: NAME.to_string(),
        url: format!("{BASE_URL}{}", item.url),
    }
}
