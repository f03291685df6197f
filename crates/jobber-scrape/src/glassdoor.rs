//! Glassdoor adapter.
//!
//! Two endpoints: a location autocomplete that resolves a location term to
//! an id/type pair, and a search API paginated with cursors. The site sits
//! behind Cloudflare and sometimes answers 403 to requests that would work
//! a moment later, so 403 is added to the retryable pool and every attempt
//! carries a fresh random User-Agent.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use jobber_core::{OfferParams, QueryView};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::retry::RetryClient;
use crate::{ScrapeError, Source};

pub const NAME: &str = "Glassdoor";

const BASE_URL: &str = "https://www.glassdoor.de";
const LOCATION_ENDPOINT: &str = "/autocomplete/location";
const SEARCH_ENDPOINT: &str = "/job-search-next/bff/jobSearchResultsQuery";

const PARAM_LOCATION_TYPE_FILTERS: &str = "locationTypeFilters";
const LOCATION_TYPE_FILTERS: &str = "CITY,STATE,COUNTRY";
/// The location search term, ie. `term=berlin`.
const PARAM_TERM: &str = "term";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Location {
    location_id: i64,
    location_type: String,
}

/// The autocomplete endpoint answers with a single letter for the
/// location type, but the search endpoint wants the full word.
fn location_type_name(letter: &str) -> &'static str {
    match letter {
        "C" => "CITY",
        "S" => "STATE",
        "N" => "COUNTRY",
        _ => "",
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: SearchData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    job_listings: JobListings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobListings {
    #[serde(default)]
    job_listings: Vec<Listing>,
    #[serde(default)]
    pagination_cursors: Vec<PaginationCursor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaginationCursor {
    cursor: String,
    page_number: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listing {
    job_view: JobView,
}

#[derive(Debug, Deserialize)]
struct JobView {
    header: ListingHeader,
    job: ListingJob,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingHeader {
    #[serde(default)]
    age_in_days: i64,
    #[serde(default)]
    employer_name_from_search: String,
    #[serde(default)]
    location_name: String,
    #[serde(default)]
    seo_job_link: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingJob {
    #[serde(default)]
    description_fragments_text: Vec<String>,
    #[serde(default)]
    job_title_text: String,
    listing_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    filter_params: Vec<FilterParam>,
    keyword: String,
    location_id: i64,
    location_type: String,
    num_jobs_to_show: i64,
    page_cursor: String,
    page_number: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterParam {
    filter_key: String,
    values: String,
}

pub struct Glassdoor {
    client: RetryClient,
    /// Resolved locations, so known terms don't hit the autocomplete
    /// endpoint again. First writer wins on concurrent misses.
    locations: RwLock<HashMap<String, Location>>,
}

impl Default for Glassdoor {
    fn default() -> Self {
        Self::new()
    }
}

impl Glassdoor {
    pub fn new() -> Self {
        Self {
            client: RetryClient::new()
                .with_random_user_agent()
                .with_extra_retryable_status(&[StatusCode::FORBIDDEN]),
            locations: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_offers(
        &self,
        cancel: &CancellationToken,
        body: &SearchBody,
    ) -> Result<SearchResponse, ScrapeError> {
        let url = Url::parse(&format!("{BASE_URL}{SEARCH_ENDPOINT}"))
            .map_err(|err| ScrapeError::Message(format!("parsing search url: {err}")))?;
        let mut request = Request::new(Method::POST, url);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.headers_mut().insert(ACCEPT, HeaderValue::from_static("*/*"));
        *request.body_mut() = Some(serde_json::to_vec(body)?.into());

        let response = self.client.execute(request, cancel).await?;
        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::OK {
            return Err(ScrapeError::Status { status, body: text });
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Initialize a search body for a query: resolve the location, pick
    /// the lookback window, fill in the immutable defaults.
    async fn new_search_body(
        &self,
        cancel: &CancellationToken,
        query: &QueryView,
    ) -> Result<SearchBody, ScrapeError> {
        let location = self.fetch_location(cancel, &query.location).await?;

        // fromAge takes strings for 1, 3 or 7 days. We want 7 unless this
        // source scraped the query less than a day ago.
        let age = match query.scraped_at {
            Some(scraped_at) if Utc::now() - scraped_at < ChronoDuration::hours(24) => "1",
            _ => "7",
        };

        Ok(SearchBody {
            filter_params: vec![FilterParam {
                filter_key: "fromAge".to_string(),
                values: age.to_string(),
            }],
            keyword: query.keywords.clone(),
            location_id: location.location_id,
            location_type: location_type_name(&location.location_type).to_string(),
            num_jobs_to_show: 30,
            page_cursor: String::new(),
            page_number: 1,
        })
    }

    async fn fetch_location(
        &self,
        cancel: &CancellationToken,
        term: &str,
    ) -> Result<Location, ScrapeError> {
        if let Some(location) = self.locations.read().await.get(term) {
            return Ok(location.clone());
        }

        let mut url = Url::parse(&format!("{BASE_URL}{LOCATION_ENDPOINT}"))
            .map_err(|err| ScrapeError::Message(format!("parsing location url: {err}")))?;
        url.query_pairs_mut()
            .append_pair(PARAM_LOCATION_TYPE_FILTERS, LOCATION_TYPE_FILTERS)
            .append_pair(PARAM_TERM, term);

        let mut request = Request::new(Method::GET, url);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.headers_mut().insert(ACCEPT, HeaderValue::from_static("*/*"));

        let response = self.client.execute(request, cancel).await?;
        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::OK {
            return Err(ScrapeError::Status { status, body: text });
        }

        // The endpoint returns a list of matches; the first is the best.
        let matches: Vec<Location> = serde_json::from_str(&text)?;
        let best = matches
            .into_iter()
            .next()
            .ok_or_else(|| ScrapeError::Message(format!("no location match for {term:?}")))?;

        let mut cache = self.locations.write().await;
        Ok(cache.entry(term.to_string()).or_insert(best).clone())
    }
}

#[async_trait]
impl Source for Glassdoor {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn scrape(
        &self,
        cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        let mut offers = Vec::new();

        let mut body = match self.new_search_body(&cancel, query).await {
            Ok(body) => body,
            Err(err) => return (offers, Some(err)),
        };

        let mut next_page = 2;
        loop {
            let response = match self.fetch_offers(&cancel, &body).await {
                Ok(response) => response,
                // Return the accumulated offers so far together with the error.
                Err(err) => return (offers, Some(err)),
            };

            for listing in response.data.job_listings.job_listings {
                let view = listing.job_view;
                offers.push(OfferParams {
                    id: view.job.listing_id.to_string(),
                    title: view.job.job_title_text,
                    company: view.header.employer_name_from_search,
                    location: view.header.location_name,
                    // Only an ageInDays value is exposed for the posting
                    // time; count back from now.
                    posted_at: Utc::now() - ChronoDuration::days(view.header.age_in_days),
                    description: view.job.description_fragments_text.join(" "),
                    source: NAME.to_string(),
                    url: view.header.seo_job_link,
                });
            }

            match response
                .data
                .job_listings
                .pagination_cursors
                .iter()
                .find(|cursor| cursor.page_number == next_page)
            {
                Some(cursor) => {
                    body.page_cursor = cursor.cursor.clone();
                    body.page_number = cursor.page_number;
                    next_page += 1;
                }
                None => break,
            }
        }

        (offers, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::retry::Transport;

    const LOCATION_PAYLOAD: &str = r#"[{"locationId": 2622109, "locationType": "C"}]"#;
    const SEARCH_PAYLOAD: &str = r#"{
        "data": {
            "jobListings": {
                "jobListings": [
                    {
                        "jobView": {
                            "header": {
                                "ageInDays": 2,
                                "employerNameFromSearch": "Späti GmbH",
                                "locationName": "Berlin",
                                "seoJobLink": "https://www.glassdoor.de/job/777"
                            },
                            "job": {
                                "descriptionFragmentsText": ["Write Go.", "Ship it."],
                                "jobTitleText": "Junior Golang Dweeb",
                                "listingId": 777
                            }
                        }
                    }
                ],
                "paginationCursors": []
            }
        }
    }"#;

    /// Answers the location endpoint with a canned match and the search
    /// endpoint with a canned single page.
    struct CannedTransport {
        location_calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn execute(
            &self,
            request: Request,
        ) -> Result<reqwest::Response, reqwest::Error> {
            let payload = if request.url().path() == LOCATION_ENDPOINT {
                self.location_calls.fetch_add(1, Ordering::SeqCst);
                LOCATION_PAYLOAD
            } else {
                SEARCH_PAYLOAD
            };
            let response = http::Response::builder()
                .status(200)
                .body(payload.as_bytes().to_vec())
                .unwrap();
            Ok(reqwest::Response::from(response))
        }
    }

    fn canned_glassdoor() -> (Glassdoor, Arc<CannedTransport>) {
        let transport = Arc::new(CannedTransport {
            location_calls: AtomicUsize::new(0),
        });
        let adapter = Glassdoor {
            client: RetryClient::new().with_transport(transport.clone()),
            locations: RwLock::new(HashMap::new()),
        };
        (adapter, transport)
    }

    fn view(scraped_at: Option<chrono::DateTime<Utc>>) -> QueryView {
        QueryView {
            id: 1,
            keywords: "golang".to_string(),
            location: "berlin".to_string(),
            created_at: Utc::now(),
            queried_at: Utc::now(),
            updated_at: None,
            scraped_at,
        }
    }

    #[tokio::test]
    async fn scrape_maps_listings_to_offer_params() {
        let (adapter, _) = canned_glassdoor();

        let (offers, err) = adapter.scrape(CancellationToken::new(), &view(None)).await;

        assert!(err.is_none());
        assert_eq!(offers.len(), 1);
        let offer = &offers[0];
        assert_eq!(offer.id, "777");
        assert_eq!(offer.title, "Junior Golang Dweeb");
        assert_eq!(offer.company, "Späti GmbH");
        assert_eq!(offer.description, "Write Go. Ship it.");
        assert_eq!(offer.source, NAME);
        let expected = Utc::now() - ChronoDuration::days(2);
        assert!((offer.posted_at - expected).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn location_lookups_are_cached() {
        let (adapter, transport) = canned_glassdoor();
        let cancel = CancellationToken::new();

        adapter.fetch_location(&cancel, "berlin").await.unwrap();
        adapter.fetch_location(&cancel, "berlin").await.unwrap();

        assert_eq!(transport.location_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recently_scraped_query_narrows_the_lookback() {
        let (adapter, _) = canned_glassdoor();
        let cancel = CancellationToken::new();

        let fresh = adapter
            .new_search_body(&cancel, &view(Some(Utc::now() - ChronoDuration::hours(1))))
            .await
            .unwrap();
        assert_eq!(fresh.filter_params[0].values, "1");

        let stale = adapter
            .new_search_body(&cancel, &view(Some(Utc::now() - ChronoDuration::days(3))))
            .await
            .unwrap();
        assert_eq!(stale.filter_params[0].values, "7");
    }

    #[test]
    fn location_type_letters_expand() {
        assert_eq!(location_type_name("C"), "CITY");
        assert_eq!(location_type_name("S"), "STATE");
        assert_eq!(location_type_name("N"), "COUNTRY");
        assert_eq!(location_type_name("?"), "");
    }
}
