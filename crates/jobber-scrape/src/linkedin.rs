//! LinkedIn adapter.
//!
//! Uses the guest jobs API, which answers with HTML fragments of at most
//! ten job cards per page. Pagination moves `start` in steps of ten and
//! stops on the first short batch (or at 1000, where LinkedIn starts
//! answering 400).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use jobber_core::{OfferParams, QueryView};
use jobber_metrics::AppMetrics;
use reqwest::{Method, Request};
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::retry::RetryClient;
use crate::{ScrapeError, Source};

pub const NAME: &str = "LinkedIn";

const SEARCH_URL: &str = "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
/// Direct link to a job posting.
const JOB_VIEW_URL: &str = "https://www.linkedin.com/jobs/view/";

/// LinkedIn pagination interval.
const SEARCH_INTERVAL: usize = 10;
/// The site returns 400 once `start` reaches 1000.
const MAX_SEARCH_START: usize = 1000;
const ONE_WEEK_SECONDS: i64 = 604_800;

pub struct LinkedIn {
    client: RetryClient,
    metrics: Arc<AppMetrics>,
}

impl LinkedIn {
    pub fn new(metrics: Arc<AppMetrics>) -> Self {
        Self {
            client: RetryClient::new(),
            metrics,
        }
    }

    /// Fetch one page of search results. Each page holds at most ten
    /// offers; `start` moves in increments of ten.
    async fn fetch_offers_page(
        &self,
        cancel: &CancellationToken,
        query: &QueryView,
        start: usize,
    ) -> Result<String, ScrapeError> {
        let mut url = Url::parse(SEARCH_URL)
            .map_err(|err| ScrapeError::Message(format!("parsing {SEARCH_URL}: {err}")))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("keywords", &query.keywords);
            params.append_pair("location", &query.location);
            if start != 0 {
                params.append_pair("start", &start.to_string());
            }
            // f_TPR is the lookback window in seconds. When we know when
            // the query last produced offers we only ask for the gap,
            // otherwise a full week.
            let mut lookback = ONE_WEEK_SECONDS;
            if let Some(updated_at) = query.updated_at {
                lookback = (Utc::now() - updated_at).num_seconds().max(1);
            }
            params.append_pair("f_TPR", &format!("r{lookback}"));
        }

        let request = Request::new(Method::GET, url);
        let response = self.client.execute(request, cancel).await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Source for LinkedIn {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn scrape(
        &self,
        cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        let started = Instant::now();
        let mut total = Vec::new();

        for start in (0..MAX_SEARCH_START).step_by(SEARCH_INTERVAL) {
            if cancel.is_cancelled() {
                return (total, Some(ScrapeError::Cancelled));
            }
            let body = match self.fetch_offers_page(&cancel, query, start).await {
                Ok(body) => body,
                // Return the accumulated offers so far together with the error.
                Err(err) => return (total, Some(err)),
            };
            let offers = match parse_search_page(&body) {
                Ok(offers) => offers,
                Err(err) => return (total, Some(err)),
            };
            let batch = offers.len();
            total.extend(offers);
            // A full batch means there is probably a next page.
            if batch != SEARCH_INTERVAL {
                break;
            }
        }

        self.metrics
            .scraper_job_seconds
            .with_label_values(&[
                NAME,
                &query.keywords,
                &query.location,
                &total.len().to_string(),
            ])
            .observe(started.elapsed().as_secs_f64());

        (total, None)
    }
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|err| ScrapeError::Message(format!("bad selector {css}: {err}")))
}

/// Parse one HTML page of search results into offer parameters.
fn parse_search_page(body: &str) -> Result<Vec<OfferParams>, ScrapeError> {
    let document = Html::parse_document(body);
    let items = selector("li")?;
    let card = selector(".base-search-card")?;
    let urn = selector("[data-entity-urn]")?;
    let title = selector(".base-search-card__title")?;
    let company = selector(".base-search-card__subtitle a")?;
    let location = selector(".job-search-card__location")?;
    let time = selector("time")?;

    let mut offers = Vec::new();
    for item in document.select(&items) {
        if item.select(&card).next().is_none() {
            continue;
        }

        let id = item
            .select(&urn)
            .next()
            .and_then(|el| el.value().attr("data-entity-urn"))
            .and_then(|urn| urn.rsplit(':').next())
            .unwrap_or_default()
            .to_string();

        let (datetime, relative) = item
            .select(&time)
            .next()
            .map(|el| {
                (
                    el.value().attr("datetime").unwrap_or_default().to_string(),
                    normalize_text(&el.text().collect::<String>()),
                )
            })
            .unwrap_or_default();
        let posted_at = match normalize_time(&datetime, &relative) {
            Ok(ts) => ts,
            Err(err) => {
                warn!(error = %err, "unable to normalize offer time");
                Utc::now()
            }
        };

        offers.push(OfferParams {
            url: format!("{JOB_VIEW_URL}{id}"),
            id,
            title: item
                .select(&title)
                .next()
                .map(|el| normalize_text(&el.text().collect::<String>()))
                .unwrap_or_default(),
            company: item
                .select(&company)
                .next()
                .map(|el| normalize_text(&el.text().collect::<String>()))
                .unwrap_or_default(),
            location: item
                .select(&location)
                .next()
                .map(|el| normalize_text(&el.text().collect::<String>()))
                .unwrap_or_default(),
            posted_at,
            description: String::new(),
            source: NAME.to_string(),
        });
    }

    Ok(offers)
}

/// Collapse newlines and surrounding whitespace.
fn normalize_text(s: &str) -> String {
    s.split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Construct the most accurate time possible from LinkedIn's obscured
/// machine-readable and human-readable pair.
///
/// Fresh offers carry a date-only `datetime` attribute but an "N hours
/// ago" label; older ones only say "N days ago". When the label is in
/// hours we subtract it from now. Otherwise we take the date and graft the
/// current time of day onto it, so old offers don't all look like they
/// were posted at midnight.
fn normalize_time(datetime: &str, relative: &str) -> Result<DateTime<Utc>, ScrapeError> {
    let now = Utc::now();

    if relative.contains("hours") {
        let hours: i64 = relative
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                ScrapeError::Message(format!("unable to parse relative time {relative:?}"))
            })?;
        return Ok(now - ChronoDuration::hours(hours));
    }

    let date = NaiveDate::parse_from_str(datetime, "%Y-%m-%d")
        .map_err(|err| ScrapeError::Message(format!("unable to parse date {datetime:?}: {err}")))?;
    Ok(date.and_time(now.time()).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PAGE: &str = r##"
    <ul>
      <li>
        <div class="base-search-card" data-entity-urn="urn:li:jobPosting:4100200300">
          <h3 class="base-search-card__title">
            Senior Golang Engineer
          </h3>
          <h4 class="base-search-card__subtitle"><a href="#">
            Späti GmbH
          </a></h4>
          <span class="job-search-card__location">Berlin, Germany</span>
          <time class="job-search-card__listdate" datetime="2026-07-30">
            3 days ago
          </time>
        </div>
      </li>
      <li><div class="unrelated">advert</div></li>
    </ul>
    "##;

    #[test]
    fn parses_job_cards_and_skips_noise() {
        let offers = parse_search_page(SAMPLE_PAGE).unwrap();
        assert_eq!(offers.len(), 1);

        let offer = &offers[0];
        assert_eq!(offer.id, "4100200300");
        assert_eq!(offer.title, "Senior Golang Engineer");
        assert_eq!(offer.company, "Späti GmbH");
        assert_eq!(offer.location, "Berlin, Germany");
        assert_eq!(offer.source, NAME);
        assert_eq!(offer.url, "https://www.linkedin.com/jobs/view/4100200300");
    }

    #[test]
    fn normalize_text_collapses_newlines() {
        assert_eq!(normalize_text("\n  Senior Golang\n Engineer \n"), "Senior Golang Engineer");
    }

    #[test]
    fn relative_hours_win_over_the_date_attribute() {
        let ts = normalize_time("2026-07-30", "2 hours ago").unwrap();
        let expected = Utc::now() - ChronoDuration::hours(2);
        assert!((ts - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn date_attribute_is_used_for_older_offers() {
        let ts = normalize_time("2026-07-30", "3 days ago").unwrap();
        assert_eq!(ts.date_naive(), NaiveDate::from_ymd_opt(2026, 7, 30).unwrap());
        // Time of day comes from the clock, not midnight.
        let now = Utc::now();
        assert!((ts.time() - now.time()).num_seconds().abs() < 5);
    }

    #[test]
    fn garbage_time_markup_is_an_error() {
        assert!(normalize_time("not-a-date", "sometime").is_err());
    }
}
