//! Axum + Askama boundary for jobber.
//!
//! Serves the RSS feed per query, the form that creates queries, and the
//! Prometheus metrics endpoint. Feed parameters are validated and
//! normalized here before they reach the engine.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Query, State},
    http::{header, HeaderMap, HeaderValue, Request as HttpRequest, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use jobber_core::Offer;
use jobber_engine::{EngineError, Jobber};
use jobber_metrics::AppMetrics;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobber-web";

/// Cache hints never promise more than an hour, the scrape cadence.
const MAX_CACHE_AGE_SECS: i64 = 3600;

#[derive(Clone)]
pub struct AppState {
    pub jobber: Arc<Jobber>,
    pub metrics: Arc<AppMetrics>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/", get(index_handler))
        .route("/help", get(help_handler))
        .route("/feeds", get(feed_handler).post(create_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "serving");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate;

#[derive(Template)]
#[template(path = "help.html")]
struct HelpTemplate;

#[derive(Template)]
#[template(path = "create_response.html")]
struct CreateResponseTemplate {
    feed_url: String,
}

#[derive(Template)]
#[template(path = "feed.xml")]
struct FeedXmlTemplate {
    keywords: String,
    location: String,
    feed_url: String,
    not_found: bool,
    offers: Vec<FeedOffer>,
}

#[derive(Template)]
#[template(path = "feed.html")]
struct FeedHtmlTemplate {
    keywords: String,
    location: String,
    not_found: bool,
    offers: Vec<FeedOffer>,
}

struct FeedOffer {
    id: String,
    title: String,
    url: String,
    pub_date: String,
    description: String,
}

impl FeedOffer {
    fn from_offer(offer: &Offer) -> Self {
        Self {
            id: offer.id.clone(),
            title: format!(
                "{} at {} (posted {})",
                offer.title,
                offer.company,
                offer.posted_at.format("%b %-d"),
            ),
            url: offer.url.clone(),
            pub_date: offer.created_at.to_rfc2822(),
            description: offer.description.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FeedParams {
    keywords: Option<String>,
    location: Option<String>,
}

async fn index_handler() -> Response {
    render_html(IndexTemplate)
}

async fn help_handler() -> Response {
    render_html(HelpTemplate)
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(params): Form<FeedParams>,
) -> Response {
    let (keywords, location) = match validate_params(&params) {
        Ok(values) => values,
        Err(message) => {
            info!(%message, "rejecting feed creation");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    match state.jobber.create_query(&keywords, &location).await {
        // A timed out initial scrape still gets the success page: the
        // schedule is in place and fills the feed shortly.
        Ok(()) | Err(EngineError::TimedOut) => {}
        Err(err) => return server_error("failed to create query", &err),
    }

    render_html(CreateResponseTemplate {
        feed_url: feed_url(&headers, &keywords, &location),
    })
}

async fn feed_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<FeedParams>,
) -> Response {
    let (keywords, location) = match validate_params(&params) {
        Ok(values) => values,
        Err(message) => {
            info!(%message, "rejecting feed request");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    let cancel = state.jobber.child_cancellation();
    let mut not_found = false;
    let (offers, updated_at) = match state.jobber.list_offers(&cancel, &keywords, &location).await
    {
        Ok(result) => result,
        Err(EngineError::NotFound) => {
            info!(keywords, location, "no query found for feed");
            not_found = true;
            (Vec::new(), None)
        }
        Err(err) => return server_error("failed to list offers", &err),
    };
    let offers: Vec<FeedOffer> = offers.iter().map(FeedOffer::from_offer).collect();

    // A browser asks for text/html; feed readers get RSS XML.
    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);

    let mut response = if wants_html {
        render_html(FeedHtmlTemplate {
            keywords,
            location,
            not_found,
            offers,
        })
    } else {
        let template = FeedXmlTemplate {
            feed_url: feed_url(&headers, &keywords, &location),
            keywords,
            location,
            not_found,
            offers,
        };
        match template.render() {
            Ok(xml) => ([(header::CONTENT_TYPE, "application/rss+xml")], xml).into_response(),
            Err(err) => return server_error("failed to render feed", &err),
        }
    };

    if let Some(max_age) = cache_max_age(updated_at) {
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={max_age}")) {
            response.headers_mut().insert(header::CACHE_CONTROL, value);
        }
    }

    response
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => server_error("failed to render metrics", &err),
    }
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: HttpRequest<axum::body::Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    response
}

/// Validate and normalize both feed parameters: required, letters, digits
/// and spaces only, trimmed and lowercased.
fn validate_params(params: &FeedParams) -> Result<(String, String), String> {
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let mut valid = Vec::new();

    for (name, value) in [
        ("keywords", params.keywords.as_deref()),
        ("location", params.location.as_deref()),
    ] {
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() {
            missing.push(name);
        } else if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ') {
            invalid.push(name);
        } else {
            valid.push(value.to_ascii_lowercase());
        }
    }

    if !missing.is_empty() || !invalid.is_empty() {
        let mut parts = Vec::new();
        if !missing.is_empty() {
            parts.push(format!("missing params: {missing:?}"));
        }
        if !invalid.is_empty() {
            parts.push(format!("invalid params: {invalid:?}, only [A-Za-z0-9] allowed"));
        }
        return Err(parts.join(", "));
    }

    let mut valid = valid.into_iter();
    Ok((
        valid.next().unwrap_or_default(),
        valid.next().unwrap_or_default(),
    ))
}

fn feed_url(headers: &HeaderMap, keywords: &str, location: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let scheme = if host.starts_with("localhost") { "http" } else { "https" };
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("keywords", keywords)
        .append_pair("location", location)
        .finish();
    format!("{scheme}://{host}/feeds?{query}")
}

/// Bounded positive `max-age` from the freshness timestamp, or nothing
/// when the feed is stale or never produced offers.
fn cache_max_age(updated_at: Option<DateTime<Utc>>) -> Option<i64> {
    let updated_at = updated_at?;
    let age = (Utc::now() - updated_at).num_seconds();
    if (0..MAX_CACHE_AGE_SECS).contains(&age) {
        Some(MAX_CACHE_AGE_SECS - age)
    } else {
        None
    }
}

fn render_html<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error("failed to render template", &err),
    }
}

fn server_error(message: &str, err: &dyn std::fmt::Display) -> Response {
    error!(error = %err, message);
    (StatusCode::INTERNAL_SERVER_ERROR, "it's not you it's me").into_response()
}
