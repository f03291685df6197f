//! Prometheus metrics registry for jobber.
//!
//! [`AppMetrics`] owns every registered metric and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and hand it to
//! the engine, the adapters and the HTTP boundary. Rendered in Prometheus
//! text exposition format at `GET /metrics`.

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};

pub const CRATE_NAME: &str = "jobber-metrics";

pub struct AppMetrics {
    /// New queries accepted, labelled by keywords and location.
    pub new_queries_total: CounterVec,
    /// Currently scheduled per-source cron jobs, labelled by query id,
    /// composite tag and cron expression.
    pub scheduled_queries: GaugeVec,
    /// Scrape run duration in seconds, labelled by source, keywords,
    /// location and the number of offers returned.
    pub scraper_job_seconds: HistogramVec,
    /// HTTP request count by method, path and status code.
    pub http_requests_total: CounterVec,
    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let new_queries_total = CounterVec::new(
            Opts::new("jobber_new_queries_total", "New queries accepted"),
            &["keywords", "location"],
        )?;

        let scheduled_queries = GaugeVec::new(
            Opts::new("jobber_scheduled_queries", "Currently scheduled query jobs"),
            &["query_id", "tag", "cron"],
        )?;

        let scraper_job_seconds = HistogramVec::new(
            HistogramOpts::new("jobber_scraper_job_seconds", "Scrape run duration in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["source", "keywords", "location", "count"],
        )?;

        let http_requests_total = CounterVec::new(
            Opts::new("jobber_http_requests_total", "HTTP requests by method, path and status"),
            &["method", "path", "status"],
        )?;

        registry.register(Box::new(new_queries_total.clone()))?;
        registry.register(Box::new(scheduled_queries.clone()))?;
        registry.register(Box::new(scraper_job_seconds.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            new_queries_total,
            scheduled_queries,
            scraper_job_seconds,
            http_requests_total,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
