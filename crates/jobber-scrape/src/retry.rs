//! HTTP client wrapper with automatic retries and exponential backoff.
//!
//! A request is retried when the response status is classified as
//! retryable. The default set of retryable statuses can be extended per
//! client. If retries are exhausted the client fails with
//! [`RetryError::RetriesExhausted`] carrying the last status seen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Request, Response, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exponential backoff limit.
const MAX_RETRIES: u32 = 5;

const DEFAULT_RETRYABLE: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// A small pool of browser User-Agent strings for sources that reject
/// anything that smells like a bot.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("too many retries, last status {status}")]
    RetriesExhausted { status: StatusCode },
    #[error("request cancelled while waiting to retry")]
    Cancelled,
    #[error("request body must be buffered to be replayed across retries")]
    StreamingBody,
}

/// The wire-level round trip, injectable for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Response, reqwest::Error>;
}

struct ClientTransport {
    client: reqwest::Client,
}

#[async_trait]
impl Transport for ClientTransport {
    async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        self.client.execute(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserAgentPolicy {
    /// Leave the prepared request's headers alone.
    Fixed,
    /// Overwrite the User-Agent header with a random pick on every attempt.
    RandomizedPerAttempt,
}

pub struct RetryClient {
    transport: Arc<dyn Transport>,
    retryable: HashSet<StatusCode>,
    user_agent: UserAgentPolicy,
}

impl Default for RetryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryClient {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ClientTransport {
                client: reqwest::Client::new(),
            }),
            retryable: DEFAULT_RETRYABLE
                .iter()
                .filter_map(|code| StatusCode::from_u16(*code).ok())
                .collect(),
            user_agent: UserAgentPolicy::Fixed,
        }
    }

    /// Add custom retryable statuses to the pool.
    pub fn with_extra_retryable_status(mut self, statuses: &[StatusCode]) -> Self {
        self.retryable.extend(statuses.iter().copied());
        self
    }

    /// Send a random User-Agent header on each attempt.
    pub fn with_random_user_agent(mut self) -> Self {
        self.user_agent = UserAgentPolicy::RandomizedPerAttempt;
        self
    }

    /// Swap the underlying transport for a test double.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Execute the request, retrying retryable statuses with exponential
    /// backoff. The request body, if any, is buffered once and replayed
    /// byte-identically on every attempt. Backoff waits abort early when
    /// `cancel` fires.
    pub async fn execute(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, RetryError> {
        let method = request.method().clone();
        let url = request.url().clone();
        let headers = request.headers().clone();
        let body = match request.body() {
            None => None,
            Some(body) => match body.as_bytes() {
                Some(bytes) => Some(bytes.to_vec()),
                None => return Err(RetryError::StreamingBody),
            },
        };

        let mut retries: u32 = 0;
        loop {
            let mut attempt = Request::new(method.clone(), url.clone());
            *attempt.headers_mut() = headers.clone();
            if self.user_agent == UserAgentPolicy::RandomizedPerAttempt {
                attempt.headers_mut().insert(USER_AGENT, random_user_agent());
            }
            if let Some(bytes) = &body {
                *attempt.body_mut() = Some(bytes.clone().into());
            }

            let response = self.transport.execute(attempt).await?;
            let status = response.status();

            if self.retryable.contains(&status) {
                if retries >= MAX_RETRIES {
                    return Err(RetryError::RetriesExhausted { status });
                }
                drop(response);
                retries += 1;

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1u64 << retries)) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
                continue;
            }

            return Ok(response);
        }
    }
}

fn random_user_agent() -> HeaderValue {
    use rand::seq::SliceRandom;
    let ua = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);
    HeaderValue::from_static(ua)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use reqwest::Method;
    use url::Url;

    /// Returns its canned statuses in order, repeating the last one, and
    /// records what each attempt looked like on the wire.
    struct MockTransport {
        statuses: Vec<u16>,
        calls: AtomicUsize,
        bodies: Mutex<Vec<Vec<u8>>>,
        user_agents: Mutex<Vec<Option<String>>>,
    }

    impl MockTransport {
        fn new(statuses: Vec<u16>) -> Arc<Self> {
            Arc::new(Self {
                statuses,
                calls: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
                user_agents: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let body = request
                .body()
                .and_then(|b| b.as_bytes())
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            self.bodies.lock().unwrap().push(body);
            self.user_agents.lock().unwrap().push(
                request
                    .headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            );

            let status = *self
                .statuses
                .get(call)
                .or_else(|| self.statuses.last())
                .unwrap_or(&200);
            let response = http::Response::builder()
                .status(status)
                .body(Vec::new())
                .unwrap();
            Ok(Response::from(response))
        }
    }

    fn get_request() -> Request {
        Request::new(Method::GET, Url::parse("https://example.com/jobs").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_statuses_are_retried_until_exhausted() {
        for status in [408u16, 425, 429, 500, 502, 503, 504] {
            let mock = MockTransport::new(vec![status]);
            let client = RetryClient::new().with_transport(mock.clone());

            let err = client
                .execute(get_request(), &CancellationToken::new())
                .await
                .unwrap_err();

            assert!(
                matches!(err, RetryError::RetriesExhausted { status: s } if s.as_u16() == status),
                "status {status}: unexpected error {err:?}",
            );
            assert!(mock.calls() >= 2, "status {status}: only {} attempts", mock.calls());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_503s_exhaust_after_six_attempts() {
        let mock = MockTransport::new(vec![503; 6]);
        let client = RetryClient::new().with_transport(mock.clone());

        let err = client
            .execute(get_request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::RetriesExhausted { status } if status.as_u16() == 503));
        assert_eq!(mock.calls(), 6);
    }

    #[tokio::test]
    async fn non_retryable_status_returns_after_one_attempt() {
        let mock = MockTransport::new(vec![400]);
        let client = RetryClient::new().with_transport(mock.clone());

        let response = client
            .execute(get_request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extra_retryable_status_is_honoured() {
        let mock = MockTransport::new(vec![400]);
        let client = RetryClient::new()
            .with_transport(mock.clone())
            .with_extra_retryable_status(&[StatusCode::BAD_REQUEST]);

        let err = client
            .execute(get_request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::RetriesExhausted { .. }));
        assert!(mock.calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_retry_succeeds() {
        let mock = MockTransport::new(vec![503, 200]);
        let client = RetryClient::new().with_transport(mock.clone());

        let response = client
            .execute(get_request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn body_bytes_are_identical_across_attempts() {
        let mock = MockTransport::new(vec![503; 6]);
        let client = RetryClient::new().with_transport(mock.clone());

        let mut request = Request::new(
            Method::POST,
            Url::parse("https://example.com/search").unwrap(),
        );
        *request.body_mut() = Some(br#"{"url":"https://example.com/q"}"#.to_vec().into());

        let _ = client.execute(request, &CancellationToken::new()).await;

        let bodies = mock.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 6);
        for body in bodies.iter() {
            assert_eq!(body, br#"{"url":"https://example.com/q"}"#);
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_the_backoff_wait() {
        let mock = MockTransport::new(vec![503]);
        let client = RetryClient::new().with_transport(mock.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.execute(get_request(), &cancel).await.unwrap_err();

        assert!(matches!(err, RetryError::Cancelled));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn randomized_policy_sets_a_user_agent_on_every_attempt() {
        let mock = MockTransport::new(vec![200]);
        let client = RetryClient::new()
            .with_transport(mock.clone())
            .with_random_user_agent();

        client
            .execute(get_request(), &CancellationToken::new())
            .await
            .unwrap();

        let agents = mock.user_agents.lock().unwrap();
        assert_eq!(agents.len(), 1);
        let ua = agents[0].as_deref().unwrap();
        assert!(USER_AGENTS.contains(&ua));
    }
}
