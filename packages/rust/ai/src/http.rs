//! POST client with a per-call deadline and fixed-backoff retries.
//!
//! Only responses whose status the retry predicate classifies as transient
//! are retried (default: any 5xx). Transport errors and other statuses are
//! returned on the first attempt. The backoff does not grow between attempts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use lexiforge_shared::{HttpConfig, LexiforgeError, Result};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("lexiforge/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in [`LexiforgeError::HttpStatus`].
const MAX_ERROR_BODY: usize = 4_096;

/// Classifies a response status as transient (worth retrying).
pub type RetryPredicate = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Default predicate: retry on any server error.
pub fn retry_on_server_error(status: StatusCode) -> bool {
    status.is_server_error()
}

/// HTTP client shared by all AI service calls.
#[derive(Clone)]
pub struct RetryClient {
    client: Client,
    max_retries: u32,
    backoff: Duration,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryClient")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryClient {
    /// Build a client with the configured deadline and retry policy.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LexiforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            backoff: config.backoff,
            retryable: Arc::new(retry_on_server_error),
        })
    }

    /// Replace the transient-status predicate.
    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// POST `body` to `url`, retrying transient statuses up to `max_retries` times.
    ///
    /// Returns the response body of the first successful attempt, or the error
    /// of the last attempt. Cancellation aborts in-flight requests and waits.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn post(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<Bytes> {
        let mut retries = 0;
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LexiforgeError::Cancelled),
                res = self.send_once(url, body.clone(), headers) => res,
            };

            match attempt {
                Ok(bytes) => return Ok(bytes),
                Err(LexiforgeError::HttpStatus { status, body })
                    if retries < self.max_retries && self.is_retryable(status) =>
                {
                    retries += 1;
                    warn!(
                        status,
                        retry = retries,
                        max_retries = self.max_retries,
                        body = %truncate(&body, 200),
                        "transient HTTP status, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(LexiforgeError::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_retryable(&self, status: u16) -> bool {
        StatusCode::from_u16(status)
            .map(|s| (self.retryable)(s))
            .unwrap_or(false)
    }

    /// A single attempt: non-2xx statuses become [`LexiforgeError::HttpStatus`].
    async fn send_once(&self, url: &Url, body: Bytes, headers: &HeaderMap) -> Result<Bytes> {
        debug!(%url, "POST");
        let response = self
            .client
            .post(url.clone())
            .headers(headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| LexiforgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LexiforgeError::Network(format!("{url}: body read failed: {e}")))?;

        if !status.is_success() {
            return Err(LexiforgeError::HttpStatus {
                status: status.as_u16(),
                body: truncate(&String::from_utf8_lossy(&bytes), MAX_ERROR_BODY),
            });
        }

        Ok(bytes)
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(max_retries: u32) -> RetryClient {
        RetryClient::new(&HttpConfig {
            timeout: Duration::from_secs(5),
            max_retries,
            backoff: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn endpoint(server: &MockServer) -> Url {
        Url::parse(&format!("{}/v1/chat", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn retries_exactly_max_retries_on_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(4)
            .mount(&server)
            .await;

        let client = test_client(3);
        let err = client
            .post(
                &CancellationToken::new(),
                &endpoint(&server),
                Bytes::from_static(b"{}"),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();

        match err {
            LexiforgeError::HttpStatus { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn does_not_retry_on_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(3);
        let err = client
            .post(
                &CancellationToken::new(),
                &endpoint(&server),
                Bytes::from_static(b"{}"),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LexiforgeError::HttpStatus { status: 400, .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .with_priority(2)
            .mount(&server)
            .await;

        let client = test_client(3);
        let body = client
            .post(
                &CancellationToken::new(),
                &endpoint(&server),
                Bytes::from_static(b"{}"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn custom_predicate_retries_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client =
            test_client(2).with_retry_predicate(|s| s == StatusCode::TOO_MANY_REQUESTS);
        let err = client
            .post(
                &CancellationToken::new(),
                &endpoint(&server),
                Bytes::new(),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LexiforgeError::HttpStatus { status: 429, .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let client = test_client(0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = client
            .post(&cancel, &endpoint(&server), Bytes::new(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = RetryClient::new(&HttpConfig {
            timeout: Duration::from_secs(5),
            max_retries: 5,
            backoff: Duration::from_secs(30),
        })
        .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = client
            .post(&cancel, &endpoint(&server), Bytes::new(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
