//! Rate-limited, retrying API client shared by every subtask of one connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lake_core::PipelineError;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, debug_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Refills one token per `refill_every`, up to `capacity`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let refill_ms = self.refill_every.as_millis();
            if refill_ms > 0 {
                let elapsed = state.last_refill.elapsed();
                let refills = elapsed.as_millis() / refill_ms;
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
            } else {
                state.tokens = self.capacity;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("api client is shut down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => {
                let retryable = StatusCode::from_u16(status)
                    .map(|s| classify_status(s) == RetryDisposition::Retryable)
                    .unwrap_or(false);
                if retryable {
                    PipelineError::TransientIo(format!("http {status} for {url} after retries"))
                } else {
                    PipelineError::Remote { status, url }
                }
            }
            FetchError::Request(inner) => PipelineError::TransientIo(inner.to_string()),
            FetchError::Closed => PipelineError::TransientIo(err.to_string()),
        }
    }
}

/// HTTP client bound to one connection endpoint.
///
/// Concurrency, the token bucket and retry policy apply to every request issued through a clone.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoint: String,
    headers: Arc<Vec<(String, String)>>,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            headers: Arc::new(config.headers),
            in_flight: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            token_bucket: config
                .token_bucket
                .map(|bucket| Arc::new(SimpleTokenBucket::new(bucket))),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Absolute urls pass through; anything else is joined onto the endpoint.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GET with retries on 5xx, 429 and connect/timeout failures.
    ///
    /// Any other non-2xx status comes back as [`FetchError::HttpStatus`] without retrying.
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, FetchError> {
        let url = self.resolve(path);
        let span = debug_span!("api_get", url = %url);
        self.get_inner(url, query).instrument(span).await
    }

    async fn get_inner(&self, url: String, query: &[(String, String)]) -> Result<ApiResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let mut request = self.client.get(&url).query(query);
            for (name, value) in self.headers.iter() {
                request = request.header(name.as_str(), value.as_str());
            }

            let can_retry = attempt < self.backoff.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "api response");
                        return Ok(ApiResponse {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retrying api request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retrying api request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, max_retries: usize) -> ApiClient {
        ApiClient::new(ApiClientConfig {
            endpoint: server.uri(),
            headers: vec![("Authorization".into(), "Bearer t0ken".into())],
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..ApiClientConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_errors_map_by_retryability() {
        let err: PipelineError = FetchError::HttpStatus {
            status: 404,
            url: "x".into(),
        }
        .into();
        assert_eq!(err.kind(), "remote");
        let err: PipelineError = FetchError::HttpStatus {
            status: 503,
            url: "x".into(),
        }
        .into();
        assert_eq!(err.kind(), "transient_io");
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls"))
            .and(query_param("page", "1"))
            .and(header("Authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let resp = client
            .get("repos/o/r/pulls", &[("page".into(), "1".into())])
            .await
            .expect("get");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.json::<Vec<u32>>().expect("json"), Vec::<u32>::new());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let err = client.get("/missing", &[]).await.expect_err("404");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn resolve_joins_relative_paths_only() {
        let client = ApiClient::new(ApiClientConfig {
            endpoint: "https://api.example.com/v3/".into(),
            ..ApiClientConfig::default()
        })
        .expect("client");
        assert_eq!(client.resolve("/issues"), "https://api.example.com/v3/issues");
        assert_eq!(client.resolve("http://other/x"), "http://other/x");
    }
}
