//! Bounded HTTP retry with exponential backoff.
//!
//! - Retries on connection errors and HTTP 408, 409, 429, 5xx
//! - `x-should-retry: true|false` overrides the status check
//! - `Retry-After` / `Retry-After-Ms` win over the computed delay when in `(0, 60s)`
//! - Down-jitter: the delay is scaled by a factor in `[1 - jitter_factor, 1.0]`

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};

const RETRY_COUNT_HEADER: &str = "X-Haven-Retry-Count";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Re-attempts after the first request.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let in_range = |d: Duration| d > Duration::ZERO && d < Duration::from_secs(60);

    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if in_range(duration) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if in_range(duration) {
            return Some(duration);
        }
    }

    None
}

#[must_use]
pub fn should_retry(status: StatusCode, headers: &HeaderMap) -> bool {
    if let Some(val) = headers.get("x-should-retry")
        && let Ok(s) = val.to_str()
    {
        if s.eq_ignore_ascii_case("true") {
            return true;
        }
        if s.eq_ignore_ascii_case("false") {
            return false;
        }
    }

    matches!(
        status.as_u16(),
        408 | 409 | 429 | 500 | 502 | 503 | 504 | 520..=599
    )
}

/// Delay before re-attempt number `backoff_step` (0-based).
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(headers) = headers
        && let Some(delay) = parse_retry_after(headers)
    {
        return delay;
    }

    let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Result of [`send_with_retry`]. Only `Success` carries a 2xx response.
#[derive(Debug)]
pub enum RetryOutcome {
    Success(Response),
    /// Non-2xx after retries ran out, or a status that is never retried.
    HttpError(Response),
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
}

/// Send the request built by `build_request`, retrying per `config`.
///
/// `build_request` runs once per attempt.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let mut retry_count = 0;
    loop {
        let can_retry = retry_count < config.max_retries;
        let request = build_request().header(RETRY_COUNT_HEADER, retry_count.to_string());

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if !can_retry || !should_retry(status, response.headers()) {
                    return RetryOutcome::HttpError(response);
                }
                let delay = calculate_retry_delay(retry_count, config, Some(response.headers()));
                tracing::debug!(
                    status = %status,
                    retry_count = retry_count + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying content fetch after error status"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if !can_retry || !is_retryable_error(&e) {
                    return RetryOutcome::ConnectionError {
                        attempts: retry_count + 1,
                        source: e,
                    };
                }
                let delay = calculate_retry_delay(retry_count, config, None);
                tracing::debug!(
                    error = %e,
                    retry_count = retry_count + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying content fetch after connection error"
                );
                tokio::time::sleep(delay).await;
            }
        }
        retry_count += 1;
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_retry_after_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1500))
        );

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.clear();
        headers.insert("retry-after-ms", HeaderValue::from_static("NaN"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retryable_statuses() {
        let headers = HeaderMap::new();
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS, &headers));
        assert!(should_retry(StatusCode::SERVICE_UNAVAILABLE, &headers));
        assert!(should_retry(StatusCode::REQUEST_TIMEOUT, &headers));
        assert!(!should_retry(StatusCode::NOT_FOUND, &headers));
        assert!(!should_retry(StatusCode::FORBIDDEN, &headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-should-retry", HeaderValue::from_static("false"));
        assert!(!should_retry(StatusCode::SERVICE_UNAVAILABLE, &headers));
    }

    #[test]
    fn delay_is_capped_and_jittered_down() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let first = calculate_retry_delay(0, &config, None);
            assert!(first >= Duration::from_millis(375) && first <= Duration::from_millis(500));

            let late = calculate_retry_delay(20, &config, None);
            assert!(late <= Duration::from_secs(8));
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        let attempt = AtomicU32::new(0);

        Mock::given(method("GET"))
            .and(path("/content"))
            .respond_with(move |_: &wiremock::Request| {
                if attempt.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200).set_body_string("ok")
                }
            })
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/content", server.uri());
        let outcome = send_with_retry(|| client.get(&url), &fast_retry_config()).await;

        match outcome {
            RetryOutcome::Success(response) => assert_eq!(response.status(), StatusCode::OK),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/content", server.uri());
        let outcome = send_with_retry(|| client.get(&url), &fast_retry_config()).await;

        match outcome {
            RetryOutcome::HttpError(response) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/content", server.uri());
        let outcome = send_with_retry(|| client.get(&url), &fast_retry_config()).await;
        assert!(matches!(outcome, RetryOutcome::HttpError(_)));
    }

    #[tokio::test]
    async fn numbers_each_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header(RETRY_COUNT_HEADER, "0"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header(RETRY_COUNT_HEADER, "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let outcome = send_with_retry(|| client.get(&url), &fast_retry_config()).await;
        assert!(matches!(outcome, RetryOutcome::Success(_)));
    }

    #[tokio::test]
    async fn connection_failure_reports_attempts() {
        let client = reqwest::Client::new();
        // Nothing listens on port 9 of the loopback interface.
        let config = RetryConfig {
            max_retries: 1,
            ..fast_retry_config()
        };
        let outcome = send_with_retry(|| client.get("http://127.0.0.1:9/content"), &config).await;
        match outcome {
            RetryOutcome::ConnectionError { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected ConnectionError, got {other:?}"),
        }
    }
}
