//! Where remote content comes from.

use std::future::Future;
use std::net::IpAddr;

use haven_config::SyncSettings;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use url::{Host, Url};

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::{SourceError, SyncFailure};

/// The remote payload before validation.
///
/// Items stay untyped so one malformed item cannot sink the others.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteEnvelope {
    pub items: Vec<Value>,
}

pub trait ContentSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<RemoteEnvelope, SyncFailure>> + Send;
}

/// HTTPS JSON content API.
#[derive(Debug, Clone)]
pub struct HttpContentSource {
    client: reqwest::Client,
    endpoint: Url,
    retry: RetryConfig,
    max_body_bytes: usize,
}

impl HttpContentSource {
    pub fn from_settings(settings: &SyncSettings) -> Result<Self, SourceError> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .ok_or(SourceError::MissingEndpoint)?;
        let endpoint = parse_endpoint(endpoint)?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .https_only(endpoint.scheme() == "https")
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(SourceError::Client)?;

        Ok(Self {
            client,
            endpoint,
            retry: RetryConfig::with_max_retries(settings.max_retries),
            max_body_bytes: settings.max_body_bytes,
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ContentSource for HttpContentSource {
    async fn fetch(&self) -> Result<RemoteEnvelope, SyncFailure> {
        let outcome = send_with_retry(
            || {
                self.client
                    .get(self.endpoint.clone())
                    .header(ACCEPT, HeaderValue::from_static("application/json"))
            },
            &self.retry,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                return Err(SyncFailure::HttpStatus {
                    status: response.status().as_u16(),
                });
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(SyncFailure::Network { attempts, source });
            }
        };

        let body = read_capped(response, self.max_body_bytes).await?;
        serde_json::from_slice(&body).map_err(|e| SyncFailure::Payload(e.to_string()))
    }
}

async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, SyncFailure> {
    let too_large = SyncFailure::PayloadTooLarge { limit };
    if let Some(len) = response.content_length()
        && len > limit as u64
    {
        return Err(too_large);
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|source| SyncFailure::Network {
            attempts: 1,
            source,
        })?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Accept `https` anywhere and plain `http` only on the loopback interface.
fn parse_endpoint(raw: &str) -> Result<Url, SourceError> {
    let url = Url::parse(raw.trim())?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        other => Err(SourceError::InsecureEndpoint {
            scheme: other.to_string(),
        }),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}
