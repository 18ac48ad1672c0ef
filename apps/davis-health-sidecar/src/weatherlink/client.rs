use super::payload::RawPayload;
use super::signer::{RequestDescriptor, RequestSigner};
use super::{ApiFailure, Endpoint};
use crate::context::{ArchiveWindow, CredentialContext};
use anyhow::{Context, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode, Url};
use tokio::time::{sleep, Duration};

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub request_timeout: Duration,
    pub base_delay: Duration,
    /// Upper bound for any single backoff. Kept below the vendor's signature validity
    /// window; every attempt is re-signed regardless.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        let factor = 1u32 << shift;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Worst-case wall time of one fetch, used to bound a stuck cycle.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let mut total = self.request_timeout * attempts as u32;
        for attempt in 1..attempts {
            total += self.delay_after(attempt);
        }
        total
    }
}

enum AttemptError {
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    Terminal(ApiFailure),
}

#[derive(Clone, Debug)]
pub struct WeatherLinkClient {
    http: Client,
    signer: RequestSigner,
    policy: RetryPolicy,
}

impl WeatherLinkClient {
    pub fn new(http: Client, base_url: &str, policy: RetryPolicy) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid WeatherLink API base URL {base_url}"))?;
        Ok(Self {
            http,
            signer: RequestSigner::new(base_url),
            policy,
        })
    }

    /// Fetch one endpoint, retrying transient failures. Each attempt is signed
    /// immediately before it is sent.
    pub async fn fetch(
        &self,
        creds: &CredentialContext,
        endpoint: Endpoint,
        window: &ArchiveWindow,
    ) -> Result<RawPayload, ApiFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;
        let mut last_error = String::new();

        while attempt < max_attempts {
            attempt += 1;
            let request = self.signer.sign(creds, endpoint, Some(window));
            tracing::debug!(
                endpoint = %endpoint,
                attempt,
                url = %request.url,
                signed_at = request.signed_at,
                "sending WeatherLink request"
            );

            match self.send_once(&request).await {
                Ok(payload) => {
                    tracing::debug!(
                        endpoint = %endpoint,
                        attempt,
                        sensors = payload.sensors.len(),
                        generated_at = ?payload.generated_at,
                        "received WeatherLink payload"
                    );
                    return Ok(payload);
                }
                Err(AttemptError::Terminal(failure)) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt,
                        kind = failure.kind(),
                        error = %failure,
                        "WeatherLink request failed; not retrying"
                    );
                    return Err(failure);
                }
                Err(AttemptError::Retryable {
                    message,
                    retry_after,
                }) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts,
                        error = %message,
                        "WeatherLink request failed"
                    );
                    last_error = message;
                    if attempt < max_attempts {
                        let delay = retry_after
                            .map(|value| value.min(self.policy.max_delay))
                            .unwrap_or_else(|| self.policy.delay_after(attempt));
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(ApiFailure::Transient {
            endpoint,
            attempts: attempt,
            message: last_error,
        })
    }

    async fn send_once(&self, request: &RequestDescriptor) -> Result<RawPayload, AttemptError> {
        let endpoint = request.endpoint;
        let response = self
            .http
            .get(request.url.clone())
            .headers(request.headers.clone())
            .query(&request.query)
            .timeout(self.policy.request_timeout)
            .send()
            .await
            .map_err(|err| AttemptError::Retryable {
                message: err.to_string(),
                retry_after: None,
            })?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|err| AttemptError::Retryable {
                    message: err.to_string(),
                    retry_after: None,
                })?;
            return serde_json::from_slice::<RawPayload>(&body).map_err(|err| {
                AttemptError::Terminal(ApiFailure::Malformed {
                    endpoint,
                    message: err.to_string(),
                })
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AttemptError::Terminal(ApiFailure::Auth { endpoint, status }));
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptError::Retryable {
                message: format!("unexpected status {status}"),
                retry_after,
            });
        }

        Err(AttemptError::Terminal(ApiFailure::Rejected { endpoint, status }))
    }
}
