use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;
use url::Url;

use super::circuit_breaker::CircuitBreaker;
use super::circuit_breaker::CircuitBreakerRegistry;
use super::retry::RetryPolicy;
use crate::config::RetryConfig;
use crate::config::ServiceEndpoint;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{service} is temporarily unavailable")]
    CircuitOpen { service: String },
    #[error("{service} request failed after {attempts} attempts: {last_error}")]
    Exhausted {
        service: String,
        attempts: u32,
        last_error: String,
    },
    #[error("{service} responded with {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
    #[error("{service} request failed: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode {service} response: {source}")]
    Decode {
        service: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {service} request: {source}")]
    Encode {
        service: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url for {service}: {reason}")]
    InvalidUrl { service: String, reason: String },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ClientError::CircuitOpen { .. } | ClientError::Exhausted { .. }
        )
    }
}

enum AttemptFailure {
    Status(StatusCode),
    Network(reqwest::Error),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Status(status) => write!(f, "status {status}"),
            AttemptFailure::Network(err) => write!(f, "{err}"),
        }
    }
}

/// HTTP invoker for one collaborating service.
///
/// Each logical call passes through the destination's circuit breaker once
/// and then through a retry loop. Only 5xx answers and transient network
/// errors are retried; the breaker records a failure only when the retries
/// are exhausted, so an open circuit never burns retry budget.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    service: String,
    base_url: Url,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        service: &str,
        endpoint: &ServiceEndpoint,
        http: reqwest::Client,
        breakers: &CircuitBreakerRegistry,
        retry: &RetryConfig,
    ) -> Result<Self, ClientError> {
        let invalid = |reason: String| ClientError::InvalidUrl {
            service: service.to_string(),
            reason,
        };
        let mut base_url = Url::parse(&endpoint.base_url).map_err(|err| invalid(err.to_string()))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| invalid(format!("{} has no host", endpoint.base_url)))?
            .to_string();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let destination = match base_url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let attempt_timeout = Duration::from_millis(
            endpoint.timeout_ms.unwrap_or(retry.attempt_timeout_ms),
        );
        Ok(Self {
            service: service.to_string(),
            base_url,
            http,
            breaker: breakers.get(&destination),
            policy: RetryPolicy::from(retry),
            attempt_timeout,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &[&str],
        token: Option<&str>,
    ) -> Result<T, ClientError> {
        let body = self.execute(Method::GET, path, None, token).await?;
        self.decode(&body)
    }

    /// Like [`Self::get_json`] but maps 404 to `None`.
    pub async fn get_optional_json<T: DeserializeOwned>(
        &self,
        path: &[&str],
        token: Option<&str>,
    ) -> Result<Option<T>, ClientError> {
        match self.execute(Method::GET, path, None, token).await {
            Ok(body) if body.is_empty() => Ok(None),
            Ok(body) => self.decode(&body).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &[&str],
        payload: &B,
        token: Option<&str>,
    ) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let encoded = self.encode(payload)?;
        let body = self.execute(method, path, Some(encoded), token).await?;
        self.decode(&body)
    }

    /// Sends `payload` and discards whatever the service answers.
    pub async fn send<B>(
        &self,
        method: Method,
        path: &[&str],
        payload: &B,
        token: Option<&str>,
    ) -> Result<(), ClientError>
    where
        B: Serialize + ?Sized,
    {
        let encoded = self.encode(payload)?;
        self.execute(method, path, Some(encoded), token).await?;
        Ok(())
    }

    /// Issues one logical request and returns the body of the 2xx answer.
    pub async fn execute(
        &self,
        method: Method,
        path: &[&str],
        body: Option<Bytes>,
        token: Option<&str>,
    ) -> Result<Bytes, ClientError> {
        let url = self.url(path)?;
        let permit = self
            .breaker
            .try_acquire()
            .map_err(|_| ClientError::CircuitOpen {
                service: self.service.clone(),
            })?;
        let result = self.with_retries(method, url, body, token).await;
        match &result {
            Err(ClientError::Exhausted { .. }) => permit.fail(),
            _ => permit.succeed(),
        }
        result
    }

    async fn with_retries(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
        token: Option<&str>,
    ) -> Result<Bytes, ClientError> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(self.attempt_timeout);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => return Ok(bytes),
                        Err(err) if is_transient(&err) => AttemptFailure::Network(err),
                        Err(source) => {
                            return Err(ClientError::Transport {
                                service: self.service.clone(),
                                source,
                            });
                        }
                    }
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    // Drain so the connection can go back to the pool.
                    let _ = response.bytes().await;
                    AttemptFailure::Status(status)
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::Status {
                        service: self.service.clone(),
                        status,
                        body,
                    });
                }
                Err(err) if is_transient(&err) => AttemptFailure::Network(err),
                Err(source) => {
                    return Err(ClientError::Transport {
                        service: self.service.clone(),
                        source,
                    });
                }
            };

            if attempt >= self.policy.max_retries {
                return Err(ClientError::Exhausted {
                    service: self.service.clone(),
                    attempts: attempt + 1,
                    last_error: failure.to_string(),
                });
            }
            let delay = self.policy.backoff(attempt);
            warn!(
                service = %self.service,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "request failed ({failure}); retrying"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Appends `segments` to the base path. Each segment is percent-encoded
    /// on its own, so ids cannot add path levels or a query string.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let invalid = |reason: String| ClientError::InvalidUrl {
            service: self.service.clone(),
            reason,
        };
        if let Some(segment) = segments
            .iter()
            .find(|segment| matches!(**segment, "" | "." | ".."))
        {
            return Err(invalid(format!("path segment {segment:?} is not allowed")));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| invalid(format!("{} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn encode<B: Serialize + ?Sized>(&self, payload: &B) -> Result<Bytes, ClientError> {
        serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|source| ClientError::Encode {
                service: self.service.clone(),
                source,
            })
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ClientError> {
        serde_json::from_slice(body).map_err(|source| {
            debug!(service = %self.service, "undecodable body: {}", String::from_utf8_lossy(body));
            ClientError::Decode {
                service: self.service.clone(),
                source,
            }
        })
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_body() || err.is_request()
}
