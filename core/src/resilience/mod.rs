pub mod circuit_breaker;
pub mod client;
pub mod retry;

pub use circuit_breaker::BreakerError;
pub use circuit_breaker::BreakerPermit;
pub use circuit_breaker::BreakerSettings;
pub use circuit_breaker::BreakerSnapshot;
pub use circuit_breaker::BreakerState;
pub use circuit_breaker::BreakerTransition;
pub use circuit_breaker::CircuitBreaker;
pub use circuit_breaker::CircuitBreakerRegistry;
pub use circuit_breaker::CircuitOpen;
pub use client::ClientError;
pub use client::ResilientClient;
pub use retry::RetryPolicy;

use std::fmt;
use std::sync::Arc;

use crate::config::BreakerConfig;
use crate::config::RetryConfig;
use crate::config::ServiceEndpoint;

/// Shared plumbing for every outbound client: one HTTP connection pool,
/// one breaker per destination and a common retry policy.
#[derive(Clone)]
pub struct ResilienceServices {
    pub breakers: Arc<CircuitBreakerRegistry>,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl ResilienceServices {
    pub fn new(breaker: &BreakerConfig, retry: &RetryConfig) -> Self {
        Self::with_http(reqwest::Client::new(), breaker, retry)
    }

    pub fn with_http(http: reqwest::Client, breaker: &BreakerConfig, retry: &RetryConfig) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerSettings::from(breaker))),
            http,
            retry: retry.clone(),
        }
    }

    pub fn client(
        &self,
        service: &str,
        endpoint: &ServiceEndpoint,
    ) -> Result<ResilientClient, ClientError> {
        ResilientClient::new(
            service,
            endpoint,
            self.http.clone(),
            &self.breakers,
            &self.retry,
        )
    }
}

impl fmt::Debug for ResilienceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceServices")
            .field("breakers", &self.breakers.snapshot().len())
            .field("max_retries", &self.retry.max_retries)
            .finish()
    }
}
