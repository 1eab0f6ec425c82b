//! HTTP delivery over `reqwest`.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method};
use tracing::debug;

use crate::error::{Result, RouterError};
use crate::ports::{Transport, TransportRequest, TransportResponse};

/// Connect timeout for new connections; the per-request deadline comes from
/// the request itself.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Config` if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("claw-alert-router/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RouterError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a TransportRequest) -> BoxFuture<'a, Result<TransportResponse>> {
        Box::pin(async move {
            let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
                RouterError::InvalidTarget {
                    reason: format!(
                        "target {}: invalid HTTP method {}",
                        request.target, request.method
                    ),
                }
            })?;

            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(request.timeout)
                .body(request.body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| map_send_error(&request.target, &e))?;

            let status = response.status().as_u16();
            let body = response.text().await.ok().filter(|b| !b.is_empty());
            debug!(target_name = %request.target, status, "delivery answered");
            Ok(TransportResponse { status, body })
        })
    }
}

fn map_send_error(target: &str, err: &reqwest::Error) -> RouterError {
    if err.is_timeout() {
        RouterError::Timeout {
            operation: format!("publish to {target}"),
        }
    } else {
        RouterError::Transport {
            target: target.to_string(),
            reason: err.to_string(),
        }
    }
}
