//! Network client abstraction for image fetches.
//!
//! The engine talks to the network through the [`NetworkClient`] trait.
//! This abstraction allows for dependency injection and easier testing by
//! enabling mock clients in tests; the real implementation wraps reqwest.
//!
//! Fetches are aborted by dropping the returned future. The engine does
//! this when the last waiter for a request cancels.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur while fetching image bytes.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// Transport-level failure (connection, TLS, timeout).
    #[error("request failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },
}

/// Asynchronous byte-fetching client.
///
/// Implementations must be `Send + Sync` for use across async tasks. The
/// returned future resolves to the full response body; dropping it before
/// completion aborts the underlying request.
pub trait NetworkClient: Send + Sync {
    /// Fetches the resource at `url` and returns its body.
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, NetworkError>>;
}

/// Real HTTP client implementation using reqwest.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with the default 30 second request timeout.
    pub fn new() -> Result<Self, NetworkError> {
        Self::with_timeout(30)
    }

    /// Creates a client with a custom request timeout.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| NetworkError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl NetworkClient for ReqwestClient {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, NetworkError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| NetworkError::Transport(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(NetworkError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            response
                .bytes()
                .await
                .map_err(|e| NetworkError::Transport(format!("failed to read response body: {e}")))
        })
    }
}
