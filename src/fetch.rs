//! Producer that downloads the body behind a URL.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use tracing::info;

use crate::memo::Producer;

/// The HTTP client behind an [`HttpFetcher`] could not be set up.
#[derive(Debug, thiserror::Error)]
#[error("failed to build HTTP client")]
pub struct ClientError(#[source] reqwest::Error);

/// Why a URL could not be fetched.
///
/// Cheap to clone, so a [`Memo`](crate::Memo) can hand the same error to every caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Sending the request failed (invalid URL, connection error, timeout, ...).
    #[error("failed to fetch {url}")]
    Request {
        /// The requested URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: Arc<reqwest::Error>,
    },
    /// The response arrived but its body could not be read.
    #[error("failed to read response body of {url}")]
    Body {
        /// The requested URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: Arc<reqwest::Error>,
    },
}

/// Fetches URLs with a blocking HTTP client and returns the response body.
///
/// The body is returned whatever the HTTP status is; only transport failures are errors.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Request timeout used by [`HttpFetcher::new`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a fetcher with [`HttpFetcher::DEFAULT_TIMEOUT`].
    pub fn new() -> Result<Self, ClientError> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Creates a fetcher whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError)?;
        Ok(Self { client })
    }
}

impl Producer<String> for HttpFetcher {
    type Value = Bytes;
    type Error = FetchError;

    fn produce(&self, url: &String) -> Result<Bytes, FetchError> {
        info!(%url, "fetching");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|err| FetchError::Request {
                url: url.clone(),
                source: Arc::new(err),
            })?;
        response.bytes().map_err(|err| FetchError::Body {
            url: url.clone(),
            source: Arc::new(err),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{FetchError, HttpFetcher};
    use crate::memo::{FailurePolicy, Memo};

    #[test]
    fn build_with_custom_timeout() {
        let fetcher = HttpFetcher::with_timeout(Duration::from_secs(1)).unwrap();
        let memo = Memo::new(fetcher);
        // Transport failures are the only errors a fetch reports.
        assert!(matches!(
            memo.get("http://[::1".to_string()),
            Err(FetchError::Request { .. })
        ));
    }

    #[test]
    fn invalid_url_is_a_request_error() {
        let memo = Memo::new(HttpFetcher::new().unwrap());
        let err = memo.get("not a url".to_string()).unwrap_err();
        assert!(matches!(&err, FetchError::Request { url, .. } if url == "not a url"));
        assert_eq!(err.to_string(), "failed to fetch not a url");

        // The failure is remembered.
        assert!(memo.peek(&"not a url".to_string()).unwrap().is_err());
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn invalid_url_is_forgotten_with_retry() {
        let memo = Memo::with_policy(HttpFetcher::new().unwrap(), FailurePolicy::Retry);
        assert!(memo.get("::".to_string()).is_err());
        assert!(memo.is_empty());
    }
}
