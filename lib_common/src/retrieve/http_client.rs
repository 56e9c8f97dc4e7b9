//! # HTTP Client
//!
//! A `reqwest` client behind `reqwest-middleware`, resolving paths against a
//! base URL. Connection errors, timeouts and 5xx/408/429 answers are resent a
//! few times with a short exponential backoff before the caller sees them.

use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;

/// Status and body of one completed exchange.
///
/// Non-2xx statuses are not errors at this level; callers decide what a
/// given status means for them.
#[derive(Debug)]
pub struct ApiResponse {
    /// The numeric HTTP status code.
    pub status: u16,
    /// Whether the status was in the 2xx range.
    pub success: bool,
    /// The response body, empty if it could not be read.
    pub body: String,
}

const RESEND_MIN_DELAY: Duration = Duration::from_millis(100);
const RESEND_MAX_DELAY: Duration = Duration::from_secs(2);

/// Asynchronous HTTP client bound to one base URL.
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Creates a client that resends transient failures up to `max_retries`
    /// times, each request bounded by `timeout`. Zero disables resending.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the TLS backend cannot
    /// be initialised.
    pub fn new(base_url: &str, max_retries: u32, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(RESEND_MIN_DELAY, RESEND_MAX_DELAY)
            .build_with_max_retries(max_retries);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sensorhub/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url })
    }

    /// The base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends `body` as `text/plain` to `path`, resolved against the base URL.
    /// An empty `path` targets the base URL itself.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be joined or the request could not
    /// be completed (connect failure, timeout).
    pub async fn send_text(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: String,
    ) -> anyhow::Result<ApiResponse> {
        let url = self.base_url.join(path)?;
        let mut req = self
            .inner
            .request(method, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if let Some(h) = headers {
            req = req.headers(h);
        }

        let response = req.body(body).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        Ok(ApiResponse {
            status: status.as_u16(),
            success: status.is_success(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_base_urls_are_rejected() {
        assert!(ApiClient::new("localhost/write", 0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn empty_path_targets_the_base_url() {
        let client = ApiClient::new("http://localhost:5001/write", 0, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url().join("").unwrap().as_str(), "http://localhost:5001/write");
    }
}
