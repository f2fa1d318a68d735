#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! HTTP collaborator for ferry.
//!
//! [`fetch`] sends a request through the [`retry`] loop, which takes a
//! token from the request's shared [`RateLimiter`] before every attempt.

pub mod rate_limit;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub use rate_limit::RateLimiter;
pub use reqwest::{Method, Url};

/// Errors that can occur while fetching.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a status that is not retried, or kept
    /// answering with a retryable one.
    #[error("HTTP {status} from {url} after {retries} retries")]
    Status {
        /// Status code of the last response.
        status: u16,
        /// Final request URL.
        url: String,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// A configured header name or value is not valid HTTP.
    #[error("invalid header {name}: {message}")]
    Header {
        /// Header name as configured.
        name: String,
        /// Description of what went wrong.
        message: String,
    },
}

/// Shared HTTP client carrying the headers sent with every request.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    /// Builds a client sending `headers` (and `user_agent`, if set) on
    /// every request.
    ///
    /// # Errors
    ///
    /// Returns [`WebError::Header`] for header names or values that are
    /// not valid HTTP, and [`WebError::Http`] if the TLS backend cannot be
    /// initialised.
    pub fn new(
        user_agent: Option<&str>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, WebError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let header_error = |message: String| WebError::Header {
                name: name.clone(),
                message,
            };
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| header_error(e.to_string()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| header_error(e.to_string()))?;
            default_headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30));
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            http: builder.build()?,
        })
    }
}

/// Everything needed to issue one HTTP call.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: Url,
    /// Client the call is sent with.
    pub client: Arc<Client>,
    /// Limiter shared by every call derived from the same request.
    pub rate_limiter: Arc<RateLimiter>,
}

/// Sends the request with retry and returns the response body.
///
/// Every attempt, retries included, takes a token from the request's rate
/// limiter first.
///
/// # Errors
///
/// Returns [`WebError`] if the request fails after all retries.
pub async fn fetch(config: &FetchConfig) -> Result<Vec<u8>, WebError> {
    log::debug!("{} {}", config.method, config.url);
    retry::send_bytes(&config.rate_limiter, || {
        config
            .client
            .http
            .request(config.method.clone(), config.url.clone())
    })
    .await
}
