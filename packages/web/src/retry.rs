//! HTTP retry helpers for transient errors.
//!
//! Every fetch goes through [`send_bytes`] instead of calling
//! `reqwest::RequestBuilder::send()` directly, so each request gets
//! automatic retry with exponential backoff for transient failures
//! (timeouts, connection resets, server errors, rate limiting). Every
//! attempt, retries included, first takes a token from the request's
//! [`RateLimiter`].
//!
//! ```ignore
//! let body = retry::send_bytes(&limiter, || client.get(url.clone())).await?;
//! ```

use std::time::Duration;

use reqwest::StatusCode;

use crate::{RateLimiter, WebError};

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With exponential backoff (2s, 4s, 8s, 16s, 32s) the total wait before
/// giving up is 62 seconds.
const MAX_RETRIES: u32 = 5;

/// Maximum number of full re-fetch attempts when the response body cannot
/// be read (connection dropped mid-body, truncated transfer).
const MAX_BODY_RETRIES: u32 = 3;

/// Sends an HTTP request and returns the raw response body.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// # Retry behaviour
///
/// 1. **Connection-level** ([`send_inner`]): up to [`MAX_RETRIES`] retries
///    with exponential backoff on connection errors, timeouts, HTTP 429,
///    and HTTP 5xx.
/// 2. **Body-read**: if the response arrives but its body cannot be read,
///    the *entire* request is re-sent up to [`MAX_BODY_RETRIES`] times.
///
/// HTTP 4xx other than 429 is permanent and never retried. Every attempt
/// waits for `rate_limiter` before it is sent.
///
/// # Errors
///
/// Returns [`WebError`] if the request fails after all retries or the
/// server answers with a non-retryable status code.
pub async fn send_bytes<F>(rate_limiter: &RateLimiter, build_request: F) -> Result<Vec<u8>, WebError>
where
    F: Fn() -> reqwest::RequestBuilder + Sync,
{
    let mut body_attempt = 0;
    loop {
        let response = send_inner(rate_limiter, &build_request, MAX_RETRIES).await?;
        let url = response.url().to_string();
        let status = response.status();

        match response.bytes().await {
            Ok(body) => return Ok(body.to_vec()),
            Err(e) if body_attempt < MAX_BODY_RETRIES => {
                body_attempt += 1;
                let delay = backoff(body_attempt);
                log::warn!(
                    "Response body read failed (body retry {body_attempt}/{MAX_BODY_RETRIES}), \
                     re-fetching in {delay:?}...\n  \
                     url: {url}\n  \
                     status: {status}\n  \
                     error: {e}",
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::error!(
                    "Response body read failed after {MAX_BODY_RETRIES} retries, giving up.\n  \
                     url: {url}\n  \
                     status: {status}\n  \
                     error: {e}",
                );
                return Err(WebError::Http(e));
            }
        }
    }
}

/// What to do with a response, judged by its status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accept,
    Retry,
    Fail,
}

fn disposition(status: StatusCode) -> Disposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Disposition::Retry
    } else if status.is_client_error() {
        Disposition::Fail
    } else {
        Disposition::Accept
    }
}

/// Delay before retry number `attempt` (1-based): 2s, 4s, 8s, ...
const fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

/// Core retry loop.
///
/// Sends the request built by `build_request`, retrying on transient
/// errors up to `max_retries` times with exponential backoff. Returns the
/// successful [`reqwest::Response`] (status 1xx, 2xx or 3xx).
async fn send_inner<F>(
    rate_limiter: &RateLimiter,
    build_request: &F,
    max_retries: u32,
) -> Result<reqwest::Response, WebError>
where
    F: Fn() -> reqwest::RequestBuilder + Sync,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = backoff(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        rate_limiter.acquire().await;
        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    attempt += 1;
                    continue;
                }
                return Err(WebError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                match disposition(status) {
                    Disposition::Accept => return Ok(response),
                    Disposition::Retry if attempt < max_retries => {
                        log::warn!("  HTTP {status} from {}", response.url());
                        attempt += 1;
                    }
                    Disposition::Retry | Disposition::Fail => {
                        return Err(WebError::Status {
                            status: status.as_u16(),
                            url: response.url().to_string(),
                            retries: attempt,
                        });
                    }
                }
            }
        }
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    use super::*;

    /// Serves `503 Service Unavailable` to every request and counts them.
    async fn unavailable_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/products", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    socket
                        .write_all(
                            b"HTTP/1.1 503 Service Unavailable\r\n\
                              content-length: 0\r\n\
                              connection: close\r\n\r\n",
                        )
                        .await
                        .ok();
                    socket.shutdown().await.ok();
                });
            }
        });

        (url, hits)
    }

    #[tokio::test(start_paused = true)]
    async fn every_retry_waits_for_the_rate_limiter() {
        let (url, hits) = unavailable_server().await;
        let client = reqwest::Client::new();
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let start = Instant::now();

        let err = send_bytes(&limiter, || client.get(&url)).await.unwrap_err();

        assert!(matches!(
            err,
            WebError::Status {
                status: 503,
                retries: MAX_RETRIES,
                ..
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1 + MAX_RETRIES as usize);
        // One token per minute: the sixth attempt cannot start before 5 min.
        assert!(start.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_retries_only_wait_for_backoff() {
        let (url, hits) = unavailable_server().await;
        let client = reqwest::Client::new();
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();

        send_bytes(&limiter, || client.get(&url)).await.unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1 + MAX_RETRIES as usize);
        assert!(start.elapsed() < Duration::from_secs(120));
    }

    #[test]
    fn rate_limiting_and_server_errors_are_retried() {
        assert_eq!(disposition(StatusCode::TOO_MANY_REQUESTS), Disposition::Retry);
        assert_eq!(disposition(StatusCode::BAD_GATEWAY), Disposition::Retry);
        assert_eq!(
            disposition(StatusCode::SERVICE_UNAVAILABLE),
            Disposition::Retry
        );
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert_eq!(disposition(StatusCode::NOT_FOUND), Disposition::Fail);
        assert_eq!(disposition(StatusCode::UNAUTHORIZED), Disposition::Fail);
    }

    #[test]
    fn success_and_redirects_are_accepted() {
        assert_eq!(disposition(StatusCode::OK), Disposition::Accept);
        assert_eq!(disposition(StatusCode::NO_CONTENT), Disposition::Accept);
        assert_eq!(disposition(StatusCode::NOT_MODIFIED), Disposition::Accept);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(5), Duration::from_secs(32));
    }
}
