//! Turns declarative [`Request`]s into independently executable fetches.
//!
//! A request without a time series becomes one [`FlattenedRequest`]; a
//! request with one becomes one per chunk, in chunk order. Every fetch
//! derived from the same request shares one [`RateLimiter`], so the API
//! sees the aggregate rate no matter how many fetches run at once.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_transport_models::{HttpMethod, RateLimitConfig, Request};
use ferry_web::{Client, FetchConfig, Method, RateLimiter, Url};

use crate::TransportError;

/// One fully resolved fetch and the table its response is written to.
#[derive(Debug, Clone)]
pub struct FlattenedRequest {
    /// What to fetch and how.
    pub fetch_config: FetchConfig,
    /// Destination table, if the response is stored.
    pub table: Option<String>,
}

/// Flattens a request into a single fetch, ignoring any time series.
///
/// `default_rate_limit` applies when the request declares none.
///
/// # Errors
///
/// Returns [`TransportError::MalformedRequest`] if the endpoint cannot be
/// joined onto `base_uri`, and [`TransportError::MissingRateLimit`] if the
/// request has a time series but no rate limit resolves.
pub fn flatten(
    request: &Request,
    base_uri: &str,
    client: &Arc<Client>,
    default_rate_limit: Option<&RateLimitConfig>,
) -> Result<FlattenedRequest, TransportError> {
    let rate_limiter = rate_limiter_for(request, default_rate_limit)?;
    flatten_with(request, base_uri, client, &request.query, rate_limiter)
}

/// Flattens a request into one fetch per time-series chunk, or a single
/// fetch when it has no time series.
///
/// Each chunk gets its own copy of the query with the time-series start and
/// end parameters set to the chunk bounds. Nothing is returned unless every
/// chunk flattens.
///
/// # Errors
///
/// Returns [`TransportError::MalformedRequest`] for endpoints that cannot
/// be joined, [`TransportError::MissingRateLimit`] if no rate limit
/// resolves, and [`TransportError::Config`] for an unusable time layout.
pub fn flatten_timeseries(
    request: &Request,
    base_uri: &str,
    client: &Arc<Client>,
    default_rate_limit: Option<&RateLimitConfig>,
) -> Result<Vec<FlattenedRequest>, TransportError> {
    let Some(timeseries) = &request.timeseries else {
        return Ok(vec![flatten(
            request,
            base_uri,
            client,
            default_rate_limit,
        )?]);
    };

    let rate_limiter = rate_limiter_for(request, default_rate_limit)?;

    timeseries
        .chunks()
        .into_iter()
        .map(|(start, end)| {
            let mut query = request.query.clone();
            query.insert(
                timeseries.start_name.clone(),
                format_bound(start, &timeseries.layout)?,
            );
            query.insert(
                timeseries.end_name.clone(),
                format_bound(end, &timeseries.layout)?,
            );
            flatten_with(request, base_uri, client, &query, rate_limiter.clone())
        })
        .collect()
}

fn flatten_with(
    request: &Request,
    base_uri: &str,
    client: &Arc<Client>,
    query: &BTreeMap<String, String>,
    rate_limiter: Arc<RateLimiter>,
) -> Result<FlattenedRequest, TransportError> {
    Ok(FlattenedRequest {
        fetch_config: FetchConfig {
            method: http_method(request.method),
            url: resolve_url(base_uri, &request.endpoint, query)?,
            client: client.clone(),
            rate_limiter,
        },
        table: request.table.clone(),
    })
}

/// Picks the request's own rate limit, then the default.
///
/// Time-series requests fan out into bursts of fetches, so they must be
/// throttled; anything else may run unthrottled.
fn rate_limiter_for(
    request: &Request,
    default_rate_limit: Option<&RateLimitConfig>,
) -> Result<Arc<RateLimiter>, TransportError> {
    match request.rate_limit.as_ref().or(default_rate_limit) {
        Some(config) => Ok(Arc::new(RateLimiter::new(config.period(), config.burst))),
        None if request.timeseries.is_some() => Err(TransportError::MissingRateLimit {
            endpoint: request.endpoint.clone(),
        }),
        None => Ok(Arc::new(RateLimiter::unlimited())),
    }
}

fn http_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
    }
}

fn format_bound(at: DateTime<Utc>, layout: &str) -> Result<String, TransportError> {
    let mut formatted = String::new();
    write!(formatted, "{}", at.format(layout)).map_err(|_| TransportError::Config {
        message: format!("invalid time layout: {layout}"),
    })?;
    Ok(formatted)
}

/// Joins `endpoint` onto `base_uri` as path segments and merges the query.
///
/// Parameters already on the base URL or embedded in the endpoint are
/// kept unless `query` names the same key. A URL with no parameters gets
/// no `?`.
fn resolve_url(
    base_uri: &str,
    endpoint: &str,
    query: &BTreeMap<String, String>,
) -> Result<Url, TransportError> {
    let malformed = |message: String| TransportError::MalformedRequest {
        endpoint: endpoint.to_string(),
        message,
    };

    let mut url = Url::parse(base_uri).map_err(|e| malformed(format!("{base_uri}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(malformed(format!("{base_uri} cannot be a base URL")));
    }

    let (path, embedded_query) = endpoint
        .split_once('?')
        .map_or((endpoint, None), |(path, query)| (path, Some(query)));

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(segment) = segments.iter().find(|s| is_dot_segment(s)) {
        return Err(malformed(format!("path segment {segment:?} is not allowed")));
    }

    // `set_path` leaves existing `%XX` escapes alone, so an endpoint that is
    // already percent-encoded is not encoded a second time.
    if !segments.is_empty() {
        let mut joined = url.path().trim_end_matches('/').to_string();
        for segment in &segments {
            joined.push('/');
            joined.push_str(segment);
        }
        if path.ends_with('/') {
            joined.push('/');
        }
        url.set_path(&joined);
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    url.set_query(embedded_query);
    pairs.extend(url.query_pairs().into_owned());
    pairs.retain(|(key, _)| !query.contains_key(key));
    pairs.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url)
}

/// `.` and `..`, literal or percent-encoded, which URL parsing would
/// otherwise collapse.
fn is_dot_segment(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "." | ".." | "%2e" | ".%2e" | "%2e." | "%2e%2e"
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use ferry_transport_models::Timeseries;

    use super::*;

    const BASE: &str = "https://api.example.com";

    fn client() -> Arc<Client> {
        Arc::new(Client::new(None, &BTreeMap::new()).unwrap())
    }

    fn request(endpoint: &str) -> Request {
        Request {
            endpoint: endpoint.to_string(),
            table: Some("products".to_string()),
            ..Request::default()
        }
    }

    fn candles() -> Request {
        Request {
            endpoint: "/candles".to_string(),
            query: BTreeMap::from([("granularity".to_string(), "3600".to_string())]),
            timeseries: Some(Timeseries {
                start_name: "start".to_string(),
                end_name: "end".to_string(),
                start: Utc.with_ymd_and_hms(2022, 5, 10, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2022, 5, 11, 0, 0, 0).unwrap(),
                period_secs: 18_000,
                layout: ferry_transport_models::DEFAULT_LAYOUT.to_string(),
            }),
            table: Some("candles".to_string()),
            rate_limit: Some(RateLimitConfig {
                period_ms: 1000,
                burst: 5,
            }),
            ..Request::default()
        }
    }

    #[test]
    fn flattens_plain_request_to_single_url_without_query() {
        let flat = flatten(&request("/products"), BASE, &client(), None).unwrap();

        assert_eq!(
            flat.fetch_config.url.as_str(),
            "https://api.example.com/products"
        );
        assert_eq!(flat.fetch_config.method, Method::GET);
        assert_eq!(flat.table.as_deref(), Some("products"));
        assert!(flat.fetch_config.rate_limiter.is_unlimited());
    }

    #[test]
    fn flatten_timeseries_without_series_yields_one_unit() {
        let flat = flatten_timeseries(&request("/products"), BASE, &client(), None).unwrap();
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn joins_onto_base_path() {
        let flat = flatten(
            &request("products/"),
            "https://api.example.com/v1/",
            &client(),
            None,
        )
        .unwrap();
        assert_eq!(
            flat.fetch_config.url.as_str(),
            "https://api.example.com/v1/products/"
        );
    }

    #[test]
    fn request_query_overrides_embedded_parameters() {
        let mut req = request("/products?limit=10&sort=asc");
        req.query = BTreeMap::from([("limit".to_string(), "50".to_string())]);

        let flat = flatten(&req, BASE, &client(), None).unwrap();

        assert_eq!(
            flat.fetch_config.url.as_str(),
            "https://api.example.com/products?sort=asc&limit=50"
        );
    }

    #[test]
    fn rejects_dot_segments() {
        let err = flatten(&request("/a/../admin"), BASE, &client(), None).unwrap_err();
        assert!(
            matches!(err, TransportError::MalformedRequest { ref endpoint, .. } if endpoint == "/a/../admin")
        );
    }

    #[test]
    fn rejects_encoded_dot_segments() {
        let err = flatten(&request("/a/%2e%2E/admin"), BASE, &client(), None).unwrap_err();
        assert!(matches!(err, TransportError::MalformedRequest { .. }));
        assert!(flatten(&request("/a/%2e/admin"), BASE, &client(), None).is_err());
    }

    #[test]
    fn keeps_existing_percent_escapes() {
        let flat = flatten(&request("/search/hello%20world"), BASE, &client(), None).unwrap();
        assert_eq!(
            flat.fetch_config.url.as_str(),
            "https://api.example.com/search/hello%20world"
        );
    }

    #[test]
    fn escapes_unencoded_characters_once() {
        let flat = flatten(&request("/search/hello world"), BASE, &client(), None).unwrap();
        assert_eq!(
            flat.fetch_config.url.as_str(),
            "https://api.example.com/search/hello%20world"
        );
    }

    #[test]
    fn rejects_relative_base() {
        let err = flatten(&request("/products"), "api.example.com", &client(), None).unwrap_err();
        assert!(matches!(err, TransportError::MalformedRequest { .. }));
    }

    #[test]
    fn one_unit_per_chunk_with_formatted_bounds() {
        let flat = flatten_timeseries(&candles(), BASE, &client(), None).unwrap();

        assert_eq!(flat.len(), 5);
        assert_eq!(
            flat[0].fetch_config.url.as_str(),
            "https://api.example.com/candles?end=2022-05-10T05%3A00%3A00Z&granularity=3600&start=2022-05-10T00%3A00%3A00Z"
        );
        assert_eq!(
            flat[4].fetch_config.url.as_str(),
            "https://api.example.com/candles?end=2022-05-11T00%3A00%3A00Z&granularity=3600&start=2022-05-10T20%3A00%3A00Z"
        );
        assert!(flat.iter().all(|f| f.table.as_deref() == Some("candles")));
    }

    #[test]
    fn chunks_share_one_rate_limiter() {
        let flat = flatten_timeseries(&candles(), BASE, &client(), None).unwrap();
        let first = &flat[0].fetch_config.rate_limiter;
        assert!(
            flat.iter()
                .all(|f| Arc::ptr_eq(first, &f.fetch_config.rate_limiter))
        );
    }

    #[test]
    fn separate_requests_get_separate_limiters() {
        let c = client();
        let a = flatten_timeseries(&candles(), BASE, &c, None).unwrap();
        let b = flatten_timeseries(&candles(), BASE, &c, None).unwrap();
        assert!(!Arc::ptr_eq(
            &a[0].fetch_config.rate_limiter,
            &b[0].fetch_config.rate_limiter
        ));
    }

    #[test]
    fn timeseries_without_rate_limit_is_rejected() {
        let mut req = candles();
        req.rate_limit = None;

        let err = flatten_timeseries(&req, BASE, &client(), None).unwrap_err();

        assert!(matches!(err, TransportError::MissingRateLimit { .. }));
    }

    #[test]
    fn timeseries_falls_back_to_default_rate_limit() {
        let mut req = candles();
        req.rate_limit = None;
        let default = RateLimitConfig {
            period_ms: 200,
            burst: 1,
        };

        let flat = flatten_timeseries(&req, BASE, &client(), Some(&default)).unwrap();

        assert!(!flat[0].fetch_config.rate_limiter.is_unlimited());
    }

    #[test]
    fn unusable_layout_is_a_configuration_error() {
        let mut req = candles();
        if let Some(timeseries) = req.timeseries.as_mut() {
            timeseries.layout = "%Q".to_string();
        }

        let err = flatten_timeseries(&req, BASE, &client(), None).unwrap_err();

        assert!(matches!(err, TransportError::Config { .. }));
    }

    #[test]
    fn http_methods_map_to_reqwest() {
        let mut req = request("/products");
        req.method = HttpMethod::Post;
        let flat = flatten(&req, BASE, &client(), None).unwrap();
        assert_eq!(flat.fetch_config.method, Method::POST);
    }
}
