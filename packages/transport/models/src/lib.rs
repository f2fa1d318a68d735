#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Declarative transport configuration.
//!
//! A [`Config`] names the API to read from, the storages to write to, and
//! the [`Request`]s to run. A request with a [`Timeseries`] is split into
//! one fetch per time chunk.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default number of concurrent fetches.
pub const DEFAULT_WORKERS: usize = 4;

/// Default chunk bound layout (RFC 3339 in UTC, second precision).
pub const DEFAULT_LAYOUT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// HTTP method of a request.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    #[default]
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// `HEAD`
    Head,
}

/// Top-level transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL every request endpoint is joined onto.
    pub url: String,
    /// Storages every fetched batch is written to.
    #[serde(default)]
    pub connection_strings: Vec<String>,
    /// Truncate every request table before writing.
    #[serde(default)]
    pub truncate: bool,
    /// Maximum number of concurrent fetches.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// `User-Agent` sent with every request.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Rate limit for requests that do not declare their own.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Requests to run.
    #[serde(default)]
    pub requests: Vec<Request>,
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// One declarative API request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Path fragment joined onto the base URL. May carry its own query
    /// string.
    pub endpoint: String,
    /// Query parameters; these override same-named parameters embedded in
    /// the endpoint.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Splits the request into one fetch per time chunk.
    #[serde(default)]
    pub timeseries: Option<Timeseries>,
    /// Destination table. Requests without one are fetched but not stored.
    #[serde(default)]
    pub table: Option<String>,
    /// Rate limit shared by every fetch derived from this request.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Token-bucket settings: `burst` immediate calls, then one per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Replenishment interval in milliseconds.
    pub period_ms: u64,
    /// Bucket capacity.
    pub burst: u32,
}

impl RateLimitConfig {
    /// Replenishment interval.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// A time range fetched in fixed-size chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeseries {
    /// Query parameter receiving each chunk's start.
    pub start_name: String,
    /// Query parameter receiving each chunk's end.
    pub end_name: String,
    /// Start of the range (inclusive).
    pub start: DateTime<Utc>,
    /// End of the range (exclusive).
    pub end: DateTime<Utc>,
    /// Chunk length in seconds.
    pub period_secs: u64,
    /// `strftime` pattern the chunk bounds are formatted with.
    #[serde(default = "default_layout")]
    pub layout: String,
}

fn default_layout() -> String {
    DEFAULT_LAYOUT.to_string()
}

impl Timeseries {
    /// Chunk length, or `None` if `period_secs` is zero or too large for a
    /// [`TimeDelta`].
    #[must_use]
    pub fn period(&self) -> Option<TimeDelta> {
        i64::try_from(self.period_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .filter(|step| *step > TimeDelta::zero())
    }

    /// Partitions `[start, end)` into consecutive chunks of `period_secs`,
    /// the last one clipped to `end`.
    ///
    /// Chunks never overlap and leave no gaps. An empty or inverted range,
    /// or a zero period, yields no chunks.
    #[must_use]
    pub fn chunks(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let Some(step) = self.period() else {
            return Vec::new();
        };

        let mut chunks = Vec::new();
        let mut chunk_start = self.start;
        while chunk_start < self.end {
            let chunk_end = chunk_start
                .checked_add_signed(step)
                .map_or(self.end, |next| next.min(self.end));
            chunks.push((chunk_start, chunk_end));
            chunk_start = chunk_end;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 5, 10, 0, 0, 0).unwrap() + TimeDelta::hours(hour.into())
    }

    fn series(start: DateTime<Utc>, end: DateTime<Utc>, period_secs: u64) -> Timeseries {
        Timeseries {
            start_name: "start".to_string(),
            end_name: "end".to_string(),
            start,
            end,
            period_secs,
            layout: DEFAULT_LAYOUT.to_string(),
        }
    }

    #[test]
    fn chunks_cover_range_without_gaps_and_clip_last() {
        let chunks = series(at(0), at(24), 5 * 3600).chunks();

        assert_eq!(
            chunks,
            vec![
                (at(0), at(5)),
                (at(5), at(10)),
                (at(10), at(15)),
                (at(15), at(20)),
                (at(20), at(24)),
            ]
        );
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        let chunks = series(at(0), at(4), 3600).chunks();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last(), Some(&(at(3), at(4))));
    }

    #[test]
    fn empty_or_inverted_range_yields_no_chunks() {
        assert!(series(at(2), at(2), 60).chunks().is_empty());
        assert!(series(at(3), at(2), 60).chunks().is_empty());
        assert!(series(at(0), at(2), 0).chunks().is_empty());
    }

    #[test]
    fn period_rejects_values_beyond_time_delta() {
        assert_eq!(series(at(0), at(1), 60).period(), Some(TimeDelta::minutes(1)));
        assert_eq!(series(at(0), at(1), 0).period(), None);
        assert_eq!(series(at(0), at(1), 10_000_000_000_000_000).period(), None);
        assert_eq!(series(at(0), at(1), u64::MAX).period(), None);
    }

    #[test]
    fn method_parses_uppercase() {
        assert_eq!("POST".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!(HttpMethod::default().to_string(), "GET");
    }
}
