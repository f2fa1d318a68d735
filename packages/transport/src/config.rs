//! Loading and validating transport configuration files.

use std::path::Path;

use ferry_transport_models::{Config, RateLimitConfig, Request};
use ferry_web::Url;

use crate::TransportError;

/// Parses a [`Config`] from a TOML string and validates it.
///
/// # Errors
///
/// Returns [`TransportError::Toml`] if the TOML is malformed or missing
/// required fields, and [`TransportError::Config`] if it fails validation.
pub fn parse_config(toml_str: &str) -> Result<Config, TransportError> {
    let config: Config = toml::de::from_str(toml_str)?;
    validate(&config)?;
    Ok(config)
}

/// Reads and parses the configuration file at `path`.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the file cannot be read, otherwise
/// whatever [`parse_config`] returns.
pub fn load_config(path: &Path) -> Result<Config, TransportError> {
    let data = std::fs::read_to_string(path)?;
    parse_config(&data)
}

/// Checks the invariants serde cannot express.
///
/// # Errors
///
/// Returns [`TransportError::Config`] describing the first problem found.
pub fn validate(config: &Config) -> Result<(), TransportError> {
    let invalid = |message: String| TransportError::Config { message };

    let url = Url::parse(&config.url).map_err(|e| invalid(format!("url {}: {e}", config.url)))?;
    if url.cannot_be_a_base() {
        return Err(invalid(format!("url {} is not an absolute base URL", config.url)));
    }
    if config.requests.is_empty() {
        return Err(invalid("no requests configured".to_string()));
    }
    if config.workers == 0 {
        return Err(invalid("workers must be at least 1".to_string()));
    }
    if let Some(rate_limit) = &config.rate_limit {
        validate_rate_limit(rate_limit, "default")?;
    }

    config.requests.iter().try_for_each(validate_request)
}

fn validate_request(request: &Request) -> Result<(), TransportError> {
    let invalid = |message: String| TransportError::Config {
        message: format!("request {}: {message}", request.endpoint),
    };

    if let Some(rate_limit) = &request.rate_limit {
        validate_rate_limit(rate_limit, &request.endpoint)?;
    }
    if let Some(timeseries) = &request.timeseries {
        if timeseries.period().is_none() {
            return Err(invalid(format!(
                "timeseries period_secs {} must be positive and representable as a duration",
                timeseries.period_secs
            )));
        }
        if timeseries.start >= timeseries.end {
            return Err(invalid(format!(
                "timeseries start {} is not before end {}",
                timeseries.start, timeseries.end
            )));
        }
    }
    Ok(())
}

fn validate_rate_limit(rate_limit: &RateLimitConfig, owner: &str) -> Result<(), TransportError> {
    if rate_limit.period_ms == 0 || rate_limit.burst == 0 {
        return Err(TransportError::Config {
            message: format!("{owner} rate_limit needs a positive period_ms and burst"),
        });
    }
    Ok(())
}
