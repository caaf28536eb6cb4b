//! Validation of endpoint configuration before it reaches the store.
//!
//! Validates:
//! - Delivery URLs (absolute, http/https, has a host, bounded length)
//! - Subscribed events against the catalog
//! - Retry policy, timeout and custom header bounds

use std::collections::{BTreeMap, BTreeSet};

use reqwest::header::{HeaderName, HeaderValue};

use crate::db::models::endpoints::RetryPolicy;
use crate::errors::{Error, Result};
use crate::webhooks::EventName;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_TIMEOUT_MS: u64 = 60_000;
pub const MAX_RETRIES: u32 = 10;
pub const MAX_CUSTOM_HEADERS: usize = 20;

/// Headers the engine sets itself; tenants cannot override them.
const RESERVED_HEADERS: &[&str] = &["content-type", "content-length", "host", "transfer-encoding"];
const RESERVED_HEADER_PREFIX: &str = "x-webhook-";

fn bad_request(message: impl Into<String>) -> Error {
    Error::BadRequest { message: message.into() }
}

/// Validate a delivery URL, returning it normalised.
///
/// `allow_http` permits plain `http://` targets (useful for development and internal receivers);
/// otherwise only `https://` is accepted.
pub fn validate_url(url: &str, allow_http: bool) -> Result<String> {
    if url.len() > MAX_URL_LENGTH {
        return Err(bad_request(format!(
            "Webhook URL must be at most {} characters",
            MAX_URL_LENGTH
        )));
    }

    let parsed = url::Url::parse(url).map_err(|e| bad_request(format!("Invalid webhook URL: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => return Err(bad_request("Webhook URL must use HTTPS")),
        scheme => return Err(bad_request(format!("Unsupported URL scheme: {scheme}"))),
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(bad_request("Webhook URL must have a host"));
    }

    Ok(parsed.to_string())
}

/// Parse and validate a list of subscribed event names.
pub fn parse_events(events: &[String]) -> Result<BTreeSet<EventName>> {
    if events.is_empty() {
        return Err(bad_request("At least one event type must be subscribed"));
    }

    events
        .iter()
        .map(|event| {
            event.parse::<EventName>().map_err(|_| {
                bad_request(format!(
                    "Invalid event type: {}. Valid types are: {}",
                    event,
                    EventName::catalog()
                ))
            })
        })
        .collect()
}

pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.max_retries > MAX_RETRIES {
        return Err(bad_request(format!("max_retries must be at most {}", MAX_RETRIES)));
    }
    if policy.initial_delay_ms == 0 {
        return Err(bad_request("initial_delay_ms must be at least 1"));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(bad_request("backoff_multiplier must be a finite number >= 1.0"));
    }
    Ok(())
}

pub fn validate_timeout(timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
        return Err(bad_request(format!(
            "timeout_ms must be between 1 and {}",
            MAX_TIMEOUT_MS
        )));
    }
    Ok(())
}

pub fn validate_headers(headers: &BTreeMap<String, String>) -> Result<()> {
    if headers.len() > MAX_CUSTOM_HEADERS {
        return Err(bad_request(format!(
            "At most {} custom headers are allowed",
            MAX_CUSTOM_HEADERS
        )));
    }

    let mut seen = BTreeSet::new();
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| bad_request(format!("Invalid header name: {name}")))?;
        let lower = header_name.as_str();
        if RESERVED_HEADERS.contains(&lower) || lower.starts_with(RESERVED_HEADER_PREFIX) {
            return Err(bad_request(format!("Header {name} is set by the delivery engine")));
        }
        // Header names are case-insensitive on the wire
        if !seen.insert(lower.to_string()) {
            return Err(bad_request(format!("Header {name} is given more than once")));
        }
        HeaderValue::from_str(value).map_err(|_| bad_request(format!("Invalid value for header {name}")))?;
    }
    Ok(())
}
