use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use url::Url;

use crate::error::DispatchError;

pub(crate) const MAX_ERROR_BODY_LEN: usize = 512;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Resolves a request target against an optional base url.
///
/// Only `http` and `https` targets are accepted. The returned url is the
/// parsed, normalized form used for origin identity and dedupe keys.
pub(crate) fn resolve_target(base_url: Option<&Url>, target: &str) -> Result<Url, DispatchError> {
    let invalid = || DispatchError::InvalidUri {
        uri: target.to_owned(),
    };
    let parsed = match Url::parse(target) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base_url.ok_or_else(invalid)?;
            base.join(target).map_err(|_| invalid())?
        }
        Err(_) => return Err(invalid()),
    };
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    Ok(parsed)
}

/// Scheme, host and port with default ports spelled out.
pub(crate) fn origin_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port_or_known_default() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    }
}

pub(crate) fn redact_uri_for_logs(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, DispatchError> {
    name.parse()
        .map_err(|source| DispatchError::InvalidHeaderName {
            name: name.to_owned(),
            source: std::sync::Arc::new(source),
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, DispatchError> {
    value
        .parse()
        .map_err(|source| DispatchError::InvalidHeaderValue {
            name: name.to_owned(),
            source: std::sync::Arc::new(source),
        })
}

/// Reads `Retry-After` as either delta-seconds or an HTTP date.
///
/// Dates in the past and negative delta-seconds both yield zero, i.e. retry
/// immediately. Anything else is ignored so the caller falls back to
/// computed backoff.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<i64>() {
        return Some(Duration::from_secs(u64::try_from(seconds).unwrap_or(0)));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
