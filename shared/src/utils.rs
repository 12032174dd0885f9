//! Utility functions for the webhook dispatch service
//!
//! Timestamp helpers, destination URL validation, queue-name slugification,
//! retry backoff, `Retry-After` parsing and callback signing. These are used
//! by both the command surface and the worker pool.

use anyhow::Result;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Validate a destination URL for outbound dispatch.
///
/// Ensures the URL is syntactically valid, uses http or https, has a host,
/// carries no embedded credentials, and does not point at a private or
/// otherwise non-routable address. Hostnames are checked literally; the
/// resolver is not consulted here.
pub fn validate_destination_url(url_str: &str) -> crate::Result<()> {
    let parsed = Url::parse(url_str).map_err(|e| {
        crate::DispatchError::validation("url", format!("Invalid URL '{}': {}", url_str, e))
    })?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(crate::DispatchError::validation(
            "url",
            format!("URL '{}' must use http:// or https:// scheme", url_str),
        )
        .into());
    }

    let host = parsed.host_str().ok_or_else(|| {
        crate::DispatchError::validation("url", format!("URL '{}' must have a valid host", url_str))
    })?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(crate::DispatchError::validation(
            "url",
            format!("URL '{}' must not contain embedded credentials", url_str),
        )
        .into());
    }

    if is_blocked_host(host) {
        return Err(crate::DispatchError::validation(
            "url",
            format!("URL '{}' points at a private or local address", url_str),
        )
        .into());
    }

    Ok(())
}

/// Whether a host literal is on the private-address blocklist.
fn is_blocked_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost" || lowered.ends_with(".localhost") || lowered.ends_with(".local") {
        return true;
    }

    // IPv6 literals in URLs come bracketed.
    let bare = lowered.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT, 100.64.0.0/10
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Slugify a display name into a queue/endpoint slug.
///
/// Lowercases, maps runs of non-alphanumeric characters to single hyphens,
/// and trims leading/trailing hyphens: "Stripe Hooks" becomes "stripe-hooks".
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Calculate the retry delay for a failed attempt: exponential backoff with
/// jitter, `min(cap, base * 2^(attempt-1)) + U(0, base)`.
///
/// `attempt` is the 1-based attempt that just failed.
pub fn retry_backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);
    let jitter = rand::rng().random_range(0..base_ms.max(1));
    delay + jitter
}

/// Parse a `Retry-After` header value into a delay in milliseconds relative
/// to `now_ms`.
///
/// Accepts both forms: a delta in seconds, or an HTTP-date (RFC 2822). A
/// date in the past yields zero rather than a negative delay.
pub fn parse_retry_after(value: &str, now_ms: i64) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Some(seconds.max(0) * 1000);
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(trimmed) {
        return Some((date.timestamp_millis() - now_ms).max(0));
    }
    None
}

/// Sign a callback payload with the tenant's webhook secret.
///
/// Returns the `X-Signature` header value: `sha256=<lower-hex HMAC-SHA256>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Generate a random alphanumeric token, used for ping tokens and webhook
/// secrets.
pub fn generate_token(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Truncate string to maximum length with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let mut cut = max_len - 3;
        // Back off to a char boundary so multi-byte input can't panic.
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration_ms: f64) -> String {
    if duration_ms < 1000.0 {
        format!("{:.1}ms", duration_ms)
    } else if duration_ms < 60_000.0 {
        format!("{:.1}s", duration_ms / 1000.0)
    } else {
        format!("{:.1}m", duration_ms / 60_000.0)
    }
}
