//! Field sanitization and token rules shared by the tick codecs.
//!
//! Sanitization clamps values into their documented bounds; validation
//! rejects shapes that clamping cannot repair. The bounds mirror the wire
//! contract: prices live in `[0.01, 1_000_000)` and timestamps within the
//! trailing 24 hours.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Smallest price a sanitized tick may carry.
pub const MIN_PRICE: f64 = 0.01;
/// Upper bound (exclusive for validation, inclusive clamp target).
pub const MAX_PRICE: f64 = 1_000_000.0;
/// Oldest acceptable tick age.
pub const MAX_TICK_AGE_HOURS: i64 = 24;

/// `[A-Z0-9]{1,10}`
pub fn is_valid_ticker(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 10
        && value
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// `[A-Za-z0-9_-]{1,100}`
pub fn is_valid_source(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 100
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `[a-z0-9_-]{1,50}`
pub fn is_valid_sector(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 50
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Strips control characters and surrounding whitespace.
pub fn sanitize_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Clamps a price into `[MIN_PRICE, MAX_PRICE]`. Non-finite input collapses
/// to the minimum.
pub fn sanitize_price(price: f64) -> f64 {
    if !price.is_finite() || price <= 0.0 {
        return MIN_PRICE;
    }
    price.min(MAX_PRICE)
}

/// Clamps a millisecond timestamp to `now` when it is in the future or older
/// than 24 hours.
pub fn sanitize_timestamp_ms(timestamp_ms: i64, now: DateTime<Utc>) -> i64 {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(ts) if timestamp_in_range(ts, now) => timestamp_ms,
        _ => now.timestamp_millis(),
    }
}

/// True when `ts` lies within the trailing 24 hours, inclusive of `now`.
pub fn timestamp_in_range(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    ts <= now && ts > now - Duration::hours(MAX_TICK_AGE_HOURS)
}
