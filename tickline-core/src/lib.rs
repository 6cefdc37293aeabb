//! Fundamental data types shared across the entire workspace.
//!
//! Every record that crosses a stage boundary lives here: the untrusted
//! [`RawTick`] produced by feed ingestors, the canonical [`NormalizedTick`]
//! flowing through the pipeline, the [`Anomaly`] emitted by the detector and
//! the per-ticker [`LatestQuote`] materialized for readers. Each type carries
//! its own stream-field codec (`to_fields`/`from_fields`) so producers and
//! consumers agree on the wire representation byte for byte.

pub mod shutdown;
pub mod validation;

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use shutdown::ShutdownSignal;
use validation::{
    is_valid_sector, is_valid_source, is_valid_ticker, sanitize_price, sanitize_timestamp_ms,
    sanitize_token, timestamp_in_range, MAX_PRICE,
};

/// Stream carrying validated raw feed observations.
pub const RAW_STREAM: &str = "raw:events";
/// Stream carrying canonicalized ticks.
pub const NORMALIZED_STREAM: &str = "normalized:events";
/// Pub/sub channel on which every normalized tick is broadcast.
pub const QUOTES_CHANNEL: &str = "quotes:pubsub";
/// Stream carrying detected anomalies.
pub const ANOMALY_STREAM: &str = "anomalies:stream";

/// Key of the latest-quote hash for a ticker.
pub fn latest_quote_key(ticker: &str) -> String {
    format!("quotes:latest:{ticker}")
}

/// Key of the per-ticker ordered anomaly index.
pub fn anomaly_index_key(ticker: &str) -> String {
    format!("anomalies:{ticker}")
}

/// Errors produced while decoding or validating a tick record.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TickError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl TickError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

fn field<'m>(map: &'m HashMap<String, String>, name: &'static str) -> Result<&'m str, TickError> {
    map.get(name)
        .map(String::as_str)
        .ok_or(TickError::MissingField(name))
}

/// Accepts a JSON number or a numeric string; feeds disagree on which.
fn de_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => text
            .trim()
            .parse()
            .map_err(|err| serde::de::Error::custom(format!("price: {err}"))),
    }
}

/// Accepts either epoch milliseconds or an RFC 3339 string.
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        Repr::Text(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| serde::de::Error::custom(format!("timestamp: {err}"))),
    }
}

/// An untrusted price observation as decoded from a feed payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawTick {
    pub source: String,
    pub symbol: String,
    #[serde(deserialize_with = "de_price")]
    pub price: f64,
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl RawTick {
    /// Clamps fields into their documented bounds without rejecting.
    pub fn sanitize(&mut self) {
        self.sanitize_at(Utc::now());
    }

    /// Variant of [`RawTick::sanitize`] with an explicit clock.
    pub fn sanitize_at(&mut self, now: DateTime<Utc>) {
        self.source = sanitize_token(&self.source);
        self.symbol = sanitize_token(&self.symbol);
        self.price = sanitize_price(self.price);
        if self.timestamp > now || self.timestamp < now - chrono::Duration::hours(24) {
            self.timestamp = now;
        }
    }

    /// Checks the token and range rules that sanitization cannot repair.
    pub fn validate(&self) -> Result<(), TickError> {
        self.validate_at(Utc::now())
    }

    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), TickError> {
        if !is_valid_source(&self.source) {
            return Err(TickError::invalid(
                "source",
                "must be 1-100 characters of [A-Za-z0-9_-]",
            ));
        }
        if !is_valid_ticker(&self.symbol) {
            return Err(TickError::invalid(
                "symbol",
                "must be 1-10 characters of [A-Z0-9]",
            ));
        }
        if !(self.price > 0.0 && self.price < MAX_PRICE) {
            return Err(TickError::invalid(
                "price",
                format!("{} outside (0, 1000000)", self.price),
            ));
        }
        if !timestamp_in_range(self.timestamp, now) {
            return Err(TickError::invalid(
                "timestamp",
                "must be within the last 24 hours and not in the future",
            ));
        }
        Ok(())
    }

    /// Wire representation for `raw:events`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("source", self.source.clone()),
            ("symbol", self.symbol.clone()),
            ("price", format!("{:.8}", self.price)),
            (
                "timestamp",
                self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ),
        ]
    }

    /// Decodes, sanitizes and validates a `raw:events` entry.
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, TickError> {
        let source = field(map, "source")?.to_string();
        let symbol = field(map, "symbol")?.to_string();
        let price: f64 = field(map, "price")?
            .trim()
            .parse()
            .map_err(|err| TickError::invalid("price", format!("{err}")))?;
        let raw_ts = field(map, "timestamp")?.trim();
        let timestamp = match DateTime::parse_from_rfc3339(raw_ts) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                let ms: i64 = raw_ts
                    .parse()
                    .map_err(|_| TickError::invalid("timestamp", raw_ts.to_string()))?;
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| TickError::invalid("timestamp", format!("{ms} out of range")))?
            }
        };

        let mut tick = Self {
            source,
            symbol,
            price,
            timestamp,
        };
        tick.sanitize();
        tick.validate()?;
        Ok(tick)
    }
}

/// The canonical in-pipeline tick after symbol and unit canonicalization.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NormalizedTick {
    pub ticker: String,
    pub price: f64,
    /// Milliseconds since the Unix epoch, UTC.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    pub sector: String,
}

impl NormalizedTick {
    pub fn sanitize(&mut self) {
        self.sanitize_at(Utc::now());
    }

    pub fn sanitize_at(&mut self, now: DateTime<Utc>) {
        self.ticker = sanitize_token(&self.ticker);
        self.price = sanitize_price(self.price);
        self.timestamp_ms = sanitize_timestamp_ms(self.timestamp_ms, now);
        self.sector = sanitize_token(&self.sector).to_lowercase();
    }

    pub fn validate(&self) -> Result<(), TickError> {
        if !is_valid_ticker(&self.ticker) {
            return Err(TickError::invalid(
                "ticker",
                "must be 1-10 characters of [A-Z0-9]",
            ));
        }
        if !(self.price > 0.0 && self.price < MAX_PRICE) {
            return Err(TickError::invalid(
                "price",
                format!("{} outside (0, 1000000)", self.price),
            ));
        }
        if !is_valid_sector(&self.sector) {
            return Err(TickError::invalid(
                "sector",
                "must be 1-50 characters of [a-z0-9_-]",
            ));
        }
        Ok(())
    }

    /// Wire representation for `normalized:events`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ticker", self.ticker.clone()),
            ("price", format!("{:.8}", self.price)),
            ("ts_ms", self.timestamp_ms.to_string()),
            ("sector", self.sector.clone()),
        ]
    }

    /// Decodes, sanitizes and validates a `normalized:events` entry.
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, TickError> {
        let ticker = field(map, "ticker")?.to_string();
        let price: f64 = field(map, "price")?
            .trim()
            .parse()
            .map_err(|err| TickError::invalid("price", format!("{err}")))?;
        let timestamp_ms: i64 = field(map, "ts_ms")?
            .trim()
            .parse()
            .map_err(|err| TickError::invalid("ts_ms", format!("{err}")))?;
        let sector = map
            .get("sector")
            .map(String::as_str)
            .unwrap_or("unknown")
            .to_string();

        let mut tick = Self {
            ticker,
            price,
            timestamp_ms,
            sector,
        };
        tick.sanitize();
        tick.validate()?;
        Ok(tick)
    }

    /// JSON payload broadcast on `quotes:pubsub`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, TickError> {
        let mut tick: Self = serde_json::from_str(data)
            .map_err(|err| TickError::invalid("payload", format!("{err}")))?;
        tick.sanitize();
        tick.validate()?;
        Ok(tick)
    }
}

/// Per-ticker most-recent state stored under `quotes:latest:<ticker>`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LatestQuote {
    pub ticker: String,
    pub price: f64,
    pub timestamp_ms: i64,
}

impl LatestQuote {
    /// Hash fields written by the publisher.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("price", format!("{:.8}", self.price)),
            ("ts_ms", self.timestamp_ms.to_string()),
        ]
    }
}

impl From<&NormalizedTick> for LatestQuote {
    fn from(tick: &NormalizedTick) -> Self {
        Self {
            ticker: tick.ticker.clone(),
            price: tick.price,
            timestamp_ms: tick.timestamp_ms,
        }
    }
}

/// A detected price outlier.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Anomaly {
    pub ticker: String,
    pub price: f64,
    pub z_score: f64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

impl Anomaly {
    pub fn sanitize(&mut self) {
        self.ticker = sanitize_token(&self.ticker);
        self.price = sanitize_price(self.price);
        self.timestamp_ms = sanitize_timestamp_ms(self.timestamp_ms, Utc::now());
        self.z_score = self.z_score.clamp(0.0, 100.0);
    }

    /// Wire representation for `anomalies:stream`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ticker", self.ticker.clone()),
            ("price", format!("{:.8}", self.price)),
            ("z", self.z_score.to_string()),
            ("ts_ms", self.timestamp_ms.to_string()),
        ]
    }

    /// Deterministic JSON used as the sorted-set member, so byte-identical
    /// replays dedupe naturally.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, TickError> {
        let mut anomaly: Self = serde_json::from_str(data)
            .map_err(|err| TickError::invalid("payload", format!("{err}")))?;
        anomaly.sanitize();
        Ok(anomaly)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn fields(pairs: Vec<(&'static str, String)>) -> HashMap<String, String> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn recent_raw() -> RawTick {
        RawTick {
            source: "feedA".into(),
            symbol: "BTCUSD".into(),
            price: 30_000.0,
            timestamp: Utc::now() - Duration::minutes(5),
        }
    }

    #[test]
    fn raw_tick_field_round_trip_is_identity() {
        let tick = recent_raw();
        let decoded = RawTick::from_fields(&fields(tick.to_fields())).unwrap();
        assert_eq!(decoded.source, tick.source);
        assert_eq!(decoded.symbol, tick.symbol);
        assert!((decoded.price - tick.price).abs() < 1e-8);
        // RFC 3339 nanosecond precision preserves chrono timestamps exactly.
        assert_eq!(decoded.timestamp, tick.timestamp);
    }

    #[test]
    fn raw_tick_accepts_millisecond_timestamps() {
        let now_ms = Utc::now().timestamp_millis();
        let map = fields(vec![
            ("source", "feedA".into()),
            ("symbol", "ETHUSD".into()),
            ("price", "1999.5".into()),
            ("timestamp", now_ms.to_string()),
        ]);
        let tick = RawTick::from_fields(&map).unwrap();
        assert_eq!(tick.timestamp.timestamp_millis(), now_ms);
    }

    #[test]
    fn raw_tick_rejects_unknown_symbol_shape() {
        let mut tick = recent_raw();
        tick.symbol = "btc-usd".into();
        assert!(matches!(
            tick.validate(),
            Err(TickError::InvalidField { field: "symbol", .. })
        ));
    }

    #[test]
    fn raw_tick_missing_field_is_reported() {
        let mut map = fields(recent_raw().to_fields());
        map.remove("price");
        assert_eq!(
            RawTick::from_fields(&map),
            Err(TickError::MissingField("price"))
        );
    }

    #[test]
    fn sanitize_clamps_price_and_future_timestamp() {
        let now = Utc::now();
        let mut tick = recent_raw();
        tick.price = -5.0;
        tick.timestamp = now + Duration::hours(2);
        tick.sanitize_at(now);
        assert_eq!(tick.price, 0.01);
        assert_eq!(tick.timestamp, now);
    }

    #[test]
    fn sanitize_clamps_stale_timestamp_to_now() {
        let now = Utc::now();
        let mut tick = recent_raw();
        tick.timestamp = now - Duration::hours(25);
        tick.sanitize_at(now);
        assert_eq!(tick.timestamp, now);
    }

    #[test]
    fn raw_tick_decodes_string_and_numeric_json_payloads() {
        let ts = Utc::now().to_rfc3339();
        let payload = format!(
            r#"{{"source":"feedA","symbol":"BTCUSD","price":"30000.00","timestamp":"{ts}"}}"#
        );
        let tick: RawTick = serde_json::from_str(&payload).unwrap();
        assert_eq!(tick.price, 30_000.0);

        let ms = Utc::now().timestamp_millis();
        let payload =
            format!(r#"{{"source":"feedA","symbol":"BTCUSD","price":42.5,"timestamp":{ms}}}"#);
        let tick: RawTick = serde_json::from_str(&payload).unwrap();
        assert_eq!(tick.timestamp.timestamp_millis(), ms);
    }

    #[test]
    fn normalized_tick_json_round_trip_is_identity() {
        let tick = NormalizedTick {
            ticker: "BTCUSD".into(),
            price: 30_000.0,
            timestamp_ms: Utc::now().timestamp_millis(),
            sector: "crypto".into(),
        };
        let json = tick.to_json().unwrap();
        assert_eq!(NormalizedTick::from_json(&json).unwrap(), tick);
    }

    #[test]
    fn normalized_tick_json_uses_contract_field_names() {
        let tick = NormalizedTick {
            ticker: "BTCUSD".into(),
            price: 1.5,
            timestamp_ms: 1_700_000_000_000,
            sector: "crypto".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&tick.to_json().unwrap()).unwrap();
        assert!(value.get("timestamp").is_some());
        assert!(value.get("ts_ms").is_none());
    }

    #[test]
    fn normalized_tick_defaults_missing_sector_to_unknown() {
        let map = fields(vec![
            ("ticker", "BTCUSD".into()),
            ("price", "100.00000000".into()),
            ("ts_ms", Utc::now().timestamp_millis().to_string()),
        ]);
        let tick = NormalizedTick::from_fields(&map).unwrap();
        assert_eq!(tick.sector, "unknown");
    }

    #[test]
    fn ts_conversion_matches_known_epoch() {
        let dt = Utc.with_ymd_and_hms(2025, 7, 10, 12, 0, 0).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_752_148_800_000);
    }

    #[test]
    fn anomaly_sanitize_clamps_z_score() {
        let mut anomaly = Anomaly {
            ticker: "X1".into(),
            price: 100.0,
            z_score: 250.0,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        anomaly.sanitize();
        assert_eq!(anomaly.z_score, 100.0);
        anomaly.z_score = -1.0;
        anomaly.sanitize();
        assert_eq!(anomaly.z_score, 0.0);
    }

    #[test]
    fn anomaly_json_is_deterministic() {
        let anomaly = Anomaly {
            ticker: "X1".into(),
            price: 1000.0,
            z_score: 4.36,
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(anomaly.to_json().unwrap(), anomaly.to_json().unwrap());
        let decoded = Anomaly::from_json(&anomaly.to_json().unwrap()).unwrap();
        assert_eq!(decoded.ticker, anomaly.ticker);
        assert_eq!(decoded.z_score, anomaly.z_score);
    }

    #[test]
    fn latest_quote_fields_match_hash_contract() {
        let tick = NormalizedTick {
            ticker: "BTCUSD".into(),
            price: 30_000.0,
            timestamp_ms: 1_752_148_800_000,
            sector: "crypto".into(),
        };
        let quote = LatestQuote::from(&tick);
        let fields = quote.to_fields();
        assert_eq!(fields[0], ("price", "30000.00000000".to_string()));
        assert_eq!(fields[1], ("ts_ms", "1752148800000".to_string()));
    }
}
