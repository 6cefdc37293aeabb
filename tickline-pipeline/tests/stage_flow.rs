//! Behavior of the pure stage logic chained together: raw entry decode,
//! normalization, latest-state admission and anomaly detection, without a
//! live store.

use std::collections::HashMap;

use chrono::{Duration, Utc};

use tickline_core::{NormalizedTick, RawTick};
use tickline_pipeline::{
    normalize_tick, DetectorConfig, DetectorState, MonotonicGuard, SymbolTable,
};

fn tables() -> SymbolTable {
    let symbols = [("BTCUSD", "BTCUSD")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let sectors = [("BTCUSD", "crypto")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    SymbolTable::new(symbols, sectors)
}

fn entry(pairs: Vec<(&'static str, String)>) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[test]
fn raw_entry_becomes_an_identical_broadcast_payload() {
    let observed = Utc::now() - Duration::minutes(1);
    let raw = RawTick {
        source: "feedA".into(),
        symbol: "BTCUSD".into(),
        price: 30_000.0,
        timestamp: observed,
    };

    // Ingestor writes raw fields; the normalizer reads them back.
    let decoded = RawTick::from_fields(&entry(raw.to_fields())).unwrap();
    let normalized = normalize_tick(&decoded, &tables()).unwrap();
    assert_eq!(normalized.ticker, "BTCUSD");
    assert_eq!(normalized.sector, "crypto");
    assert_eq!(normalized.timestamp_ms, observed.timestamp_millis());

    // The publisher reads normalized fields and broadcasts JSON; the
    // detector decodes that JSON. Nothing may change along the way.
    let republished = NormalizedTick::from_fields(&entry(normalized.to_fields())).unwrap();
    let payload = republished.to_json().unwrap();
    let received = NormalizedTick::from_json(&payload).unwrap();
    assert_eq!(received, normalized);
}

#[test]
fn unknown_symbols_never_reach_the_normalized_stream() {
    let raw = RawTick {
        source: "feedA".into(),
        symbol: "ZZZ".into(),
        price: 10.0,
        timestamp: Utc::now(),
    };
    let decoded = RawTick::from_fields(&entry(raw.to_fields())).unwrap();
    assert!(normalize_tick(&decoded, &tables()).is_err());
}

#[test]
fn replayed_entries_do_not_regress_latest_state() {
    let mut guard = MonotonicGuard::default();

    // Normal forward progress.
    assert!(guard.admit("BTCUSD", 1_000));
    guard.record("BTCUSD", 1_000);
    assert!(guard.admit("BTCUSD", 2_000));
    guard.record("BTCUSD", 2_000);

    // An at-least-once replay of the first entry must be a no-op.
    assert!(!guard.admit("BTCUSD", 1_000));
    // Replaying the newest entry is idempotent, not rejected.
    assert!(guard.admit("BTCUSD", 2_000));
}

#[test]
fn flat_market_then_spike_raises_one_anomaly() {
    let mut detector = DetectorState::new(DetectorConfig {
        window_size: 20,
        threshold: 3.0,
    });
    let base_ts = Utc::now().timestamp_millis();

    for i in 0..19 {
        let tick = NormalizedTick {
            ticker: "BTCUSD".into(),
            price: 100.0,
            timestamp_ms: base_ts + i,
            sector: "crypto".into(),
        };
        assert!(detector.observe(&tick).is_none());
    }

    let spike = NormalizedTick {
        ticker: "BTCUSD".into(),
        price: 1_000.0,
        timestamp_ms: base_ts + 19,
        sector: "crypto".into(),
    };
    let anomaly = detector.observe(&spike).expect("spike must emit");
    assert_eq!(anomaly.ticker, "BTCUSD");
    assert_eq!(anomaly.price, 1_000.0);
    assert_eq!(anomaly.timestamp_ms, base_ts + 19);
    assert!((anomaly.z_score - 4.359).abs() < 0.01);

    // The emitted record encodes per the stream contract.
    let fields = anomaly.to_fields();
    assert_eq!(fields[0], ("ticker", "BTCUSD".to_string()));
    assert_eq!(fields[1], ("price", "1000.00000000".to_string()));
    assert_eq!(fields[3], ("ts_ms", (base_ts + 19).to_string()));

    // Back on flat prices the inflated window stays quiet.
    let calm = NormalizedTick {
        ticker: "BTCUSD".into(),
        price: 100.0,
        timestamp_ms: base_ts + 20,
        sector: "crypto".into(),
    };
    assert!(detector.observe(&calm).is_none());
}
