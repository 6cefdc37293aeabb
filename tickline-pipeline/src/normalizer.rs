//! Normalizer: consumes `raw:events`, emits canonical ticks onto
//! `normalized:events` under bounded parallelism.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use tickline_core::{NormalizedTick, RawTick, ShutdownSignal, TickError, NORMALIZED_STREAM, RAW_STREAM};
use tickline_store::{RedisStore, StoreResult, StreamEntry};
use tickline_telemetry::PipelineMetrics;

use crate::tables::SymbolTable;
use crate::{READ_BLOCK, READ_RETRY_DELAY};

/// Reasons a raw entry never becomes a normalized tick.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error(transparent)]
    Invalid(#[from] TickError),
    /// No canonical ticker exists; distinct from an unmapped sector, which
    /// falls back to `"unknown"`.
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
}

/// Canonicalizes one validated raw tick. Pure: all I/O stays in the loop.
pub fn normalize_tick(raw: &RawTick, tables: &SymbolTable) -> Result<NormalizedTick, NormalizeError> {
    let ticker = tables
        .ticker(&raw.symbol)
        .ok_or_else(|| NormalizeError::UnknownSymbol(raw.symbol.clone()))?;
    Ok(NormalizedTick {
        ticker: ticker.to_string(),
        price: raw.price,
        timestamp_ms: raw.timestamp.timestamp_millis(),
        sector: tables.sector(ticker).to_string(),
    })
}

/// Single consumer loop over `raw:events`, fanning admitted work out to
/// ephemeral tasks behind a semaphore.
pub struct Normalizer {
    store: RedisStore,
    tables: Arc<SymbolTable>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    max_workers: usize,
}

impl Normalizer {
    pub fn new(
        store: RedisStore,
        tables: Arc<SymbolTable>,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            tables,
            metrics,
            batch_size,
            max_workers,
        }
    }

    pub async fn run(self, shutdown: ShutdownSignal) -> StoreResult<()> {
        info!("normalization worker started");
        let mut reader = self
            .store
            .stream_reader(RAW_STREAM, self.batch_size, READ_BLOCK)
            .await?;
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        while !shutdown.triggered() {
            let entries = tokio::select! {
                _ = shutdown.wait() => break,
                result = reader.read_batch() => match result {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(error = %err, "raw stream read failed");
                        if !shutdown.sleep(READ_RETRY_DELAY).await {
                            break;
                        }
                        continue;
                    }
                }
            };

            for entry in entries {
                // The cursor is a low-water mark of "seen", not "processed":
                // it moves even when the entry is shed below.
                reader.advance(&entry.id);

                match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let store = self.store.clone();
                        let tables = self.tables.clone();
                        let metrics = self.metrics.clone();
                        tokio::spawn(async move {
                            normalize_entry(entry, &store, &tables, &metrics).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        warn!(id = %entry.id, "normalize pool full, dropping message");
                        self.metrics.inc_normalize_dropped();
                    }
                }
            }
        }

        info!("normalization worker stopped");
        Ok(())
    }
}

async fn normalize_entry(
    entry: StreamEntry,
    store: &RedisStore,
    tables: &SymbolTable,
    metrics: &PipelineMetrics,
) {
    let start = Instant::now();

    let raw = match RawTick::from_fields(&entry.fields) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(id = %entry.id, error = %err, "raw parse error");
            metrics.inc_normalize_error();
            return;
        }
    };
    let normalized = match normalize_tick(&raw, tables) {
        Ok(tick) => tick,
        Err(err) => {
            warn!(id = %entry.id, error = %err, "normalization skipped");
            metrics.inc_normalize_error();
            return;
        }
    };

    match store.append(NORMALIZED_STREAM, &normalized.to_fields()).await {
        Ok(()) => metrics.inc_normalize(),
        Err(err) => {
            error!(error = %err, "failed to write normalized event");
            metrics.inc_normalize_error();
        }
    }
    metrics.observe_normalize_latency(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn tables() -> SymbolTable {
        let symbols = [("BTCUSD", "BTCUSD"), ("XBTUSD", "BTCUSD")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let sectors = [("BTCUSD", "crypto")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SymbolTable::new(symbols, sectors)
    }

    #[test]
    fn canonicalizes_symbol_sector_and_timestamp() {
        let raw = RawTick {
            source: "feedA".into(),
            symbol: "BTCUSD".into(),
            price: 30_000.0,
            timestamp: Utc.with_ymd_and_hms(2025, 7, 10, 12, 0, 0).unwrap(),
        };
        let tick = normalize_tick(&raw, &tables()).unwrap();
        assert_eq!(tick.ticker, "BTCUSD");
        assert_eq!(tick.price, 30_000.0);
        assert_eq!(tick.timestamp_ms, 1_752_148_800_000);
        assert_eq!(tick.sector, "crypto");
    }

    #[test]
    fn unknown_symbol_is_rejected_not_defaulted() {
        let raw = RawTick {
            source: "feedA".into(),
            symbol: "ZZZ".into(),
            price: 10.0,
            timestamp: Utc::now(),
        };
        assert_eq!(
            normalize_tick(&raw, &tables()),
            Err(NormalizeError::UnknownSymbol("ZZZ".into()))
        );
    }

    #[test]
    fn known_ticker_without_sector_maps_to_unknown() {
        let symbols = [("ETHUSD", "ETHUSD")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let tables = SymbolTable::new(symbols, Default::default());
        let raw = RawTick {
            source: "feedA".into(),
            symbol: "ETHUSD".into(),
            price: 2_000.0,
            timestamp: Utc::now(),
        };
        let tick = normalize_tick(&raw, &tables).unwrap();
        assert_eq!(tick.sector, "unknown");
    }

    #[test]
    fn alias_symbols_collapse_onto_one_ticker() {
        let raw = RawTick {
            source: "feedB".into(),
            symbol: "XBTUSD".into(),
            price: 30_000.0,
            timestamp: Utc::now(),
        };
        let tick = normalize_tick(&raw, &tables()).unwrap();
        assert_eq!(tick.ticker, "BTCUSD");
    }
}
