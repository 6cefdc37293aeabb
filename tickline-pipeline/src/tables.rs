//! Read-only symbol and sector lookup tables.

use std::collections::HashMap;

/// Sector assigned to tickers without a mapping entry.
pub const UNKNOWN_SECTOR: &str = "unknown";

/// Symbol-to-ticker and ticker-to-sector mappings, loaded once at startup
/// and shared read-only across normalizer workers.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, String>,
    sectors: HashMap<String, String>,
}

impl SymbolTable {
    pub fn new(symbols: HashMap<String, String>, sectors: HashMap<String, String>) -> Self {
        Self { symbols, sectors }
    }

    /// Canonical ticker for a feed symbol; `None` means the symbol has no
    /// canonical form and the tick must be skipped.
    pub fn ticker(&self, symbol: &str) -> Option<&str> {
        self.symbols.get(symbol).map(String::as_str)
    }

    /// Sector for a canonical ticker, falling back to [`UNKNOWN_SECTOR`].
    pub fn sector(&self, ticker: &str) -> &str {
        self.sectors
            .get(ticker)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_SECTOR)
    }
}
