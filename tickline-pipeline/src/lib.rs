//! Pipeline stages between the raw log and the anomaly streams: the
//! normalizer, the latest-state publisher and the anomaly detector.

pub mod detector;
pub mod normalizer;
pub mod publisher;
pub mod tables;
pub mod window;

use std::time::Duration;

pub use detector::{AnomalyDetector, DetectorConfig, DetectorState};
pub use normalizer::{normalize_tick, NormalizeError, Normalizer};
pub use publisher::{MonotonicGuard, QuotePublisher};
pub use tables::SymbolTable;
pub use window::RollingWindow;

/// Block window for batched stream reads.
pub(crate) const READ_BLOCK: Duration = Duration::from_millis(500);
/// Pause after a failed stream read before retrying.
pub(crate) const READ_RETRY_DELAY: Duration = Duration::from_millis(200);
