//! Fixed-capacity rolling window with O(1) mean and standard deviation.

/// Ring buffer over the most recent `W` values of a series, maintaining a
/// running sum and sum of squares.
///
/// Population statistics over the buffered sample: `mean = sum/n`,
/// `variance = max(0, sqsum/n - mean^2)`. The clamp absorbs the negative
/// epsilon that floating-point cancellation can leave behind.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    buf: Vec<f64>,
    idx: usize,
    filled: bool,
    sum: f64,
    sqsum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity.max(1)],
            idx: 0,
            filled: false,
            sum: 0.0,
            sqsum: 0.0,
        }
    }

    /// Inserts a value, evicting the oldest once the window is full.
    pub fn push(&mut self, value: f64) {
        if self.filled {
            let old = self.buf[self.idx];
            self.sum -= old;
            self.sqsum -= old * old;
        }
        self.buf[self.idx] = value;
        self.sum += value;
        self.sqsum += value * value;
        self.idx = (self.idx + 1) % self.buf.len();
        if self.idx == 0 {
            self.filled = true;
        }
    }

    /// Number of buffered samples: `min(k, W)` after `k` pushes.
    pub fn len(&self) -> usize {
        if self.filled {
            self.buf.len()
        } else {
            self.idx
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled
    }

    /// `(mean, std)` over the buffered samples; `(0, 0)` when empty.
    pub fn mean_std(&self) -> (f64, f64) {
        let n = self.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let n = n as f64;
        let mean = self.sum / n;
        let variance = (self.sqsum / n - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn partial_window_uses_observed_count() {
        let mut window = RollingWindow::new(20);
        for _ in 0..19 {
            window.push(100.0);
        }
        assert_eq!(window.len(), 19);
        assert!(!window.is_full());

        window.push(100.0);
        assert_eq!(window.len(), 20);
        assert!(window.is_full());
    }

    #[test]
    fn eviction_removes_oldest_from_both_sums() {
        let mut window = RollingWindow::new(3);
        window.push(1.0);
        window.push(2.0);
        window.push(3.0);
        // Evicts the 1.0: sample is now [2, 3, 4].
        window.push(4.0);
        let (mean, std) = window.mean_std();
        assert_close(mean, 3.0);
        assert_close(std, (2.0f64 / 3.0).sqrt());
    }

    #[test]
    fn sums_track_the_trailing_sample() {
        let values = [5.0, 7.0, 11.0, 2.0, 8.0, 3.0, 9.0];
        let capacity = 4;
        let mut window = RollingWindow::new(capacity);
        for (k, &value) in values.iter().enumerate() {
            window.push(value);
            let tail_start = (k + 1).saturating_sub(capacity);
            let tail = &values[tail_start..=k];
            let sum: f64 = tail.iter().sum();
            let sqsum: f64 = tail.iter().map(|v| v * v).sum();
            assert_eq!(window.len(), tail.len());
            let (mean, std) = window.mean_std();
            assert_close(mean, sum / tail.len() as f64);
            let variance = (sqsum / tail.len() as f64 - mean * mean).max(0.0);
            assert_close(std, variance.sqrt());
        }
    }

    #[test]
    fn empty_window_reports_zero_stats() {
        let window = RollingWindow::new(5);
        assert_eq!(window.mean_std(), (0.0, 0.0));
        assert!(window.is_empty());
    }

    #[test]
    fn constant_series_has_zero_std() {
        let mut window = RollingWindow::new(5);
        for _ in 0..7 {
            window.push(100.0);
        }
        let (mean, std) = window.mean_std();
        assert_close(mean, 100.0);
        assert_close(std, 0.0);
    }

    #[test]
    fn variance_clamp_keeps_std_finite() {
        let mut window = RollingWindow::new(4);
        // Large equal magnitudes maximize cancellation error.
        for _ in 0..4 {
            window.push(1.0e9);
        }
        let (_, std) = window.mean_std();
        assert!(std >= 0.0);
        assert!(std.is_finite());
    }

    #[test]
    fn small_window_outlier_inflates_std() {
        // A single spike in a small window suppresses later emissions by
        // inflating the deviation, so z stays modest.
        let mut window = RollingWindow::new(5);
        for _ in 0..5 {
            window.push(100.0);
        }
        window.push(200.0);
        let (mean, std) = window.mean_std();
        assert_close(mean, 120.0);
        assert_close(std, 40.0);
        assert_close((200.0 - mean) / std, 2.0);

        window.push(300.0);
        let (mean, std) = window.mean_std();
        assert_close(mean, 160.0);
        assert_close(std, 80.0);
        assert_close((300.0 - mean) / std, 1.75);

        window.push(1000.0);
        let (mean, std) = window.mean_std();
        assert_close(mean, 340.0);
        assert!((std - 338.231).abs() < 0.01);
        assert!(((1000.0 - mean) / std - 1.951).abs() < 0.01);
    }
}
