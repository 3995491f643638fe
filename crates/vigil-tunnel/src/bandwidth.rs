//! Bandwidth Idle Analyzer
//!
//! Decides from byte-counter samples whether the tunnel is idle enough
//! for a disruptive operation such as a rekey.

use crate::settings::IdleSettings;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::debug;

const MAX_SNAPSHOTS: usize = 2;

/// Byte counters at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub timestamp: Instant,
}

/// Tracks the two most recent snapshots
#[derive(Debug)]
pub struct BandwidthAnalyzer {
    thresholds: IdleSettings,
    /// Newest first
    snapshots: VecDeque<BandwidthSnapshot>,
}

impl BandwidthAnalyzer {
    pub fn new(thresholds: IdleSettings) -> Self {
        Self {
            thresholds,
            snapshots: VecDeque::with_capacity(MAX_SNAPSHOTS),
        }
    }

    /// Record counters sampled now
    pub fn record(&mut self, rx_bytes: u64, tx_bytes: u64) {
        self.record_at(rx_bytes, tx_bytes, Instant::now());
    }

    /// Record counters sampled at `timestamp`
    pub fn record_at(&mut self, rx_bytes: u64, tx_bytes: u64, timestamp: Instant) {
        self.snapshots.push_front(BandwidthSnapshot {
            rx_bytes,
            tx_bytes,
            timestamp,
        });
        self.snapshots.truncate(MAX_SNAPSHOTS);
    }

    /// rx and tx rates in bytes per second between the two latest
    /// snapshots, if they can be computed
    pub fn rates(&self) -> Option<(f64, f64)> {
        let (newest, oldest) = (self.snapshots.front()?, self.snapshots.get(1)?);

        let elapsed = newest.timestamp.saturating_duration_since(oldest.timestamp).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        // Counter went backwards (adapter restart); we know nothing.
        let rx = newest.rx_bytes.checked_sub(oldest.rx_bytes)?;
        let tx = newest.tx_bytes.checked_sub(oldest.tx_bytes)?;

        Some((rx as f64 / elapsed, tx as f64 / elapsed))
    }

    /// Whether both rates between the two latest snapshots are below
    /// their thresholds
    pub fn is_idle(&self) -> bool {
        let Some((rx_rate, tx_rate)) = self.rates() else {
            return false;
        };
        debug!(rx_rate, tx_rate, "Tunnel bandwidth");

        rx_rate < self.thresholds.rx_bytes_per_sec && tx_rate < self.thresholds.tx_bytes_per_sec
    }

    /// Forget history so the next check cannot claim idleness
    pub fn prevent_idle(&mut self) {
        self.snapshots.clear();
    }

    /// Clear history, e.g. after switching servers
    pub fn reset(&mut self) {
        self.snapshots.clear();
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn analyzer() -> BandwidthAnalyzer {
        BandwidthAnalyzer::new(IdleSettings::default())
    }

    #[test]
    fn test_needs_two_snapshots() {
        let mut analyzer = analyzer();
        assert!(!analyzer.is_idle());

        analyzer.record(0, 0);
        assert!(!analyzer.is_idle());
    }

    #[test]
    fn test_low_traffic_is_idle() {
        let mut analyzer = analyzer();
        let start = Instant::now();

        analyzer.record_at(1_000, 1_000, start);
        analyzer.record_at(11_000, 6_000, start + Duration::from_secs(10));

        assert!(analyzer.is_idle());
    }

    #[test]
    fn test_either_direction_busy_is_not_idle() {
        let mut analyzer = analyzer();
        let start = Instant::now();

        analyzer.record_at(0, 0, start);
        analyzer.record_at(0, 2 * 1024 * 1024, start + Duration::from_secs(10));

        assert!(!analyzer.is_idle());
    }

    #[test]
    fn test_only_two_latest_count() {
        let mut analyzer = analyzer();
        let start = Instant::now();

        analyzer.record_at(0, 0, start);
        analyzer.record_at(100 * 1024 * 1024, 0, start + Duration::from_secs(1));
        analyzer.record_at(100 * 1024 * 1024, 0, start + Duration::from_secs(2));

        assert_eq!(analyzer.snapshot_count(), 2);
        assert!(analyzer.is_idle());
    }

    #[test]
    fn test_non_monotonic_samples() {
        let mut analyzer = analyzer();
        let start = Instant::now();

        analyzer.record_at(5_000, 5_000, start);
        analyzer.record_at(10, 10, start + Duration::from_secs(10));
        assert!(!analyzer.is_idle());

        analyzer.record_at(20, 20, start + Duration::from_secs(10));
        assert!(!analyzer.is_idle());
    }

    #[test]
    fn test_prevent_idle_and_reset() {
        let mut analyzer = analyzer();
        let start = Instant::now();

        analyzer.record_at(0, 0, start);
        analyzer.record_at(0, 0, start + Duration::from_secs(10));
        assert!(analyzer.is_idle());

        analyzer.prevent_idle();
        assert!(!analyzer.is_idle());

        analyzer.record_at(0, 0, start + Duration::from_secs(20));
        analyzer.record_at(0, 0, start + Duration::from_secs(30));
        analyzer.reset();
        assert_eq!(analyzer.snapshot_count(), 0);
    }

    #[test]
    fn test_rate_grows_with_byte_delta() {
        let start = Instant::now();
        let window = Duration::from_secs(10);
        let mut previous = (0.0, 0.0);

        for delta in [0u64, 1, 512, 1024, 64 * 1024, 1024 * 1024, 512 * 1024 * 1024] {
            let mut analyzer = analyzer();
            analyzer.record_at(1_000, 1_000, start);
            analyzer.record_at(1_000 + delta, 1_000 + 2 * delta, start + window);

            let (rx, tx) = analyzer.rates().unwrap();
            assert!(rx >= previous.0 && tx >= previous.1, "rate dropped at delta {delta}");
            previous = (rx, tx);

            let mut doubled = self::analyzer();
            doubled.record_at(1_000, 1_000, start);
            doubled.record_at(1_000 + 2 * delta, 1_000 + 4 * delta, start + window);
            let (rx2, tx2) = doubled.rates().unwrap();
            assert!(rx2 >= rx && tx2 >= tx);

            // A busier tunnel is never idle when a quieter one is not.
            if !analyzer.is_idle() {
                assert!(!doubled.is_idle());
            }
        }
    }

    #[test]
    fn test_rates_unavailable() {
        let mut analyzer = analyzer();
        let start = Instant::now();
        assert_eq!(analyzer.rates(), None);

        analyzer.record_at(10, 10, start);
        analyzer.record_at(10, 10, start);
        assert_eq!(analyzer.rates(), None);

        analyzer.record_at(1_000, 2_000, start + Duration::from_secs(2));
        assert_eq!(analyzer.rates(), Some((495.0, 995.0)));
    }

    #[test]
    fn test_thresholds_are_independent() {
        let mut analyzer = BandwidthAnalyzer::new(IdleSettings {
            rx_bytes_per_sec: 10.0,
            tx_bytes_per_sec: 1_000_000.0,
        });
        let start = Instant::now();

        analyzer.record_at(0, 0, start);
        analyzer.record_at(500, 500_000, start + Duration::from_secs(1));

        assert!(!analyzer.is_idle());
    }
}
