//! Timer values per RFC 3261 §17 Table 4, UDP column.
//!
//! The base values T1/T2/T4 are configurable (tests shrink them to compress
//! wall-clock time); everything else is derived, never stored.

use std::time::Duration;

use crate::TransactionTimer;

/// Base timer values and the derivation of the lettered timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTable {
    /// RTT estimate, default 500 ms. The retransmit seed for A/E/G.
    pub t1: Duration,
    /// Retransmit interval cap, default 4 s.
    pub t2: Duration,
    /// Maximum time a message stays in the network, default 5 s.
    pub t4: Duration,
}

impl Default for TimerTable {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerTable {
    pub fn new(t1: Duration, t2: Duration, t4: Duration) -> Self {
        Self { t1, t2, t4 }
    }

    /// Initial duration for the given timer. Retransmit timers (A, E, G)
    /// start here and double per [`next_interval`] up to T2.
    ///
    /// [`next_interval`]: TimerTable::next_interval
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => self.t1,
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.t1.saturating_mul(64)
            }
            // RFC 3261: Timer D must exceed 32 s for UDP.
            TransactionTimer::D => Duration::from_secs(32).max(self.t1.saturating_mul(64)),
            TransactionTimer::I | TransactionTimer::K => self.t4,
            TransactionTimer::J => self.t1.saturating_mul(64),
        }
    }

    /// Doubles a retransmit interval, capped at T2.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.t2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc_table_4() {
        let t = TimerTable::default();
        assert_eq!(t.duration(TransactionTimer::A), Duration::from_millis(500));
        assert_eq!(t.duration(TransactionTimer::B), Duration::from_secs(32));
        assert_eq!(t.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(t.duration(TransactionTimer::F), Duration::from_secs(32));
        assert_eq!(t.duration(TransactionTimer::H), Duration::from_secs(32));
        assert_eq!(t.duration(TransactionTimer::I), Duration::from_secs(5));
        assert_eq!(t.duration(TransactionTimer::J), Duration::from_secs(32));
        assert_eq!(t.duration(TransactionTimer::K), Duration::from_secs(5));
    }

    #[test]
    fn retransmit_interval_doubles_to_t2() {
        let t = TimerTable::default();
        let mut interval = t.duration(TransactionTimer::A);
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(interval);
            interval = t.next_interval(interval);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn scaled_tables_derive_consistently() {
        let t = TimerTable::new(
            Duration::from_millis(20),
            Duration::from_millis(160),
            Duration::from_millis(200),
        );
        assert_eq!(t.duration(TransactionTimer::B), Duration::from_millis(1280));
        assert_eq!(t.duration(TransactionTimer::K), Duration::from_millis(200));
        // D never dips below the RFC floor.
        assert_eq!(t.duration(TransactionTimer::D), Duration::from_secs(32));
    }
}
