//! Per-direction packet sequence tracking
//!
//! Detects lost packets for the receiver report and rejects replayed or
//! duplicated datagrams after decryption.

/// Number of sequences behind the highest one that are still tracked
const WINDOW: u32 = 64;

/// What happened to a recorded sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Newest packet so far; `gap` packets were skipped before it
    Advanced { gap: u32 },
    /// Arrived late but inside the window, previously counted as lost
    Late,
    /// Already seen
    Duplicate,
    /// Too old to tell; treated as a replay
    Stale,
}

impl SequenceOutcome {
    /// Whether the packet should be processed
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Late)
    }
}

/// Sliding-window tracker over u32 sequence numbers with wraparound
#[derive(Debug, Default)]
pub struct SequenceTracker {
    highest: Option<u32>,
    /// Bit N set means (highest - N) was received
    bitmap: u64,
    packets_received: u64,
    packets_lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received sequence number
    pub fn record(&mut self, sequence: u32) -> SequenceOutcome {
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            self.bitmap = 1;
            self.packets_received = 1;
            return SequenceOutcome::Advanced { gap: 0 };
        };

        let diff = sequence.wrapping_sub(highest) as i32 as i64;

        if diff > 0 {
            let gap = (diff - 1) as u32;
            if diff < WINDOW as i64 {
                self.bitmap = (self.bitmap << diff as u32) | 1;
            } else {
                self.bitmap = 1;
            }
            self.highest = Some(sequence);
            self.packets_received += 1;
            self.packets_lost += gap as u64;
            return SequenceOutcome::Advanced { gap };
        }

        let offset = (-diff) as u32;
        if offset >= WINDOW {
            return SequenceOutcome::Stale;
        }

        let mask = 1u64 << offset;
        if self.bitmap & mask != 0 {
            return SequenceOutcome::Duplicate;
        }

        self.bitmap |= mask;
        self.packets_received += 1;
        self.packets_lost = self.packets_lost.saturating_sub(1);
        SequenceOutcome::Late
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_packets() {
        let mut tracker = SequenceTracker::new();

        for i in 0..10 {
            let outcome = tracker.record(i);
            assert_eq!(outcome, SequenceOutcome::Advanced { gap: 0 }, "at {}", i);
        }

        assert_eq!(tracker.packets_received(), 10);
        assert_eq!(tracker.packets_lost(), 0);
    }

    #[test]
    fn test_gap_counts_as_loss() {
        let mut tracker = SequenceTracker::new();

        tracker.record(0);
        let outcome = tracker.record(4);

        assert_eq!(outcome, SequenceOutcome::Advanced { gap: 3 });
        assert_eq!(tracker.packets_lost(), 3);
    }

    #[test]
    fn test_late_arrival_corrects_loss() {
        let mut tracker = SequenceTracker::new();

        tracker.record(0);
        tracker.record(1);
        tracker.record(3);
        assert_eq!(tracker.packets_lost(), 1);

        assert_eq!(tracker.record(2), SequenceOutcome::Late);
        assert_eq!(tracker.packets_lost(), 0);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut tracker = SequenceTracker::new();

        tracker.record(0);
        tracker.record(1);

        assert_eq!(tracker.record(1), SequenceOutcome::Duplicate);
        assert_eq!(tracker.record(0), SequenceOutcome::Duplicate);
        assert!(!tracker.record(1).is_fresh());
        assert_eq!(tracker.packets_received(), 2);
    }

    #[test]
    fn test_stale_outside_window() {
        let mut tracker = SequenceTracker::new();

        tracker.record(1000);
        assert_eq!(tracker.record(900), SequenceOutcome::Stale);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut tracker = SequenceTracker::new();

        tracker.record(u32::MAX - 1);
        tracker.record(u32::MAX);
        let outcome = tracker.record(0);

        assert_eq!(outcome, SequenceOutcome::Advanced { gap: 0 });
        assert_eq!(tracker.packets_lost(), 0);
    }
}
