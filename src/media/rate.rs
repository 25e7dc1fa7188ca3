//! Loss-driven bitrate control
//!
//! Additive increase while the receiver reports a clean link, multiplicative
//! decrease when loss exceeds the threshold. Bounded by the configured target.

use tracing::debug;

const MIN_BITRATE_KBPS: u32 = 1000;
const INCREASE_KBPS: u32 = 500;
/// Multiplicative decrease, in percent
const DECREASE_PERCENT: u64 = 85;

/// Loss fraction above which the bitrate is cut
const LOSS_THRESHOLD: f64 = 0.02;

#[derive(Debug)]
pub struct BitrateController {
    target_kbps: u32,
    current_kbps: u32,
    last_received: u64,
    last_lost: u64,
}

impl BitrateController {
    pub fn new(target_kbps: u32) -> Self {
        let target_kbps = target_kbps.max(MIN_BITRATE_KBPS);
        Self {
            target_kbps,
            current_kbps: target_kbps,
            last_received: 0,
            last_lost: 0,
        }
    }

    pub fn current_kbps(&self) -> u32 {
        self.current_kbps
    }

    /// Feed cumulative receiver counters; returns the new bitrate if it changed
    pub fn on_report(&mut self, packets_received: u64, packets_lost: u64) -> Option<u32> {
        let received = packets_received.saturating_sub(self.last_received);
        let lost = packets_lost.saturating_sub(self.last_lost);
        self.last_received = packets_received;
        self.last_lost = packets_lost;

        let total = received + lost;
        if total == 0 {
            return None;
        }
        let loss = lost as f64 / total as f64;

        let next = if loss > LOSS_THRESHOLD {
            ((self.current_kbps as u64 * DECREASE_PERCENT / 100) as u32).max(MIN_BITRATE_KBPS)
        } else {
            (self.current_kbps + INCREASE_KBPS).min(self.target_kbps)
        };

        if next == self.current_kbps {
            return None;
        }
        debug!(
            "Bitrate {} -> {} kbps (loss {:.1}%)",
            self.current_kbps,
            next,
            loss * 100.0
        );
        self.current_kbps = next;
        Some(next)
    }
}
