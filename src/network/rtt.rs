//! Round-trip time estimation from ping/pong control messages

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

/// Maximum pending pings before discarding old ones
const MAX_PENDING_PINGS: usize = 10;

/// TCP-style smoothing factor
const ALPHA: f64 = 0.125;

/// Smoothed RTT estimator
#[derive(Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    pending: HashMap<u32, Instant>,
    next_seq: u32,
    epoch: Instant,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: None,
            pending: HashMap::new(),
            next_seq: 0,
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the estimator was created
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Allocate a ping and remember when it was sent.
    /// Returns `(ping_sequence, sent_time_us)`.
    pub fn start_ping(&mut self) -> (u32, u64) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.pending.len() >= MAX_PENDING_PINGS {
            if let Some(&oldest) = self.pending.keys().min() {
                self.pending.remove(&oldest);
            }
        }
        self.pending.insert(seq, Instant::now());
        (seq, self.now_us())
    }

    /// Feed a pong. Returns the raw sample when the ping was known.
    pub fn on_pong(&mut self, ping_sequence: u32) -> Option<Duration> {
        let sent = self.pending.remove(&ping_sequence)?;
        let sample = sent.elapsed();
        self.observe(sample);
        Some(sample)
    }

    /// Fold a sample into the moving average
    pub fn observe(&mut self, sample: Duration) {
        let srtt = match self.srtt {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - ALPHA) + sample.mul_f64(ALPHA),
        };
        trace!("RTT updated: srtt={:?} (sample={:?})", srtt, sample);
        self.srtt = Some(srtt);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rtt_ms(&self) -> u32 {
        self.srtt.map(|d| d.as_millis() as u32).unwrap_or(0)
    }
}
