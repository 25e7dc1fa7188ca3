//! Token-bucket send pacing
//!
//! The bucket refills at the target bitrate and may run into debt by one
//! datagram: a send is allowed whenever the balance is not negative, and the
//! datagram's size is charged afterwards. Video leaves the host no faster than
//! the target, with short bursts capped by the bucket depth.

use std::time::{Duration, Instant};

use crate::protocol::MAX_DATAGRAM_SIZE;

/// Bucket depth in milliseconds of traffic at the current rate
const BURST_MS: f64 = 20.0;

/// Shallowest bucket, so a couple of full datagrams can always go back to back
const MIN_BURST_BYTES: f64 = (MAX_DATAGRAM_SIZE * 2) as f64;

#[derive(Debug)]
pub struct Pacer {
    bytes_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Pacer {
    pub fn new(kbps: u32) -> Self {
        let mut pacer = Self {
            bytes_per_sec: 0.0,
            burst: 0.0,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        pacer.set_rate(kbps);
        pacer.tokens = pacer.burst;
        pacer
    }

    pub fn set_rate(&mut self, kbps: u32) {
        self.bytes_per_sec = kbps.max(1) as f64 * 125.0;
        self.burst = (self.bytes_per_sec * BURST_MS / 1000.0).max(MIN_BURST_BYTES);
        self.tokens = self.tokens.min(self.burst);
    }

    pub fn rate_kbps(&self) -> u32 {
        (self.bytes_per_sec / 125.0) as u32
    }

    /// Time until the next datagram may go out
    pub fn ready_in(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.bytes_per_sec)
        }
    }

    /// Charge a datagram that was just sent
    pub fn consume(&mut self, bytes: usize, now: Instant) {
        self.refill(now);
        self.tokens -= bytes as f64;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_wait() {
        // 8000 kbps is 1 MB/s; the bucket holds 20 ms of it
        let start = Instant::now();
        let mut pacer = Pacer::new(8000);

        let mut sent = 0;
        while pacer.ready_in(start).is_zero() {
            pacer.consume(1000, start);
            sent += 1;
        }
        assert_eq!(sent, 21);

        // 1000 bytes of debt at 1 MB/s
        let wait = pacer.ready_in(start);
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(2), "{:?}", wait);
        assert!(pacer.ready_in(start + Duration::from_millis(2)).is_zero());
    }

    #[test]
    fn test_sustained_rate_matches_target() {
        let start = Instant::now();
        let mut pacer = Pacer::new(2000);
        let mut now = start;
        let mut bytes = 0usize;

        while now < start + Duration::from_secs(2) {
            now += pacer.ready_in(now);
            pacer.consume(1200, now);
            bytes += 1200;
        }

        // 2000 kbps for 2 s, plus at most one bucket and one datagram
        let kbps = (bytes * 8 / 1000) as u32 / 2;
        assert!((1950..=2100).contains(&kbps), "{} kbps", kbps);
    }

    #[test]
    fn test_idle_time_does_not_bank_past_burst() {
        let start = Instant::now();
        let mut pacer = Pacer::new(1000);
        let later = start + Duration::from_secs(10);
        pacer.ready_in(later);
        assert_eq!(pacer.burst, 2500.0);
        assert_eq!(pacer.tokens, pacer.burst);
    }

    #[test]
    fn test_rate_change() {
        let mut pacer = Pacer::new(8000);
        pacer.set_rate(1500);
        assert_eq!(pacer.rate_kbps(), 1500);
        assert!(pacer.tokens <= pacer.burst);
    }
}
