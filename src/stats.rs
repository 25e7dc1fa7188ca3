//! Session statistics and diagnostic strings
//!
//! Workers update counters with relaxed atomics; readers take snapshots
//! without blocking. Snapshots and diagnostics are also published on `watch`
//! channels for subscribers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::watch;

/// Longest diagnostic string kept, in bytes
pub const MAX_DIAGNOSTIC_LEN: usize = 511;

/// Point-in-time view of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub fps: u32,
    pub rtt_ms: u32,
    pub bitrate_kbps: u32,
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub packets_lost: u64,
}

/// Lock-free counters shared by session workers
#[derive(Debug)]
pub struct StatsAggregator {
    connected: AtomicBool,
    fps: AtomicU32,
    rtt_ms: AtomicU32,
    bitrate_kbps: AtomicU32,
    frames_encoded: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    packets_lost: AtomicU64,
    tx: watch::Sender<StatsSnapshot>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatsSnapshot::default());
        Self {
            connected: AtomicBool::new(false),
            fps: AtomicU32::new(0),
            rtt_ms: AtomicU32::new(0),
            bitrate_kbps: AtomicU32::new(0),
            frames_encoded: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            tx,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_fps(&self, fps: u32) {
        self.fps.store(fps, Ordering::Relaxed);
    }

    pub fn set_rtt_ms(&self, rtt_ms: u32) {
        self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    pub fn set_bitrate_kbps(&self, kbps: u32) {
        self.bitrate_kbps.store(kbps, Ordering::Relaxed);
    }

    pub fn set_packets_lost(&self, lost: u64) {
        self.packets_lost.store(lost, Ordering::Relaxed);
    }

    pub fn add_frames_encoded(&self, n: u64) {
        self.frames_encoded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_frames_decoded(&self, n: u64) {
        self.frames_decoded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_frames_dropped(&self, n: u64) {
        self.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            fps: self.fps.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ms.load(Ordering::Relaxed),
            bitrate_kbps: self.bitrate_kbps.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
        }
    }

    /// Push the current snapshot to subscribers
    pub fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }

    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.tx.subscribe()
    }

    /// Zero everything; called when a new session starts
    pub fn reset_session(&self) {
        self.reset_live();
        self.rtt_ms.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
        self.publish();
    }

    /// Clear the live gauges; called when a session ends
    pub fn reset_live(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.fps.store(0, Ordering::Relaxed);
        self.bitrate_kbps.store(0, Ordering::Relaxed);
        self.publish();
    }
}

/// Counts events over a one-second window to produce a rate
#[derive(Debug)]
pub struct RateMeter {
    window_start: std::time::Instant,
    frames: u32,
    bytes: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            window_start: std::time::Instant::now(),
            frames: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.frames += 1;
        self.bytes += bytes as u64;
    }

    /// Returns `(fps, kbps)` once a full second has elapsed
    pub fn poll(&mut self) -> Option<(u32, u32)> {
        let elapsed = self.window_start.elapsed();
        if elapsed.as_millis() < 1000 {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let fps = (self.frames as f64 / secs).round() as u32;
        let kbps = ((self.bytes * 8) as f64 / 1000.0 / secs).round() as u32;
        *self = Self::new();
        Some((fps, kbps))
    }
}

/// Single-writer, many-reader diagnostic string
#[derive(Debug)]
pub struct DiagnosticSlot {
    tx: watch::Sender<String>,
}

impl Default for DiagnosticSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(String::new());
        Self { tx }
    }

    /// Replace the stored message
    pub fn set(&self, message: impl AsRef<str>) {
        self.tx.send_replace(sanitize(message.as_ref()));
    }

    pub fn clear(&self) {
        self.tx.send_replace(String::new());
    }

    pub fn get(&self) -> String {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    /// Copy into a C-style buffer: at most `buf.len() - 1` bytes plus a NUL.
    /// Returns the number of bytes copied, excluding the NUL.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let message = self.tx.borrow();
        let bytes = message.as_bytes();
        let len = bytes.len().min(buf.len() - 1);
        buf[..len].copy_from_slice(&bytes[..len]);
        buf[len] = 0;
        len
    }
}

/// Replace NULs and truncate to `MAX_DIAGNOSTIC_LEN` on a char boundary
fn sanitize(message: &str) -> String {
    let mut end = message.len().min(MAX_DIAGNOSTIC_LEN);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].replace('\0', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = StatsAggregator::new();
        stats.set_connected(true);
        stats.set_fps(60);
        stats.set_bitrate_kbps(5000);
        stats.set_rtt_ms(12);
        stats.add_frames_encoded(10);

        stats.reset_live();
        let snap = stats.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.fps, 0);
        assert_eq!(snap.bitrate_kbps, 0);
        assert_eq!(snap.frames_encoded, 10);
        assert_eq!(snap.rtt_ms, 12);

        stats.reset_session();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let stats = StatsAggregator::new();
        let rx = stats.subscribe();
        stats.add_frames_decoded(3);
        stats.publish();
        assert_eq!(rx.borrow().frames_decoded, 3);
    }

    #[test]
    fn test_diagnostic_truncates_on_char_boundary() {
        let slot = DiagnosticSlot::new();
        // 'é' is two bytes; 300 of them is 600 bytes
        slot.set("é".repeat(300));
        let stored = slot.get();
        assert!(stored.len() <= MAX_DIAGNOSTIC_LEN);
        assert_eq!(stored.len(), 510);
    }

    #[test]
    fn test_diagnostic_replaces_nul() {
        let slot = DiagnosticSlot::new();
        slot.set("bad\0value");
        assert_eq!(slot.get(), "bad value");
    }

    #[test]
    fn test_copy_to_bounded() {
        let slot = DiagnosticSlot::new();
        slot.set("connection timed out");

        let mut small = [0xFFu8; 8];
        assert_eq!(slot.copy_to(&mut small), 7);
        assert_eq!(&small[..7], b"connect");
        assert_eq!(small[7], 0);

        let mut large = [0xFFu8; 64];
        assert_eq!(slot.copy_to(&mut large), 20);
        assert_eq!(large[20], 0);

        let mut empty: [u8; 0] = [];
        assert_eq!(slot.copy_to(&mut empty), 0);

        let mut one = [0xFFu8; 1];
        assert_eq!(slot.copy_to(&mut one), 0);
        assert_eq!(one[0], 0);
    }

    #[test]
    fn test_clear() {
        let slot = DiagnosticSlot::new();
        slot.set("boom");
        slot.clear();
        assert!(slot.get().is_empty());
    }
}
