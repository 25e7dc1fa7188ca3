//! Host encode loop and client decode loop
//!
//! Both run as tasks beside the session's transport loop. The encode loop
//! feeds a `FrameQueue` the transport drains; the decode loop receives
//! reassembled frames and reports back when it needs a keyframe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::stats::{RateMeter, StatsAggregator};

use super::capture::FrameSource;
use super::codec::{VideoDecoder, VideoEncoder};
use super::error::MediaError;
use super::queue::FrameQueue;
use super::renderer::VideoRenderer;
use super::EncodedFrame;

/// Shared slot for the renderer installed by the embedding application
pub type RendererSlot = Arc<Mutex<Option<Box<dyn VideoRenderer>>>>;

/// One-shot flag asking the encoder for a keyframe
#[derive(Debug, Default)]
pub struct KeyframeTrigger(AtomicBool);

impl KeyframeTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Frames' worth of unspent bitrate the encode loop may bank
const BUDGET_BURST_FRAMES: i64 = 4;

/// Byte credit shared out one frame interval at a time
///
/// Each tick adds the per-frame share of the bitrate target; each encoded
/// frame spends its size. While the credit is negative the loop skips
/// capture, so an oversized frame is paid back by the frames after it.
#[derive(Debug)]
struct FrameBudget {
    per_frame: i64,
    credit: i64,
}

impl FrameBudget {
    fn new(kbps: u32, fps: u32) -> Self {
        let mut budget = Self {
            per_frame: 0,
            credit: 0,
        };
        budget.set_bitrate(kbps, fps);
        budget.credit = budget.per_frame;
        budget
    }

    fn set_bitrate(&mut self, kbps: u32, fps: u32) {
        self.per_frame = kbps as i64 * 125 / fps.max(1) as i64;
    }

    /// Refill for one frame interval; false when this frame must be skipped
    fn tick(&mut self) -> bool {
        self.credit = (self.credit + self.per_frame).min(self.per_frame * BUDGET_BURST_FRAMES);
        self.credit >= 0
    }

    fn spend(&mut self, bytes: usize) {
        self.credit -= bytes as i64;
    }
}

/// Capture and encode at a fixed frame rate
pub struct EncodeLoop {
    pub source: Box<dyn FrameSource>,
    pub encoder: Box<dyn VideoEncoder>,
    pub queue: Arc<FrameQueue>,
    pub keyframe: Arc<KeyframeTrigger>,
    pub stats: Arc<StatsAggregator>,
    pub fps: u32,
    pub keyframe_interval: Duration,
    pub max_consecutive_errors: u32,
    pub bitrate: watch::Receiver<u32>,
}

impl EncodeLoop {
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), MediaError> {
        let fps = self.fps.max(1);
        let mut ticker = interval(Duration::from_secs_f64(1.0 / fps as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_keyframe: Option<Instant> = None;
        let mut consecutive_errors = 0u32;
        let mut meter = RateMeter::new();
        let mut budget = FrameBudget::new(*self.bitrate.borrow(), fps);

        info!("Encode loop started at {} fps", fps);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Encode loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if self.bitrate.has_changed().unwrap_or(false) {
                let kbps = *self.bitrate.borrow_and_update();
                self.encoder.set_bitrate(kbps);
                budget.set_bitrate(kbps, fps);
            }

            if !budget.tick() {
                trace!("Over the bitrate budget; skipping a frame");
                continue;
            }

            let interval_due = last_keyframe.map_or(true, |t| t.elapsed() >= self.keyframe_interval);
            let force = self.keyframe.take() || interval_due;

            let result = self
                .source
                .capture()
                .and_then(|frame| self.encoder.encode(&frame, force));

            match result {
                Ok(frame) => {
                    consecutive_errors = 0;
                    if frame.keyframe {
                        last_keyframe = Some(Instant::now());
                    }
                    meter.record(frame.data.len());
                    budget.spend(frame.data.len());
                    self.stats.add_frames_encoded(1);

                    if let Some(evicted) = self.queue.push(frame) {
                        self.stats.add_frames_dropped(1);
                        if evicted.keyframe {
                            debug!("Dropped keyframe {}; forcing another", evicted.frame_id);
                            self.keyframe.request();
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!("Encode failed ({} in a row): {}", consecutive_errors, e);
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(MediaError::TooManyErrors {
                            count: consecutive_errors,
                            last: e.to_string(),
                        });
                    }
                    self.keyframe.request();
                }
            }

            if let Some((measured, _)) = meter.poll() {
                self.stats.set_fps(measured.min(fps));
            }
        }
    }
}

/// Sent from the decode loop to the transport loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFeedback {
    NeedKeyframe { last_frame_id: Option<u64> },
}

/// Decode reassembled frames and hand them to the renderer
pub struct DecodeLoop {
    pub decoder: Box<dyn VideoDecoder>,
    pub renderer: RendererSlot,
    pub stats: Arc<StatsAggregator>,
    pub max_fps: u32,
    pub max_consecutive_errors: u32,
    pub frames: mpsc::Receiver<EncodedFrame>,
    pub feedback: mpsc::UnboundedSender<DecodeFeedback>,
}

impl DecodeLoop {
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), MediaError> {
        let mut awaiting_keyframe = false;
        let mut last_good: Option<u64> = None;
        let mut consecutive_errors = 0u32;
        let mut meter = RateMeter::new();
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Some((fps, _)) = meter.poll() {
                        self.stats.set_fps(fps.min(self.max_fps));
                    }
                    continue;
                }
                frame = self.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };

            if awaiting_keyframe && !frame.keyframe {
                self.stats.add_frames_dropped(1);
                continue;
            }

            let failure = match self.decoder.decode(&frame) {
                Ok(decoded) => {
                    awaiting_keyframe = false;
                    last_good = Some(frame.frame_id);
                    meter.record(frame.data.len());
                    self.stats.add_frames_decoded(1);

                    let rendered = match self.renderer.lock().as_mut() {
                        Some(renderer) => renderer.render(&decoded),
                        None => Ok(()),
                    };
                    rendered.err()
                }
                Err(MediaError::NeedKeyframe) => {
                    debug!("Frame {} has no reference; waiting for keyframe", frame.frame_id);
                    awaiting_keyframe = true;
                    self.stats.add_frames_dropped(1);
                    let _ = self.feedback.send(DecodeFeedback::NeedKeyframe {
                        last_frame_id: last_good,
                    });
                    continue;
                }
                Err(e) => {
                    awaiting_keyframe = true;
                    let _ = self.feedback.send(DecodeFeedback::NeedKeyframe {
                        last_frame_id: last_good,
                    });
                    Some(e)
                }
            };

            match failure {
                None => consecutive_errors = 0,
                Some(e) => {
                    consecutive_errors += 1;
                    warn!("Media error ({} in a row): {}", consecutive_errors, e);
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(MediaError::TooManyErrors {
                            count: consecutive_errors,
                            last: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        DeltaRleDecoder, DeltaRleEncoder, MediaError, PixelFormat, RawFrame, SurfaceRenderer,
        TestPatternSource,
    };

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn capture(&mut self) -> Result<RawFrame, MediaError> {
            Err(MediaError::Capture("no display".to_string()))
        }

        fn resolution(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    struct CountingRenderer(Arc<Mutex<u64>>);

    impl VideoRenderer for CountingRenderer {
        fn render(&mut self, _frame: &RawFrame) -> Result<(), MediaError> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    fn encode_loop(source: Box<dyn FrameSource>, queue: Arc<FrameQueue>) -> EncodeLoop {
        let (_tx, bitrate) = watch::channel(8000);
        EncodeLoop {
            source,
            encoder: Box::new(DeltaRleEncoder::new(8000, 100)),
            queue,
            keyframe: Arc::new(KeyframeTrigger::new()),
            stats: Arc::new(StatsAggregator::new()),
            fps: 100,
            keyframe_interval: Duration::from_secs(2),
            max_consecutive_errors: 3,
            bitrate,
        }
    }

    #[tokio::test]
    async fn test_encode_loop_produces_keyframe_first() {
        let queue = Arc::new(FrameQueue::new(8));
        let source = Box::new(TestPatternSource::new(64, 16, None).unwrap());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(encode_loop(source, queue.clone()).run(cancel.clone()));

        let first = tokio::time::timeout(Duration::from_secs(2), queue.pop_wait())
            .await
            .expect("encoder should produce a frame");
        assert!(first.keyframe);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_encode_loop_escalates_errors() {
        let queue = Arc::new(FrameQueue::new(8));
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            encode_loop(Box::new(FailingSource), queue).run(CancellationToken::new()),
        )
        .await
        .expect("loop should give up");
        assert!(matches!(result, Err(MediaError::TooManyErrors { count: 3, .. })));
    }

    #[test]
    fn test_keyframe_trigger_is_one_shot() {
        let trigger = KeyframeTrigger::new();
        assert!(!trigger.take());
        trigger.request();
        assert!(trigger.take());
        assert!(!trigger.take());
    }

    #[tokio::test]
    async fn test_decode_loop_renders_and_requests_keyframe() {
        let mut encoder = DeltaRleEncoder::new(8000, 60);
        let frame = |v: u8| RawFrame {
            width: 8,
            height: 8,
            format: PixelFormat::Gray8,
            timestamp_us: 0,
            data: vec![v; 64],
        };
        let key = encoder.encode(&frame(1), false).unwrap();
        let _lost = encoder.encode(&frame(2), false).unwrap();
        let orphan = encoder.encode(&frame(3), false).unwrap();

        let rendered = Arc::new(Mutex::new(0u64));
        let renderer: RendererSlot =
            Arc::new(Mutex::new(Some(
            Box::new(CountingRenderer(rendered.clone())) as Box<dyn VideoRenderer>,
        )));
        let stats = Arc::new(StatsAggregator::new());
        let (frame_tx, frames) = mpsc::channel(8);
        let (feedback, mut feedback_rx) = mpsc::unbounded_channel();

        let decode = DecodeLoop {
            decoder: Box::new(DeltaRleDecoder::new(1920, 1080)),
            renderer,
            stats: stats.clone(),
            max_fps: 60,
            max_consecutive_errors: 5,
            frames,
            feedback,
        };
        let task = tokio::spawn(decode.run(CancellationToken::new()));

        frame_tx.send(key.clone()).await.unwrap();
        frame_tx.send(orphan).await.unwrap();

        let request = tokio::time::timeout(Duration::from_secs(2), feedback_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            request,
            DecodeFeedback::NeedKeyframe {
                last_frame_id: Some(key.frame_id)
            }
        );

        drop(frame_tx);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(*rendered.lock(), 1);
        assert_eq!(stats.snapshot().frames_decoded, 1);
    }

    #[test]
    fn test_budget_skips_until_paid_back() {
        // 1000 kbps at 25 fps is 5000 bytes a frame
        let mut budget = FrameBudget::new(1000, 25);
        assert!(budget.tick());
        budget.spend(12_000);

        // 10000 - 12000 + 5000 = 3000 banked after the next refill
        let allowed: Vec<bool> = (0..3).map(|_| budget.tick()).collect();
        assert_eq!(allowed, vec![true, true, true]);

        budget.spend(40_000);
        let mut skipped = 0;
        while !budget.tick() {
            skipped += 1;
        }
        assert!(skipped >= 4, "only skipped {}", skipped);
    }

    #[test]
    fn test_budget_banks_a_bounded_burst() {
        let mut budget = FrameBudget::new(1000, 25);
        for _ in 0..100 {
            budget.tick();
        }
        assert_eq!(budget.credit, 5000 * BUDGET_BURST_FRAMES);

        budget.set_bitrate(2000, 25);
        budget.spend(70_000);
        assert!(!budget.tick());
    }

    #[test]
    fn test_surface_renderer_fits_slot() {
        let slot: RendererSlot = Arc::new(Mutex::new(Some(
            Box::new(SurfaceRenderer::new(1)) as Box<dyn VideoRenderer>,
        )));
        assert!(slot.lock().is_some());
    }
}
