//! Bounded outbound frame queue

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::EncodedFrame;

/// Frames waiting to be chunked onto the wire
///
/// When full, the oldest frame is dropped so latency stays bounded.
pub struct FrameQueue {
    frames: Mutex<VecDeque<EncodedFrame>>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame, returning the one evicted to make room
    pub fn push(&self, frame: EncodedFrame) -> Option<EncodedFrame> {
        let evicted = {
            let mut frames = self.frames.lock();
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front()
            } else {
                None
            };
            frames.push_back(frame);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<EncodedFrame> {
        self.frames.lock().pop_front()
    }

    /// Wait for the next frame
    pub async fn pop_wait(&self) -> EncodedFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}
