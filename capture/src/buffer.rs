use homecam_common::frame::Frame;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Fixed-capacity ring of the most recent frames, oldest first.
///
/// One writer (the acquisition loop) and any number of readers. The lock is
/// held only for the push or the copy of a few `Arc` handles, so readers
/// never see a half-applied eviction and never wait on I/O.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame, evicting the oldest one when full.
    pub fn push(&self, frame: Frame) {
        let mut frames = self.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// The last `min(n, len)` frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Frame> {
        let frames = self.lock();
        let skip = frames.len().saturating_sub(n);
        frames.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().back().cloned()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
