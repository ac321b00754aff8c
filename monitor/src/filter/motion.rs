use std::time::{Duration, Instant};

use homecam_common::config::MotionConfig;
use homecam_common::frame::Frame;
use image::imageops::grayscale;
use tracing::debug;

/// Frame-differencing motion detector with a global cooldown.
///
/// Algorithm:
/// 1. Convert both frames to 8-bit luma
/// 2. Absolute per-pixel difference, binarized at `threshold`
/// 3. Flood-fill 8-connected regions of changed pixels
/// 4. Motion if any region covers at least `min_area` pixels
///
/// No background model is kept, so a global lighting change or a shaking
/// camera reads as motion.
pub struct MotionDetector {
    threshold: u8,
    min_area: usize,
    cooldown: Duration,
    last_detection: Option<Instant>,
}

impl MotionDetector {
    pub fn new(threshold: u8, min_area: usize, cooldown: Duration) -> Self {
        Self {
            threshold,
            min_area,
            cooldown,
            last_detection: None,
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(
            u8::try_from(config.threshold).unwrap_or(u8::MAX),
            config.min_area as usize,
            Duration::from_secs(config.cooldown_secs),
        )
    }

    /// Whether `curr` differs from `prev` by a connected changed region of at
    /// least `min_area` pixels. Frames of different sizes never match.
    pub fn detect_pair(&self, prev: &Frame, curr: &Frame) -> bool {
        if prev.dimensions() != curr.dimensions() {
            debug!(
                prev = ?prev.dimensions(),
                curr = ?curr.dimensions(),
                "frame sizes differ, skipping comparison"
            );
            return false;
        }

        let a = grayscale(prev.image());
        let b = grayscale(curr.image());
        let mut mask: Vec<bool> = a
            .as_raw()
            .iter()
            .zip(b.as_raw())
            .map(|(&p, &q)| p.abs_diff(q) > self.threshold)
            .collect();

        let found = has_region(&mut mask, prev.width() as usize, self.min_area);
        debug!(
            prev_seq = prev.seq,
            curr_seq = curr.seq,
            threshold = self.threshold,
            min_area = self.min_area,
            motion = found,
            "motion comparison"
        );
        found
    }

    /// Scan consecutive pairs for motion, honouring the cooldown. Only a
    /// positive result restarts the cooldown.
    pub fn detect_in_sequence(&mut self, frames: &[Frame]) -> bool {
        self.detect_in_sequence_at(frames, Instant::now())
    }

    fn detect_in_sequence_at(&mut self, frames: &[Frame], now: Instant) -> bool {
        if frames.len() < 2 {
            return false;
        }
        if self.in_cooldown(now) {
            debug!("motion scan skipped, cooldown active");
            return false;
        }
        let found = frames.windows(2).any(|pair| self.detect_pair(&pair[0], &pair[1]));
        if found {
            self.last_detection = Some(now);
        }
        found
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_detection
            .is_some_and(|last| now.saturating_duration_since(last) < self.cooldown)
    }
}

/// True once a region of 8-connected `true` cells reaches `min_area`.
/// Visited cells are cleared in place.
fn has_region(mask: &mut [bool], width: usize, min_area: usize) -> bool {
    if width == 0 {
        return false;
    }
    let height = mask.len() / width;
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] {
            continue;
        }
        mask[start] = false;
        stack.push(start);
        let mut area = 0;

        while let Some(idx) = stack.pop() {
            area += 1;
            if area >= min_area {
                return true;
            }
            let (x, y) = (idx % width, idx / width);
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let n = ny * width + nx;
                    if mask[n] {
                        mask[n] = false;
                        stack.push(n);
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn blank(seq: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(64, 48, Rgb([20, 20, 20])), 0, seq)
    }

    /// Blank frame with a bright `size`×`size` square at (8, 8).
    fn with_block(seq: u64, size: u32) -> Frame {
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        for y in 8..8 + size {
            for x in 8..8 + size {
                image.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        Frame::new(image, 0, seq)
    }

    fn detector(min_area: usize) -> MotionDetector {
        MotionDetector::new(25, min_area, Duration::from_secs(300))
    }

    #[test]
    fn identical_frames_never_move() {
        for threshold in [0u8, 1, 25, 254, 255] {
            let d = MotionDetector::new(threshold, 1, Duration::ZERO);
            assert!(!d.detect_pair(&with_block(1, 10), &with_block(2, 10)));
        }
    }

    #[test]
    fn block_at_min_area_is_motion() {
        // 20x20 = 400 pixels
        assert!(detector(400).detect_pair(&blank(1), &with_block(2, 20)));
        assert!(detector(100).detect_pair(&with_block(1, 20), &blank(2)));
    }

    #[test]
    fn block_below_min_area_is_not_motion() {
        assert!(!detector(401).detect_pair(&blank(1), &with_block(2, 20)));
    }

    #[test]
    fn small_change_under_threshold_is_ignored() {
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        for pixel in image.pixels_mut() {
            *pixel = Rgb([40, 40, 40]);
        }
        let brighter = Frame::new(image, 0, 2);
        assert!(!detector(1).detect_pair(&blank(1), &brighter));
    }

    #[test]
    fn scattered_pixels_do_not_form_a_region() {
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        let mut changed = 0;
        for y in (0..48).step_by(3) {
            for x in (0..64).step_by(3) {
                image.put_pixel(x, y, Rgb([250, 250, 250]));
                changed += 1;
            }
        }
        assert!(changed > 300);
        let noisy = Frame::new(image, 0, 2);
        assert!(!detector(300).detect_pair(&blank(1), &noisy));
        assert!(detector(1).detect_pair(&blank(1), &noisy));
    }

    #[test]
    fn diagonal_neighbours_are_connected() {
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        for i in 0..40 {
            image.put_pixel(i, i, Rgb([250, 250, 250]));
        }
        let diagonal = Frame::new(image, 0, 2);
        assert!(detector(40).detect_pair(&blank(1), &diagonal));
    }

    #[test]
    fn mismatched_sizes_are_not_compared() {
        let small = Frame::new(RgbImage::from_pixel(32, 24, Rgb([250, 250, 250])), 0, 2);
        assert!(!detector(1).detect_pair(&blank(1), &small));
    }

    #[test]
    fn sequence_needs_two_frames() {
        let mut d = detector(10);
        assert!(!d.detect_in_sequence(&[]));
        assert!(!d.detect_in_sequence(&[with_block(1, 20)]));
    }

    #[test]
    fn cooldown_suppresses_immediate_repeat() {
        let mut d = detector(100);
        let frames = vec![blank(1), blank(2), with_block(3, 20), blank(4)];
        assert!(d.detect_in_sequence(&frames));
        assert!(!d.detect_in_sequence(&frames));
    }

    #[test]
    fn detection_resumes_after_cooldown() {
        let mut d = MotionDetector::new(25, 100, Duration::from_secs(300));
        let frames = vec![blank(1), with_block(2, 20)];
        let t0 = Instant::now();
        assert!(d.detect_in_sequence_at(&frames, t0));
        assert!(!d.detect_in_sequence_at(&frames, t0 + Duration::from_secs(299)));
        assert!(d.detect_in_sequence_at(&frames, t0 + Duration::from_secs(300)));
    }

    #[test]
    fn negative_scan_leaves_cooldown_untouched() {
        let mut d = detector(100);
        let still = vec![blank(1), blank(2), blank(3)];
        let t0 = Instant::now();
        assert!(!d.detect_in_sequence_at(&still, t0));
        assert!(d.last_detection.is_none());
        assert!(d.detect_in_sequence_at(&[blank(4), with_block(5, 20)], t0));
    }
}
