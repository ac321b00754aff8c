use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use homecam_capture::{CaptureCoordinator, CaptureStatus, FrameSource};
use homecam_common::config::{Config, QuietHours};
use homecam_common::event::Notification;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter::MotionDetector;
use crate::recorder::{ClipEncoder, EncodeError, OutputFile};

const MOTION_CAPTION: &str = "Motion detected!";
const WATCH_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no frames available")]
    BufferEmpty,
    #[error("monitoring is not running")]
    NotRunning,
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub scan_frames: usize,
    pub scan_interval: Duration,
    pub clip_length: Duration,
    pub max_clip_length: Duration,
    pub fps: u32,
    pub quiet_hours: QuietHours,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scan_frames: config.motion.scan_frames,
            scan_interval: Duration::from_millis(config.motion.scan_interval_ms),
            clip_length: Duration::from_secs(config.notification.clip_seconds),
            max_clip_length: Duration::from_secs(config.video.max_duration_secs),
            fps: config.stream.fps,
            quiet_hours: config.quiet_hours(),
        }
    }
}

struct Watch<S: FrameSource> {
    capture: Arc<CaptureCoordinator<S>>,
    detector: Arc<Mutex<MotionDetector>>,
    encoder: ClipEncoder,
    events: mpsc::Sender<Notification>,
    settings: MonitorSettings,
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// What the command surface talks to: starts and stops capture plus the
/// motion watch, and turns buffered frames into snapshots and clips.
pub struct MonitorService<S: FrameSource> {
    watch: Arc<Watch<S>>,
    handle: tokio::sync::Mutex<Option<WatchHandle>>,
}

impl<S: FrameSource> MonitorService<S> {
    pub fn new(
        capture: Arc<CaptureCoordinator<S>>,
        detector: MotionDetector,
        encoder: ClipEncoder,
        events: mpsc::Sender<Notification>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            watch: Arc::new(Watch {
                capture,
                detector: Arc::new(Mutex::new(detector)),
                encoder,
                events,
                settings,
            }),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Start capture and the motion watch. Returns whether the camera
    /// connected on the first attempt; monitoring runs either way.
    pub async fn start_monitoring(&self) -> bool {
        let connected = self.watch.capture.start().await;

        let mut handle = self.handle.lock().await;
        if handle.is_none() {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_motion_watch(Arc::clone(&self.watch), cancel.clone()));
            *handle = Some(WatchHandle { cancel, task });
            info!(connected, "monitoring started");
        }
        connected
    }

    /// Stop the motion watch, then capture. Safe to call when stopped.
    pub async fn stop_monitoring(&self) {
        if let Some(WatchHandle { cancel, mut task }) = self.handle.lock().await.take() {
            cancel.cancel();
            if tokio::time::timeout(WATCH_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("motion watch did not stop in time, aborting");
                task.abort();
            }
            info!("monitoring stopped");
        }
        self.watch.capture.stop().await;
    }

    pub fn status(&self) -> CaptureStatus {
        self.watch.capture.status()
    }

    /// JPEG of the newest buffered frame.
    pub async fn snapshot(&self) -> Result<OutputFile, CaptureError> {
        self.ensure_running()?;
        let frame = self.watch.capture.latest().ok_or(CaptureError::BufferEmpty)?;
        Ok(self.watch.encoder.still(&frame).await?)
    }

    /// MP4 of the last `duration` (capped at the configured maximum).
    pub async fn request_clip(&self, duration: Duration) -> Result<OutputFile, CaptureError> {
        self.ensure_running()?;
        self.watch.clip(duration).await
    }

    fn ensure_running(&self) -> Result<(), CaptureError> {
        if self.watch.capture.status().running() {
            Ok(())
        } else {
            Err(CaptureError::NotRunning)
        }
    }
}

impl<S: FrameSource> Watch<S> {
    async fn clip(&self, duration: Duration) -> Result<OutputFile, CaptureError> {
        let frames = self.capture.recent(self.capture.buffer().capacity());
        if frames.is_empty() {
            return Err(CaptureError::BufferEmpty);
        }
        let file = self
            .encoder
            .clip(&frames, duration, self.settings.max_clip_length, self.settings.fps)
            .await?;
        Ok(file)
    }

    /// Run the detector over the newest frames on the blocking pool.
    async fn scan(&self) -> bool {
        let frames = self.capture.recent(self.settings.scan_frames);
        if frames.len() < 2 {
            return false;
        }
        let detector = Arc::clone(&self.detector);
        let scanned = tokio::task::spawn_blocking(move || {
            detector
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .detect_in_sequence(&frames)
        })
        .await;
        match scanned {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "motion detection task failed");
                false
            }
        }
    }

    async fn report_motion(&self, quiet: bool) {
        if quiet {
            info!(
                quiet_start = self.settings.quiet_hours.start,
                quiet_end = self.settings.quiet_hours.end,
                "motion detected during quiet hours, not notifying"
            );
            return;
        }
        info!("motion detected");

        let clip = match self.clip(self.settings.clip_length).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "failed to encode motion clip, sending caption only");
                None
            }
        };

        // Reserve first so the clip is still owned, and removed, if the
        // channel is closed or the watch is cancelled while waiting.
        match self.events.reserve().await {
            Ok(permit) => permit.send(Notification::Motion {
                clip: clip.map(OutputFile::persist),
                caption: MOTION_CAPTION.into(),
            }),
            Err(_) => warn!("notification channel closed, dropping motion event"),
        }
    }
}

async fn run_motion_watch<S: FrameSource>(watch: Arc<Watch<S>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(watch.settings.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        scan_frames = watch.settings.scan_frames,
        interval = ?watch.settings.scan_interval,
        "motion watch started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !watch.scan().await {
            continue;
        }
        let quiet = watch.settings.quiet_hours.is_active_now();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = watch.report_motion(quiet) => {}
        }
    }
    debug!("motion watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use homecam_capture::{ConnectError, CoordinatorSettings, ReadError};
    use homecam_common::config::VideoQuality;
    use homecam_common::frame::Frame;
    use image::{Rgb, RgbImage};
    use tokio::time::timeout;

    /// Serves 32x24 frames; when `moving`, a bright square blinks on and off.
    struct BlinkingSource {
        moving: bool,
        connected: bool,
        seq: u64,
    }

    impl FrameSource for BlinkingSource {
        async fn connect(&mut self) -> Result<(), ConnectError> {
            self.connected = true;
            Ok(())
        }

        async fn read_frame(&mut self) -> Result<Frame, ReadError> {
            if !self.connected {
                return Err(ReadError::StreamClosed);
            }
            self.seq += 1;
            let mut image = RgbImage::from_pixel(32, 24, Rgb([10, 10, 10]));
            if self.moving && self.seq % 2 == 0 {
                for y in 4..16 {
                    for x in 4..16 {
                        image.put_pixel(x, y, Rgb([240, 240, 240]));
                    }
                }
            }
            Ok(Frame::new(image, self.seq as i64, self.seq))
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn label(&self) -> String {
            "test://blinking".into()
        }
    }

    struct Harness {
        service: MonitorService<BlinkingSource>,
        events: mpsc::Receiver<Notification>,
        dir: tempfile::TempDir,
    }

    fn harness(moving: bool, quiet_hours: QuietHours) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, events) = mpsc::channel(8);
        let capture_settings = CoordinatorSettings {
            buffer_capacity: 100,
            frame_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
            read_retry: Duration::from_millis(100),
            start_wait: Duration::from_secs(1),
            cpu_high_water_percent: f32::MAX,
            load_shed: Duration::ZERO,
            alert_after_failures: 3,
        };
        let source = BlinkingSource {
            moving,
            connected: false,
            seq: 0,
        };
        let capture = Arc::new(CaptureCoordinator::new(source, capture_settings, tx.clone()));
        let encoder = ClipEncoder::new(
            dir.path(),
            "/nonexistent/ffmpeg-binary",
            "h264",
            VideoQuality::Low,
            80,
        );
        let settings = MonitorSettings {
            scan_frames: 4,
            scan_interval: Duration::from_millis(50),
            clip_length: Duration::from_secs(5),
            max_clip_length: Duration::from_secs(60),
            fps: 10,
            quiet_hours,
        };
        let detector = MotionDetector::new(25, 50, Duration::from_secs(300));
        let service = MonitorService::new(capture, detector, encoder, tx, settings);
        Harness {
            service,
            events,
            dir,
        }
    }

    async fn wait_for_frames(service: &MonitorService<BlinkingSource>) {
        for _ in 0..200 {
            if service.status().buffered_frames >= 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no frames buffered");
    }

    #[tokio::test]
    async fn motion_sends_caption_when_clip_fails() {
        let mut h = harness(true, QuietHours::new(0, 0));
        assert!(h.service.start_monitoring().await);

        let event = timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Notification::Motion {
                clip: None,
                caption: "Motion detected!".into()
            }
        );

        // Cooldown holds back a second event.
        assert!(timeout(Duration::from_millis(300), h.events.recv()).await.is_err());
        h.service.stop_monitoring().await;
    }

    #[tokio::test]
    async fn quiet_hours_suppress_notifications() {
        let mut h = harness(true, QuietHours::new(0, 24));
        h.service.start_monitoring().await;
        assert!(timeout(Duration::from_millis(500), h.events.recv()).await.is_err());
        h.service.stop_monitoring().await;
    }

    #[tokio::test]
    async fn still_scene_sends_nothing() {
        let mut h = harness(false, QuietHours::new(0, 0));
        h.service.start_monitoring().await;
        assert!(timeout(Duration::from_millis(500), h.events.recv()).await.is_err());
        h.service.stop_monitoring().await;
    }

    #[tokio::test]
    async fn on_demand_requests_need_running_capture() {
        let h = harness(false, QuietHours::new(0, 0));
        assert!(matches!(h.service.snapshot().await, Err(CaptureError::NotRunning)));
        assert!(matches!(
            h.service.request_clip(Duration::from_secs(5)).await,
            Err(CaptureError::NotRunning)
        ));

        h.service.start_monitoring().await;
        wait_for_frames(&h.service).await;

        let snapshot = h.service.snapshot().await.unwrap();
        assert!(snapshot.path().starts_with(h.dir.path()));
        assert!(snapshot.path().exists());

        let err = h.service.request_clip(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Encode(EncodeError::Spawn(_))));

        h.service.stop_monitoring().await;
        h.service.stop_monitoring().await;
        assert!(!h.service.status().running());
        assert!(matches!(h.service.snapshot().await, Err(CaptureError::NotRunning)));
    }
}
