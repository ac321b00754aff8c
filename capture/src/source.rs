use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use homecam_common::config::{Config, StreamMode};
use homecam_common::frame::Frame;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ffmpeg::FfmpegSource;
use crate::mjpeg::MjpegSource;

static FRAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Next process-wide frame sequence number.
pub(crate) fn next_seq() -> u64 {
    FRAME_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// A connection to a camera that yields decoded frames one at a time.
///
/// All methods are driven from the acquisition task; none of them may block
/// the calling thread. Implementations push blocking work (JPEG decode,
/// subprocess pipes) onto their own tasks.
pub trait FrameSource: Send + 'static {
    /// Open the stream. Calling this while already connected is a no-op.
    fn connect(&mut self) -> impl Future<Output = Result<(), ConnectError>> + Send;

    /// Wait for the next frame.
    fn read_frame(&mut self) -> impl Future<Output = Result<Frame, ReadError>> + Send;

    /// Release the transport. Safe to call repeatedly.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Short human-readable description for logs and alerts.
    fn label(&self) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("stream unavailable at {url}: {reason}")]
    StreamUnavailable { url: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("stream closed")]
    StreamClosed,
    #[error("failed to decode frame: {0}")]
    DecodeError(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

impl ReadError {
    /// Whether the transport should be torn down and reopened after this error.
    /// A single undecodable frame does not justify a reconnect.
    pub fn is_connection_lost(&self) -> bool {
        !matches!(self, ReadError::DecodeError(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Connection state written by the acquisition loop and read by status
/// queries without taking a lock.
#[derive(Debug, Clone, Default)]
pub struct SharedConnectionState(Arc<AtomicU8>);

impl SharedConnectionState {
    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

/// Consecutive connect-failure counter. Every `alert_after` failures in a
/// row it fires once and starts counting again, so a camera that stays down
/// produces one alert per `alert_after` attempts.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    consecutive_failures: u32,
    alert_after: u32,
}

pub const DEFAULT_ALERT_AFTER: u32 = 3;

impl ConnectionHealth {
    pub fn new(alert_after: u32) -> Self {
        Self {
            consecutive_failures: 0,
            alert_after: alert_after.max(1),
        }
    }

    /// Count a failed attempt. Returns `true` when an alert should be raised.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.alert_after {
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_AFTER)
    }
}

/// Latest-value channel fed by a background reader task.
///
/// The reader overwrites the slot as fast as the camera delivers; a consumer
/// that falls behind skips stale values instead of building up latency.
/// Dropping the feed aborts the reader.
pub(crate) struct LatestFeed<T> {
    rx: watch::Receiver<Option<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> LatestFeed<T> {
    pub fn spawn<F, Fut>(reader: F) -> Self
    where
        F: FnOnce(watch::Sender<Option<T>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(reader(tx));
        Self { rx, task }
    }

    /// Wait for a value newer than the last one returned. `None` once the
    /// reader has finished and every value has been seen.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

impl<T> Drop for LatestFeed<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The configured camera transport.
pub enum StreamSource {
    Mjpeg(MjpegSource),
    Ffmpeg(FfmpegSource),
}

impl StreamSource {
    pub fn from_config(config: &Config) -> Self {
        let stream = &config.stream;
        let use_mjpeg = match stream.mode {
            StreamMode::Mjpeg => true,
            StreamMode::Ffmpeg => false,
            StreamMode::Auto => {
                stream.url.starts_with("http://") || stream.url.starts_with("https://")
            }
        };
        let connect_timeout = Duration::from_secs(stream.connect_timeout_secs);
        if use_mjpeg {
            StreamSource::Mjpeg(MjpegSource::new(&stream.url, connect_timeout))
        } else {
            StreamSource::Ffmpeg(FfmpegSource::new(
                &stream.url,
                &config.video.ffmpeg_path,
                (stream.width, stream.height),
                stream.fps,
                connect_timeout,
            ))
        }
    }
}

impl FrameSource for StreamSource {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        match self {
            StreamSource::Mjpeg(source) => source.connect().await,
            StreamSource::Ffmpeg(source) => source.connect().await,
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, ReadError> {
        match self {
            StreamSource::Mjpeg(source) => source.read_frame().await,
            StreamSource::Ffmpeg(source) => source.read_frame().await,
        }
    }

    fn disconnect(&mut self) {
        match self {
            StreamSource::Mjpeg(source) => source.disconnect(),
            StreamSource::Ffmpeg(source) => source.disconnect(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            StreamSource::Mjpeg(source) => source.is_connected(),
            StreamSource::Ffmpeg(source) => source.is_connected(),
        }
    }

    fn label(&self) -> String {
        match self {
            StreamSource::Mjpeg(source) => source.label(),
            StreamSource::Ffmpeg(source) => source.label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_raise_one_alert() {
        let mut health = ConnectionHealth::default();
        let alerts: Vec<bool> = (0..3).map(|_| health.record_failure()).collect();
        assert_eq!(alerts, vec![false, false, true]);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn six_failures_raise_two_alerts() {
        let mut health = ConnectionHealth::default();
        let alerts = (0..6).filter(|_| health.record_failure()).count();
        assert_eq!(alerts, 2);
    }

    #[test]
    fn success_resets_the_count() {
        let mut health = ConnectionHealth::default();
        health.record_failure();
        health.record_failure();
        health.record_success();
        assert!(!health.record_failure());
        assert!(!health.record_failure());
        assert!(health.record_failure());
    }

    #[test]
    fn decode_errors_keep_the_connection() {
        assert!(!ReadError::DecodeError("bad jpeg".into()).is_connection_lost());
        assert!(ReadError::StreamClosed.is_connection_lost());
        assert!(ReadError::Timeout(Duration::from_secs(1)).is_connection_lost());
    }

    #[test]
    fn shared_state_roundtrip() {
        let state = SharedConnectionState::default();
        assert_eq!(state.get(), ConnectionState::Disconnected);
        let reader = state.clone();
        state.set(ConnectionState::Connected);
        assert!(reader.is_connected());
        state.set(ConnectionState::Connecting);
        assert_eq!(reader.get().as_str(), "connecting");
    }

    #[tokio::test]
    async fn latest_feed_ends_when_reader_finishes() {
        let mut feed = LatestFeed::spawn(|tx| async move {
            let _ = tx.send(Some(1u32));
        });
        assert_eq!(feed.next().await, Some(1));
        assert_eq!(feed.next().await, None);
        assert!(!feed.is_alive());
    }

    #[test]
    fn auto_mode_picks_transport_by_scheme() {
        let http = homecam_common::config::Config::from_toml(
            "[stream]\nurl = \"http://cam.local/stream\"\n",
        )
        .unwrap();
        assert!(matches!(StreamSource::from_config(&http), StreamSource::Mjpeg(_)));

        let rtsp = homecam_common::config::Config::from_toml(
            "[stream]\nurl = \"rtsp://cam.local/live\"\n",
        )
        .unwrap();
        assert!(matches!(StreamSource::from_config(&rtsp), StreamSource::Ffmpeg(_)));
    }
}
