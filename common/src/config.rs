use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// `http(s)://` URLs use the MJPEG reader, everything else goes through ffmpeg.
    Auto,
    Mjpeg,
    Ffmpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: StreamMode,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_read_retry_ms")]
    pub read_retry_ms: u64,
}

/// Motion gate. Only `threshold` and `min_area` take part in the decision;
/// `sensitivity` is range-checked and kept for future weighting.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_scan_frames")]
    pub scan_frames: usize,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_quiet_start")]
    pub quiet_hours_start: u32,
    #[serde(default = "default_quiet_end")]
    pub quiet_hours_end: u32,
    #[serde(default = "default_clip_seconds")]
    pub clip_seconds: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

impl VideoQuality {
    /// x264/x265 constant rate factor for this quality level.
    pub fn crf(self) -> u32 {
        match self {
            VideoQuality::Low => 30,
            VideoQuality::Medium => 23,
            VideoQuality::High => 18,
        }
    }

    pub fn preset(self) -> &'static str {
        match self {
            VideoQuality::Low => "ultrafast",
            VideoQuality::Medium => "veryfast",
            VideoQuality::High => "medium",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_quality")]
    pub quality: VideoQuality,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_cpu_high_water")]
    pub cpu_high_water_percent: f32,
    #[serde(default = "default_load_shed_ms")]
    pub load_shed_ms: u64,
    /// How long `start` waits for the first connection attempt.
    #[serde(default = "default_start_wait_ms")]
    pub start_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to daily-rolled files in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &'static str, reason: String| {
            if !ok {
                errors.push(FieldError { field, reason });
            }
        };

        check(
            !self.stream.url.trim().is_empty(),
            "stream.url",
            "must not be empty".into(),
        );
        check(
            (1..=60).contains(&self.stream.fps),
            "stream.fps",
            format!("must be between 1 and 60, got {}", self.stream.fps),
        );
        check(
            self.stream.width > 0 && self.stream.width % 2 == 0,
            "stream.width",
            format!("must be a positive even number, got {}", self.stream.width),
        );
        check(
            self.stream.height > 0 && self.stream.height % 2 == 0,
            "stream.height",
            format!("must be a positive even number, got {}", self.stream.height),
        );
        check(
            self.stream.connect_timeout_secs > 0,
            "stream.connect_timeout_secs",
            "must be greater than 0".into(),
        );
        check(
            self.stream.read_timeout_secs > 0,
            "stream.read_timeout_secs",
            "must be greater than 0".into(),
        );
        check(
            self.stream.reconnect_backoff_secs > 0,
            "stream.reconnect_backoff_secs",
            "must be greater than 0".into(),
        );
        check(
            self.stream.read_retry_ms > 0,
            "stream.read_retry_ms",
            "must be greater than 0".into(),
        );
        check(
            self.motion.threshold <= 255,
            "motion.threshold",
            format!("must be between 0 and 255, got {}", self.motion.threshold),
        );
        check(
            self.motion.min_area > 0,
            "motion.min_area",
            "must be greater than 0".into(),
        );
        check(
            (0.0..=1.0).contains(&self.motion.sensitivity),
            "motion.sensitivity",
            format!("must be between 0.0 and 1.0, got {}", self.motion.sensitivity),
        );
        check(
            self.motion.scan_frames >= 2,
            "motion.scan_frames",
            format!("must be at least 2, got {}", self.motion.scan_frames),
        );
        check(
            self.motion.scan_interval_ms > 0,
            "motion.scan_interval_ms",
            "must be greater than 0".into(),
        );
        check(
            self.notification.quiet_hours_start <= 23,
            "notification.quiet_hours_start",
            format!("must be between 0 and 23, got {}", self.notification.quiet_hours_start),
        );
        check(
            self.notification.quiet_hours_end <= 23,
            "notification.quiet_hours_end",
            format!("must be between 0 and 23, got {}", self.notification.quiet_hours_end),
        );
        check(
            self.notification.clip_seconds > 0,
            "notification.clip_seconds",
            "must be greater than 0".into(),
        );
        check(
            self.video.buffer_seconds > 0,
            "video.buffer_seconds",
            "must be greater than 0".into(),
        );
        check(
            self.video.max_duration_secs > 0,
            "video.max_duration_secs",
            "must be greater than 0".into(),
        );
        check(
            matches!(self.video.codec.as_str(), "h264" | "h265"),
            "video.codec",
            format!("expected 'h264' or 'h265', got '{}'", self.video.codec),
        );
        check(
            (1..=100).contains(&self.video.jpeg_quality),
            "video.jpeg_quality",
            format!("must be between 1 and 100, got {}", self.video.jpeg_quality),
        );
        check(
            !self.storage.output_dir.as_os_str().is_empty(),
            "storage.output_dir",
            "must not be empty".into(),
        );
        check(
            self.storage.cleanup_interval_secs > 0,
            "storage.cleanup_interval_secs",
            "must be greater than 0".into(),
        );
        check(
            self.capture.cpu_high_water_percent > 0.0,
            "capture.cpu_high_water_percent",
            "must be greater than 0".into(),
        );
        check(
            self.capture.load_shed_ms > 0,
            "capture.load_shed_ms",
            "must be greater than 0".into(),
        );
        check(
            self.capture.start_wait_ms > 0,
            "capture.start_wait_ms",
            "must be greater than 0".into(),
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Number of frames held by the ring buffer.
    pub fn buffer_capacity(&self) -> usize {
        (self.video.buffer_seconds * u64::from(self.stream.fps)) as usize
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.stream.fps))
    }

    pub fn quiet_hours(&self) -> QuietHours {
        QuietHours::new(
            self.notification.quiet_hours_start,
            self.notification.quiet_hours_end,
        )
    }
}

/// Time-of-day window `[start, end)` in local hours. Wraps past midnight
/// when `start > end`; `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: u32,
    pub end: u32,
}

impl QuietHours {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    pub fn is_active_now(&self) -> bool {
        use chrono::Timelike;
        self.contains(chrono::Local::now().hour())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {}", join_fields(.0))]
    Invalid(Vec<FieldError>),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_area: default_min_area(),
            sensitivity: default_sensitivity(),
            cooldown_secs: default_cooldown(),
            scan_frames: default_scan_frames(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            quiet_hours_start: default_quiet_start(),
            quiet_hours_end: default_quiet_end(),
            clip_seconds: default_clip_seconds(),
            webhook_url: None,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: default_buffer_seconds(),
            max_duration_secs: default_max_duration(),
            quality: default_quality(),
            codec: default_codec(),
            ffmpeg_path: default_ffmpeg_path(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_size_mb: default_max_size_mb(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cpu_high_water_percent: default_cpu_high_water(),
            load_shed_ms: default_load_shed_ms(),
            start_wait_ms: default_start_wait_ms(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

// Default value functions
fn default_mode() -> StreamMode {
    StreamMode::Auto
}
fn default_fps() -> u32 {
    10
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    10
}
fn default_reconnect_backoff() -> u64 {
    5
}
fn default_read_retry_ms() -> u64 {
    1000
}
fn default_threshold() -> u32 {
    25
}
fn default_min_area() -> u32 {
    500
}
fn default_sensitivity() -> f64 {
    0.5
}
fn default_cooldown() -> u64 {
    300
}
fn default_scan_frames() -> usize {
    10
}
fn default_scan_interval_ms() -> u64 {
    1000
}
fn default_quiet_start() -> u32 {
    22
}
fn default_quiet_end() -> u32 {
    7
}
fn default_clip_seconds() -> u64 {
    5
}
fn default_buffer_seconds() -> u64 {
    30
}
fn default_max_duration() -> u64 {
    60
}
fn default_quality() -> VideoQuality {
    VideoQuality::Medium
}
fn default_codec() -> String {
    "h264".into()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./cache")
}
fn default_max_size_mb() -> u64 {
    500
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_cpu_high_water() -> f32 {
    80.0
}
fn default_load_shed_ms() -> u64 {
    500
}
fn default_start_wait_ms() -> u64 {
    2000
}
fn default_listen_addr() -> String {
    "127.0.0.1:8080".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [stream]
        url = "rtsp://camera.local/stream"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.stream.mode, StreamMode::Auto);
        assert_eq!(config.stream.fps, 10);
        assert_eq!(config.video.buffer_seconds, 30);
        assert_eq!(config.buffer_capacity(), 300);
        assert_eq!(config.notification.quiet_hours_start, 22);
        assert_eq!(config.notification.quiet_hours_end, 7);
        assert_eq!(config.video.quality, VideoQuality::Medium);
        assert!(config.notification.webhook_url.is_none());
    }

    #[test]
    fn missing_stream_section_is_parse_error() {
        let err = Config::from_toml("[motion]\nthreshold = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn validation_reports_every_invalid_field() {
        let toml = r#"
            [stream]
            url = ""
            fps = 0
            reconnect_backoff_secs = 0
            read_retry_ms = 0

            [motion]
            threshold = 300
            sensitivity = 1.5
            scan_interval_ms = 0

            [notification]
            quiet_hours_end = 24

            [capture]
            load_shed_ms = 0
            start_wait_ms = 0
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        let ConfigError::Invalid(fields) = err else {
            panic!("expected Invalid, got {err:?}");
        };
        let names: Vec<_> = fields.iter().map(|f| f.field).collect();
        assert_eq!(
            names,
            vec![
                "stream.url",
                "stream.fps",
                "stream.reconnect_backoff_secs",
                "stream.read_retry_ms",
                "motion.threshold",
                "motion.sensitivity",
                "motion.scan_interval_ms",
                "notification.quiet_hours_end",
                "capture.load_shed_ms",
                "capture.start_wait_ms",
            ]
        );
    }

    #[test]
    fn zero_loop_intervals_are_rejected() {
        let toml = "[stream]\nurl = \"rtsp://x\"\nreconnect_backoff_secs = 0\n[motion]\nscan_interval_ms = 0\n";
        let err = Config::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("stream.reconnect_backoff_secs"), "{msg}");
        assert!(msg.contains("motion.scan_interval_ms"), "{msg}");
    }

    #[test]
    fn invalid_error_message_lists_fields() {
        let err = Config::from_toml("[stream]\nurl = \"x\"\n[video]\ncodec = \"vp9\"\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("video.codec"), "{msg}");
    }

    #[test]
    fn quiet_hours_wrap_past_midnight() {
        let quiet = QuietHours::new(22, 7);
        assert!(quiet.contains(23));
        assert!(!quiet.contains(8));
        assert!(quiet.contains(22));
        assert!(quiet.contains(6));
        assert!(!quiet.contains(7));
        assert!(quiet.contains(0));
    }

    #[test]
    fn quiet_hours_same_day_window() {
        let quiet = QuietHours::new(9, 17);
        assert!(!quiet.contains(8));
        assert!(quiet.contains(9));
        assert!(quiet.contains(16));
        assert!(!quiet.contains(17));
    }

    #[test]
    fn quiet_hours_equal_bounds_never_quiet() {
        let quiet = QuietHours::new(5, 5);
        assert!((0..24).all(|h| !quiet.contains(h)));
    }

    #[test]
    fn quality_maps_to_crf() {
        assert!(VideoQuality::High.crf() < VideoQuality::Medium.crf());
        assert!(VideoQuality::Medium.crf() < VideoQuality::Low.crf());
    }
}
