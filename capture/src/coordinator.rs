use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use homecam_common::config::Config;
use homecam_common::event::Notification;
use homecam_common::frame::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::FrameBuffer;
use crate::load::{CpuLoad, LoadProbe};
use crate::source::{
    ConnectError, ConnectionHealth, ConnectionState, FrameSource, ReadError,
    SharedConnectionState, DEFAULT_ALERT_AFTER,
};

/// How long `stop` waits for the acquisition loop before aborting it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl CaptureState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub buffer_capacity: usize,
    pub frame_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub read_retry: Duration,
    pub start_wait: Duration,
    pub cpu_high_water_percent: f32,
    pub load_shed: Duration,
    pub alert_after_failures: u32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_capacity: config.buffer_capacity(),
            frame_interval: config.frame_interval(),
            connect_timeout: Duration::from_secs(config.stream.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.stream.read_timeout_secs),
            reconnect_backoff: Duration::from_secs(config.stream.reconnect_backoff_secs),
            read_retry: Duration::from_millis(config.stream.read_retry_ms),
            start_wait: Duration::from_millis(config.capture.start_wait_ms),
            cpu_high_water_percent: config.capture.cpu_high_water_percent,
            load_shed: Duration::from_millis(config.capture.load_shed_ms),
            alert_after_failures: DEFAULT_ALERT_AFTER,
        }
    }
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub connection: ConnectionState,
    pub buffered_frames: usize,
}

impl CaptureStatus {
    pub fn running(&self) -> bool {
        self.state == CaptureState::Running
    }

    pub fn connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Running, but the camera is currently unreachable.
    pub fn is_degraded(&self) -> bool {
        self.running() && !self.connected()
    }
}

/// State shared between the coordinator and its acquisition task.
struct Shared<S> {
    source: tokio::sync::Mutex<S>,
    buffer: Arc<FrameBuffer>,
    connection: SharedConnectionState,
    health: Mutex<ConnectionHealth>,
    load: Mutex<Box<dyn LoadProbe>>,
    events: mpsc::Sender<Notification>,
    settings: CoordinatorSettings,
    label: String,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs the camera → ring buffer acquisition loop and exposes read-only
/// accessors to everything else.
///
/// `Idle → Starting → Running → Stopping → Idle`. While `Running` the source
/// may be disconnected (degraded); the loop keeps reconnecting until stopped.
pub struct CaptureCoordinator<S: FrameSource> {
    shared: Arc<Shared<S>>,
    state: Mutex<CaptureState>,
    control: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl<S: FrameSource> CaptureCoordinator<S> {
    pub fn new(
        source: S,
        settings: CoordinatorSettings,
        events: mpsc::Sender<Notification>,
    ) -> Self {
        Self::with_load_probe(source, settings, events, Box::new(CpuLoad::new()))
    }

    /// Like `new`, with a custom load reading for the shedding check.
    pub fn with_load_probe(
        source: S,
        settings: CoordinatorSettings,
        events: mpsc::Sender<Notification>,
        load: Box<dyn LoadProbe>,
    ) -> Self {
        let label = source.label();
        let shared = Shared {
            source: tokio::sync::Mutex::new(source),
            buffer: Arc::new(FrameBuffer::new(settings.buffer_capacity)),
            connection: SharedConnectionState::default(),
            health: Mutex::new(ConnectionHealth::new(settings.alert_after_failures)),
            load: Mutex::new(load),
            events,
            settings,
            label,
        };
        Self {
            shared: Arc::new(shared),
            state: Mutex::new(CaptureState::Idle),
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// Start capturing. Makes one bounded connection attempt, then launches
    /// the acquisition loop whatever its outcome, so a camera that comes up
    /// later is still picked up. Returns whether the first attempt connected.
    /// A no-op when already started.
    pub async fn start(&self) -> bool {
        let mut control = self.control.lock().await;
        if control.is_some() {
            debug!(source = %self.shared.label, "capture already running");
            return self.is_connected();
        }

        self.set_state(CaptureState::Starting);
        self.shared.buffer.clear();
        info!(
            source = %self.shared.label,
            capacity = self.shared.buffer.capacity(),
            "starting capture"
        );

        let connected = {
            let mut source = self.shared.source.lock().await;
            self.shared
                .connect(&mut source, self.shared.settings.start_wait)
                .await
                .is_ok()
        };
        if !connected {
            warn!(
                source = %self.shared.label,
                "initial connection failed, capture keeps retrying in the background"
            );
        }

        let initial_pause = if connected {
            Duration::ZERO
        } else {
            self.shared.settings.reconnect_backoff
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_acquisition(
            Arc::clone(&self.shared),
            cancel.clone(),
            initial_pause,
        ));
        *control = Some(LoopHandle { cancel, task });
        self.set_state(CaptureState::Running);
        connected
    }

    /// Stop capturing: cancel the loop, wait for it (bounded), then release
    /// the transport. A no-op when not running.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(LoopHandle { cancel, mut task }) = control.take() else {
            debug!(source = %self.shared.label, "capture not running");
            return;
        };

        self.set_state(CaptureState::Stopping);
        cancel.cancel();
        if timeout(STOP_JOIN_TIMEOUT, &mut task).await.is_err() {
            warn!(
                source = %self.shared.label,
                timeout = ?STOP_JOIN_TIMEOUT,
                "acquisition loop did not stop in time, aborting"
            );
            task.abort();
            let _ = task.await;
        }

        // The loop has released the source; only now is it safe to close it.
        self.shared.source.lock().await.disconnect();
        self.shared.connection.set(ConnectionState::Disconnected);
        self.set_state(CaptureState::Idle);
        info!(source = %self.shared.label, "capture stopped");
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.get()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            state: self.state(),
            connection: self.connection_state(),
            buffered_frames: self.shared.buffer.size(),
        }
    }

    /// Snapshot of the last `n` frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Frame> {
        self.shared.buffer.recent(n)
    }

    pub fn latest(&self) -> Option<Frame> {
        self.shared.buffer.latest()
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.shared.buffer
    }
}

impl<S: FrameSource> Drop for CaptureCoordinator<S> {
    fn drop(&mut self) {
        if let Ok(control) = self.control.try_lock() {
            if let Some(handle) = control.as_ref() {
                handle.cancel.cancel();
            }
        }
    }
}

impl<S: FrameSource> Shared<S> {
    fn health(&self) -> MutexGuard<'_, ConnectionHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_percent(&self) -> f32 {
        self.load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .percent()
    }

    async fn connect(&self, source: &mut S, limit: Duration) -> Result<(), ConnectError> {
        self.connection.set(ConnectionState::Connecting);
        let result = match timeout(limit, source.connect()).await {
            Ok(result) => result,
            Err(_) => {
                source.disconnect();
                Err(ConnectError::StreamUnavailable {
                    url: self.label.clone(),
                    reason: format!("no connection within {limit:?}"),
                })
            }
        };

        match &result {
            Ok(()) => {
                self.health().record_success();
                self.connection.set(ConnectionState::Connected);
                info!(source = %self.label, "stream connected");
            }
            Err(e) => {
                self.connection.set(ConnectionState::Disconnected);
                let alert = self.health().record_failure();
                warn!(
                    source = %self.label,
                    error = %e,
                    retry_in = ?self.settings.reconnect_backoff,
                    "failed to connect to stream"
                );
                if alert {
                    self.publish_degraded();
                }
            }
        }
        result
    }

    fn publish_degraded(&self) {
        let message = format!(
            "Camera stream {} unreachable after {} consecutive attempts, still retrying every {}s",
            self.label,
            self.settings.alert_after_failures,
            self.settings.reconnect_backoff.as_secs()
        );
        error!(source = %self.label, "{message}");
        if let Err(e) = self
            .events
            .try_send(Notification::HealthDegraded { message })
        {
            warn!(error = %e, "dropping health alert");
        }
    }

    /// One iteration: ensure a connection, read a frame, buffer it. Returns
    /// how long to pause before the next iteration.
    async fn acquire_once(&self, source: &mut S) -> Duration {
        if !source.is_connected()
            && self
                .connect(source, self.settings.connect_timeout)
                .await
                .is_err()
        {
            return self.settings.reconnect_backoff;
        }

        match timeout(self.settings.read_timeout, source.read_frame()).await {
            Ok(Ok(frame)) => {
                self.buffer.push(frame);
                self.settings.frame_interval
            }
            Ok(Err(e)) => self.read_failed(source, e),
            Err(_) => self.read_failed(source, ReadError::Timeout(self.settings.read_timeout)),
        }
    }

    fn read_failed(&self, source: &mut S, error: ReadError) -> Duration {
        warn!(source = %self.label, error = %error, "failed to read frame");
        if error.is_connection_lost() {
            source.disconnect();
            self.connection.set(ConnectionState::Disconnected);
        }
        self.settings.read_retry
    }
}

/// The acquisition loop. Holds the source for its whole lifetime, checks the
/// cancellation token at every suspension point, and never exits on error.
async fn run_acquisition<S: FrameSource>(
    shared: Arc<Shared<S>>,
    cancel: CancellationToken,
    initial_pause: Duration,
) {
    let mut source = shared.source.lock().await;
    info!(source = %shared.label, "acquisition loop started");

    let mut pause = initial_pause;
    loop {
        if !pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(shared.acquire_once(&mut source)).catch_unwind() => outcome,
        };

        pause = match outcome {
            Ok(pause) => pause,
            Err(_) => {
                error!(source = %shared.label, "acquisition step panicked, resetting stream");
                source.disconnect();
                shared.connection.set(ConnectionState::Disconnected);
                shared.settings.reconnect_backoff
            }
        };

        let cpu = shared.load_percent();
        if cpu > shared.settings.cpu_high_water_percent {
            warn!(cpu_percent = cpu, "high CPU usage, slowing capture");
            pause += shared.settings.load_shed;
        }
    }

    info!(source = %shared.label, "acquisition loop stopped");
}
