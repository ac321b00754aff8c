use chrono::Utc;
use homecam_common::frame::Frame;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::source::{next_seq, ConnectError, FrameSource, LatestFeed, ReadError};

/// Any stream ffmpeg can open (RTSP cameras, files, HLS), decoded by an
/// ffmpeg subprocess into fixed-size `rgb24` rawvideo on stdout.
pub struct FfmpegSource {
    url: String,
    ffmpeg_path: String,
    size: (u32, u32),
    fps: u32,
    connect_timeout: Duration,
    feed: Option<LatestFeed<Frame>>,
    /// First frame, received while connecting.
    pending: Option<Frame>,
}

impl FfmpegSource {
    pub fn new(
        url: &str,
        ffmpeg_path: &str,
        size: (u32, u32),
        fps: u32,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            ffmpeg_path: ffmpeg_path.to_string(),
            size,
            fps,
            connect_timeout,
            feed: None,
            pending: None,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> ConnectError {
        ConnectError::StreamUnavailable {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    fn decoder_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-i".into(),
            self.url.clone(),
            "-an".into(),
            "-vf".into(),
            format!("scale={}:{}", self.size.0, self.size.1),
            "-r".into(),
            self.fps.to_string(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

impl FrameSource for FfmpegSource {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        self.disconnect();

        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.decoder_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.unavailable("could not get ffmpeg stdout handle"))?;

        debug!(url = self.url, width = self.size.0, height = self.size.1, "ffmpeg decoder started");

        let size = self.size;
        let url = self.url.clone();
        let mut feed = LatestFeed::spawn(move |tx| read_rawvideo(child, stdout, size, url, tx));

        // ffmpeg starts even for a dead URL; the stream is only "open" once a frame decodes.
        match tokio::time::timeout(self.connect_timeout, feed.next()).await {
            Ok(Some(frame)) => {
                info!(url = self.url, "connected to stream via ffmpeg");
                self.pending = Some(frame);
                self.feed = Some(feed);
                Ok(())
            }
            Ok(None) => Err(self.unavailable("ffmpeg exited before the first frame")),
            Err(_) => Err(self.unavailable(format!(
                "no frame within {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, ReadError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        let feed = self.feed.as_mut().ok_or(ReadError::StreamClosed)?;
        match feed.next().await {
            Some(frame) => Ok(frame),
            None => {
                self.feed = None;
                Err(ReadError::StreamClosed)
            }
        }
    }

    fn disconnect(&mut self) {
        self.pending = None;
        if self.feed.take().is_some() {
            info!(url = self.url, "ffmpeg decoder stopped");
        }
    }

    fn is_connected(&self) -> bool {
        self.feed.as_ref().is_some_and(LatestFeed::is_alive)
    }

    fn label(&self) -> String {
        self.url.clone()
    }
}

/// Reader task: slice ffmpeg's stdout into whole frames.
async fn read_rawvideo(
    mut child: Child,
    mut stdout: ChildStdout,
    size: (u32, u32),
    url: String,
    tx: watch::Sender<Option<Frame>>,
) {
    let frame_bytes = size.0 as usize * size.1 as usize * 3;
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        if let Err(e) = stdout.read_exact(&mut buffer).await {
            warn!(url, error = %e, "ffmpeg stream ended");
            break;
        }
        let Some(frame) = Frame::from_rgb(
            size.0,
            size.1,
            buffer,
            Utc::now().timestamp_millis(),
            next_seq(),
        ) else {
            break;
        };
        if tx.send(Some(frame)).is_err() {
            break;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
