use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use homecam_common::config::{Config, VideoQuality};
use homecam_common::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::keys;
use super::output::OutputFile;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("no frames to encode")]
    NoFrames,
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("failed to encode still image: {0}")]
    Image(#[from] image::ImageError),
    #[error("output file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns buffered frames into files in the output directory: JPEG stills
/// via the `image` crate, H.264/H.265 MP4 clips via an ffmpeg subprocess.
///
/// Holds no per-request state; concurrent calls are fine since every output
/// gets a unique name.
#[derive(Debug, Clone)]
pub struct ClipEncoder {
    output_dir: PathBuf,
    ffmpeg_path: String,
    codec: String,
    quality: VideoQuality,
    jpeg_quality: u8,
}

impl ClipEncoder {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        ffmpeg_path: &str,
        codec: &str,
        quality: VideoQuality,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            ffmpeg_path: ffmpeg_path.to_string(),
            codec: codec.to_string(),
            quality,
            jpeg_quality,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.storage.output_dir,
            &config.video.ffmpeg_path,
            &config.video.codec,
            config.video.quality,
            config.video.jpeg_quality,
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write one frame as a JPEG.
    pub async fn still(&self, frame: &Frame) -> Result<OutputFile, EncodeError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = keys::still_path(&self.output_dir, frame.captured_at_ms);
        let output = OutputFile::new(path.clone());

        let frame = frame.clone();
        let quality = self.jpeg_quality;
        tokio::task::spawn_blocking(move || write_jpeg(&frame, &path, quality))
            .await
            .map_err(|e| EncodeError::Io(std::io::Error::other(e)))??;

        debug!(path = %output.path().display(), "still written");
        Ok(output)
    }

    /// Encode the newest `min(requested, max) × fps` frames as a
    /// constant-frame-rate MP4. Fails with `NoFrames` when nothing is left
    /// to encode. A failed encode leaves no file behind.
    pub async fn clip(
        &self,
        frames: &[Frame],
        requested: Duration,
        max: Duration,
        fps: u32,
    ) -> Result<OutputFile, EncodeError> {
        let selected = select_clip_frames(frames, requested, max, fps);
        let Some(last) = selected.last() else {
            return Err(EncodeError::NoFrames);
        };

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = OutputFile::new(keys::clip_path(&self.output_dir, last.captured_at_ms));
        let (width, height) = last.dimensions();

        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.clip_args(width, height, fps, output.path()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EncodeError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Spawn("could not get stdin handle".into()))?;

        debug!(
            codec = self.codec,
            crf = self.quality.crf(),
            width,
            height,
            fps,
            frames = selected.len(),
            output = %output.path().display(),
            "ffmpeg encoder started"
        );

        for frame in selected {
            stdin
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| EncodeError::Write(e.to_string()))?;
        }
        // Close stdin so ffmpeg knows there are no more frames.
        drop(stdin);

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| EncodeError::Wait(e.to_string()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            return Err(EncodeError::FfmpegFailed(stderr.into_owned()));
        }

        info!(
            frames = selected.len(),
            seconds = format!("{:.1}", selected.len() as f64 / f64::from(fps.max(1))),
            path = %output.path().display(),
            "clip encoding complete"
        );
        Ok(output)
    }

    fn clip_args(&self, width: u32, height: u32, fps: u32, output: &Path) -> Vec<String> {
        let vcodec = match self.codec.as_str() {
            "h265" => "libx265",
            _ => "libx264",
        };
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            vcodec.into(),
            "-preset".into(),
            self.quality.preset().into(),
            "-crf".into(),
            self.quality.crf().to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            output.display().to_string(),
        ]
    }
}

/// The tail of `frames` a clip of `min(requested, max)` seconds at `fps`
/// covers. Frames before a resolution change are dropped, since a rawvideo
/// stream has a single frame size.
pub fn select_clip_frames(frames: &[Frame], requested: Duration, max: Duration, fps: u32) -> &[Frame] {
    let seconds = requested.min(max).as_secs_f64();
    let wanted = (seconds * f64::from(fps)).round() as usize;
    let tail = &frames[frames.len().saturating_sub(wanted)..];

    let Some(last) = tail.last() else {
        return tail;
    };
    let size = last.dimensions();
    let start = tail
        .iter()
        .rposition(|f| f.dimensions() != size)
        .map_or(0, |i| i + 1);
    &tail[start..]
}

fn write_jpeg(frame: &Frame, path: &Path, quality: u8) -> Result<(), EncodeError> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(frame.image())?;
    writer.flush()?;
    Ok(())
}

/// Check whether ffmpeg can be run. Logs a warning if not.
pub async fn check_ffmpeg_available(ffmpeg_path: &str) {
    match Command::new(ffmpeg_path).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(ffmpeg_path, "ffmpeg is available");
        }
        Ok(_) => {
            warn!(ffmpeg_path, "ffmpeg returned non-zero for -version; clip encoding may fail");
        }
        Err(e) => {
            warn!(
                ffmpeg_path,
                error = %e,
                "ffmpeg not found; clips and ffmpeg-decoded streams will fail. \
                 Install ffmpeg with libx264/libx265 support."
            );
        }
    }
}
