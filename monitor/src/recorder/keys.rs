use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn fmt_ts(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Random suffix so concurrent requests for the same frame never collide.
fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// e.g. "cache/snapshot_20260218T093000000Z_3f2a9c01b7de.jpg"
pub fn still_path(dir: &Path, captured_at_ms: i64) -> PathBuf {
    dir.join(format!(
        "snapshot_{ts}_{suffix}.jpg",
        ts = fmt_ts(captured_at_ms),
        suffix = unique_suffix(),
    ))
}

/// e.g. "cache/clip_20260218T093000000Z_3f2a9c01b7de.mp4", stamped with the
/// capture time of the clip's last frame.
pub fn clip_path(dir: &Path, end_ms: i64) -> PathBuf {
    dir.join(format!(
        "clip_{ts}_{suffix}.mp4",
        ts = fmt_ts(end_ms),
        suffix = unique_suffix(),
    ))
}
