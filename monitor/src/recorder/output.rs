use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file written for a caller. The file is removed when the handle is
/// dropped, unless ownership of the path is taken with [`OutputFile::persist`].
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    keep: bool,
}

impl OutputFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the file over; the caller becomes responsible for removing it.
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed output file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove output file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"data").unwrap();

        drop(OutputFile::new(path.clone()));
        assert!(!path.exists());
    }

    #[test]
    fn persisted_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.jpg");
        std::fs::write(&path, b"data").unwrap();

        let kept = OutputFile::new(path.clone()).persist();
        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        drop(OutputFile::new(dir.path().join("never-written.mp4")));
    }
}
