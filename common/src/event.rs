use std::path::PathBuf;

/// Events pushed from the capture and monitoring pipeline to whatever
/// delivers notifications. Attached files belong to the receiver, which
/// must remove them once the event has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Motion was detected outside quiet hours. `clip` is `None` when the
    /// clip could not be encoded; the caption is then sent on its own.
    Motion {
        clip: Option<PathBuf>,
        caption: String,
    },
    /// The stream failed to connect several times in a row.
    HealthDegraded { message: String },
}

impl Notification {
    pub fn text(&self) -> &str {
        match self {
            Notification::Motion { caption, .. } => caption,
            Notification::HealthDegraded { message } => message,
        }
    }

    pub fn attachment(&self) -> Option<&PathBuf> {
        match self {
            Notification::Motion { clip, .. } => clip.as_ref(),
            Notification::HealthDegraded { .. } => None,
        }
    }
}
