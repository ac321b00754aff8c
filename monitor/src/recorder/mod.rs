pub mod encoder;
pub mod keys;
pub mod output;

pub use encoder::{check_ffmpeg_available, ClipEncoder, EncodeError};
pub use output::OutputFile;
