pub mod cache;
pub mod filter;
pub mod notify;
pub mod recorder;
pub mod service;

pub use filter::MotionDetector;
pub use recorder::{ClipEncoder, EncodeError, OutputFile};
pub use service::{CaptureError, MonitorService, MonitorSettings};
