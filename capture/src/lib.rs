pub mod buffer;
pub mod coordinator;
pub mod ffmpeg;
pub mod load;
pub mod mjpeg;
pub mod source;

pub use buffer::FrameBuffer;
pub use load::{CpuLoad, LoadProbe};
pub use coordinator::{CaptureCoordinator, CaptureState, CaptureStatus, CoordinatorSettings};
pub use source::{ConnectError, ConnectionState, FrameSource, ReadError, StreamSource};
