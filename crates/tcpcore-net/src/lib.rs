pub mod driver;
pub mod wire;

pub use driver::{Driver, DriverCaps};
pub use wire::{FrameError, TcpFrame, build_tcp_frame, parse_tcp_frame};
