mod arrayvec;
mod assert;
mod thread;
mod vsync;

pub use arrayvec::{ArrayStr, ArrayVec};
pub use thread::{ThreadPriority, thread_boot};
pub use vsync::vsync;
