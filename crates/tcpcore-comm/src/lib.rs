mod error;
pub mod queue;

pub use error::QueueError;
pub use queue::Queue;
