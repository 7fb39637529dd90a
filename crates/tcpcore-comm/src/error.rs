use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue empty")]
    Empty,
}
