//! Error taxonomy surfaced to applications, plus engine-internal errors.
//!
//! Internal code (pools, the address pool, the flow table) returns
//! [`EngineError`]; the socket API (`tcpcore::socket`) is the only place that
//! converts an `EngineError` into an [`ErrorKind`] via [`EngineError::kind`].
//! Internal code never constructs an `ErrorKind` directly and API code never
//! matches on `EngineError` variants.

use thiserror::Error;

/// Error kinds surfaced to applications (POSIX-shaped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidDescriptor,
    InvalidArgument,
    NotConnected,
    AlreadyConnected,
    InProgress,
    WouldBlock,
    OutOfMemory,
    AddressInUse,
    ConnectionReset,
    ConnectionRefused,
    TimedOut,
    Permission,
    Interrupted,
}

/// Why a stream's connection ended, recorded on the stream for diagnostics
/// and surfaced to the application as the reason a blocking call unblocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseReason {
    #[default]
    NotClosed,
    ActiveClose,
    PassiveClose,
    ConnFail,
    ConnLost,
    Reset,
    NoMem,
    NotAccepted,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("descriptor {0} is not a valid socket")]
    InvalidDescriptor(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("operation in progress")]
    InProgress,
    #[error("operation would block")]
    WouldBlock,
    #[error("pool exhausted: {0}")]
    OutOfMemory(&'static str),
    #[error("address {0:?} already in use")]
    AddressInUse((std::net::Ipv4Addr, u16)),
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("operation timed out")]
    TimedOut,
    #[error("permission denied")]
    Permission,
    #[error("interrupted")]
    Interrupted,
}

impl EngineError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::NotConnected => ErrorKind::NotConnected,
            EngineError::AlreadyConnected => ErrorKind::AlreadyConnected,
            EngineError::InProgress => ErrorKind::InProgress,
            EngineError::WouldBlock => ErrorKind::WouldBlock,
            EngineError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            EngineError::AddressInUse(_) => ErrorKind::AddressInUse,
            EngineError::ConnectionReset => ErrorKind::ConnectionReset,
            EngineError::ConnectionRefused => ErrorKind::ConnectionRefused,
            EngineError::TimedOut => ErrorKind::TimedOut,
            EngineError::Permission => ErrorKind::Permission,
            EngineError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
