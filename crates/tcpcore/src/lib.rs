pub mod addr_pool;
pub mod config;
pub mod congestion;
pub mod engine;
pub mod epoll;
pub mod error;
pub mod flow;
pub mod input;
pub mod listener;
pub mod output;
pub mod pacing;
pub mod pool;
pub mod ring;
pub mod socket;
pub mod stream;
pub mod timers;

pub use config::Config;
pub use engine::{ConnectRequest, Engine, EngineHandle, run_engine};
pub use error::{CloseReason, EngineError, EngineResult, ErrorKind};
pub use stream::{FourTuple, Stream, StreamId, TcpState};
