//! AIPM Session Pool Library
//!
//! A bounded, queue-backed request/response service on top of long-running
//! interactive AI assistant processes. Each process is wrapped in a session;
//! sessions are dispatched from a FIFO queue, watched for stalls and restarted
//! by a supervisor without reducing pool capacity.

pub mod abnormality;
pub mod api;
pub mod completion;
pub mod error;
pub mod instance;
pub mod pool;
pub mod resources;
pub mod session;
pub mod supervisor;

pub use error::{PoolError, TaskFailure};
pub use pool::{PoolConfig, PoolStatus, SessionPool, TaskHandle, TaskOutput, TaskRequest, TaskResult};
pub use session::{ProcessLauncher, SessionId, SessionState};
