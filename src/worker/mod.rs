//! Worker process pool.
//!
//! Each worker is an interpreter process running the application's worker
//! script. The host talks to it over stdin/stdout, one request and one
//! response at a time.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │     Gateway     │
//!                     └────────┬────────┘
//!                              │ RequestEnvelope
//!                     ┌────────▼────────┐        ┌────────────┐
//!                     │   Dispatcher    │◄──────►│ Supervisor │
//!                     │  (idle queue)   │        │ (watchers) │
//!                     └────────┬────────┘        └─────┬──────┘
//!               ┌──────────────┼──────────────┐        │ spawn / reap
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐  │
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │◄─┘
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker runs in its own process group
//! - **Turn-taking**: a worker's channel is owned by at most one request
//! - **Crash recovery**: dead workers are respawned in place with backoff
//! - **Clean shutdown**: every process group is killed and reaped

mod backoff;
mod channel;
mod dispatch;
mod pool;
mod protocol;
mod signals;
mod spawn;
mod supervisor;

pub use backoff::RestartPolicy;
pub use channel::{DEFAULT_MAX_FRAME_BYTES, WorkerChannel};
pub use dispatch::Dispatcher;
pub use pool::{PoolStats, WorkerInfo, WorkerState};
pub use protocol::{
    DEFAULT_STATUS, DecodeError, INVALID_BODY_PLACEHOLDER, RequestEnvelope, ResponseEnvelope,
};
pub use signals::TerminationReason;
pub use spawn::{WORKER_ID_ENV, WorkerCommand};
pub use supervisor::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_EXCHANGE_TIMEOUT, Supervisor, WorkerPoolConfig,
};
