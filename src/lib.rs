//! tusk - a native application server for PHP.
//!
//! A [`worker::Supervisor`] keeps a fixed pool of long-lived PHP processes
//! alive, each speaking newline-delimited JSON envelopes over stdin/stdout. The
//! [`server`] module puts an axum gateway in front of the pool that relays
//! every HTTP request to an idle worker.

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod server;
pub mod version;
pub mod worker;
