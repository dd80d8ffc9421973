//! cgi-prefork - a prefork TCP dispatcher
//!
//! This library provides a process-pool request dispatcher that:
//! - Listens on one TCP address and keeps a fixed pool of workers
//! - Signals a free worker whenever a connection is pending, and the worker
//!   accepts that connection itself from the shared socket
//! - Answers each request with the stdout of an external command, wrapped in
//!   a fixed `HTTP/1.1 200 OK` response
//! - Retires a worker after a configurable number of requests and starts a
//!   fresh one in its place
//! - Applies backpressure when every worker is busy, leaving connections in
//!   the kernel backlog

pub mod cgi;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod worker;

pub use config::Config;
pub use dispatch::{Activity, Dispatcher, RetireReason};
pub use server::Server;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
