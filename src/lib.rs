//! Devgate - a development proxy in front of a supervised local backend
//!
//! The crate runs a backend server (by default `php -S`) as a child
//! process and:
//! - Forwards every HTTP request from a public port to the backend
//! - Polls the backend and restarts it when it stops answering
//! - Answers with a JSON 502 while the backend is unreachable
//! - Tears the proxy and the backend down in order on SIGINT/SIGTERM

pub mod config;
pub mod error;
pub mod healthcheck;
pub mod lifecycle;
pub mod process;
pub mod proxy;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
