//! CSPTP programs: the client and service engines plus their CLI,
//! configuration, and logging surface. The wire protocol itself lives in
//! the `csptp-core` crate.

pub mod cli;
pub mod client;
pub mod config;
pub mod logging;
pub mod report;
pub mod service;
pub mod shutdown;
