//! Error taxonomy for the core subsystems.
//!
//! Every fallible operation reports success or failure explicitly; nothing in
//! this crate panics on bad input. `Malformed` covers wire data we received
//! and dropped, `Contract` covers misuse by the caller, `Exhausted` covers
//! build-time capacity limits.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated an API precondition (detached message, shrink, range).
    #[error("invalid call: {0}")]
    Contract(&'static str),

    /// Received wire data is inconsistent; the datagram is dropped.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// Build-time capacity limit: TLV count at maximum or residual too small.
    #[error("no room: {0}")]
    Exhausted(&'static str),

    /// Address string/hostname could not be turned into a usable IP.
    #[error("cannot resolve '{0}'")]
    Resolve(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
