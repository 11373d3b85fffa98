//! # Summary
//!
//! Top-level error type unifying every failure mode a running
//! `pichain-server` process can hit, mapped to the exit codes a caller's
//! `main` reports: 0 clean shutdown, 1 configuration error, 2
//! unrecoverable storage error. Transport and protocol failures never
//! reach this type — `crate::transport` and `crate::client` log and
//! retry internally, since a disconnected peer or a malformed client
//! line is routine, not fatal.

use crate::config::ConfigError;
use crate::storage::StorageError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Storage(_) | Error::Io(_) => 2,
        }
    }
}
