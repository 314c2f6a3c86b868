use std::path::PathBuf;
use thiserror::Error;

use crate::backend::ExecutionError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum UssdqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid operation: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Could not determine a default database path")]
    NoDatabasePath,
}

/// Errors raised while building a new operation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("USSD code is empty")]
    EmptyCode,

    #[error("USSD code is {0} characters long, the limit is 182")]
    CodeTooLong(usize),

    #[error("USSD code contains invalid character '{0}'")]
    InvalidCharacter(char),
}

/// Failures at the recovery sites of the queue.
///
/// None of these are fatal: each one is logged where it happens and the
/// next poll or notification gets a fresh attempt.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to read operations: {0}")]
    StoreRead(#[source] StoreError),

    #[error("Failed to write {status} for operation {id}: {source}")]
    StoreWrite {
        id: String,
        status: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Operation {id} failed: {source}")]
    Execution {
        id: String,
        #[source]
        source: ExecutionError,
    },

    #[error("Change subscription unavailable: {0}")]
    Subscription(String),
}

pub type Result<T> = std::result::Result<T, UssdqError>;
