//! Error types for the Vigil core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid secret code: {0}")]
    InvalidCodeFormat(String),

    #[error("Invalid screen transition: {0}")]
    InvalidTransition(String),

    #[error("A verification session is already in progress")]
    SessionInProgress,

    #[error("No verification session is active")]
    NoActiveSession,

    #[error("Session is locked")]
    Locked,

    #[error("The user who opened this gate has logged out")]
    LoggedOut,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
