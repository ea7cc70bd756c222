//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bridge channel to or from the USB worker failed
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
