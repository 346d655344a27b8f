//! Error types for battery readings.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PowerError {
    /// No power supply of type `Battery` was found.
    #[error("No battery found under {0}")]
    NoBattery(String),

    #[error("Failed to parse {file}: {value:?}")]
    Parse { file: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PowerError>;
