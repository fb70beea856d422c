//! Error types for the MIDI value layer.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Empty MIDI message")]
    EmptyMessage,

    #[error("Invalid status byte: {0:#04x}")]
    InvalidStatus(u8),

    #[error("Unknown clock mode: {0}")]
    UnknownClockMode(String),

    #[error("Port {index} out of range ({count} ports)")]
    IndexOutOfRange { index: usize, count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
