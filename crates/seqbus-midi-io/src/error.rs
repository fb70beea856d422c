//! Error types for the MIDI transport subsystem.

use crate::MidiApi;
use seqbus_midi::PortDirection;
use thiserror::Error;

/// Coarse classification used by the error-callback hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Non-fatal; one message lost.
    Warning,
    /// Bad request: unavailable backend, invalid port index, bad settings.
    Config,
    /// A native subsystem call failed.
    Driver,
    /// No usable backend at all.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("MIDI backend {0} not compiled in")]
    BackendUnavailable(MidiApi),

    #[error("MIDI backend {0} reports no ports")]
    NoPorts(MidiApi),

    #[error("No usable MIDI backend found")]
    NoBackend,

    #[error("Invalid {direction} port index {index}")]
    InvalidPort {
        direction: PortDirection,
        index: usize,
    },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("MIDI driver error: {0}")]
    Driver(String),

    #[error("MIDI port not open")]
    PortClosed,

    #[error("MIDI input queue full")]
    QueueFull,

    #[error(transparent)]
    Message(#[from] seqbus_midi::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::QueueFull | Error::PortClosed => ErrorKind::Warning,
            Error::BackendUnavailable(_)
            | Error::NoPorts(_)
            | Error::InvalidPort { .. }
            | Error::InvalidSettings(_)
            | Error::Message(_) => ErrorKind::Config,
            Error::Driver(_) => ErrorKind::Driver,
            Error::NoBackend => ErrorKind::Fatal,
        }
    }
}

#[cfg(all(target_os = "linux", feature = "alsa"))]
impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Error::Driver(e.to_string())
    }
}

#[cfg(feature = "jack")]
impl From<jack::Error> for Error {
    fn from(e: jack::Error) -> Self {
        Error::Driver(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
