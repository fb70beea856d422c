//! Centralized error type for the seqbus umbrella crate.
//!
//! Wraps the subsystem errors so `?` propagates naturally across crate boundaries.

use seqbus_midi::PortDirection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("MIDI: {0}")]
    Midi(#[from] seqbus_midi_io::Error),

    #[error(transparent)]
    Message(#[from] seqbus_midi::Error),

    #[error("No {direction} bus {index} in this session")]
    NoBus {
        direction: PortDirection,
        index: usize,
    },
}

impl Error {
    /// Taxonomy used by the error hook; unknown buses are configuration errors.
    pub fn kind(&self) -> seqbus_midi_io::ErrorKind {
        match self {
            Error::Midi(e) => e.kind(),
            Error::Message(_) | Error::NoBus { .. } => seqbus_midi_io::ErrorKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
