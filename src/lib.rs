//! # seqbus - Real-time MIDI transport
//!
//! Cross-platform MIDI port layer for a sequencer: discovers the ports a
//! native subsystem offers, binds logical buses to them, and moves channel
//! messages, SysEx, clock and transport events in and out in real time.
//!
//! ## Architecture
//!
//! seqbus is an umbrella crate that coordinates:
//! - **seqbus-midi** - Value types (Message, EventQueue, PortCatalog, SysEx pacing, timing)
//! - **seqbus-midi-io** - Backends (ALSA, JACK, dummy), dispatch, buses, input listener
//!
//! ## Quick Start
//!
//! ```no_run
//! use seqbus::{Message, MidiSession, PortDirection, Transport};
//!
//! let mut session = MidiSession::builder()
//!     .client_name("sequencer")
//!     .tempo(192, 120.0)
//!     .build()?;
//!
//! for port in session.enumerate_ports(PortDirection::Output) {
//!     println!("{port}");
//! }
//!
//! session.send(0, &Message::note_on(0, 60, 100))?;
//! session.transport(Transport::Start);
//! # Ok::<(), seqbus::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `jack` (default) - JACK backend
//! - `alsa` - ALSA sequencer backend (Linux)
//!
//! The in-process dummy backend is always available, but only when asked for.

mod builder;
mod error;
mod session;

pub use builder::MidiSessionBuilder;
pub use error::{Error, Result};
pub use session::{MidiSession, PortListing, Transport};

/// Re-export of seqbus-midi for direct access
pub use seqbus_midi as midi;

/// Re-export of seqbus-midi-io for direct access
pub use seqbus_midi_io as io;

pub use seqbus_midi::{
    status, ClockMode, EventQueue, Message, PortCatalog, PortDescriptor, PortDirection, PortKind,
    SysexPacing, SysexReport,
};
pub use seqbus_midi_io::{
    Bus, DummyBackend, ErrorKind, InputListener, MidiApi, MidiInfo, MidiSettings,
    MidiSettingsBuilder, PortState, SentEvent, SentKind,
};

/// Convenience re-exports for common usage
pub mod prelude {
    pub use crate::{
        Bus, ClockMode, Message, MidiApi, MidiSession, MidiSettings, PortDirection, Transport,
    };
}
