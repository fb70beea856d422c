//! MIDI transport subsystem for seqbus.
//!
//! Backend discovery and selection, per-port operations over ALSA and JACK,
//! the dispatch wrapper that binds a bus to one backend, and the buses
//! themselves.
//!
//! Feature gates: `jack` (default), `alsa` (Linux only). The in-process dummy
//! backend is always available but only used when asked for.

pub mod error;
pub use error::{Error, ErrorKind, Result};

mod api;
pub use api::{
    candidate_order, compiled_apis, reset_selected_api, select_backend, selected_api, MidiApi,
};

mod settings;
pub use settings::{MidiSettings, MidiSettingsBuilder};

mod info;
pub use info::{ErrorCallback, MidiInfo, PortCatalogs};

pub mod backend;
pub use backend::dummy::{DummyBackend, SentEvent, SentKind};
pub use backend::{PortOps, PortSpec};

mod dispatch;
pub use dispatch::{PortApi, PortState};

mod bus;
pub use bus::Bus;

mod listener;
pub use listener::InputListener;

pub use seqbus_midi::{
    status, timing, ClockMode, EventQueue, Message, PortCatalog, PortDescriptor, PortDirection,
    PortKind, SysexPacing, SysexReport, BAD_ID,
};
