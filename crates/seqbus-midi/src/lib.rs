//! Backend-independent MIDI transport types.
//!
//! Everything a port backend and its consumers exchange without touching a
//! native subsystem:
//!
//! - [`Message`]: raw status/data bytes with a pulse timestamp and source bus tag
//! - [`EventQueue`]: bounded SPSC FIFO between a receive path and a poll path
//! - [`PortDescriptor`] / [`PortCatalog`]: scanned port records, one catalog per direction
//! - [`sysex`]: chunked SysEx transmission with inter-chunk pacing
//! - [`timing`]: tempo, PPQN and song-position arithmetic
//! - [`ClockMode`]: per-bus MIDI clock emission policy
//!
//! # Example
//!
//! ```
//! use seqbus_midi::{EventQueue, Message};
//!
//! let mut queue = EventQueue::new(2);
//! assert!(queue.add(Message::note_on(0, 60, 100)));
//! assert!(queue.add(Message::note_off(0, 60, 0)));
//! assert!(!queue.add(Message::clock()));
//! assert_eq!(queue.pop_front().map(|m| m.status()), Some(0x90));
//! ```

pub mod error;
pub use error::{Error, Result};

mod clock;
mod message;
mod port;
mod queue;

pub mod sysex;
pub mod timing;

pub use clock::ClockMode;
pub use message::{status, Message};
pub use port::{PortCatalog, PortDescriptor, PortDirection, PortKind, BAD_ID};
pub use queue::{EventQueue, QueueConsumer, QueueProducer, DEFAULT_QUEUE_SIZE};
pub use sysex::{SysexPacing, SysexReport};
