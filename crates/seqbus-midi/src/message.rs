//! Raw MIDI message capsule.
//!
//! A [`Message`] carries wire bytes exactly as they travel to or from a port.
//! No MIDI semantics are interpreted beyond the status byte and SysEx framing.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Status bytes used by the transport layer.
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const AFTERTOUCH: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_PRESSURE: u8 = 0xD0;
    pub const PITCH_WHEEL: u8 = 0xE0;

    pub const SYSEX: u8 = 0xF0;
    pub const SONG_POSITION: u8 = 0xF2;
    pub const SYSEX_END: u8 = 0xF7;
    pub const CLOCK: u8 = 0xF8;
    pub const START: u8 = 0xFA;
    pub const CONTINUE: u8 = 0xFB;
    pub const STOP: u8 = 0xFC;
    pub const ACTIVE_SENSE: u8 = 0xFE;
    pub const RESET: u8 = 0xFF;
}

/// Immutable MIDI message: bytes, a timestamp in pulses, and the bus it came from.
///
/// Channel and realtime messages fit inline; SysEx spills to the heap.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    bytes: SmallVec<[u8; 3]>,
    timestamp: u64,
    source_bus: Option<u8>,
}

impl Message {
    pub fn new(bytes: &[u8], timestamp: u64) -> Self {
        Self {
            bytes: SmallVec::from_slice(bytes),
            timestamp,
            source_bus: None,
        }
    }

    /// Like [`Message::new`], but rejects byte strings that do not start with a status byte.
    pub fn try_new(bytes: &[u8], timestamp: u64) -> Result<Self> {
        match bytes.first() {
            None => Err(Error::EmptyMessage),
            Some(&b) if b < 0x80 => Err(Error::InvalidStatus(b)),
            Some(_) => Ok(Self::new(bytes, timestamp)),
        }
    }

    pub fn with_source(mut self, bus: u8) -> Self {
        self.source_bus = Some(bus);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_message(status::NOTE_ON, channel, &[note, velocity])
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_message(status::NOTE_OFF, channel, &[note, velocity])
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::channel_message(status::CONTROL_CHANGE, channel, &[controller, value])
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::channel_message(status::PROGRAM_CHANGE, channel, &[program])
    }

    fn channel_message(kind: u8, channel: u8, data: &[u8]) -> Self {
        let mut bytes = SmallVec::new();
        bytes.push(kind | (channel.min(15)));
        bytes.extend(data.iter().map(|d| d & 0x7F));
        Self {
            bytes,
            timestamp: 0,
            source_bus: None,
        }
    }

    pub fn clock() -> Self {
        Self::new(&[status::CLOCK], 0)
    }

    pub fn start() -> Self {
        Self::new(&[status::START], 0)
    }

    pub fn stop() -> Self {
        Self::new(&[status::STOP], 0)
    }

    pub fn continue_() -> Self {
        Self::new(&[status::CONTINUE], 0)
    }

    /// Song position pointer in MIDI beats (sixteenth notes), clamped to 14 bits.
    pub fn song_position(beats: u32) -> Self {
        let beats = beats.min(0x3FFF);
        let lsb = (beats & 0x7F) as u8;
        let msb = ((beats >> 7) & 0x7F) as u8;
        Self::new(&[status::SONG_POSITION, lsb, msb], 0)
    }

    /// Wraps a complete `F0 .. F7` payload.
    pub fn sysex(payload: &[u8]) -> Self {
        Self::new(payload, 0)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn source_bus(&self) -> Option<u8> {
        self.source_bus
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Status byte, or 0 for an empty message.
    #[inline]
    pub fn status(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    pub fn channel(&self) -> Option<u8> {
        self.is_channel_message().then(|| self.status() & 0x0F)
    }

    /// The two data bytes following the status, zero-filled.
    pub fn data(&self) -> (u8, u8) {
        let d0 = self.bytes.get(1).copied().unwrap_or(0);
        let d1 = self.bytes.get(2).copied().unwrap_or(0);
        (d0, d1)
    }

    /// Status with its channel nibble replaced, for channel-voice messages only.
    pub fn status_for_channel(&self, channel: u8) -> u8 {
        let status = self.status();
        if self.is_channel_message() {
            (status & 0xF0) | (channel & 0x0F)
        } else {
            status
        }
    }

    /// Wire bytes as they go out for `play(event, channel)`.
    pub fn channel_bytes(&self, channel: u8) -> SmallVec<[u8; 3]> {
        let mut out = SmallVec::from_slice(&self.bytes);
        if let Some(first) = out.first_mut() {
            *first = self.status_for_channel(channel);
        }
        out
    }

    #[inline]
    pub fn is_channel_message(&self) -> bool {
        (0x80..=0xEF).contains(&self.status())
    }

    #[inline]
    pub fn is_sysex(&self) -> bool {
        self.status() == status::SYSEX
    }

    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.status() >= status::CLOCK
    }

    /// Active sensing and system reset are filtered on some input paths.
    #[inline]
    pub fn is_sense_or_reset(&self) -> bool {
        matches!(self.status(), status::ACTIVE_SENSE | status::RESET)
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_constructors() {
        let msg = Message::note_on(3, 60, 100);
        assert_eq!(msg.bytes(), &[0x93, 60, 100]);
        assert_eq!(msg.channel(), Some(3));
        assert_eq!(msg.data(), (60, 100));

        let pc = Message::program_change(20, 200);
        assert_eq!(pc.bytes(), &[0xCF, 0x48]);
    }

    #[test]
    fn test_status_for_channel() {
        let msg = Message::control_change(0, 7, 127);
        assert_eq!(msg.status_for_channel(9), 0xB9);
        assert_eq!(msg.channel_bytes(9).as_slice(), &[0xB9, 7, 127]);

        let clock = Message::clock();
        assert_eq!(clock.status_for_channel(9), 0xF8);
    }

    #[test]
    fn test_song_position_encoding() {
        let msg = Message::song_position(300);
        assert_eq!(msg.bytes(), &[0xF2, (300u32 & 0x7F) as u8, (300u32 >> 7) as u8]);

        let clamped = Message::song_position(u32::MAX);
        assert_eq!(clamped.bytes(), &[0xF2, 0x7F, 0x7F]);
    }

    #[test]
    fn test_sysex_spills_to_heap() {
        let payload: Vec<u8> = std::iter::once(0xF0)
            .chain(0..40u8)
            .chain(std::iter::once(0xF7))
            .collect();
        let msg = Message::sysex(&payload);
        assert!(msg.is_sysex());
        assert_eq!(msg.len(), 42);
        assert_eq!(msg.bytes(), payload.as_slice());
    }

    #[test]
    fn test_try_new_rejects_running_status() {
        assert_eq!(Message::try_new(&[], 0), Err(Error::EmptyMessage));
        assert_eq!(Message::try_new(&[0x40, 1], 0), Err(Error::InvalidStatus(0x40)));
        assert!(Message::try_new(&[0xFA], 0).is_ok());
    }

    #[test]
    fn test_classification() {
        assert!(Message::clock().is_realtime());
        assert!(!Message::clock().is_channel_message());
        assert!(Message::new(&[0xFE], 0).is_sense_or_reset());
        assert!(!Message::start().is_sense_or_reset());
        assert_eq!(Message::default().status(), 0);
    }

    #[test]
    fn test_source_and_timestamp() {
        let msg = Message::note_off(0, 64, 0).with_source(2).with_timestamp(960);
        assert_eq!(msg.source_bus(), Some(2));
        assert_eq!(msg.timestamp(), 960);
    }
}
