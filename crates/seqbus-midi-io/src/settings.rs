//! MIDI transport configuration.
//!
//! Supplied by the application's configuration layer; nothing here reads or
//! writes files.

use crate::{Error, MidiApi, Result};
use seqbus_midi::sysex::{SysexPacing, SYSEX_CHUNK_SIZE};
use seqbus_midi::timing::{DEFAULT_BPM, DEFAULT_PPQN};
use seqbus_midi::{ClockMode, DEFAULT_QUEUE_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    pub client_name: String,
    pub api: MidiApi,
    /// Try JACK before ALSA when no backend is requested.
    pub prefer_jack: bool,
    /// Build virtual buses instead of binding to discovered ports.
    pub manual_ports: bool,
    pub virtual_inputs: usize,
    pub virtual_outputs: usize,
    pub ppqn: u32,
    pub bpm: f64,
    pub queue_capacity: usize,
    pub sysex_chunk_size: usize,
    pub sysex_pause_ms: u64,
    pub default_clock: ClockMode,
    pub poll_interval_ms: u64,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            client_name: "seqbus".to_string(),
            api: MidiApi::Unspecified,
            prefer_jack: false,
            manual_ports: false,
            virtual_inputs: 1,
            virtual_outputs: 1,
            ppqn: DEFAULT_PPQN,
            bpm: DEFAULT_BPM,
            queue_capacity: DEFAULT_QUEUE_SIZE,
            sysex_chunk_size: SYSEX_CHUNK_SIZE,
            sysex_pause_ms: 80,
            default_clock: ClockMode::Off,
            poll_interval_ms: 1,
        }
    }
}

impl MidiSettings {
    pub fn builder() -> MidiSettingsBuilder {
        MidiSettingsBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_name.is_empty() || self.client_name.contains('\0') {
            return Err(Error::InvalidSettings(format!(
                "client name {:?} is not usable",
                self.client_name
            )));
        }
        if self.ppqn == 0 {
            return Err(Error::InvalidSettings("ppqn must be positive".into()));
        }
        if !self.bpm.is_finite() || self.bpm < 0.0 {
            return Err(Error::InvalidSettings(format!(
                "bpm {} out of range",
                self.bpm
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidSettings("queue capacity must be positive".into()));
        }
        if self.sysex_chunk_size == 0 {
            return Err(Error::InvalidSettings("SysEx chunk size must be positive".into()));
        }
        Ok(())
    }

    pub fn sysex_pacing(&self) -> SysexPacing {
        SysexPacing::new(self.sysex_chunk_size, Duration::from_millis(self.sysex_pause_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Fluent construction of [`MidiSettings`], validated on `build()`.
///
/// ```
/// use seqbus_midi_io::{MidiApi, MidiSettings};
///
/// let settings = MidiSettings::builder()
///     .client_name("sequencer")
///     .api(MidiApi::Dummy)
///     .manual_ports(2, 2)
///     .tempo(96, 140.0)
///     .build()
///     .unwrap();
/// assert_eq!(settings.virtual_outputs, 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MidiSettingsBuilder {
    settings: MidiSettings,
}

impl MidiSettingsBuilder {
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.settings.client_name = name.into();
        self
    }

    pub fn api(mut self, api: MidiApi) -> Self {
        self.settings.api = api;
        self
    }

    pub fn prefer_jack(mut self, prefer: bool) -> Self {
        self.settings.prefer_jack = prefer;
        self
    }

    /// Enables manual (virtual) ports with the given counts.
    pub fn manual_ports(mut self, inputs: usize, outputs: usize) -> Self {
        self.settings.manual_ports = true;
        self.settings.virtual_inputs = inputs;
        self.settings.virtual_outputs = outputs;
        self
    }

    pub fn tempo(mut self, ppqn: u32, bpm: f64) -> Self {
        self.settings.ppqn = ppqn;
        self.settings.bpm = bpm;
        self
    }

    /// Default: 100
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.settings.queue_capacity = capacity;
        self
    }

    /// Default: 256 bytes, 80 ms
    pub fn sysex_pacing(mut self, chunk_size: usize, pause: Duration) -> Self {
        self.settings.sysex_chunk_size = chunk_size;
        self.settings.sysex_pause_ms = pause.as_millis() as u64;
        self
    }

    pub fn default_clock(mut self, mode: ClockMode) -> Self {
        self.settings.default_clock = mode;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<MidiSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
