//! Builder for configuring and constructing a `MidiSession`.

use crate::{MidiSession, Result};
use seqbus_midi::ClockMode;
use seqbus_midi_io::{DummyBackend, ErrorKind, MidiApi, MidiInfo, MidiSettings};
use std::sync::Arc;
use std::time::Duration;

type ErrorHook = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// The backend is picked from the settings: an explicit `api` is used as-is,
/// otherwise the compiled backends are probed in preference order. Buses are
/// opened during `build()`; a bus that fails to open stays disabled and is
/// reported through the error hook instead of failing the build.
///
/// # Example
///
/// ```
/// use seqbus::{DummyBackend, MidiSession};
///
/// let session = MidiSession::builder()
///     .client_name("sequencer")
///     .manual_ports(1, 2)
///     .dummy(DummyBackend::new())
///     .build()
///     .unwrap();
///
/// assert_eq!(session.enumerate_ports(seqbus::PortDirection::Output).len(), 2);
/// ```
pub struct MidiSessionBuilder {
    settings: MidiSettings,
    dummy: Option<DummyBackend>,
    on_error: Option<ErrorHook>,
}

impl Default for MidiSessionBuilder {
    fn default() -> Self {
        Self {
            settings: MidiSettings::default(),
            dummy: None,
            on_error: None,
        }
    }
}

impl MidiSessionBuilder {
    /// Replaces every setting made so far.
    pub fn settings(mut self, settings: MidiSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Default: "seqbus"
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

    /// Virtual buses instead of one bus per discovered port.
    pub fn manual_ports(mut self, inputs: usize, outputs: usize) -> Self {
        self.settings.manual_ports = true;
        self.settings.virtual_inputs = inputs;
        self.settings.virtual_outputs = outputs;
        self
    }

    /// Default: 192 PPQN, 120 BPM
    pub fn tempo(mut self, ppqn: u32, bpm: f64) -> Self {
        self.settings.ppqn = ppqn;
        self.settings.bpm = bpm;
        self
    }

    /// Clock mode for every output bus. Default: off
    pub fn clock(mut self, mode: ClockMode) -> Self {
        self.settings.default_clock = mode;
        self
    }

    pub fn sysex_pacing(mut self, chunk_size: usize, pause: Duration) -> Self {
        self.settings.sysex_chunk_size = chunk_size;
        self.settings.sysex_pause_ms = pause.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Runs on the in-process backend instead of a sound server.
    pub fn dummy(mut self, backend: DummyBackend) -> Self {
        self.settings.api = MidiApi::Dummy;
        self.dummy = Some(backend);
        self
    }

    /// Receives every driver failure and swallowed warning, including bus
    /// open failures during `build()`.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(ErrorKind, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<MidiSession> {
        self.settings.validate()?;
        let info = match self.dummy {
            Some(backend) => MidiInfo::with_dummy(&self.settings, backend)?,
            None => MidiInfo::open(&self.settings)?,
        };
        if let Some(hook) = self.on_error {
            info.set_error_callback(move |kind, message| hook(kind, message));
        }
        Ok(MidiSession::from_info(info))
    }
}
