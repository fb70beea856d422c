//! Dispatch wrapper: one backend port per bus, chosen by the bus's info.
//!
//! Owns the port state machine (`Uninitialized -> Enabled | Disabled`) and
//! the error policy: per-message failures are logged and swallowed, per-port
//! failures disable the port and are returned to the caller.

use crate::backend::dummy::DummyPort;
use crate::backend::{NativeInfo, PortOps, PortSpec};
use crate::{Message, MidiApi, MidiInfo, Result};
use seqbus_midi::sysex::{send_chunked, SysexReport};
use seqbus_midi::PortDirection;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(all(target_os = "linux", feature = "alsa"))]
use crate::backend::alsa::AlsaPort;
#[cfg(feature = "jack")]
use crate::backend::jack::JackPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Uninitialized,
    Enabled,
    Disabled,
}

enum PortBackend {
    #[cfg(all(target_os = "linux", feature = "alsa"))]
    Alsa(AlsaPort),
    #[cfg(feature = "jack")]
    Jack(JackPort),
    Dummy(DummyPort),
}

impl PortBackend {
    fn for_info(info: &MidiInfo) -> Self {
        match info.native() {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => PortBackend::Alsa(AlsaPort::new(shared.clone())),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(shared) => PortBackend::Jack(JackPort::new(shared.clone())),
            NativeInfo::Dummy(backend) => PortBackend::Dummy(DummyPort::new(backend.clone())),
        }
    }

    fn ops(&mut self) -> &mut dyn PortOps {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            PortBackend::Alsa(port) => port,
            #[cfg(feature = "jack")]
            PortBackend::Jack(port) => port,
            PortBackend::Dummy(port) => port,
        }
    }
}

pub struct PortApi {
    info: Arc<MidiInfo>,
    backend: PortBackend,
    state: PortState,
    direction: Option<PortDirection>,
    suspended: bool,
}

impl PortApi {
    pub fn new(info: Arc<MidiInfo>) -> Self {
        let backend = PortBackend::for_info(&info);
        Self {
            info,
            backend,
            state: PortState::Uninitialized,
            direction: None,
            suspended: false,
        }
    }

    pub fn api(&self) -> MidiApi {
        self.info.api()
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    /// Open and not suspended.
    pub fn is_enabled(&self) -> bool {
        self.state == PortState::Enabled && !self.suspended
    }

    pub fn init_out(&mut self, spec: &PortSpec) -> Result<()> {
        self.reset(PortDirection::Output);
        let ops = self.backend.ops();
        let result = ops.init_out(spec).and_then(|()| ops.connect(spec));
        self.finish_init(PortDirection::Output, spec, result)
    }

    pub fn init_out_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        self.reset(PortDirection::Output);
        let result = self.backend.ops().init_out_virtual(spec);
        self.finish_init(PortDirection::Output, spec, result)
    }

    pub fn init_in(&mut self, spec: &PortSpec) -> Result<()> {
        self.reset(PortDirection::Input);
        let ops = self.backend.ops();
        let result = ops.init_in(spec).and_then(|()| ops.connect(spec));
        self.finish_init(PortDirection::Input, spec, result)
    }

    pub fn init_in_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        self.reset(PortDirection::Input);
        let result = self.backend.ops().init_in_virtual(spec);
        self.finish_init(PortDirection::Input, spec, result)
    }

    /// Closes whatever a previous init left behind before a re-open.
    fn reset(&mut self, direction: PortDirection) {
        if self.state != PortState::Uninitialized {
            self.deinit(direction);
        }
        self.direction = Some(direction);
        self.suspended = false;
    }

    fn finish_init(
        &mut self,
        direction: PortDirection,
        spec: &PortSpec,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = PortState::Enabled;
                debug!("Opened MIDI {} port {}", direction, spec.connect_name());
                Ok(())
            }
            Err(e) => {
                match direction {
                    PortDirection::Output => self.backend.ops().deinit_out(),
                    PortDirection::Input => self.backend.ops().deinit_in(),
                }
                self.state = PortState::Disabled;
                self.info.report(
                    e.kind(),
                    &format!(
                        "MIDI {} port {} failed to open: {}",
                        direction,
                        spec.connect_name(),
                        e
                    ),
                );
                Err(e)
            }
        }
    }

    pub fn deinit_out(&mut self) {
        self.deinit(PortDirection::Output);
    }

    pub fn deinit_in(&mut self) {
        self.deinit(PortDirection::Input);
    }

    fn deinit(&mut self, direction: PortDirection) {
        match direction {
            PortDirection::Output => self.backend.ops().deinit_out(),
            PortDirection::Input => self.backend.ops().deinit_in(),
        }
        self.state = PortState::Uninitialized;
    }

    /// Closes the port in whichever direction it was opened.
    pub fn close(&mut self) {
        if let Some(direction) = self.direction {
            if self.state != PortState::Uninitialized {
                self.deinit(direction);
            }
        }
    }

    /// Re-runs the backend connect step for an already open port.
    pub fn connect(&mut self, spec: &PortSpec) -> Result<()> {
        if self.state != PortState::Enabled {
            return Err(crate::Error::PortClosed);
        }
        self.backend.ops().connect(spec).inspect_err(|e| {
            self.info.report(
                e.kind(),
                &format!("MIDI connect to {} failed: {}", spec.connect_name(), e),
            );
        })
    }

    /// Suspends or resumes traffic without closing the native port.
    pub fn set_suspended(&mut self, suspended: bool) -> bool {
        if self.state != PortState::Enabled {
            return false;
        }
        self.suspended = suspended;
        self.backend.ops().set_suspended(suspended);
        true
    }

    /// Sends a channel message with its channel nibble set to `channel`.
    pub fn play(&mut self, msg: &Message, channel: u8) {
        if !self.is_enabled() {
            return;
        }
        if msg.is_empty() || msg.len() > 3 {
            warn!("play() expects a 1-3 byte message, got {} bytes", msg.len());
            return;
        }
        let bytes = msg.channel_bytes(channel);
        if let Err(e) = self.backend.ops().play(&bytes) {
            self.info
                .report(crate::ErrorKind::Warning, &format!("MIDI play failed: {e}"));
        }
    }

    /// Sends a SysEx payload, chunked and paced per the info's settings.
    ///
    /// Blocks for the inter-chunk pauses.
    pub fn sysex(&mut self, msg: &Message) -> SysexReport {
        if !self.is_enabled() {
            return SysexReport::default();
        }
        let pacing = self.info.settings().sysex_pacing();
        let ops = RefCell::new(self.backend.ops());
        let report = send_chunked(
            msg.bytes(),
            pacing,
            |chunk| ops.borrow_mut().sysex_chunk(chunk),
            || ops.borrow_mut().flush(),
        );
        if !report.is_ok() {
            self.info.report(
                crate::ErrorKind::Warning,
                &format!("{} of {} SysEx chunks failed", report.failed, report.calls),
            );
        }
        report
    }

    pub fn flush(&mut self) {
        if self.state == PortState::Enabled {
            self.backend.ops().flush();
        }
    }

    pub fn start(&mut self) {
        if self.is_enabled() {
            let result = self.backend.ops().start();
            self.swallow("start", result);
        }
    }

    pub fn stop(&mut self) {
        if self.is_enabled() {
            let result = self.backend.ops().stop();
            self.swallow("stop", result);
        }
    }

    pub fn continue_from(&mut self, tick: u64, beats: u32) {
        if self.is_enabled() {
            let result = self.backend.ops().continue_from(tick, beats);
            self.swallow("continue", result);
        }
    }

    pub fn clock(&mut self, tick: u64) {
        if self.is_enabled() {
            let result = self.backend.ops().clock(tick);
            self.swallow("clock", result);
        }
    }

    /// Shared across every port on this info; last writer wins.
    pub fn set_ppqn(&mut self, ppqn: u32) -> Result<()> {
        self.info.set_ppqn(ppqn)
    }

    /// Shared across every port on this info; last writer wins.
    pub fn set_beats_per_minute(&mut self, bpm: f64) -> Result<()> {
        self.info.set_beats_per_minute(bpm)
    }

    /// Messages waiting; 0 for disabled or output ports.
    pub fn poll_for_midi(&mut self) -> usize {
        if self.is_enabled() && self.direction == Some(PortDirection::Input) {
            self.backend.ops().poll_for_midi()
        } else {
            0
        }
    }

    pub fn get_midi_event(&mut self) -> Option<Message> {
        if self.state == PortState::Enabled {
            self.backend.ops().get_midi_event()
        } else {
            None
        }
    }

    fn swallow(&self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            self.info
                .report(crate::ErrorKind::Warning, &format!("MIDI {what} failed: {e}"));
        }
    }
}

impl Drop for PortApi {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, SentKind};
    use crate::MidiSettings;
    use seqbus_midi::PortKind;
    use std::time::Duration;

    fn setup() -> (Arc<MidiInfo>, DummyBackend) {
        let backend = DummyBackend::with_through_port();
        let settings = MidiSettings::builder()
            .sysex_pacing(256, Duration::ZERO)
            .build()
            .unwrap();
        let info = MidiInfo::with_dummy(&settings, backend.clone()).unwrap();
        (info, backend)
    }

    fn through_out() -> PortSpec {
        PortSpec {
            index: 0,
            direction: PortDirection::Output,
            kind: PortKind::Normal,
            client_id: 14,
            port_id: 0,
            client_name: "Midi Through".into(),
            port_name: "Midi Through Port-0".into(),
            queue_capacity: 8,
        }
    }

    #[test]
    fn test_state_machine() {
        let (info, _) = setup();
        let mut api = PortApi::new(info);
        assert_eq!(api.state(), PortState::Uninitialized);
        api.init_out(&through_out()).unwrap();
        assert_eq!(api.state(), PortState::Enabled);
        api.deinit_out();
        assert_eq!(api.state(), PortState::Uninitialized);
    }

    #[test]
    fn test_failed_init_disables_and_can_retry() {
        let (info, backend) = setup();
        let mut api = PortApi::new(info);
        let mut spec = through_out();
        spec.client_id = 99;
        assert!(api.init_out(&spec).is_err());
        assert_eq!(api.state(), PortState::Disabled);
        assert!(!api.is_enabled());

        api.play(&Message::note_on(0, 60, 100), 0);
        assert!(backend.sent().is_empty());

        api.init_out(&through_out()).unwrap();
        assert!(api.is_enabled());
    }

    #[test]
    fn test_play_sets_channel() {
        let (info, backend) = setup();
        let mut api = PortApi::new(info);
        api.init_out(&through_out()).unwrap();
        api.play(&Message::note_on(0, 60, 100), 5);
        let sent = backend.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SentKind::Play);
        assert_eq!(sent[0].bytes, vec![0x95, 60, 100]);
    }

    #[test]
    fn test_sysex_600_bytes() {
        let (info, backend) = setup();
        let mut api = PortApi::new(info);
        api.init_out(&through_out()).unwrap();
        let mut payload = vec![0xF0];
        payload.extend((0..598).map(|i| (i % 0x7F) as u8));
        payload.push(0xF7);

        let report = api.sysex(&Message::sysex(&payload));
        assert_eq!(report.calls, 3);
        let sizes: Vec<usize> = backend.sent().iter().map(|e| e.bytes.len()).collect();
        assert_eq!(sizes, vec![256, 256, 88]);
        let joined: Vec<u8> = backend.sent().into_iter().flat_map(|e| e.bytes).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_suspend_blocks_traffic() {
        let (info, backend) = setup();
        let mut api = PortApi::new(info);
        assert!(!api.set_suspended(true));
        api.init_out(&through_out()).unwrap();
        assert!(api.set_suspended(true));
        api.start();
        api.clock(0);
        assert!(backend.sent().is_empty());
        api.set_suspended(false);
        api.start();
        assert_eq!(backend.sent().len(), 1);
    }

    #[test]
    fn test_poll_only_for_inputs() {
        let (info, backend) = setup();
        let mut out = PortApi::new(info.clone());
        out.init_out(&through_out()).unwrap();
        assert_eq!(out.poll_for_midi(), 0);

        let mut input = PortApi::new(info);
        let spec = PortSpec {
            direction: PortDirection::Input,
            ..through_out()
        };
        input.init_in(&spec).unwrap();
        let port = *backend.input_ports().last().unwrap();
        backend.inject(port, Message::clock()).unwrap();
        assert_eq!(input.poll_for_midi(), 1);
        assert_eq!(input.get_midi_event(), Some(Message::clock()));
        assert_eq!(input.get_midi_event(), None);
    }

    #[test]
    fn test_drop_closes_input_route() {
        let (info, backend) = setup();
        let spec = PortSpec {
            direction: PortDirection::Input,
            ..through_out()
        };
        {
            let mut input = PortApi::new(info);
            input.init_in(&spec).unwrap();
            assert_eq!(backend.input_ports().len(), 1);
        }
        assert!(backend.input_ports().is_empty());
    }
}
