//! Bus: the logical MIDI port the application holds.
//!
//! A bus binds a logical index to one port (catalog entry or synthesized
//! virtual endpoint) and owns the [`PortApi`] that talks to it. Clock pacing
//! lives here, so backends only ever see single clock ticks.

use crate::backend::PortSpec;
use crate::{Error, MidiApi, MidiInfo, PortApi, PortState, Result};
use seqbus_midi::sysex::SysexReport;
use seqbus_midi::timing::{
    clock_mod_ticks, clock_ticks_from_ppqn, pulses_per_sixteenth, song_position_beats,
};
use seqbus_midi::{ClockMode, Message, PortDescriptor, PortDirection, PortKind};
use std::sync::Arc;
use tracing::debug;

pub struct Bus {
    info: Arc<MidiInfo>,
    api: PortApi,
    spec: PortSpec,
    bus_id: i32,
    bus_id_override: Option<i32>,
    port_id: i32,
    alias: String,
    clock_mode: ClockMode,
    /// Last pulse a clock decision was made for; -1 before the first.
    last_tick: i64,
}

impl Bus {
    /// Builds a bus without opening it.
    ///
    /// Normal and system buses resolve their names and ids from the catalog
    /// for `direction` at `index`; an index past the end is
    /// [`Error::InvalidPort`]. Virtual buses are named `"midi in N"` /
    /// `"midi out N"` and need no catalog entry. `bus_id` overrides the
    /// resolved bus id.
    pub fn new(
        info: Arc<MidiInfo>,
        index: usize,
        direction: PortDirection,
        kind: PortKind,
        bus_id: Option<i32>,
    ) -> Result<Self> {
        let queue_capacity = info.settings().queue_capacity;
        let (spec, resolved_bus, port_id, alias) = match kind {
            PortKind::Virtual => {
                let spec = PortSpec {
                    index,
                    direction,
                    kind,
                    client_id: info.client_id(),
                    port_id: seqbus_midi::BAD_ID,
                    client_name: info.client_name().to_string(),
                    port_name: format!("midi {} {}", direction.short_name(), index),
                    queue_capacity,
                };
                (spec, index as i32, index as i32, String::new())
            }
            PortKind::Normal | PortKind::System => {
                let catalog = info.catalog(direction);
                let port = catalog
                    .get(index)
                    .ok_or(Error::InvalidPort { direction, index })?;
                let spec = PortSpec {
                    index,
                    direction,
                    kind: if port.is_system() { PortKind::System } else { kind },
                    client_id: port.client_id,
                    port_id: port.port_id,
                    client_name: port.client_name.clone(),
                    port_name: port.port_name.clone(),
                    queue_capacity,
                };
                (spec, port.client_id, port.port_id, port.alias.clone())
            }
        };

        let clock_mode = match direction {
            PortDirection::Output => info.settings().default_clock,
            PortDirection::Input => ClockMode::Disabled,
        };
        let api = PortApi::new(info.clone());
        Ok(Self {
            info,
            api,
            spec,
            bus_id: bus_id.unwrap_or(resolved_bus),
            bus_id_override: bus_id,
            port_id,
            alias,
            clock_mode,
            last_tick: -1,
        })
    }

    /// A bus bound to catalog entry `index`.
    pub fn from_catalog(
        info: Arc<MidiInfo>,
        direction: PortDirection,
        index: usize,
    ) -> Result<Self> {
        Self::new(info, index, direction, PortKind::Normal, None)
    }

    /// A fresh endpoint other software can connect to.
    pub fn virtual_bus(
        info: Arc<MidiInfo>,
        direction: PortDirection,
        index: usize,
    ) -> Result<Self> {
        Self::new(info, index, direction, PortKind::Virtual, None)
    }

    // -- identity --------------------------------------------------------

    pub fn index(&self) -> usize {
        self.spec.index
    }

    /// Moves the bus to a new catalog index after a rescan.
    pub fn set_index(&mut self, index: usize) {
        self.spec.index = index;
        if self.is_virtual() {
            self.spec.port_name = format!("midi {} {}", self.spec.direction.short_name(), index);
        }
    }

    /// Rebinds a catalog bus to `port`, found at `index` by a rescan.
    ///
    /// Takes effect on the next open; an open bus keeps talking to the old
    /// address until then.
    pub fn retarget(&mut self, index: usize, port: &PortDescriptor) {
        if self.is_virtual() {
            return;
        }
        self.spec.index = index;
        self.spec.client_id = port.client_id;
        self.spec.port_id = port.port_id;
        self.spec.client_name = port.client_name.clone();
        self.spec.port_name = port.port_name.clone();
        self.spec.kind = if port.is_system() {
            PortKind::System
        } else {
            PortKind::Normal
        };
        self.bus_id = self.bus_id_override.unwrap_or(port.client_id);
        self.port_id = port.port_id;
        self.alias = port.alias.clone();
    }

    pub fn bus_id(&self) -> i32 {
        self.bus_id
    }

    pub fn port_id(&self) -> i32 {
        self.port_id
    }

    pub fn direction(&self) -> PortDirection {
        self.spec.direction
    }

    pub fn kind(&self) -> PortKind {
        self.spec.kind
    }

    pub fn is_input(&self) -> bool {
        self.spec.direction.is_input()
    }

    pub fn is_virtual(&self) -> bool {
        self.spec.kind == PortKind::Virtual
    }

    pub fn is_system(&self) -> bool {
        self.spec.kind == PortKind::System
    }

    pub fn queue_number(&self) -> i32 {
        self.info.global_queue()
    }

    pub fn bus_name(&self) -> &str {
        &self.spec.client_name
    }

    pub fn port_name(&self) -> &str {
        &self.spec.port_name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn connect_name(&self) -> String {
        self.spec.connect_name()
    }

    /// `"[index] bus_id:port_id client:port"`
    pub fn display_name(&self) -> String {
        format!(
            "[{}] {}:{} {}",
            self.spec.index,
            self.bus_id,
            self.port_id,
            self.connect_name()
        )
    }

    /// Address the subsystem knows this port by; for virtual buses this is
    /// only meaningful after a successful open.
    pub fn native_address(&self) -> (i32, i32) {
        (self.spec.client_id, self.spec.port_id)
    }

    /// The bus as a port record, for listings.
    pub fn descriptor(&self) -> PortDescriptor {
        PortDescriptor::new(
            self.spec.direction,
            self.bus_id,
            self.spec.client_name.clone(),
            self.port_id,
            self.spec.port_name.clone(),
        )
        .with_kind(self.spec.kind)
        .with_alias(self.alias.clone())
    }

    pub fn api(&self) -> MidiApi {
        self.api.api()
    }

    pub fn info(&self) -> &Arc<MidiInfo> {
        &self.info
    }

    // -- lifecycle -------------------------------------------------------

    /// Opens the native port with the init variant for this bus's kind.
    pub fn open(&mut self) -> Result<()> {
        let result = match (self.spec.direction, self.spec.kind) {
            (PortDirection::Output, PortKind::Virtual) => self.api.init_out_virtual(&mut self.spec),
            (PortDirection::Output, _) => self.api.init_out(&self.spec),
            (PortDirection::Input, PortKind::Virtual) => self.api.init_in_virtual(&mut self.spec),
            (PortDirection::Input, _) => self.api.init_in(&self.spec),
        };
        if result.is_ok() {
            debug!("Bus {} open", self.display_name());
        }
        result
    }

    pub fn close(&mut self) {
        self.api.close();
        self.last_tick = -1;
    }

    pub fn state(&self) -> PortState {
        self.api.state()
    }

    pub fn enabled(&self) -> bool {
        self.api.is_enabled()
    }

    /// Pauses or resumes traffic on an open bus. Returns false if not open.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        self.api.set_suspended(!enabled)
    }

    // -- output ----------------------------------------------------------

    pub fn play(&mut self, msg: &Message, channel: u8) {
        self.api.play(msg, channel);
    }

    /// Sends `msg` on its own channel; SysEx goes through [`Bus::sysex`].
    pub fn send(&mut self, msg: &Message) {
        if msg.is_sysex() {
            self.sysex(msg);
        } else {
            self.play(msg, msg.channel().unwrap_or(0));
        }
    }

    pub fn sysex(&mut self, msg: &Message) -> SysexReport {
        self.api.sysex(msg)
    }

    pub fn flush(&mut self) {
        self.api.flush();
    }

    // -- transport and clock ---------------------------------------------

    pub fn clock_mode(&self) -> ClockMode {
        self.clock_mode
    }

    pub fn set_clock_mode(&mut self, mode: ClockMode) {
        self.clock_mode = mode;
    }

    pub fn clock_enabled(&self) -> bool {
        !self.is_input() && self.clock_mode.emits_clock()
    }

    /// Resets clock pacing; sends start when this bus emits clock.
    pub fn start(&mut self) {
        self.last_tick = -1;
        if self.clock_enabled() {
            self.api.start();
        }
    }

    pub fn stop(&mut self) {
        self.last_tick = -1;
        if self.clock_enabled() {
            self.api.stop();
        }
    }

    /// Song position for `tick`, then continue. Clocks resume at the next
    /// sixteenth boundary.
    pub fn continue_from(&mut self, tick: u64) {
        let ppqn = self.ppqn();
        let sixteenth = u64::from(pulses_per_sixteenth(ppqn));
        let leftover = tick % sixteenth;
        let mut starting = tick - leftover;
        if leftover > 0 {
            starting += sixteenth;
        }
        self.last_tick = starting as i64 - 1;
        if self.clock_enabled() {
            self.api.continue_from(tick, song_position_beats(tick, ppqn));
        }
    }

    /// Prepares clock output for playback starting at `tick`.
    ///
    /// In `Pos` mode a nonzero tick resumes from that song position. Otherwise
    /// start is sent and, in `Mod` mode, clocks begin at the next 16-bar
    /// boundary.
    pub fn init_clock(&mut self, tick: u64) {
        if !self.clock_enabled() {
            return;
        }
        if self.clock_mode == ClockMode::Pos && tick != 0 {
            self.continue_from(tick);
            return;
        }
        self.start();
        let mut starting = tick;
        if self.clock_mode == ClockMode::Mod {
            let modulus = clock_mod_ticks(self.ppqn());
            let leftover = tick % modulus;
            if leftover > 0 {
                starting = tick - leftover + modulus;
            }
        }
        self.last_tick = starting as i64 - 1;
    }

    /// Emits every clock due between the last call and `tick`, then flushes once.
    pub fn clock(&mut self, tick: u64) {
        if !self.clock_enabled() {
            return;
        }
        let target = tick as i64;
        if target <= self.last_tick {
            return;
        }
        let step = i64::from(clock_ticks_from_ppqn(self.ppqn()));
        let first = self.last_tick + 1;
        let mut next = (first + step - 1) / step * step;
        let mut emitted = false;
        while next <= target {
            self.api.clock(next as u64);
            next += step;
            emitted = true;
        }
        self.last_tick = target;
        if emitted {
            self.api.flush();
        }
    }

    // -- shared tempo ----------------------------------------------------

    pub fn ppqn(&self) -> u32 {
        self.info.ppqn()
    }

    pub fn bpm(&self) -> f64 {
        self.info.bpm()
    }

    /// Changes PPQN for every bus on this bus's info.
    pub fn set_ppqn(&mut self, ppqn: u32) -> Result<()> {
        self.api.set_ppqn(ppqn)
    }

    /// Changes tempo for every bus on this bus's info.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        self.api.set_beats_per_minute(bpm)
    }

    // -- input -----------------------------------------------------------

    /// Messages ready to [`receive`](Bus::receive); 0 when closed or output.
    pub fn poll(&mut self) -> usize {
        self.api.poll_for_midi()
    }

    /// Next received message, tagged with this bus's index.
    pub fn receive(&mut self) -> Option<Message> {
        let tag = self.spec.source_tag();
        self.api.get_midi_event().map(|msg| msg.with_source(tag))
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.display_name())
            .field("direction", &self.spec.direction)
            .field("kind", &self.spec.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, SentKind};
    use crate::MidiSettings;

    fn setup(clock: ClockMode) -> (Arc<MidiInfo>, DummyBackend) {
        let backend = DummyBackend::with_through_port();
        let settings = MidiSettings::builder()
            .tempo(96, 120.0)
            .default_clock(clock)
            .build()
            .unwrap();
        let info = MidiInfo::with_dummy(&settings, backend.clone()).unwrap();
        (info, backend)
    }

    fn clocks(backend: &DummyBackend) -> usize {
        backend
            .sent()
            .iter()
            .filter(|e| e.kind == SentKind::Clock)
            .count()
    }

    #[test]
    fn test_catalog_bus_resolves_names() {
        let (info, _) = setup(ClockMode::Off);
        let bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        assert_eq!(bus.bus_id(), 14);
        assert_eq!(bus.port_id(), 0);
        assert_eq!(bus.connect_name(), "Midi Through:Midi Through Port-0");
        assert_eq!(bus.display_name(), "[0] 14:0 Midi Through:Midi Through Port-0");
        assert_eq!(bus.state(), PortState::Uninitialized);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let (info, _) = setup(ClockMode::Off);
        let err = Bus::from_catalog(info, PortDirection::Input, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPort {
                direction: PortDirection::Input,
                index: 3
            }
        ));
    }

    #[test]
    fn test_bus_id_override() {
        let (info, _) = setup(ClockMode::Off);
        let bus = Bus::new(info, 0, PortDirection::Output, PortKind::Normal, Some(3)).unwrap();
        assert_eq!(bus.bus_id(), 3);
    }

    #[test]
    fn test_retarget_follows_renumbered_port() {
        let (info, backend) = setup(ClockMode::Off);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.close();

        backend.remove_port(PortDirection::Output, 14, 0);
        let moved = PortDescriptor::new(
            PortDirection::Output,
            20,
            "Midi Through",
            1,
            "Midi Through Port-0",
        )
        .with_alias("loopback");
        backend.add_port(moved.clone());

        bus.retarget(3, &moved);
        assert_eq!(bus.index(), 3);
        assert_eq!(bus.bus_id(), 20);
        assert_eq!(bus.port_id(), 1);
        assert_eq!(bus.native_address(), (20, 1));
        assert_eq!(bus.alias(), "loopback");
        bus.open().unwrap();
        assert!(bus.enabled());
    }

    #[test]
    fn test_retarget_keeps_bus_id_override() {
        let (info, _) = setup(ClockMode::Off);
        let mut bus = Bus::new(info, 0, PortDirection::Output, PortKind::Normal, Some(3)).unwrap();
        let moved = PortDescriptor::new(PortDirection::Output, 20, "Midi Through", 0, "p");
        bus.retarget(0, &moved);
        assert_eq!(bus.bus_id(), 3);
        assert_eq!(bus.native_address(), (20, 0));
    }

    #[test]
    fn test_virtual_open_rederives_native_address() {
        let (info, _) = setup(ClockMode::Off);
        let mut bus = Bus::virtual_bus(info, PortDirection::Input, 2).unwrap();
        assert_eq!(bus.port_name(), "midi in 2");
        bus.open().unwrap();
        assert_eq!(bus.bus_id(), 2);
        assert_eq!(bus.native_address().0, 128);
        assert!(bus.native_address().1 >= 0);
    }

    #[test]
    fn test_clock_pacing() {
        let (info, backend) = setup(ClockMode::Pos);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.init_clock(0);
        backend.clear_sent();

        // 96 PPQN: one clock every 4 pulses, pulses 0, 4, 8.
        bus.clock(10);
        assert_eq!(clocks(&backend), 3);
        let flushes = backend.flush_count();

        bus.clock(11);
        assert_eq!(clocks(&backend), 3);
        assert_eq!(backend.flush_count(), flushes);

        bus.clock(95);
        assert_eq!(clocks(&backend), 24);
    }

    #[test]
    fn test_clock_off_sends_nothing() {
        let (info, backend) = setup(ClockMode::Off);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.init_clock(0);
        bus.clock(500);
        assert!(backend.sent().is_empty());
    }

    #[test]
    fn test_init_clock_pos_resumes_from_tick() {
        let (info, backend) = setup(ClockMode::Pos);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.init_clock(96 * 4);
        let kinds: Vec<SentKind> = backend.sent().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![SentKind::SongPosition, SentKind::Continue]);
        // 4 quarters = 16 sixteenths.
        assert_eq!(backend.sent()[0].bytes, vec![0xF2, 16, 0]);
    }

    #[test]
    fn test_init_clock_mod_waits_for_boundary() {
        let (info, backend) = setup(ClockMode::Mod);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        // 96 PPQN: 24 pulses per sixteenth, 1536 per 16 bars.
        bus.init_clock(100);
        assert_eq!(backend.sent()[0].kind, SentKind::Start);
        bus.clock(1535);
        assert_eq!(clocks(&backend), 0);
        bus.clock(1536);
        assert_eq!(clocks(&backend), 1);
    }

    #[test]
    fn test_transport_gated_on_clock_mode() {
        let (info, backend) = setup(ClockMode::Off);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.start();
        bus.continue_from(100);
        bus.stop();
        assert!(backend.sent().is_empty());

        bus.set_clock_mode(ClockMode::Pos);
        // 100 pulses is 4 sixteenths and a bit; clocks resume at pulse 120.
        bus.continue_from(100);
        bus.clock(119);
        assert_eq!(clocks(&backend), 0);
        bus.clock(120);
        assert_eq!(clocks(&backend), 1);
        assert_eq!(backend.sent()[0].bytes, vec![0xF2, 4, 0]);
    }

    #[test]
    fn test_receive_tags_source() {
        let (info, backend) = setup(ClockMode::Off);
        let mut bus = Bus::virtual_bus(info, PortDirection::Input, 5).unwrap();
        bus.open().unwrap();
        backend
            .inject(bus.native_address().1, Message::note_on(1, 64, 90))
            .unwrap();
        assert_eq!(bus.poll(), 1);
        let msg = bus.receive().unwrap();
        assert_eq!(msg.source_bus(), Some(5));
        assert_eq!(msg.channel(), Some(1));
    }

    #[test]
    fn test_send_routes_sysex() {
        let (info, backend) = setup(ClockMode::Off);
        let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
        bus.open().unwrap();
        bus.send(&Message::sysex(&[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]));
        bus.send(&Message::control_change(3, 7, 100));
        let sent = backend.sent();
        assert_eq!(sent[0].kind, SentKind::Sysex);
        assert_eq!(sent[1].kind, SentKind::Play);
        assert_eq!(sent[1].bytes, vec![0xB3, 7, 100]);
    }
}
