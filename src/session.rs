//! MidiSession: the set of buses an application plays through.
//!
//! One session owns one [`MidiInfo`] and every [`Bus`] built on it. In
//! manual-port mode the buses are virtual endpoints; otherwise there is one
//! bus per catalog entry. Transport and clock calls fan out to every output
//! bus, tempo changes go to the shared timing queue.

use crate::{Error, Result};
use seqbus_midi::{ClockMode, Message, PortDirection};
use seqbus_midi_io::{Bus, MidiApi, MidiInfo, MidiSettings, PortState};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transport request fanned out to every output bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Start,
    Stop,
    /// Resume from a pulse position.
    Continue(u64),
}

/// One row of [`MidiSession::enumerate_ports`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortListing {
    pub index: usize,
    pub bus_id: i32,
    pub port_id: i32,
    /// "client:port"
    pub name: String,
    pub alias: String,
    pub is_virtual: bool,
    pub is_system: bool,
    /// False for a bus that failed to open or was closed.
    pub enabled: bool,
}

impl fmt::Display for PortListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}:{} {}", self.index, self.bus_id, self.port_id, self.name)?;
        if !self.alias.is_empty() {
            write!(f, " ({})", self.alias)?;
        }
        if self.is_virtual {
            f.write_str(" (virtual)")?;
        }
        if self.is_system {
            f.write_str(" (system)")?;
        }
        if !self.enabled {
            f.write_str(" (disabled)")?;
        }
        Ok(())
    }
}

pub struct MidiSession {
    inputs: Vec<Bus>,
    outputs: Vec<Bus>,
    /// Buses closed by a rescan because their port disappeared.
    vanished: HashSet<(PortDirection, usize)>,
    info: Arc<MidiInfo>,
}

impl MidiSession {
    pub fn builder() -> crate::MidiSessionBuilder {
        crate::MidiSessionBuilder::default()
    }

    /// Opens a backend per `settings` and builds its buses.
    pub fn open(settings: &MidiSettings) -> Result<Self> {
        Self::builder().settings(settings.clone()).build()
    }

    /// Builds and opens the buses for an already opened backend.
    ///
    /// Buses that fail to open stay in the session, disabled.
    pub fn from_info(info: Arc<MidiInfo>) -> Self {
        let settings = info.settings().clone();
        let mut session = Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            vanished: HashSet::new(),
            info,
        };
        if settings.manual_ports {
            session.inputs = session.build_virtual(PortDirection::Input, settings.virtual_inputs);
            session.outputs =
                session.build_virtual(PortDirection::Output, settings.virtual_outputs);
        } else {
            session.inputs = session.build_catalog(PortDirection::Input);
            session.outputs = session.build_catalog(PortDirection::Output);
        }
        info!(
            "MIDI session on {}: {} inputs, {} outputs",
            session.info.api(),
            session.inputs.len(),
            session.outputs.len()
        );
        session
    }

    fn build_virtual(&self, direction: PortDirection, count: usize) -> Vec<Bus> {
        (0..count)
            .filter_map(|index| match Bus::virtual_bus(self.info.clone(), direction, index) {
                Ok(bus) => Some(Self::opened(bus)),
                Err(e) => {
                    warn!("Virtual {} bus {} not built: {}", direction, index, e);
                    None
                }
            })
            .collect()
    }

    fn build_catalog(&self, direction: PortDirection) -> Vec<Bus> {
        let count = self.info.catalog(direction).count();
        (0..count)
            .filter_map(|index| match Bus::from_catalog(self.info.clone(), direction, index) {
                Ok(bus) => Some(Self::opened(bus)),
                Err(e) => {
                    warn!("{} bus {} not built: {}", direction, index, e);
                    None
                }
            })
            .collect()
    }

    /// Open failures are already reported by the bus; the bus stays disabled.
    fn opened(mut bus: Bus) -> Bus {
        let _ = bus.open();
        bus
    }

    pub fn info(&self) -> &Arc<MidiInfo> {
        &self.info
    }

    pub fn api(&self) -> MidiApi {
        self.info.api()
    }

    fn buses(&self, direction: PortDirection) -> &[Bus] {
        match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        }
    }

    fn buses_mut(&mut self, direction: PortDirection) -> &mut Vec<Bus> {
        match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        }
    }

    pub fn bus(&self, direction: PortDirection, index: usize) -> Option<&Bus> {
        self.buses(direction).get(index)
    }

    pub fn bus_mut(&mut self, direction: PortDirection, index: usize) -> Option<&mut Bus> {
        self.buses_mut(direction).get_mut(index)
    }

    fn require(&mut self, direction: PortDirection, index: usize) -> Result<&mut Bus> {
        self.buses_mut(direction)
            .get_mut(index)
            .ok_or(Error::NoBus { direction, index })
    }

    pub fn bus_count(&self, direction: PortDirection) -> usize {
        self.buses(direction).len()
    }

    // -- ports -------------------------------------------------------------

    pub fn enumerate_ports(&self, direction: PortDirection) -> Vec<PortListing> {
        self.buses(direction)
            .iter()
            .enumerate()
            .map(|(index, bus)| PortListing {
                index,
                bus_id: bus.bus_id(),
                port_id: bus.port_id(),
                name: bus.connect_name(),
                alias: bus.alias().to_string(),
                is_virtual: bus.is_virtual(),
                is_system: bus.is_system(),
                enabled: bus.enabled(),
            })
            .collect()
    }

    /// Opens (or re-opens) bus `index`.
    pub fn open_bus(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        self.vanished.remove(&(direction, index));
        let bus = self.require(direction, index)?;
        if bus.state() == PortState::Enabled {
            return Ok(());
        }
        Ok(bus.open()?)
    }

    pub fn close_bus(&mut self, direction: PortDirection, index: usize) -> Result<()> {
        self.vanished.remove(&(direction, index));
        self.require(direction, index)?.close();
        Ok(())
    }

    /// Pauses or resumes traffic on an open bus without closing it.
    pub fn set_bus_enabled(
        &mut self,
        direction: PortDirection,
        index: usize,
        enabled: bool,
    ) -> Result<bool> {
        Ok(self.require(direction, index)?.set_enabled(enabled))
    }

    /// True once after ports appeared or disappeared in the subsystem.
    pub fn ports_changed(&self) -> bool {
        self.info.take_ports_changed()
    }

    /// Rescans the subsystem and re-resolves every catalog bus.
    ///
    /// Buses are matched by address and connect name, then by connect name
    /// alone, and pick up the new numbering. A bus whose port vanished is
    /// closed and reopened once the port returns. Outside manual-port mode a
    /// bus is added and opened for each port that appeared. Virtual buses are
    /// left alone.
    pub fn rescan(&mut self) -> Result<usize> {
        let total = self.info.scan()?;
        let manual = self.info.settings().manual_ports;
        for direction in [PortDirection::Input, PortDirection::Output] {
            let catalog = self.info.catalog(direction);
            let mut seen = vec![false; catalog.count()];
            let Self {
                inputs,
                outputs,
                vanished,
                ..
            } = &mut *self;
            let buses = match direction {
                PortDirection::Input => inputs,
                PortDirection::Output => outputs,
            };
            for (position, bus) in buses.iter_mut().enumerate() {
                if bus.is_virtual() {
                    continue;
                }
                let name = bus.connect_name();
                let (client_id, port_id) = bus.native_address();
                let Some(index) = catalog.resolve(client_id, port_id, &name, |i| seen[i]) else {
                    if bus.state() == PortState::Enabled {
                        warn!("{} is gone, closing", name);
                        bus.close();
                        vanished.insert((direction, position));
                    }
                    continue;
                };
                seen[index] = true;
                let mut reopen = vanished.remove(&(direction, position));
                if let Some(port) = catalog.get(index) {
                    let renumbered = (port.client_id, port.port_id) != (client_id, port_id);
                    if renumbered || index != bus.index() {
                        debug!(
                            "{} moved to index {} at {}:{}",
                            name, index, port.client_id, port.port_id
                        );
                        bus.retarget(index, port);
                    }
                    // An open bus still points at the old address.
                    reopen |= renumbered && bus.state() == PortState::Enabled;
                }
                if reopen {
                    match bus.open() {
                        Ok(()) => info!("{} reopened at {}:{}", name, bus.bus_id(), bus.port_id()),
                        Err(e) => warn!("{} failed to reopen: {}", name, e),
                    }
                }
            }
            if manual {
                continue;
            }
            for (index, _) in seen.iter().enumerate().filter(|(_, seen)| !**seen) {
                match Bus::from_catalog(self.info.clone(), direction, index) {
                    Ok(bus) => {
                        debug!("New {} port {}", direction, bus.connect_name());
                        self.buses_mut(direction).push(Self::opened(bus));
                    }
                    Err(e) => warn!("{} bus {} not built: {}", direction, index, e),
                }
            }
        }
        Ok(total)
    }

    /// Both catalogs as text, one line per port.
    pub fn port_list(&self) -> String {
        self.info.port_list()
    }

    // -- traffic -----------------------------------------------------------

    /// Sends `msg` on output bus `index`. SysEx is chunked and paced.
    ///
    /// Sending on a disabled bus is a silent no-op.
    pub fn send(&mut self, index: usize, msg: &Message) -> Result<()> {
        self.require(PortDirection::Output, index)?.send(msg);
        Ok(())
    }

    /// Next message waiting on input bus `index`.
    pub fn poll(&mut self, index: usize) -> Result<Option<Message>> {
        let bus = self.require(PortDirection::Input, index)?;
        if bus.poll() == 0 {
            return Ok(None);
        }
        Ok(bus.receive())
    }

    /// Drains every enabled input bus, in bus order.
    pub fn poll_all(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        for bus in self.inputs.iter_mut().filter(|bus| bus.enabled()) {
            if bus.poll() > 0 {
                while let Some(msg) = bus.receive() {
                    received.push(msg);
                }
            }
        }
        received
    }

    pub fn flush(&mut self) {
        for bus in self.outputs.iter_mut() {
            bus.flush();
        }
        self.info.flush();
    }

    // -- tempo, transport and clock -----------------------------------------

    /// Reprograms the shared timing queue for every bus.
    pub fn set_tempo(&self, ppqn: u32, bpm: f64) -> Result<()> {
        self.info.set_ppqn(ppqn)?;
        self.info.set_beats_per_minute(bpm)?;
        Ok(())
    }

    pub fn ppqn(&self) -> u32 {
        self.info.ppqn()
    }

    pub fn bpm(&self) -> f64 {
        self.info.bpm()
    }

    pub fn set_clock(&mut self, index: usize, mode: ClockMode) -> Result<()> {
        self.require(PortDirection::Output, index)?.set_clock_mode(mode);
        Ok(())
    }

    pub fn clock_mode(&self, index: usize) -> Option<ClockMode> {
        self.outputs.get(index).map(Bus::clock_mode)
    }

    /// Start, stop or continue on every output bus that emits clock.
    pub fn transport(&mut self, request: Transport) {
        debug!("MIDI transport {:?}", request);
        for bus in self.outputs.iter_mut() {
            match request {
                Transport::Start => bus.start(),
                Transport::Stop => bus.stop(),
                Transport::Continue(tick) => bus.continue_from(tick),
            }
        }
        self.info.flush();
    }

    /// Prepares clock output on every output bus for playback from `tick`.
    pub fn init_clock(&mut self, tick: u64) {
        for bus in self.outputs.iter_mut() {
            bus.init_clock(tick);
        }
        self.info.flush();
    }

    /// Emits the clocks due up to `tick` on every output bus.
    pub fn clock(&mut self, tick: u64) {
        for bus in self.outputs.iter_mut() {
            bus.clock(tick);
        }
    }
}

impl Drop for MidiSession {
    fn drop(&mut self) {
        for bus in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            bus.close();
        }
        debug!("MIDI session closed");
    }
}

impl fmt::Debug for MidiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiSession")
            .field("api", &self.info.api())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqbus_midi_io::{DummyBackend, SentKind};
    use seqbus_midi::PortDescriptor;

    fn session(backend: &DummyBackend) -> MidiSession {
        MidiSession::builder()
            .dummy(backend.clone())
            .tempo(96, 120.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_catalog_mode_builds_one_bus_per_port() {
        let backend = DummyBackend::with_through_port();
        let session = session(&backend);
        assert_eq!(session.bus_count(PortDirection::Input), 1);
        assert_eq!(session.bus_count(PortDirection::Output), 1);
        assert!(session.enumerate_ports(PortDirection::Output)[0].enabled);
    }

    #[test]
    fn test_unknown_bus_index() {
        let backend = DummyBackend::with_through_port();
        let mut session = session(&backend);
        let err = session.send(4, &Message::clock()).unwrap_err();
        assert!(matches!(
            err,
            Error::NoBus {
                direction: PortDirection::Output,
                index: 4
            }
        ));
    }

    #[test]
    fn test_transport_reaches_clocked_buses_only() {
        let backend = DummyBackend::with_through_port();
        backend.add_port(PortDescriptor::new(PortDirection::Output, 130, "Synth", 0, "in"));
        let mut session = session(&backend);
        session.set_clock(1, ClockMode::Pos).unwrap();

        session.transport(Transport::Start);
        session.transport(Transport::Stop);

        let sent = backend.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, SentKind::Start);
        assert_eq!(sent[1].kind, SentKind::Stop);
    }

    #[test]
    fn test_listing_display() {
        let row = PortListing {
            index: 2,
            bus_id: 20,
            port_id: 0,
            name: "USB Keys:Keys MIDI 1".into(),
            alias: String::new(),
            is_virtual: false,
            is_system: false,
            enabled: false,
        };
        assert_eq!(row.to_string(), "[2] 20:0 USB Keys:Keys MIDI 1 (disabled)");
    }
}
