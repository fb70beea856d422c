//! JACK MIDI backend.
//!
//! One activated JACK client per [`JackShared`]. Every bus registers its own
//! MIDI port on that client and parks it in a slot the process callback walks
//! each cycle: input slots push raw events into the bus queue, output slots
//! drain the bus ring into the port buffer.
//!
//! Non-RT code never blocks the process thread. Slot locks are only
//! `try_lock`ed on the RT side, and slot lists are swapped with `ArcSwap`.

use super::{PortOps, PortSpec, PortsChanged};
use crate::{Error, Message, MidiSettings, Result};
use ::jack::{
    AsyncClient, Client, ClientOptions, Control, MidiIn, MidiOut, NotificationHandler, Port,
    PortFlags, PortId, ProcessHandler, ProcessScope, RawMidi,
};
use arc_swap::ArcSwap;
use atomic_float::AtomicF64;
use parking_lot::Mutex;
use seqbus_midi::{
    status, timing, EventQueue, PortCatalog, PortDescriptor, PortDirection, QueueConsumer,
    QueueProducer, BAD_ID,
};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const MIDI_TYPE: &str = "midi";

enum SlotPort {
    In {
        port: Port<MidiIn>,
        producer: QueueProducer,
    },
    Out {
        port: Port<MidiOut>,
        consumer: QueueConsumer,
    },
}

/// One registered port as seen by the process callback.
struct JackSlot {
    port: Mutex<Option<SlotPort>>,
    active: AtomicBool,
    /// Input messages dropped on a full queue, mirrored from the producer.
    overflow: AtomicU64,
}

impl JackSlot {
    fn new(port: SlotPort) -> Arc<Self> {
        Arc::new(Self {
            port: Mutex::new(Some(port)),
            active: AtomicBool::new(true),
            overflow: AtomicU64::new(0),
        })
    }
}

type SlotList = Arc<ArcSwap<Vec<Arc<JackSlot>>>>;

/// Tempo the process callback stamps input with and transport locates by.
struct JackTempo {
    ppqn: AtomicU32,
    bpm: AtomicF64,
    sample_rate: u32,
}

impl JackTempo {
    /// Pulses elapsed at `frame` frames since the client was activated.
    fn pulses_at(&self, frame: u64) -> u64 {
        timing::frames_to_pulses(
            frame,
            self.ppqn.load(Ordering::Acquire),
            self.bpm.load(Ordering::Acquire),
            self.sample_rate,
        )
    }

    fn frames_at(&self, tick: u64) -> u64 {
        timing::pulse_to_frames(
            tick,
            self.ppqn.load(Ordering::Acquire),
            self.bpm.load(Ordering::Acquire),
            self.sample_rate,
        )
    }
}

fn is_filtered(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(&status::ACTIVE_SENSE | &status::RESET))
}

pub(crate) struct JackProcess {
    slots: SlotList,
    tempo: Arc<JackTempo>,
    /// Frames processed since activation.
    frames: u64,
}

impl ProcessHandler for JackProcess {
    fn process(&mut self, _: &Client, ps: &ProcessScope) -> Control {
        let cycle_start = self.frames;
        self.frames += u64::from(ps.n_frames());
        let slots = self.slots.load();
        for slot in slots.iter() {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let Some(mut guard) = slot.port.try_lock() else {
                continue;
            };
            match guard.as_mut() {
                Some(SlotPort::In { port, producer }) => {
                    for raw in port.iter(ps) {
                        if is_filtered(raw.bytes) {
                            continue;
                        }
                        let pulse = self.tempo.pulses_at(cycle_start + u64::from(raw.time));
                        producer.push(Message::new(raw.bytes, pulse));
                    }
                    slot.overflow.store(producer.dropped(), Ordering::Release);
                }
                Some(SlotPort::Out { port, consumer }) => {
                    let mut writer = port.writer(ps);
                    while let Some(msg) = consumer.front() {
                        // Buffer full for this cycle; the rest goes out next cycle.
                        if writer.write(&RawMidi { time: 0, bytes: msg.bytes() }).is_err() {
                            break;
                        }
                        consumer.pop();
                    }
                }
                None => {}
            }
        }
        Control::Continue
    }
}

pub(crate) struct JackNotifications {
    changed: PortsChanged,
}

impl NotificationHandler for JackNotifications {
    fn client_registration(&mut self, _: &Client, _name: &str, _is_registered: bool) {
        self.changed.raise();
    }

    fn port_registration(&mut self, _: &Client, _port_id: PortId, _is_registered: bool) {
        self.changed.raise();
    }
}

pub(crate) struct JackShared {
    client: Mutex<Option<AsyncClient<JackNotifications, JackProcess>>>,
    slots: SlotList,
    client_name: String,
    next_port_id: AtomicI32,
    tempo: Arc<JackTempo>,
    changed: PortsChanged,
}

impl JackShared {
    pub(crate) fn open(settings: &MidiSettings) -> Result<Self> {
        let (client, client_status) =
            Client::new(&settings.client_name, ClientOptions::NO_START_SERVER)?;
        let client_name = client.name().to_string();
        let sample_rate = client.sample_rate() as u32;
        debug!(
            "JACK client {} opened at {} Hz ({:?})",
            client_name, sample_rate, client_status
        );

        let changed = PortsChanged::default();
        let slots: SlotList = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let tempo = Arc::new(JackTempo {
            ppqn: AtomicU32::new(settings.ppqn),
            bpm: AtomicF64::new(settings.bpm),
            sample_rate,
        });
        let active = client.activate_async(
            JackNotifications {
                changed: changed.clone(),
            },
            JackProcess {
                slots: Arc::clone(&slots),
                tempo: Arc::clone(&tempo),
                frames: 0,
            },
        )?;

        Ok(Self {
            client: Mutex::new(Some(active)),
            slots,
            client_name,
            next_port_id: AtomicI32::new(0),
            tempo,
            changed,
        })
    }

    fn with_client<T>(&self, f: impl FnOnce(&Client) -> Result<T>) -> Result<T> {
        let guard = self.client.lock();
        let active = guard.as_ref().ok_or(Error::PortClosed)?;
        f(active.as_client())
    }

    pub(crate) fn ports_changed(&self) -> &PortsChanged {
        &self.changed
    }

    pub(crate) fn set_ppqn(&self, ppqn: u32) {
        self.tempo.ppqn.store(ppqn, Ordering::Release);
    }

    pub(crate) fn set_tempo_us(&self, tempo_us: u32) {
        self.tempo
            .bpm
            .store(timing::bpm_from_tempo_us(tempo_us), Ordering::Release);
    }

    /// JACK sources (`IS_OUTPUT`) feed our inputs and JACK sinks (`IS_INPUT`)
    /// take our outputs.
    pub(crate) fn scan(&self) -> Result<(PortCatalog, PortCatalog)> {
        self.with_client(|client| {
            let alias_of = |name: &str| {
                client
                    .port_by_name(name)
                    .and_then(|port| port.aliases().ok())
                    .and_then(|aliases| aliases.into_iter().next())
            };
            let sources = client.ports(None, Some(MIDI_TYPE), PortFlags::IS_OUTPUT);
            let sinks = client.ports(None, Some(MIDI_TYPE), PortFlags::IS_INPUT);
            let inputs = build_catalog(&sources, &self.client_name, PortDirection::Input, alias_of);
            let outputs =
                build_catalog(&sinks, &self.client_name, PortDirection::Output, alias_of);
            Ok((inputs, outputs))
        })
    }

    /// Registers a port and hands its slot to the process callback.
    fn register(
        &self,
        short_name: &str,
        direction: PortDirection,
        capacity: usize,
    ) -> Result<Registered> {
        let (producer, consumer) = EventQueue::channel(capacity);
        let (slot_port, full_name, endpoint) = self.with_client(|client| match direction {
            PortDirection::Input => {
                let port = client.register_port(short_name, MidiIn::default())?;
                let full_name = port.name()?;
                Ok((SlotPort::In { port, producer }, full_name, Endpoint::Input(consumer)))
            }
            PortDirection::Output => {
                let port = client.register_port(short_name, MidiOut::default())?;
                let full_name = port.name()?;
                Ok((SlotPort::Out { port, consumer }, full_name, Endpoint::Output(producer)))
            }
        })?;

        let slot = JackSlot::new(slot_port);
        self.slots.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&slot));
            next
        });
        Ok(Registered {
            slot,
            full_name,
            port_id: self.next_port_id.fetch_add(1, Ordering::AcqRel),
            endpoint,
        })
    }

    fn unregister(&self, slot: &Arc<JackSlot>) {
        slot.active.store(false, Ordering::Release);
        self.slots.rcu(|current| {
            current
                .iter()
                .filter(|s| !Arc::ptr_eq(s, slot))
                .cloned()
                .collect::<Vec<_>>()
        });
        let Some(port) = slot.port.lock().take() else {
            return;
        };
        let result = self.with_client(|client| match port {
            SlotPort::In { port, .. } => Ok(client.unregister_port(port)?),
            SlotPort::Out { port, .. } => Ok(client.unregister_port(port)?),
        });
        if let Err(e) = result {
            warn!("JACK unregister port failed: {}", e);
        }
    }

    fn connect(&self, source: &str, destination: &str) -> Result<()> {
        self.with_client(|client| match client.connect_ports_by_name(source, destination) {
            Ok(()) | Err(::jack::Error::PortAlreadyConnected(_, _)) => Ok(()),
            Err(e) => Err(Error::Driver(format!(
                "JACK connect {source} -> {destination} failed: {e}"
            ))),
        })
    }

    fn disconnect(&self, source: &str, destination: &str) {
        let result = self.with_client(|client| {
            Ok(client.disconnect_ports_by_name(source, destination)?)
        });
        if let Err(e) = result {
            debug!("JACK disconnect {} -> {}: {}", source, destination, e);
        }
    }

    fn transport_start(&self) -> Result<()> {
        self.with_client(|client| Ok(client.transport().start()?))
    }

    fn transport_stop(&self) -> Result<()> {
        self.with_client(|client| Ok(client.transport().stop()?))
    }

    fn transport_locate(&self, tick: u64) -> Result<()> {
        let frame = u32::try_from(self.tempo.frames_at(tick)).unwrap_or(u32::MAX);
        self.with_client(|client| Ok(client.transport().locate(frame)?))
    }
}

impl Drop for JackShared {
    fn drop(&mut self) {
        for slot in self.slots.load().iter() {
            slot.active.store(false, Ordering::Release);
        }
        if let Some(active) = self.client.lock().take() {
            if let Err(e) = active.deactivate() {
                warn!("JACK deactivate failed: {}", e);
            }
        }
        debug!("JACK client {} closed", self.client_name);
    }
}

/// Builds a catalog from full `client:port` names, skipping our own ports.
///
/// Client ids count up each time the client part changes; port ids are the
/// running position in the list.
fn build_catalog(
    names: &[String],
    own_client: &str,
    direction: PortDirection,
    alias_of: impl Fn(&str) -> Option<String>,
) -> PortCatalog {
    let mut catalog = PortCatalog::new(direction);
    let mut client_id = -1;
    let mut last_client: Option<&str> = None;
    for (count, full_name) in names.iter().enumerate() {
        let Some((client_name, port_name)) = full_name.split_once(':') else {
            continue;
        };
        if client_name == own_client {
            continue;
        }
        if last_client != Some(client_name) {
            client_id += 1;
            last_client = Some(client_name);
        }
        let alias = alias_of(full_name)
            .filter(|alias| alias != full_name)
            .unwrap_or_default();
        let port_id = i32::try_from(count).unwrap_or(i32::MAX);
        catalog.add(
            PortDescriptor::new(direction, client_id, client_name, port_id, port_name)
                .with_alias(alias)
                .with_internal_id(count as u64),
        );
    }
    catalog
}

/// Transport failures are logged only; the MIDI bytes are already queued.
fn transport_warn(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("JACK transport {} failed: {}", what, e);
    }
}

enum Endpoint {
    Input(QueueConsumer),
    Output(QueueProducer),
}

struct Registered {
    slot: Arc<JackSlot>,
    full_name: String,
    port_id: i32,
    endpoint: Endpoint,
}

pub(crate) struct JackPort {
    shared: Arc<JackShared>,
    slot: Option<Arc<JackSlot>>,
    local_name: String,
    local_id: i32,
    /// `(source, destination)` made by `connect`, undone at deinit.
    connection: Option<(String, String)>,
    endpoint: Option<Endpoint>,
    overflow_seen: u64,
}

impl JackPort {
    pub(crate) fn new(shared: Arc<JackShared>) -> Self {
        Self {
            shared,
            slot: None,
            local_name: String::new(),
            local_id: BAD_ID,
            connection: None,
            endpoint: None,
            overflow_seen: 0,
        }
    }

    fn open(&mut self, short_name: &str, spec: &PortSpec) -> Result<()> {
        let registered = self
            .shared
            .register(short_name, spec.direction, spec.queue_capacity)?;
        self.local_name = registered.full_name;
        self.local_id = registered.port_id;
        self.endpoint = Some(registered.endpoint);
        self.slot = Some(registered.slot);
        Ok(())
    }

    fn rederive(&self, spec: &mut PortSpec) {
        spec.client_id = 0;
        spec.client_name = self.shared.client_name.clone();
        if let Some((_, port)) = self.local_name.split_once(':') {
            spec.port_name = port.to_string();
        }
        spec.port_id = self.local_id;
    }

    fn release(&mut self) {
        if let Some((source, destination)) = self.connection.take() {
            self.shared.disconnect(&source, &destination);
        }
        if let Some(slot) = self.slot.take() {
            self.shared.unregister(&slot);
        }
        self.endpoint = None;
        self.local_name.clear();
        self.local_id = BAD_ID;
    }

    fn push(&mut self, msg: Message) -> Result<()> {
        let Some(Endpoint::Output(producer)) = self.endpoint.as_mut() else {
            return Err(Error::PortClosed);
        };
        if producer.push(msg) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }
}

impl PortOps for JackPort {
    fn init_out(&mut self, spec: &PortSpec) -> Result<()> {
        self.open(&format!("midi out {}", spec.index), spec)
    }

    fn init_out_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let name = spec.port_name.clone();
        self.open(&name, spec)?;
        self.rederive(spec);
        Ok(())
    }

    fn init_in(&mut self, spec: &PortSpec) -> Result<()> {
        self.open(&format!("midi in {}", spec.index), spec)
    }

    fn init_in_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let name = spec.port_name.clone();
        self.open(&name, spec)?;
        self.rederive(spec);
        Ok(())
    }

    fn deinit_out(&mut self) {
        self.release();
    }

    fn deinit_in(&mut self) {
        self.release();
    }

    fn connect(&mut self, spec: &PortSpec) -> Result<()> {
        if self.slot.is_none() {
            return Err(Error::PortClosed);
        }
        let peer = spec.connect_name();
        let (source, destination) = match spec.direction {
            PortDirection::Input => (peer, self.local_name.clone()),
            PortDirection::Output => (self.local_name.clone(), peer),
        };
        self.shared.connect(&source, &destination)?;
        debug!("JACK connected {} -> {}", source, destination);
        self.connection = Some((source, destination));
        Ok(())
    }

    fn play(&mut self, bytes: &[u8]) -> Result<()> {
        self.push(Message::try_new(bytes, 0)?)
    }

    fn sysex_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.push(Message::new(chunk, 0))
    }

    /// The process callback drains output every cycle.
    fn flush(&mut self) {}

    fn start(&mut self) -> Result<()> {
        self.push(Message::start())?;
        transport_warn("start", self.shared.transport_start());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.push(Message::stop())?;
        transport_warn("stop", self.shared.transport_stop());
        Ok(())
    }

    fn continue_from(&mut self, tick: u64, beats: u32) -> Result<()> {
        self.push(Message::song_position(beats))?;
        self.push(Message::continue_())?;
        transport_warn("locate", self.shared.transport_locate(tick));
        transport_warn("start", self.shared.transport_start());
        Ok(())
    }

    fn clock(&mut self, _tick: u64) -> Result<()> {
        self.push(Message::clock())
    }

    fn set_suspended(&mut self, suspended: bool) {
        if let Some(slot) = &self.slot {
            slot.active.store(!suspended, Ordering::Release);
        }
    }

    fn poll_for_midi(&mut self) -> usize {
        if let Some(slot) = &self.slot {
            let dropped = slot.overflow.load(Ordering::Acquire);
            if dropped > self.overflow_seen {
                warn!(
                    "JACK input {} dropped {} messages on a full queue",
                    self.local_name,
                    dropped - self.overflow_seen
                );
                self.overflow_seen = dropped;
            }
        }
        match &self.endpoint {
            Some(Endpoint::Input(consumer)) => consumer.len(),
            _ => 0,
        }
    }

    fn get_midi_event(&mut self) -> Option<Message> {
        match self.endpoint.as_mut() {
            Some(Endpoint::Input(consumer)) => consumer.pop(),
            _ => None,
        }
    }
}
