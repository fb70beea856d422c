//! ALSA sequencer backend.
//!
//! One nonblocking duplex sequencer client per [`AlsaShared`], with one
//! allocated queue whose tempo every bus shares. Each bus owns a local port:
//! normal buses subscribe it to the resolved peer, virtual buses leave it
//! open for others to subscribe to.
//!
//! Input is poll-driven. Whichever input bus polls first drains the client's
//! event buffer and routes each event to the queue of the bus whose local
//! port received it.

use super::{PortOps, PortSpec, PortsChanged};
use crate::{Error, Message, MidiSettings, Result};
use ::alsa::seq::{
    Addr, ClientIter, EvCtrl, EvQueueControl, Event, EventType, MidiEvent, PortCap, PortIter,
    PortSubscribe, PortType, Seq,
};
use parking_lot::Mutex;
use seqbus_midi::{
    status, EventQueue, PortCatalog, PortDescriptor, PortDirection, PortKind, QueueConsumer,
    QueueProducer,
};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tag carried by clock events so receivers can tell them from other traffic.
const CLOCK_TAG: u8 = 127;

const ENCODE_BUFFER: u32 = 16;
const DECODE_BUFFER: usize = 16;

fn input_caps() -> PortCap {
    PortCap::READ | PortCap::SUBS_READ
}

fn output_caps() -> PortCap {
    PortCap::WRITE | PortCap::SUBS_WRITE
}

fn app_port_type() -> PortType {
    PortType::MIDI_GENERIC | PortType::APPLICATION
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidSettings(format!("name {name:?} contains NUL")))
}

pub(crate) struct AlsaShared {
    seq: Mutex<Seq>,
    client_id: i32,
    client_name: String,
    queue: i32,
    announce_port: Option<i32>,
    routes: Mutex<HashMap<i32, QueueProducer>>,
    /// SysEx bytes received so far, per local port, until the closing F7.
    partial_sysex: Mutex<HashMap<i32, Vec<u8>>>,
    changed: PortsChanged,
}

impl AlsaShared {
    pub(crate) fn open(settings: &MidiSettings) -> Result<Self> {
        let seq = Seq::open(None, None, true)?;
        seq.set_client_name(&cstring(&settings.client_name)?)?;
        let client_id = seq.client_id()?;
        let queue = seq.alloc_queue()?;

        let announce_port = match Self::subscribe_announce(&seq, client_id) {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("ALSA announce subscription failed, port changes go unnoticed: {}", e);
                None
            }
        };

        debug!(
            "ALSA client {} ({}) opened with queue {}",
            client_id, settings.client_name, queue
        );
        Ok(Self {
            seq: Mutex::new(seq),
            client_id,
            client_name: settings.client_name.clone(),
            queue,
            announce_port,
            routes: Mutex::new(HashMap::new()),
            partial_sysex: Mutex::new(HashMap::new()),
            changed: PortsChanged::default(),
        })
    }

    /// Listens on the system announce port for clients and ports coming and going.
    fn subscribe_announce(seq: &Seq, client_id: i32) -> Result<i32> {
        let port = seq.create_simple_port(
            &cstring("announce")?,
            PortCap::WRITE | PortCap::NO_EXPORT,
            app_port_type(),
        )?;
        let subs = PortSubscribe::empty()?;
        subs.set_sender(Addr::system_announce());
        subs.set_dest(Addr {
            client: client_id,
            port,
        });
        seq.subscribe_port(&subs)?;
        Ok(port)
    }

    fn with_seq<T>(&self, f: impl FnOnce(&Seq) -> Result<T>) -> Result<T> {
        let seq = self.seq.lock();
        f(&seq)
    }

    pub(crate) fn ports_changed(&self) -> &PortsChanged {
        &self.changed
    }

    pub(crate) fn client_id(&self) -> i32 {
        self.client_id
    }

    pub(crate) fn queue(&self) -> i32 {
        self.queue
    }

    /// Input catalog starts with the system announce port; client 0 is
    /// otherwise skipped, as are our own ports.
    pub(crate) fn scan(&self) -> Result<(PortCatalog, PortCatalog)> {
        self.with_seq(|seq| {
            let mut inputs = PortCatalog::new(PortDirection::Input);
            let mut outputs = PortCatalog::new(PortDirection::Output);
            inputs.add(
                PortDescriptor::new(PortDirection::Input, 0, "system", 1, "ALSA Announce")
                    .with_kind(PortKind::System)
                    .with_internal_id(1),
            );

            for client in ClientIter::new(seq) {
                let cid = client.get_client();
                if cid == 0 || cid == self.client_id {
                    continue;
                }
                let client_name = client.get_name().unwrap_or_default().to_string();
                for port in PortIter::new(seq, cid) {
                    if !port
                        .get_type()
                        .intersects(PortType::MIDI_GENERIC | PortType::SYNTH)
                    {
                        continue;
                    }
                    let caps = port.get_capability();
                    let pid = port.get_port();
                    let port_name = port.get_name().unwrap_or_default().to_string();
                    let internal_id = ((cid as u64) << 8) | (pid as u64 & 0xFF);
                    let readable = caps.contains(input_caps());
                    let writable = caps.contains(output_caps());
                    if readable {
                        inputs.add(
                            PortDescriptor::new(
                                PortDirection::Input,
                                cid,
                                client_name.clone(),
                                pid,
                                port_name.clone(),
                            )
                            .with_internal_id(internal_id),
                        );
                    }
                    if writable {
                        outputs.add(
                            PortDescriptor::new(
                                PortDirection::Output,
                                cid,
                                client_name.clone(),
                                pid,
                                port_name,
                            )
                            .with_internal_id(internal_id),
                        );
                    } else if !readable {
                        debug!("Non-I/O ALSA port {}:{} skipped", client_name, port_name);
                    }
                }
            }
            Ok((inputs, outputs))
        })
    }

    pub(crate) fn set_ppqn(&self, ppqn: u32) -> Result<()> {
        self.with_seq(|seq| {
            let tempo = seq.get_queue_tempo(self.queue)?;
            tempo.set_ppq(ppqn as i32);
            seq.set_queue_tempo(self.queue, &tempo)?;
            Ok(())
        })
    }

    pub(crate) fn set_tempo_us(&self, tempo_us: u32) -> Result<()> {
        self.with_seq(|seq| {
            let tempo = seq.get_queue_tempo(self.queue)?;
            tempo.set_tempo(tempo_us);
            seq.set_queue_tempo(self.queue, &tempo)?;
            Ok(())
        })
    }

    pub(crate) fn flush(&self) {
        if let Err(e) = self.seq.lock().drain_output() {
            warn!("ALSA drain output failed: {}", e);
        }
    }

    /// Our client number and name as the sequencer reports them.
    fn identity(&self) -> Result<(i32, String)> {
        self.with_seq(|seq| {
            let info = seq.get_any_client_info(self.client_id)?;
            let name = info.get_name()?.to_string();
            Ok((self.client_id, name))
        })
    }

    fn create_port(&self, name: &str, caps: PortCap) -> Result<i32> {
        let name = cstring(name)?;
        self.with_seq(|seq| Ok(seq.create_simple_port(&name, caps, app_port_type())?))
    }

    fn delete_port(&self, port: i32) {
        if let Err(e) = self.seq.lock().delete_port(port) {
            warn!("ALSA delete port {} failed: {}", port, e);
        }
    }

    fn subscribe(&self, sender: Addr, dest: Addr, timestamped: bool) -> Result<()> {
        self.with_seq(|seq| {
            let subs = PortSubscribe::empty()?;
            subs.set_sender(sender);
            subs.set_dest(dest);
            if timestamped {
                subs.set_queue(self.queue);
                subs.set_time_update(true);
            }
            seq.subscribe_port(&subs)?;
            Ok(())
        })
    }

    fn unsubscribe(&self, sender: Addr, dest: Addr) {
        if let Err(e) = self.seq.lock().unsubscribe_port(sender, dest) {
            warn!(
                "ALSA unsubscribe {}:{} -> {}:{} failed: {}",
                sender.client, sender.port, dest.client, dest.port, e
            );
        }
    }

    fn local_addr(&self, port: i32) -> Addr {
        Addr {
            client: self.client_id,
            port,
        }
    }

    /// Sends `ev` from `port` to all subscribers, bypassing the queue.
    fn output_direct(&self, port: i32, ev: &mut Event) -> Result<()> {
        ev.set_source(port);
        ev.set_subs();
        ev.set_direct();
        self.with_seq(|seq| {
            seq.event_output_direct(ev)?;
            Ok(())
        })
    }

    /// Buffers `ev` from `port` for the next drain.
    fn output(&self, port: i32, ev: &mut Event) -> Result<()> {
        ev.set_source(port);
        ev.set_subs();
        ev.set_direct();
        ev.set_priority(true);
        self.with_seq(|seq| {
            seq.event_output(ev)?;
            Ok(())
        })
    }

    fn play(&self, port: i32, bytes: &[u8]) -> Result<()> {
        let coder = MidiEvent::new(ENCODE_BUFFER)?;
        coder.enable_running_status(false);
        let (_, ev) = coder.encode(bytes)?;
        let mut ev = ev.ok_or_else(|| {
            Error::Driver(format!("incomplete MIDI message {bytes:02X?}"))
        })?;
        self.output_direct(port, &mut ev)
    }

    fn register_route(&self, port: i32, producer: QueueProducer) {
        self.routes.lock().insert(port, producer);
    }

    fn remove_route(&self, port: i32) {
        self.routes.lock().remove(&port);
        self.partial_sysex.lock().remove(&port);
    }

    /// Drains pending input and routes it to the bus queues.
    fn pump_input(&self) {
        let seq = self.seq.lock();
        let mut input = seq.input();
        let decoder = match MidiEvent::new(DECODE_BUFFER as u32) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("ALSA MIDI decoder unavailable: {}", e);
                return;
            }
        };
        decoder.enable_running_status(false);

        loop {
            match input.event_input_pending(true) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("ALSA input pending check failed: {}", e);
                    break;
                }
            }
            let mut ev = match input.event_input() {
                Ok(ev) => ev,
                Err(e) => {
                    // EAGAIN on an empty nonblocking buffer, ENOSPC on overrun.
                    debug!("ALSA event input: {}", e);
                    break;
                }
            };

            let event_type = ev.get_type();
            if matches!(
                event_type,
                EventType::ClientStart
                    | EventType::ClientExit
                    | EventType::ClientChange
                    | EventType::PortStart
                    | EventType::PortExit
                    | EventType::PortChange
            ) {
                self.changed.raise();
                continue;
            }

            let dest = ev.get_dest().port;
            if Some(dest) == self.announce_port {
                continue;
            }
            let timestamp = ev.get_tick().map(u64::from).unwrap_or(0);

            let bytes = if event_type == EventType::Sysex {
                let data = ev.get_ext().unwrap_or_default();
                match self.collect_sysex(dest, data) {
                    Some(complete) => complete,
                    None => continue,
                }
            } else {
                let mut buf = [0u8; DECODE_BUFFER];
                match decoder.decode(&mut buf, &mut ev) {
                    Ok(0) => continue,
                    Ok(n) => buf[..n].to_vec(),
                    Err(e) => {
                        debug!("ALSA event type {:?} not decodable: {}", event_type, e);
                        continue;
                    }
                }
            };

            let msg = Message::new(&bytes, timestamp);
            match self.routes.lock().get_mut(&dest) {
                Some(producer) => {
                    if !producer.push(msg) {
                        warn!("ALSA input queue for port {} full, event dropped", dest);
                    }
                }
                None => debug!("ALSA event for unrouted port {} dropped", dest),
            }
        }
    }

    /// Joins SysEx fragments; returns the payload once the closing F7 arrives.
    fn collect_sysex(&self, port: i32, data: &[u8]) -> Option<Vec<u8>> {
        let mut partial = self.partial_sysex.lock();
        let buffer = partial.entry(port).or_default();
        if data.first() == Some(&status::SYSEX) {
            buffer.clear();
        }
        buffer.extend_from_slice(data);
        if buffer.last() == Some(&status::SYSEX_END) {
            partial.remove(&port)
        } else {
            None
        }
    }
}

impl Drop for AlsaShared {
    fn drop(&mut self) {
        let seq = self.seq.lock();
        if let Some(port) = self.announce_port {
            let _ = seq.delete_port(port);
        }
        if let Err(e) = seq.free_queue(self.queue) {
            warn!("ALSA free queue {} failed: {}", self.queue, e);
        }
        debug!("ALSA client {} closed", self.client_id);
    }
}

pub(crate) struct AlsaPort {
    shared: Arc<AlsaShared>,
    local_port: Option<i32>,
    /// Subscription made at init, undone at deinit.
    subscription: Option<(Addr, Addr)>,
    consumer: Option<QueueConsumer>,
}

impl AlsaPort {
    pub(crate) fn new(shared: Arc<AlsaShared>) -> Self {
        Self {
            shared,
            local_port: None,
            subscription: None,
            consumer: None,
        }
    }

    fn local(&self) -> Result<i32> {
        self.local_port.ok_or(Error::PortClosed)
    }

    fn peer(spec: &PortSpec) -> Addr {
        Addr {
            client: spec.client_id,
            port: spec.port_id,
        }
    }

    fn open_input_queue(&mut self, port: i32, capacity: usize) {
        let (producer, consumer) = EventQueue::channel(capacity);
        self.shared.register_route(port, producer);
        self.consumer = Some(consumer);
    }

    fn rederive(&self, spec: &mut PortSpec, port: i32) -> Result<()> {
        let (client_id, client_name) = self.shared.identity()?;
        spec.client_id = client_id;
        spec.client_name = client_name;
        spec.port_id = port;
        Ok(())
    }

    fn release(&mut self) {
        if let Some((sender, dest)) = self.subscription.take() {
            self.shared.unsubscribe(sender, dest);
        }
        if let Some(port) = self.local_port.take() {
            self.shared.remove_route(port);
            self.shared.delete_port(port);
        }
        self.consumer = None;
    }

    fn queue_control(&self, event_type: EventType) -> Event<'static> {
        Event::new(
            event_type,
            &EvQueueControl {
                queue: self.shared.queue(),
                value: (),
            },
        )
    }
}

impl PortOps for AlsaPort {
    fn init_out(&mut self, spec: &PortSpec) -> Result<()> {
        let port = self
            .shared
            .create_port(&spec.port_name, PortCap::NO_EXPORT | PortCap::READ)?;
        self.local_port = Some(port);
        if spec.kind != PortKind::System {
            let sender = self.shared.local_addr(port);
            let dest = Self::peer(spec);
            self.shared.subscribe(sender, dest, false)?;
            self.subscription = Some((sender, dest));
        }
        Ok(())
    }

    fn init_out_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let port = self.shared.create_port(&spec.port_name, input_caps())?;
        self.local_port = Some(port);
        self.rederive(spec, port)
    }

    fn init_in(&mut self, spec: &PortSpec) -> Result<()> {
        let port = self
            .shared
            .create_port(&spec.port_name, PortCap::NO_EXPORT | PortCap::WRITE)?;
        self.local_port = Some(port);
        let sender = Self::peer(spec);
        let dest = self.shared.local_addr(port);
        self.shared.subscribe(sender, dest, true)?;
        self.subscription = Some((sender, dest));
        self.open_input_queue(port, spec.queue_capacity);
        Ok(())
    }

    fn init_in_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let port = self.shared.create_port(&spec.port_name, output_caps())?;
        self.local_port = Some(port);
        self.open_input_queue(port, spec.queue_capacity);
        self.rederive(spec, port)
    }

    fn deinit_out(&mut self) {
        self.release();
    }

    fn deinit_in(&mut self) {
        self.release();
    }

    fn play(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.local()?;
        self.shared.play(port, bytes)
    }

    fn sysex_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let port = self.local()?;
        let mut ev = Event::new_ext(EventType::Sysex, chunk);
        ev.set_priority(true);
        self.shared.output_direct(port, &mut ev)
    }

    fn flush(&mut self) {
        self.shared.flush();
    }

    fn start(&mut self) -> Result<()> {
        let port = self.local()?;
        let mut ev = self.queue_control(EventType::Start);
        self.shared.output(port, &mut ev)
    }

    fn stop(&mut self) -> Result<()> {
        let port = self.local()?;
        let mut ev = self.queue_control(EventType::Stop);
        self.shared.output(port, &mut ev)
    }

    fn continue_from(&mut self, _tick: u64, beats: u32) -> Result<()> {
        let port = self.local()?;
        let mut position = Event::new(
            EventType::Songpos,
            &EvCtrl {
                channel: 0,
                param: 0,
                value: beats.min(0x3FFF) as i32,
            },
        );
        self.shared.output(port, &mut position)?;
        self.shared.flush();
        let mut ev = self.queue_control(EventType::Continue);
        self.shared.output(port, &mut ev)
    }

    fn clock(&mut self, _tick: u64) -> Result<()> {
        let port = self.local()?;
        let mut ev = self.queue_control(EventType::Clock);
        ev.set_tag(CLOCK_TAG);
        self.shared.output(port, &mut ev)
    }

    fn poll_for_midi(&mut self) -> usize {
        if self.consumer.is_none() {
            return 0;
        }
        self.shared.pump_input();
        self.consumer.as_ref().map_or(0, QueueConsumer::len)
    }

    fn get_midi_event(&mut self) -> Option<Message> {
        self.consumer.as_mut().and_then(QueueConsumer::pop)
    }
}
