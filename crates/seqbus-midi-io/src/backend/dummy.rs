//! In-process backend with simulated ports.
//!
//! Records every native send instead of transmitting it, and exposes
//! [`DummyBackend::inject`] to play the role of a subsystem input callback.
//! Used by tests and by hosts that run without a sound server.

use super::{PortOps, PortSpec, PortsChanged};
use crate::{Error, Message, Result};
use parking_lot::Mutex;
use seqbus_midi::{
    EventQueue, PortCatalog, PortDescriptor, PortDirection, PortKind, QueueConsumer,
    QueueProducer,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// What kind of native call a [`SentEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentKind {
    Play,
    Sysex,
    Clock,
    Start,
    Stop,
    Continue,
    SongPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    /// Local port the event left from.
    pub port: i32,
    pub kind: SentKind,
    pub bytes: Vec<u8>,
}

struct DummyState {
    client_id: i32,
    client_name: Mutex<String>,
    ports: Mutex<Vec<PortDescriptor>>,
    sent: Mutex<Vec<SentEvent>>,
    routes: Mutex<HashMap<i32, QueueProducer>>,
    refused: Mutex<HashSet<String>>,
    next_port: AtomicI32,
    scan_failures: AtomicUsize,
    flushes: AtomicUsize,
    queue_ppqn: AtomicU32,
    queue_tempo_us: AtomicU32,
    changed: PortsChanged,
}

/// Handle to a simulated subsystem. Clones share state.
#[derive(Clone)]
pub struct DummyBackend {
    inner: Arc<DummyState>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyBackend")
            .field("client_id", &self.inner.client_id)
            .field("ports", &self.inner.ports.lock().len())
            .finish()
    }
}

impl DummyBackend {
    /// A subsystem with no ports; our own client is 128.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DummyState {
                client_id: 128,
                client_name: Mutex::new(String::from("seqbus")),
                ports: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                routes: Mutex::new(HashMap::new()),
                refused: Mutex::new(HashSet::new()),
                next_port: AtomicI32::new(0),
                scan_failures: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                queue_ppqn: AtomicU32::new(0),
                queue_tempo_us: AtomicU32::new(0),
                changed: PortsChanged::default(),
            }),
        }
    }

    /// A subsystem with a "Midi Through" loopback in both directions.
    pub fn with_through_port() -> Self {
        let backend = Self::new();
        backend.add_port(PortDescriptor::new(
            PortDirection::Input,
            14,
            "Midi Through",
            0,
            "Midi Through Port-0",
        ));
        backend.add_port(PortDescriptor::new(
            PortDirection::Output,
            14,
            "Midi Through",
            0,
            "Midi Through Port-0",
        ));
        backend
    }

    pub fn add_port(&self, port: PortDescriptor) {
        self.inner.ports.lock().push(port);
        self.inner.changed.raise();
    }

    pub fn remove_port(&self, direction: PortDirection, client_id: i32, port_id: i32) -> bool {
        let mut ports = self.inner.ports.lock();
        let before = ports.len();
        ports.retain(|p| {
            !(p.direction == direction && p.client_id == client_id && p.port_id == port_id)
        });
        let removed = ports.len() != before;
        if removed {
            self.inner.changed.raise();
        }
        removed
    }

    /// Makes the next `count` scans fail.
    pub fn fail_scans(&self, count: usize) {
        self.inner.scan_failures.store(count, Ordering::Release);
    }

    /// Opening a port whose connect name or port name matches fails.
    pub fn refuse(&self, name: impl Into<String>) {
        self.inner.refused.lock().insert(name.into());
    }

    pub fn client_id(&self) -> i32 {
        self.inner.client_id
    }

    pub fn client_name(&self) -> String {
        self.inner.client_name.lock().clone()
    }

    pub(crate) fn set_client_name(&self, name: &str) {
        *self.inner.client_name.lock() = name.to_string();
    }

    pub fn sent(&self) -> Vec<SentEvent> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_from(&self, port: i32) -> Vec<SentEvent> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|e| e.port == port)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    pub fn flush_count(&self) -> usize {
        self.inner.flushes.load(Ordering::Acquire)
    }

    /// (PPQ, microseconds per quarter) as last programmed into the timing queue.
    pub fn queue_tempo(&self) -> (u32, u32) {
        (
            self.inner.queue_ppqn.load(Ordering::Acquire),
            self.inner.queue_tempo_us.load(Ordering::Acquire),
        )
    }

    /// Delivers `msg` to the input port `port` as the subsystem callback would.
    pub fn inject(&self, port: i32, msg: Message) -> Result<()> {
        let mut routes = self.inner.routes.lock();
        let producer = routes.get_mut(&port).ok_or(Error::PortClosed)?;
        if producer.push(msg) {
            Ok(())
        } else {
            tracing::warn!("Dummy input port {} queue full, message dropped", port);
            Err(Error::QueueFull)
        }
    }

    /// Local ports currently accepting input.
    pub fn input_ports(&self) -> Vec<i32> {
        let mut ports: Vec<i32> = self.inner.routes.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub(crate) fn ports_changed(&self) -> &PortsChanged {
        &self.inner.changed
    }

    pub(crate) fn scan(&self) -> Result<(PortCatalog, PortCatalog)> {
        let pending = self.inner.scan_failures.load(Ordering::Acquire);
        if pending > 0 {
            self.inner.scan_failures.store(pending - 1, Ordering::Release);
            return Err(Error::Driver("simulated scan failure".into()));
        }
        let mut inputs = PortCatalog::new(PortDirection::Input);
        let mut outputs = PortCatalog::new(PortDirection::Output);
        for port in self.inner.ports.lock().iter() {
            match port.direction {
                PortDirection::Input => inputs.add(port.clone()),
                PortDirection::Output => outputs.add(port.clone()),
            };
        }
        Ok((inputs, outputs))
    }

    pub(crate) fn set_queue_ppqn(&self, ppqn: u32) {
        self.inner.queue_ppqn.store(ppqn, Ordering::Release);
    }

    pub(crate) fn set_queue_tempo_us(&self, tempo_us: u32) {
        self.inner.queue_tempo_us.store(tempo_us, Ordering::Release);
    }

    pub(crate) fn record_flush(&self) {
        self.inner.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn record(&self, port: i32, kind: SentKind, bytes: &[u8]) {
        self.inner.sent.lock().push(SentEvent {
            port,
            kind,
            bytes: bytes.to_vec(),
        });
    }

    fn check_refused(&self, spec: &PortSpec) -> Result<()> {
        let refused = self.inner.refused.lock();
        if refused.contains(&spec.connect_name()) || refused.contains(&spec.port_name) {
            return Err(Error::Driver(format!(
                "connection to {} refused",
                spec.connect_name()
            )));
        }
        Ok(())
    }

    fn peer_exists(&self, spec: &PortSpec) -> bool {
        if spec.kind == PortKind::System {
            return true;
        }
        self.inner.ports.lock().iter().any(|p| {
            p.direction == spec.direction
                && p.client_id == spec.client_id
                && p.port_id == spec.port_id
        })
    }

    fn alloc_port(&self) -> i32 {
        self.inner.next_port.fetch_add(1, Ordering::AcqRel)
    }
}

pub(crate) struct DummyPort {
    backend: DummyBackend,
    local_port: Option<i32>,
    consumer: Option<QueueConsumer>,
}

impl DummyPort {
    pub(crate) fn new(backend: DummyBackend) -> Self {
        Self {
            backend,
            local_port: None,
            consumer: None,
        }
    }

    fn local(&self) -> Result<i32> {
        self.local_port.ok_or(Error::PortClosed)
    }

    fn open_local(&mut self, spec: &PortSpec, connect: bool) -> Result<i32> {
        self.backend.check_refused(spec)?;
        if connect && !self.backend.peer_exists(spec) {
            return Err(Error::Driver(format!(
                "no {} port {}:{}",
                spec.direction, spec.client_id, spec.port_id
            )));
        }
        let port = self.backend.alloc_port();
        self.local_port = Some(port);
        Ok(port)
    }

    fn open_input(&mut self, port: i32, capacity: usize) {
        let (producer, consumer) = EventQueue::channel(capacity);
        self.backend.inner.routes.lock().insert(port, producer);
        self.consumer = Some(consumer);
    }

    fn rederive(&self, spec: &mut PortSpec, port: i32) {
        spec.client_id = self.backend.client_id();
        spec.port_id = port;
        spec.client_name = self.backend.client_name();
    }
}

impl PortOps for DummyPort {
    fn init_out(&mut self, spec: &PortSpec) -> Result<()> {
        self.open_local(spec, true).map(|_| ())
    }

    fn init_out_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let port = self.open_local(spec, false)?;
        self.rederive(spec, port);
        Ok(())
    }

    fn init_in(&mut self, spec: &PortSpec) -> Result<()> {
        let port = self.open_local(spec, true)?;
        self.open_input(port, spec.queue_capacity);
        Ok(())
    }

    fn init_in_virtual(&mut self, spec: &mut PortSpec) -> Result<()> {
        let port = self.open_local(spec, false)?;
        self.open_input(port, spec.queue_capacity);
        self.rederive(spec, port);
        Ok(())
    }

    fn deinit_out(&mut self) {
        self.local_port = None;
    }

    fn deinit_in(&mut self) {
        if let Some(port) = self.local_port.take() {
            self.backend.inner.routes.lock().remove(&port);
        }
        self.consumer = None;
    }

    fn play(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.local()?;
        self.backend.record(port, SentKind::Play, bytes);
        Ok(())
    }

    fn sysex_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let port = self.local()?;
        self.backend.record(port, SentKind::Sysex, chunk);
        Ok(())
    }

    fn flush(&mut self) {
        self.backend.record_flush();
    }

    fn start(&mut self) -> Result<()> {
        let port = self.local()?;
        self.backend.record(port, SentKind::Start, &[0xFA]);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let port = self.local()?;
        self.backend.record(port, SentKind::Stop, &[0xFC]);
        Ok(())
    }

    fn continue_from(&mut self, _tick: u64, beats: u32) -> Result<()> {
        let port = self.local()?;
        let position = Message::song_position(beats);
        self.backend
            .record(port, SentKind::SongPosition, position.bytes());
        self.backend.record_flush();
        self.backend.record(port, SentKind::Continue, &[0xFB]);
        Ok(())
    }

    fn clock(&mut self, _tick: u64) -> Result<()> {
        let port = self.local()?;
        self.backend.record(port, SentKind::Clock, &[0xF8]);
        Ok(())
    }

    fn poll_for_midi(&mut self) -> usize {
        self.consumer.as_ref().map_or(0, QueueConsumer::len)
    }

    fn get_midi_event(&mut self) -> Option<Message> {
        self.consumer.as_mut().and_then(QueueConsumer::pop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_spec(client_id: i32, port_id: i32) -> PortSpec {
        PortSpec {
            index: 0,
            direction: PortDirection::Output,
            kind: PortKind::Normal,
            client_id,
            port_id,
            client_name: "Midi Through".into(),
            port_name: "Midi Through Port-0".into(),
            queue_capacity: 4,
        }
    }

    #[test]
    fn test_scan_splits_directions() {
        let backend = DummyBackend::with_through_port();
        let (inputs, outputs) = backend.scan().unwrap();
        assert_eq!(inputs.count(), 1);
        assert_eq!(outputs.count(), 1);
        assert_eq!(outputs.bus_id(0), 14);
    }

    #[test]
    fn test_scan_failure_is_transient() {
        let backend = DummyBackend::with_through_port();
        backend.fail_scans(1);
        assert!(backend.scan().is_err());
        assert!(backend.scan().is_ok());
    }

    #[test]
    fn test_normal_out_needs_peer() {
        let backend = DummyBackend::with_through_port();
        let mut port = DummyPort::new(backend.clone());
        assert!(port.init_out(&out_spec(14, 0)).is_ok());

        let mut missing = DummyPort::new(backend);
        assert!(missing.init_out(&out_spec(20, 0)).is_err());
        assert!(matches!(missing.play(&[0x90, 60, 1]), Err(Error::PortClosed)));
    }

    #[test]
    fn test_virtual_in_rederives_address() {
        let backend = DummyBackend::new();
        let mut spec = PortSpec {
            direction: PortDirection::Input,
            kind: PortKind::Virtual,
            client_id: 0,
            port_id: 0,
            client_name: "seqbus".into(),
            port_name: "midi in 0".into(),
            ..out_spec(0, 0)
        };
        let mut port = DummyPort::new(backend.clone());
        port.init_in_virtual(&mut spec).unwrap();
        assert_eq!(spec.client_id, 128);

        backend.inject(spec.port_id, Message::note_on(0, 60, 1)).unwrap();
        assert_eq!(port.poll_for_midi(), 1);
        assert_eq!(port.get_midi_event().map(|m| m.data().0), Some(60));

        port.deinit_in();
        assert!(matches!(
            backend.inject(spec.port_id, Message::clock()),
            Err(Error::PortClosed)
        ));
    }

    #[test]
    fn test_inject_overflow() {
        let backend = DummyBackend::new();
        let mut spec = PortSpec {
            direction: PortDirection::Input,
            kind: PortKind::Virtual,
            queue_capacity: 1,
            ..out_spec(0, 0)
        };
        let mut port = DummyPort::new(backend.clone());
        port.init_in_virtual(&mut spec).unwrap();
        backend.inject(spec.port_id, Message::start()).unwrap();
        assert!(matches!(
            backend.inject(spec.port_id, Message::stop()),
            Err(Error::QueueFull)
        ));
        assert_eq!(port.get_midi_event().map(|m| m.status()), Some(0xFA));
    }

    #[test]
    fn test_refused_port() {
        let backend = DummyBackend::with_through_port();
        backend.refuse("Midi Through:Midi Through Port-0");
        let mut port = DummyPort::new(backend);
        assert!(matches!(port.init_out(&out_spec(14, 0)), Err(Error::Driver(_))));
    }
}
