//! Integration tests for seqbus-midi-io.
//!
//! These tests exercise multi-component workflows against the in-process
//! dummy backend, without a sound server.

use parking_lot::Mutex;
use seqbus_midi_io::{
    timing, Bus, ClockMode, DummyBackend, ErrorKind, InputListener, Message, MidiApi, MidiInfo,
    MidiSettings, PortDescriptor, PortDirection, PortKind, PortState, SentKind,
};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Routes the crate's logs (swallowed send failures, open errors) to the test output.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn fast_settings() -> MidiSettings {
    MidiSettings::builder()
        .api(MidiApi::Dummy)
        .sysex_pacing(256, Duration::ZERO)
        .build()
        .unwrap()
}

fn dummy_info() -> (Arc<MidiInfo>, DummyBackend) {
    init_logging();
    let backend = DummyBackend::with_through_port();
    let info = MidiInfo::with_dummy(&fast_settings(), backend.clone()).unwrap();
    (info, backend)
}

fn synth_port() -> PortDescriptor {
    PortDescriptor::new(PortDirection::Output, 130, "FLUID Synth", 0, "Synth input port")
}

// ---------------------------------------------------------------------------
// 1. Virtual buses
// ---------------------------------------------------------------------------

#[test]
fn test_virtual_output_bus_identity() {
    let (info, backend) = dummy_info();
    let mut bus = Bus::virtual_bus(info, PortDirection::Output, 0).unwrap();
    bus.open().unwrap();

    assert!(bus.enabled());
    assert_eq!(bus.bus_id(), 0);
    assert_eq!(bus.port_name(), "midi out 0");
    assert!(bus.is_virtual());
    assert_eq!(bus.native_address().0, backend.client_id());
}

#[test]
fn test_two_virtual_buses_are_distinct() {
    let (info, _backend) = dummy_info();
    let mut first = Bus::virtual_bus(info.clone(), PortDirection::Output, 0).unwrap();
    let mut second = Bus::virtual_bus(info, PortDirection::Output, 1).unwrap();
    first.open().unwrap();
    second.open().unwrap();

    assert_ne!(first.port_name(), second.port_name());
    assert_ne!(first.native_address(), second.native_address());
    assert_eq!(second.bus_id(), 1);
}

// ---------------------------------------------------------------------------
// 2. Output gating and SysEx
// ---------------------------------------------------------------------------

#[test]
fn test_play_on_unopened_bus_sends_nothing() {
    let (info, backend) = dummy_info();
    let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
    assert_eq!(bus.state(), PortState::Uninitialized);

    bus.play(&Message::note_on(0, 60, 100), 0);
    bus.send(&Message::control_change(0, 7, 100));
    assert!(backend.sent().is_empty());

    bus.open().unwrap();
    bus.play(&Message::note_on(0, 60, 100), 3);
    bus.close();
    bus.play(&Message::note_off(0, 60, 0), 3);

    let sent = backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, vec![0x93, 60, 100]);
}

#[test]
fn test_sysex_is_split_into_paced_chunks() {
    let (info, backend) = dummy_info();
    let mut bus = Bus::virtual_bus(info, PortDirection::Output, 0).unwrap();
    bus.open().unwrap();

    let mut payload = vec![0xF0];
    payload.extend(std::iter::repeat(0x42).take(598));
    payload.push(0xF7);
    let report = bus.sysex(&Message::sysex(&payload));

    assert_eq!(report.calls, 3);
    assert_eq!(report.failed, 0);
    let chunks: Vec<usize> = backend
        .sent()
        .iter()
        .filter(|e| e.kind == SentKind::Sysex)
        .map(|e| e.bytes.len())
        .collect();
    assert_eq!(chunks, vec![256, 256, 88]);
    assert!(backend.flush_count() >= 3);
}

// ---------------------------------------------------------------------------
// 3. Shared tempo
// ---------------------------------------------------------------------------

#[test]
fn test_tempo_change_reaches_every_bus() {
    let (info, backend) = dummy_info();
    let mut a = Bus::virtual_bus(info.clone(), PortDirection::Output, 0).unwrap();
    let b = Bus::virtual_bus(info.clone(), PortDirection::Output, 1).unwrap();

    a.set_bpm(140.0).unwrap();
    a.set_ppqn(96).unwrap();

    assert_eq!(b.bpm(), 140.0);
    assert_eq!(b.ppqn(), 96);
    assert_eq!(backend.queue_tempo(), (96, timing::tempo_us_from_bpm(140.0)));
    assert!(a.set_ppqn(0).is_err());
    assert_eq!(info.ppqn(), 96);
}

// ---------------------------------------------------------------------------
// 4. Partial failure
// ---------------------------------------------------------------------------

#[test]
fn test_refused_bus_stays_disabled_others_work() {
    let backend = DummyBackend::with_through_port();
    backend.add_port(synth_port());
    backend.refuse("FLUID Synth:Synth input port");
    let info = MidiInfo::with_dummy(&fast_settings(), backend.clone()).unwrap();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    info.set_error_callback(move |kind, message| sink.lock().push((kind, message.to_string())));

    let mut through = Bus::from_catalog(info.clone(), PortDirection::Output, 0).unwrap();
    let mut synth = Bus::from_catalog(info, PortDirection::Output, 1).unwrap();
    assert!(through.open().is_ok());
    assert!(synth.open().is_err());

    assert!(through.enabled());
    assert_eq!(synth.state(), PortState::Disabled);

    synth.play(&Message::note_on(0, 60, 100), 0);
    through.play(&Message::note_on(0, 62, 100), 0);
    assert_eq!(backend.sent().len(), 1);

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, ErrorKind::Driver);
}

#[test]
fn test_invalid_catalog_index() {
    let (info, _backend) = dummy_info();
    let err = Bus::new(info, 5, PortDirection::Input, PortKind::Normal, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

// ---------------------------------------------------------------------------
// 5. Discovery
// ---------------------------------------------------------------------------

#[test]
fn test_explicit_dummy_open_and_listing() {
    let info = MidiInfo::open(&fast_settings()).unwrap();
    assert_eq!(info.api(), MidiApi::Dummy);
    insta::assert_snapshot!(info.port_list().trim_end(), @r"
    dummy input ports (1):
    [0] 14:0 Midi Through:Midi Through Port-0
    dummy output ports (1):
    [0] 14:0 Midi Through:Midi Through Port-0
    ");
}

#[test]
fn test_rescan_sees_new_port() {
    let (info, backend) = dummy_info();
    info.take_ports_changed();
    assert!(!info.take_ports_changed());

    backend.add_port(synth_port());
    assert!(info.take_ports_changed());
    assert_eq!(info.catalog(PortDirection::Output).count(), 1);

    assert_eq!(info.scan().unwrap(), 3);
    let outputs = info.catalog(PortDirection::Output);
    assert_eq!(outputs.lookup_name("FLUID Synth:Synth input port"), Some(1));
}

#[test]
fn test_bus_follows_port_across_vanish_and_return() {
    let (info, backend) = dummy_info();
    let mut bus = Bus::from_catalog(info.clone(), PortDirection::Output, 0).unwrap();
    bus.open().unwrap();
    let name = bus.connect_name();

    backend.remove_port(PortDirection::Output, 14, 0);
    info.scan().unwrap();
    let (client_id, port_id) = bus.native_address();
    let outputs = info.catalog(PortDirection::Output);
    assert_eq!(outputs.resolve(client_id, port_id, &name, |_| false), None);
    bus.close();

    backend.add_port(synth_port());
    backend.add_port(PortDescriptor::new(
        PortDirection::Output,
        20,
        "Midi Through",
        2,
        "Midi Through Port-0",
    ));
    info.scan().unwrap();
    let outputs = info.catalog(PortDirection::Output);
    let index = outputs.resolve(client_id, port_id, &name, |_| false).unwrap();
    assert_eq!(index, 1);

    bus.retarget(index, outputs.get(index).unwrap());
    assert_eq!((bus.bus_id(), bus.port_id()), (20, 2));
    assert_eq!(bus.display_name(), "[1] 20:2 Midi Through:Midi Through Port-0");
    bus.open().unwrap();

    backend.clear_sent();
    bus.play(&Message::note_on(0, 64, 90), 2);
    assert_eq!(backend.sent()[0].bytes, vec![0x92, 64, 90]);
}

// ---------------------------------------------------------------------------
// 6. Input and clock
// ---------------------------------------------------------------------------

#[test]
fn test_listener_delivers_injected_input() {
    let (info, backend) = dummy_info();
    let mut bus = Bus::from_catalog(info, PortDirection::Input, 0).unwrap();
    bus.open().unwrap();
    let port = backend.input_ports()[0];
    let listener = InputListener::spawn(bus, Duration::from_millis(1)).unwrap();

    backend.inject(port, Message::control_change(2, 64, 127)).unwrap();
    let msg = listener.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(msg.bytes(), &[0xB2, 64, 127]);
    assert_eq!(msg.source_bus(), Some(0));

    let mut bus = listener.stop().unwrap();
    bus.close();
    assert!(backend.input_ports().is_empty());
}

#[test]
fn test_clock_run_on_catalog_bus() {
    let (info, backend) = dummy_info();
    info.set_ppqn(192).unwrap();
    let mut bus = Bus::from_catalog(info, PortDirection::Output, 0).unwrap();
    bus.open().unwrap();
    bus.set_clock_mode(ClockMode::Pos);

    bus.init_clock(0);
    bus.clock(192);
    bus.stop();

    let kinds: Vec<SentKind> = backend.sent().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&SentKind::Start));
    assert_eq!(kinds.last(), Some(&SentKind::Stop));
    // Clocks at pulses 0, 8, .., 192.
    assert_eq!(kinds.iter().filter(|k| **k == SentKind::Clock).count(), 25);
}
