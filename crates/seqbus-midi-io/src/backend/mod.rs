//! Native backends.
//!
//! Each backend provides two halves: a shared per-process part (the native
//! client handle, its timing queue, catalog scanning) and a per-bus
//! [`PortOps`] implementation. [`NativeInfo`] and [`crate::PortApi`] select
//! between them by variant.

use crate::{Error, Message, MidiApi, MidiSettings, Result};
use seqbus_midi::{PortCatalog, PortDirection, PortKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(all(target_os = "linux", feature = "alsa"))]
pub(crate) mod alsa;
pub mod dummy;
#[cfg(feature = "jack")]
pub(crate) mod jack;

/// Identity of the port a [`PortOps`] instance serves.
///
/// For normal and system ports this is the resolved peer. Virtual-port init
/// overwrites it with the address the subsystem assigned to the new endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub index: usize,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub client_id: i32,
    pub port_id: i32,
    pub client_name: String,
    pub port_name: String,
    pub queue_capacity: usize,
}

impl PortSpec {
    pub fn connect_name(&self) -> String {
        format!("{}:{}", self.client_name, self.port_name)
    }

    /// Bus tag stamped on received messages.
    pub fn source_tag(&self) -> u8 {
        self.index.min(u8::MAX as usize) as u8
    }
}

/// Per-port operations against one native subsystem.
///
/// Send operations return `Err` on native failure; the dispatch layer decides
/// whether that is logged and swallowed or surfaced.
pub trait PortOps {
    fn init_out(&mut self, spec: &PortSpec) -> Result<()>;
    fn init_out_virtual(&mut self, spec: &mut PortSpec) -> Result<()>;
    fn init_in(&mut self, spec: &PortSpec) -> Result<()>;
    fn init_in_virtual(&mut self, spec: &mut PortSpec) -> Result<()>;

    /// Safe to call after a failed or partial init.
    fn deinit_out(&mut self);
    fn deinit_in(&mut self);

    /// Connections are made during init unless the backend connects lazily.
    fn connect(&mut self, _spec: &PortSpec) -> Result<()> {
        Ok(())
    }

    fn play(&mut self, bytes: &[u8]) -> Result<()>;
    fn sysex_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    fn flush(&mut self);

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn continue_from(&mut self, tick: u64, beats: u32) -> Result<()>;
    fn clock(&mut self, tick: u64) -> Result<()>;

    /// Pauses or resumes delivery without tearing the port down.
    fn set_suspended(&mut self, _suspended: bool) {}

    fn poll_for_midi(&mut self) -> usize;
    fn get_midi_event(&mut self) -> Option<Message>;
}

/// Shared native state, one per [`crate::MidiInfo`].
pub(crate) enum NativeInfo {
    #[cfg(all(target_os = "linux", feature = "alsa"))]
    Alsa(Arc<alsa::AlsaShared>),
    #[cfg(feature = "jack")]
    Jack(Arc<jack::JackShared>),
    Dummy(dummy::DummyBackend),
}

impl NativeInfo {
    /// Opens the native client for `api`.
    pub(crate) fn open(api: MidiApi, settings: &MidiSettings) -> Result<Self> {
        match api {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            MidiApi::Alsa => Ok(NativeInfo::Alsa(Arc::new(alsa::AlsaShared::open(settings)?))),
            #[cfg(feature = "jack")]
            MidiApi::Jack => Ok(NativeInfo::Jack(Arc::new(jack::JackShared::open(settings)?))),
            MidiApi::Dummy => {
                let backend = dummy::DummyBackend::with_through_port();
                backend.set_client_name(&settings.client_name);
                Ok(NativeInfo::Dummy(backend))
            }
            other => Err(Error::BackendUnavailable(other)),
        }
    }

    pub(crate) fn ports_changed(&self) -> &PortsChanged {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.ports_changed(),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(shared) => shared.ports_changed(),
            NativeInfo::Dummy(backend) => backend.ports_changed(),
        }
    }

    /// Scans the subsystem into fresh catalogs. Nothing is replaced on failure.
    pub(crate) fn scan(&self) -> Result<(PortCatalog, PortCatalog)> {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.scan(),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(shared) => shared.scan(),
            NativeInfo::Dummy(backend) => backend.scan(),
        }
    }

    pub(crate) fn set_ppqn(&self, ppqn: u32) -> Result<()> {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.set_ppqn(ppqn),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(shared) => {
                shared.set_ppqn(ppqn);
                Ok(())
            }
            NativeInfo::Dummy(backend) => {
                backend.set_queue_ppqn(ppqn);
                Ok(())
            }
        }
    }

    pub(crate) fn set_tempo_us(&self, tempo_us: u32) -> Result<()> {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.set_tempo_us(tempo_us),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(shared) => {
                shared.set_tempo_us(tempo_us);
                Ok(())
            }
            NativeInfo::Dummy(backend) => {
                backend.set_queue_tempo_us(tempo_us);
                Ok(())
            }
        }
    }

    pub(crate) fn flush(&self) {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.flush(),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(_) => {}
            NativeInfo::Dummy(backend) => backend.record_flush(),
        }
    }

    pub(crate) fn client_id(&self) -> i32 {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.client_id(),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(_) => 0,
            NativeInfo::Dummy(backend) => backend.client_id(),
        }
    }

    /// Timing queue id; JACK has none.
    pub(crate) fn global_queue(&self) -> i32 {
        match self {
            #[cfg(all(target_os = "linux", feature = "alsa"))]
            NativeInfo::Alsa(shared) => shared.queue(),
            #[cfg(feature = "jack")]
            NativeInfo::Jack(_) => -1,
            NativeInfo::Dummy(_) => 0,
        }
    }
}

/// Set by a backend when ports appear or disappear, cleared by the consumer.
#[derive(Debug, Clone, Default)]
pub(crate) struct PortsChanged(Arc<AtomicBool>);

impl PortsChanged {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
