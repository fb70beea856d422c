//! Backend info: the single owner of a native MIDI client.
//!
//! One [`MidiInfo`] exists per process (or per session). It owns the native
//! handle and the shared timing queue, holds both port catalogs, and is
//! passed by `Arc` to every [`crate::Bus`] built from it. Catalogs are
//! replaced as a pair with arc-swap, so readers never see a half-finished
//! scan.

use crate::api::{compiled_apis, select_backend, set_selected_api};
use crate::backend::dummy::DummyBackend;
use crate::backend::NativeInfo;
use crate::{ErrorKind, MidiApi, MidiSettings, Result};
use arc_swap::ArcSwap;
use atomic_float::AtomicF64;
use parking_lot::RwLock;
use seqbus_midi::timing::tempo_us_from_bpm;
use seqbus_midi::{PortCatalog, PortDirection};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Centralized error reporting hook.
pub type ErrorCallback = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// The result of one scan: an input catalog and an output catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCatalogs {
    pub inputs: PortCatalog,
    pub outputs: PortCatalog,
}

impl PortCatalogs {
    pub fn empty() -> Self {
        Self {
            inputs: PortCatalog::new(PortDirection::Input),
            outputs: PortCatalog::new(PortDirection::Output),
        }
    }

    pub fn get(&self, direction: PortDirection) -> &PortCatalog {
        match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        }
    }

    pub fn total(&self) -> usize {
        self.inputs.count() + self.outputs.count()
    }
}

const MODE_UNSET: u8 = 0;
const MODE_INPUT: u8 = 1;
const MODE_OUTPUT: u8 = 2;

pub struct MidiInfo {
    api: MidiApi,
    settings: MidiSettings,
    catalogs: ArcSwap<PortCatalogs>,
    mode: AtomicU8,
    ppqn: AtomicU32,
    bpm: AtomicF64,
    error_hook: RwLock<Option<ErrorCallback>>,
    native: NativeInfo,
}

impl MidiInfo {
    /// Opens a backend according to `settings.api`, falling back through the
    /// compiled backends when unspecified, and scans it.
    pub fn open(settings: &MidiSettings) -> Result<Arc<Self>> {
        settings.validate()?;
        let (api, (native, catalogs)) = select_backend(
            settings.api,
            settings.prefer_jack,
            settings.manual_ports,
            compiled_apis(),
            |api| {
                let native = NativeInfo::open(api, settings)?;
                let (inputs, outputs) = native.scan()?;
                let catalogs = PortCatalogs { inputs, outputs };
                let total = catalogs.total();
                Ok(((native, catalogs), total))
            },
        )?;
        set_selected_api(api);
        Ok(Arc::new(Self::from_parts(api, settings, native, catalogs)))
    }

    /// Opens against a caller-owned [`DummyBackend`], bypassing selection.
    pub fn with_dummy(settings: &MidiSettings, backend: DummyBackend) -> Result<Arc<Self>> {
        settings.validate()?;
        backend.set_client_name(&settings.client_name);
        let native = NativeInfo::Dummy(backend);
        let (inputs, outputs) = native.scan()?;
        let catalogs = PortCatalogs { inputs, outputs };
        Ok(Arc::new(Self::from_parts(
            MidiApi::Dummy,
            settings,
            native,
            catalogs,
        )))
    }

    fn from_parts(
        api: MidiApi,
        settings: &MidiSettings,
        native: NativeInfo,
        catalogs: PortCatalogs,
    ) -> Self {
        let info = Self {
            api,
            settings: settings.clone(),
            catalogs: ArcSwap::from_pointee(catalogs),
            mode: AtomicU8::new(MODE_UNSET),
            ppqn: AtomicU32::new(settings.ppqn),
            bpm: AtomicF64::new(settings.bpm),
            error_hook: RwLock::new(None),
            native,
        };
        if let Err(e) = info.native.set_ppqn(settings.ppqn) {
            warn!("Initial PPQN {} not applied: {}", settings.ppqn, e);
        }
        if let Err(e) = info.native.set_tempo_us(tempo_us_from_bpm(settings.bpm)) {
            warn!("Initial BPM {} not applied: {}", settings.bpm, e);
        }
        debug!(
            "MIDI info opened on {}: {} inputs, {} outputs",
            api,
            info.catalogs.load().inputs.count(),
            info.catalogs.load().outputs.count()
        );
        info
    }

    pub fn api(&self) -> MidiApi {
        self.api
    }

    pub fn settings(&self) -> &MidiSettings {
        &self.settings
    }

    pub fn client_name(&self) -> &str {
        &self.settings.client_name
    }

    /// Our own client number in the subsystem.
    pub fn client_id(&self) -> i32 {
        self.native.client_id()
    }

    /// Identifier of the shared timing queue (-1 when the backend has none).
    pub fn global_queue(&self) -> i32 {
        self.native.global_queue()
    }

    pub(crate) fn native(&self) -> &NativeInfo {
        &self.native
    }

    /// Rescans the subsystem and swaps in the new catalogs.
    ///
    /// On failure the previous catalogs stay in place and the error is
    /// reported once through the hook and returned.
    pub fn scan(&self) -> Result<usize> {
        match self.native.scan() {
            Ok((inputs, outputs)) => {
                let catalogs = PortCatalogs { inputs, outputs };
                let total = catalogs.total();
                self.catalogs.store(Arc::new(catalogs));
                debug!("MIDI rescan found {} ports", total);
                Ok(total)
            }
            Err(e) => {
                self.report(e.kind(), &format!("port scan failed: {e}"));
                Err(e)
            }
        }
    }

    /// Snapshot of the current scan result.
    pub fn catalogs(&self) -> Arc<PortCatalogs> {
        self.catalogs.load_full()
    }

    pub fn catalog(&self, direction: PortDirection) -> PortCatalog {
        self.catalogs.load().get(direction).clone()
    }

    /// True once after ports appeared or disappeared in the subsystem.
    pub fn take_ports_changed(&self) -> bool {
        self.native.ports_changed().take()
    }

    // -- mode-scoped lookups ---------------------------------------------

    /// Selects which catalog the mode-scoped accessors read.
    pub fn set_midi_mode(&self, direction: PortDirection) {
        let mode = match direction {
            PortDirection::Input => MODE_INPUT,
            PortDirection::Output => MODE_OUTPUT,
        };
        self.mode.store(mode, Ordering::Release);
    }

    pub fn midi_mode(&self) -> Option<PortDirection> {
        match self.mode.load(Ordering::Acquire) {
            MODE_INPUT => Some(PortDirection::Input),
            MODE_OUTPUT => Some(PortDirection::Output),
            _ => None,
        }
    }

    fn with_mode<R>(&self, default: R, f: impl FnOnce(&PortCatalog) -> R) -> R {
        match self.midi_mode() {
            Some(direction) => f(self.catalogs.load().get(direction)),
            None => {
                error!("MIDI mode lookup before set_midi_mode()");
                debug_assert!(false, "MIDI mode lookup before set_midi_mode()");
                default
            }
        }
    }

    pub fn get_port_count(&self) -> usize {
        self.with_mode(0, PortCatalog::count)
    }

    pub fn lookup_index(&self, client_id: i32, port_id: i32) -> Option<usize> {
        self.with_mode(None, |c| c.lookup_index(client_id, port_id))
    }

    pub fn bus_id(&self, index: usize) -> i32 {
        self.with_mode(seqbus_midi::BAD_ID, |c| c.bus_id(index))
    }

    pub fn port_id(&self, index: usize) -> i32 {
        self.with_mode(seqbus_midi::BAD_ID, |c| c.port_id(index))
    }

    pub fn bus_name(&self, index: usize) -> String {
        self.with_mode(String::new(), |c| c.bus_name(index).to_string())
    }

    pub fn port_name(&self, index: usize) -> String {
        self.with_mode(String::new(), |c| c.port_name(index).to_string())
    }

    pub fn port_alias(&self, index: usize) -> String {
        self.with_mode(String::new(), |c| c.port_alias(index).to_string())
    }

    pub fn is_virtual(&self, index: usize) -> bool {
        self.with_mode(false, |c| c.is_virtual(index))
    }

    pub fn is_system(&self, index: usize) -> bool {
        self.with_mode(false, |c| c.is_system(index))
    }

    pub fn connect_name(&self, index: usize) -> String {
        self.with_mode(String::new(), |c| c.connect_name(index))
    }

    /// All ports share the global queue.
    pub fn queue_number(&self, index: usize) -> i32 {
        self.with_mode(seqbus_midi::BAD_ID, |c| {
            if index < c.count() {
                self.global_queue()
            } else {
                seqbus_midi::BAD_ID
            }
        })
    }

    // -- shared timing ---------------------------------------------------

    pub fn ppqn(&self) -> u32 {
        self.ppqn.load(Ordering::Acquire)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm.load(Ordering::Acquire)
    }

    /// Reprograms the shared queue. Affects every bus; last writer wins.
    pub fn set_ppqn(&self, ppqn: u32) -> Result<()> {
        if ppqn == 0 {
            return Err(crate::Error::InvalidSettings("ppqn must be positive".into()));
        }
        self.ppqn.store(ppqn, Ordering::Release);
        self.native.set_ppqn(ppqn).inspect_err(|e| {
            self.report(e.kind(), &format!("set PPQN {ppqn} failed: {e}"));
        })
    }

    /// Reprograms the shared queue tempo. Affects every bus; last writer wins.
    pub fn set_beats_per_minute(&self, bpm: f64) -> Result<()> {
        if !bpm.is_finite() || bpm < 0.0 {
            return Err(crate::Error::InvalidSettings(format!("bpm {bpm} out of range")));
        }
        self.bpm.store(bpm, Ordering::Release);
        self.native
            .set_tempo_us(tempo_us_from_bpm(bpm))
            .inspect_err(|e| {
                self.report(e.kind(), &format!("set BPM {bpm} failed: {e}"));
            })
    }

    /// Pushes any buffered output on the shared handle to the wire.
    pub fn flush(&self) {
        self.native.flush();
    }

    // -- error hook ------------------------------------------------------

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(ErrorKind, &str) + Send + Sync + 'static,
    {
        *self.error_hook.write() = Some(Arc::new(callback));
    }

    pub fn clear_error_callback(&self) {
        *self.error_hook.write() = None;
    }

    /// Logs `message` and forwards it to the error hook, if one is set.
    pub(crate) fn report(&self, kind: ErrorKind, message: &str) {
        match kind {
            ErrorKind::Warning => warn!("{}", message),
            _ => error!("{}", message),
        }
        let hook = self.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(kind, message);
        }
    }

    /// Both catalogs as text, one line per port.
    pub fn port_list(&self) -> String {
        let catalogs = self.catalogs.load();
        format!(
            "{} input ports ({}):\n{}{} output ports ({}):\n{}",
            self.api,
            catalogs.inputs.count(),
            catalogs.inputs.listing(),
            self.api,
            catalogs.outputs.count(),
            catalogs.outputs.listing()
        )
    }
}

impl std::fmt::Debug for MidiInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiInfo")
            .field("api", &self.api)
            .field("client_name", &self.settings.client_name)
            .field("ppqn", &self.ppqn())
            .field("bpm", &self.bpm())
            .finish()
    }
}
