//! Backend identifiers and process-wide backend selection.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MidiApi {
    /// Pick the first compiled backend that reports ports.
    #[default]
    Unspecified,
    Alsa,
    Jack,
    /// In-process backend with simulated ports. Never chosen automatically.
    Dummy,
}

impl MidiApi {
    pub fn name(self) -> &'static str {
        match self {
            MidiApi::Unspecified => "unspecified",
            MidiApi::Alsa => "alsa",
            MidiApi::Jack => "jack",
            MidiApi::Dummy => "dummy",
        }
    }

    pub fn is_compiled(self) -> bool {
        self == MidiApi::Dummy || compiled_apis().contains(&self)
    }

    fn to_u8(self) -> u8 {
        match self {
            MidiApi::Unspecified => 0,
            MidiApi::Alsa => 1,
            MidiApi::Jack => 2,
            MidiApi::Dummy => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => MidiApi::Alsa,
            2 => MidiApi::Jack,
            3 => MidiApi::Dummy,
            _ => MidiApi::Unspecified,
        }
    }
}

impl fmt::Display for MidiApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MidiApi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "unspecified" | "auto" => Ok(MidiApi::Unspecified),
            "alsa" => Ok(MidiApi::Alsa),
            "jack" => Ok(MidiApi::Jack),
            "dummy" => Ok(MidiApi::Dummy),
            other => Err(Error::InvalidSettings(format!("unknown MIDI backend {other:?}"))),
        }
    }
}

/// Native backends compiled into this build, in fallback order.
pub fn compiled_apis() -> &'static [MidiApi] {
    &[
        #[cfg(feature = "jack")]
        MidiApi::Jack,
        #[cfg(all(target_os = "linux", feature = "alsa"))]
        MidiApi::Alsa,
    ]
}

static SELECTED_API: AtomicU8 = AtomicU8::new(0);

/// The backend chosen by the last successful selection, if any.
pub fn selected_api() -> Option<MidiApi> {
    match MidiApi::from_u8(SELECTED_API.load(Ordering::Acquire)) {
        MidiApi::Unspecified => None,
        api => Some(api),
    }
}

pub(crate) fn set_selected_api(api: MidiApi) {
    SELECTED_API.store(api.to_u8(), Ordering::Release);
}

/// Forgets the cached selection so the next open probes again.
pub fn reset_selected_api() {
    SELECTED_API.store(0, Ordering::Release);
}

/// Order in which backends are probed for an unspecified request.
pub fn candidate_order(
    prefer_jack: bool,
    cached: Option<MidiApi>,
    compiled: &[MidiApi],
) -> Vec<MidiApi> {
    let preferred = if prefer_jack {
        MidiApi::Jack
    } else {
        MidiApi::Alsa
    };
    let mut order = Vec::with_capacity(compiled.len() + 1);
    for api in cached.into_iter().chain(std::iter::once(preferred)) {
        if compiled.contains(&api) && !order.contains(&api) {
            order.push(api);
        }
    }
    for &api in compiled {
        if !order.contains(&api) {
            order.push(api);
        }
    }
    order
}

/// Chooses a backend.
///
/// `probe` opens a backend and reports how many ports it sees. An explicit
/// request that is not compiled in, fails to open, or sees no ports is a
/// configuration error, except in manual-port mode where an explicit backend
/// with an empty catalog is still usable for virtual ports. An unspecified
/// request walks [`candidate_order`] and keeps the first backend with at least
/// one port; if none has any, the result is [`Error::NoBackend`].
pub fn select_backend<T, P>(
    requested: MidiApi,
    prefer_jack: bool,
    manual_ports: bool,
    compiled: &[MidiApi],
    mut probe: P,
) -> Result<(MidiApi, T)>
where
    P: FnMut(MidiApi) -> Result<(T, usize)>,
{
    if requested != MidiApi::Unspecified {
        if requested != MidiApi::Dummy && !compiled.contains(&requested) {
            return Err(Error::BackendUnavailable(requested));
        }
        let (backend, ports) = probe(requested)?;
        if ports == 0 && !manual_ports {
            return Err(Error::NoPorts(requested));
        }
        info!("MIDI backend {} selected ({} ports)", requested, ports);
        return Ok((requested, backend));
    }

    for api in candidate_order(prefer_jack, selected_api(), compiled) {
        match probe(api) {
            Ok((backend, ports)) if ports > 0 => {
                info!("MIDI backend {} selected ({} ports)", api, ports);
                return Ok((api, backend));
            }
            Ok(_) => debug!("MIDI backend {} reports no ports, trying next", api),
            Err(e) => debug!("MIDI backend {} unavailable: {}", api, e),
        }
    }
    Err(Error::NoBackend)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: &[MidiApi] = &[MidiApi::Jack, MidiApi::Alsa];

    #[test]
    fn test_candidate_order() {
        assert_eq!(
            candidate_order(false, None, BOTH),
            vec![MidiApi::Alsa, MidiApi::Jack]
        );
        assert_eq!(
            candidate_order(true, None, BOTH),
            vec![MidiApi::Jack, MidiApi::Alsa]
        );
        assert_eq!(
            candidate_order(false, Some(MidiApi::Jack), BOTH),
            vec![MidiApi::Jack, MidiApi::Alsa]
        );
        assert_eq!(
            candidate_order(true, None, &[MidiApi::Alsa]),
            vec![MidiApi::Alsa]
        );
    }

    #[test]
    fn test_fallback_when_preferred_has_no_ports() {
        let mut probed = Vec::new();
        let (api, _) = select_backend(MidiApi::Unspecified, true, false, BOTH, |api| {
            probed.push(api);
            let ports = if api == MidiApi::Jack { 0 } else { 3 };
            Ok(((), ports))
        })
        .unwrap();
        assert_eq!(api, MidiApi::Alsa);
        assert!(probed.contains(&MidiApi::Jack));
    }

    #[test]
    fn test_all_empty_fails_deterministically() {
        for _ in 0..3 {
            let result = select_backend(MidiApi::Unspecified, false, false, BOTH, |_| Ok(((), 0)));
            assert!(matches!(result, Err(Error::NoBackend)));
        }
    }

    #[test]
    fn test_probe_errors_fall_through() {
        let result = select_backend(MidiApi::Unspecified, false, false, BOTH, |api| match api {
            MidiApi::Alsa => Err(Error::Driver("no sequencer".into())),
            _ => Ok((api, 1)),
        });
        assert_eq!(result.unwrap().0, MidiApi::Jack);
    }

    #[test]
    fn test_explicit_request_not_substituted() {
        let result =
            select_backend(MidiApi::Jack, false, false, &[MidiApi::Alsa], |api| Ok((api, 5)));
        assert!(matches!(result, Err(Error::BackendUnavailable(MidiApi::Jack))));

        let result = select_backend(MidiApi::Alsa, false, false, BOTH, |_| Ok(((), 0)));
        assert!(matches!(result, Err(Error::NoPorts(MidiApi::Alsa))));

        let result = select_backend(MidiApi::Dummy, false, false, &[], |_| Ok(((), 2)));
        assert_eq!(result.unwrap().0, MidiApi::Dummy);
    }

    #[test]
    fn test_manual_ports_accept_empty_explicit_backend() {
        let result = select_backend(MidiApi::Alsa, false, true, BOTH, |_| Ok(((), 0)));
        assert_eq!(result.unwrap().0, MidiApi::Alsa);

        let result = select_backend(MidiApi::Unspecified, false, true, BOTH, |_| Ok(((), 0)));
        assert!(matches!(result, Err(Error::NoBackend)));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("JACK".parse::<MidiApi>().unwrap(), MidiApi::Jack);
        assert_eq!("".parse::<MidiApi>().unwrap(), MidiApi::Unspecified);
        assert!("coreaudio".parse::<MidiApi>().is_err());
        assert_eq!(MidiApi::Alsa.to_string(), "alsa");
        assert!(MidiApi::Dummy.is_compiled());
    }
}
