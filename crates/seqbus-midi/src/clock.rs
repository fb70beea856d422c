//! Per-bus MIDI clock emission policy.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// The port could not be opened.
    Unavailable,
    /// The user disabled the port entirely.
    Disabled,
    /// Port open, no clock sent.
    #[default]
    Off,
    /// Clock sent; continue resumes from the song position.
    Pos,
    /// Clock sent; start realigns to the 16-bar modulus.
    Mod,
}

impl ClockMode {
    pub fn emits_clock(self) -> bool {
        matches!(self, ClockMode::Pos | ClockMode::Mod)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockMode::Unavailable => "unavailable",
            ClockMode::Disabled => "disabled",
            ClockMode::Off => "off",
            ClockMode::Pos => "pos",
            ClockMode::Mod => "mod",
        }
    }
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClockMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unavailable" => Ok(ClockMode::Unavailable),
            "disabled" => Ok(ClockMode::Disabled),
            "off" => Ok(ClockMode::Off),
            "pos" => Ok(ClockMode::Pos),
            "mod" => Ok(ClockMode::Mod),
            other => Err(Error::UnknownClockMode(other.to_string())),
        }
    }
}
