//! Port descriptors and per-direction catalogs built by a backend scan.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel returned by id accessors for out-of-range indices.
pub const BAD_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    /// Short form used in synthesized port names ("midi in 0").
    pub fn short_name(self) -> &'static str {
        match self {
            PortDirection::Input => "in",
            PortDirection::Output => "out",
        }
    }

    pub fn is_input(self) -> bool {
        self == PortDirection::Input
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Bound to a discovered native port.
    #[default]
    Normal,
    /// Created by this application for others to connect to.
    Virtual,
    /// Always-present subsystem port (announce, timer).
    System,
}

/// One discovered (or synthesized) port. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub client_id: i32,
    pub client_name: String,
    pub port_id: i32,
    pub port_name: String,
    pub alias: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    /// Backend-defined handle (packed ALSA address, JACK list position).
    pub internal_id: u64,
}

impl PortDescriptor {
    pub fn new(
        direction: PortDirection,
        client_id: i32,
        client_name: impl Into<String>,
        port_id: i32,
        port_name: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            client_name: client_name.into(),
            port_id,
            port_name: port_name.into(),
            alias: String::new(),
            direction,
            kind: PortKind::Normal,
            internal_id: 0,
        }
    }

    pub fn with_kind(mut self, kind: PortKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_internal_id(mut self, id: u64) -> Self {
        self.internal_id = id;
        self
    }

    /// "client:port", the name native connect calls and rescans resolve by.
    pub fn connect_name(&self) -> String {
        format!("{}:{}", self.client_name, self.port_name)
    }

    /// "[index] client:port client_name:port_name"
    pub fn display_name(&self, index: usize) -> String {
        format!(
            "[{}] {}:{} {}",
            index,
            self.client_id,
            self.port_id,
            self.connect_name()
        )
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == PortKind::Virtual
    }

    pub fn is_system(&self) -> bool {
        self.kind == PortKind::System
    }
}

/// Insertion-ordered descriptors for one direction.
///
/// Index `i` is stable for the lifetime of one scan result only; callers
/// re-resolve by client/port after a rescan. Accessors return [`BAD_ID`] or
/// an empty string for out-of-range indices instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCatalog {
    direction: PortDirection,
    ports: Vec<PortDescriptor>,
}

impl PortCatalog {
    pub fn new(direction: PortDirection) -> Self {
        Self {
            direction,
            ports: Vec::new(),
        }
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Appends a descriptor and returns its index.
    pub fn add(&mut self, mut port: PortDescriptor) -> usize {
        if port.direction != self.direction {
            tracing::warn!(
                "Port {} scanned as {} added to {} catalog",
                port.connect_name(),
                port.direction,
                self.direction
            );
            port.direction = self.direction;
        }
        self.ports.push(port);
        self.ports.len() - 1
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }

    pub fn count(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PortDescriptor> {
        self.ports.get(index)
    }

    pub fn try_get(&self, index: usize) -> Result<&PortDescriptor> {
        self.ports.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.ports.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports.iter()
    }

    /// Linear search; catalogs hold tens of ports.
    pub fn lookup_index(&self, client_id: i32, port_id: i32) -> Option<usize> {
        self.ports
            .iter()
            .position(|p| p.client_id == client_id && p.port_id == port_id)
    }

    /// Resolves a "client:port" connect name.
    pub fn lookup_name(&self, connect_name: &str) -> Option<usize> {
        self.ports
            .iter()
            .position(|p| p.connect_name() == connect_name)
    }

    /// Re-finds a port seen in an earlier scan.
    ///
    /// A port with the same ids and connect name wins; otherwise the first
    /// port with that connect name for which `taken` is false. Ports that
    /// share a name therefore each resolve to their own index.
    pub fn resolve(
        &self,
        client_id: i32,
        port_id: i32,
        connect_name: &str,
        taken: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        self.lookup_index(client_id, port_id)
            .filter(|&index| !taken(index) && self.connect_name(index) == connect_name)
            .or_else(|| {
                self.ports
                    .iter()
                    .enumerate()
                    .position(|(index, p)| !taken(index) && p.connect_name() == connect_name)
            })
    }

    pub fn bus_id(&self, index: usize) -> i32 {
        self.get(index).map_or(BAD_ID, |p| p.client_id)
    }

    pub fn port_id(&self, index: usize) -> i32 {
        self.get(index).map_or(BAD_ID, |p| p.port_id)
    }

    pub fn bus_name(&self, index: usize) -> &str {
        self.get(index).map_or("", |p| p.client_name.as_str())
    }

    pub fn port_name(&self, index: usize) -> &str {
        self.get(index).map_or("", |p| p.port_name.as_str())
    }

    pub fn port_alias(&self, index: usize) -> &str {
        self.get(index).map_or("", |p| p.alias.as_str())
    }

    pub fn is_virtual(&self, index: usize) -> bool {
        self.get(index).is_some_and(PortDescriptor::is_virtual)
    }

    pub fn is_system(&self, index: usize) -> bool {
        self.get(index).is_some_and(PortDescriptor::is_system)
    }

    pub fn connect_name(&self, index: usize) -> String {
        self.get(index)
            .map(PortDescriptor::connect_name)
            .unwrap_or_default()
    }

    /// One line per port, virtual and system ports marked.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (index, port) in self.ports.iter().enumerate() {
            out.push_str(&port.display_name(index));
            match port.kind {
                PortKind::Virtual => out.push_str(" (virtual)"),
                PortKind::System => out.push_str(" (system)"),
                PortKind::Normal => {}
            }
            out.push('\n');
        }
        out
    }
}

impl<'a> IntoIterator for &'a PortCatalog {
    type Item = &'a PortDescriptor;
    type IntoIter = std::slice::Iter<'a, PortDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outputs() -> PortCatalog {
        let mut catalog = PortCatalog::new(PortDirection::Output);
        catalog.add(PortDescriptor::new(
            PortDirection::Output,
            14,
            "Midi Through",
            0,
            "Midi Through Port-0",
        ));
        catalog.add(
            PortDescriptor::new(PortDirection::Output, 128, "FLUID Synth", 0, "Synth input port")
                .with_alias("fluidsynth"),
        );
        catalog
    }

    #[test]
    fn test_lookup_then_accessors() {
        let catalog = sample_outputs();
        let index = catalog.lookup_index(128, 0).unwrap();
        assert_eq!(index, 1);
        assert_eq!(catalog.bus_id(index), 128);
        assert_eq!(catalog.port_id(index), 0);
        assert_eq!(catalog.bus_name(index), "FLUID Synth");
        assert_eq!(catalog.port_name(index), "Synth input port");
        assert_eq!(catalog.port_alias(index), "fluidsynth");
        assert_eq!(catalog.connect_name(index), "FLUID Synth:Synth input port");
        assert!(!catalog.is_virtual(index));
        assert!(!catalog.is_system(index));
    }

    #[test]
    fn test_out_of_range_sentinels() {
        let catalog = sample_outputs();
        assert_eq!(catalog.bus_id(9), BAD_ID);
        assert_eq!(catalog.port_id(9), BAD_ID);
        assert_eq!(catalog.bus_name(9), "");
        assert_eq!(catalog.port_name(9), "");
        assert_eq!(catalog.connect_name(9), "");
        assert!(!catalog.is_system(9));
        assert_eq!(
            catalog.try_get(9),
            Err(Error::IndexOutOfRange { index: 9, count: 2 })
        );
    }

    #[test]
    fn test_lookup_missing() {
        let catalog = sample_outputs();
        assert_eq!(catalog.lookup_index(14, 3), None);
        assert_eq!(catalog.lookup_name("Midi Through:Midi Through Port-0"), Some(0));
        assert_eq!(catalog.lookup_name("nope:nope"), None);
    }

    #[test]
    fn test_resolve_prefers_ids_over_name() {
        let mut catalog = PortCatalog::new(PortDirection::Output);
        catalog.add(PortDescriptor::new(PortDirection::Output, 20, "USB Keys", 0, "MIDI 1"));
        catalog.add(PortDescriptor::new(PortDirection::Output, 24, "USB Keys", 0, "MIDI 1"));

        assert_eq!(catalog.resolve(24, 0, "USB Keys:MIDI 1", |_| false), Some(1));
        assert_eq!(catalog.resolve(20, 0, "USB Keys:MIDI 1", |_| false), Some(0));

        // Renumbered ports fall back to the first unclaimed name match.
        assert_eq!(catalog.resolve(30, 0, "USB Keys:MIDI 1", |_| false), Some(0));
        assert_eq!(catalog.resolve(30, 0, "USB Keys:MIDI 1", |i| i == 0), Some(1));
        assert_eq!(catalog.resolve(30, 0, "USB Keys:MIDI 1", |_| true), None);
    }

    #[test]
    fn test_resolve_ignores_reused_ids() {
        let mut catalog = PortCatalog::new(PortDirection::Output);
        catalog.add(PortDescriptor::new(PortDirection::Output, 20, "Other", 0, "port"));
        catalog.add(PortDescriptor::new(PortDirection::Output, 21, "Synth", 0, "in"));
        assert_eq!(catalog.resolve(20, 0, "Synth:in", |_| false), Some(1));
    }

    #[test]
    fn test_add_corrects_direction() {
        let mut catalog = PortCatalog::new(PortDirection::Input);
        let index = catalog.add(PortDescriptor::new(PortDirection::Output, 20, "a", 1, "b"));
        assert_eq!(catalog.get(index).unwrap().direction, PortDirection::Input);
    }

    #[test]
    fn test_clear_resets_indices() {
        let mut catalog = sample_outputs();
        catalog.clear();
        assert_eq!(catalog.count(), 0);
        assert_eq!(catalog.lookup_index(128, 0), None);
    }

    #[test]
    fn test_display_name() {
        let catalog = sample_outputs();
        insta::assert_snapshot!(
            catalog.get(1).unwrap().display_name(1),
            @"[1] 128:0 FLUID Synth:Synth input port"
        );
    }

    #[test]
    fn test_listing_marks_kinds() {
        let mut catalog = PortCatalog::new(PortDirection::Input);
        catalog.add(
            PortDescriptor::new(PortDirection::Input, 0, "system", 0, "announce")
                .with_kind(PortKind::System),
        );
        catalog.add(
            PortDescriptor::new(PortDirection::Input, 129, "seqbus", 0, "midi in 0")
                .with_kind(PortKind::Virtual),
        );
        let listing = catalog.listing();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[0], "[0] 0:0 system:announce (system)");
        assert_eq!(lines[1], "[1] 129:0 seqbus:midi in 0 (virtual)");
    }

    #[test]
    fn test_catalog_serde_roundtrip() {
        let catalog = sample_outputs();
        let encoded = bincode::serialize(&catalog).unwrap();
        let decoded: PortCatalog = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, catalog);
    }
}
