// SPDX-License-Identifier: GPL-2.0

//! The driver registry. Each supported driver contributes one
//! [`DeviceInstance`] variant carrying its own device state; the registry
//! proper is the [`DriverKind`] lookup plus one [`DriverContext`] per kind.
//! Adding a driver means adding a variant and its arms, nothing else.

use anyhow::Result;

use gputop_utils::device_scan::{DeviceCard, DeviceFilter};

use crate::render::Frame;
use crate::xe::XeDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Xe,
}

impl DriverKind {
    pub const ALL: [DriverKind; 1] = [DriverKind::Xe];

    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Xe => "xe",
        }
    }

    pub fn for_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// One monitored device. Operations are independent across instances: a
/// failure here never touches sibling instances' state.
#[derive(Debug)]
pub enum DeviceInstance {
    Xe(XeDevice),
}

impl DeviceInstance {
    pub fn new(kind: DriverKind, card: DeviceCard) -> Self {
        match kind {
            DriverKind::Xe => DeviceInstance::Xe(XeDevice::new(card)),
        }
    }

    pub fn card(&self) -> &DeviceCard {
        match self {
            DeviceInstance::Xe(dev) => dev.card(),
        }
    }

    pub fn discover_engines(&mut self) -> Result<()> {
        match self {
            DeviceInstance::Xe(dev) => dev.discover_engines(),
        }
    }

    pub fn open_counters(&mut self) -> Result<()> {
        match self {
            DeviceInstance::Xe(dev) => dev.open_counters(),
        }
    }

    pub fn sample(&mut self) -> Result<()> {
        match self {
            DeviceInstance::Xe(dev) => dev.sample(),
        }
    }

    pub fn render(&self, frame: &mut Frame) {
        match self {
            DeviceInstance::Xe(dev) => dev.render(frame),
        }
    }
}

/// Per-driver bookkeeping: whether any device matched and the instances
/// themselves. Instances are addressed by index; the vector may reallocate
/// as discovery appends, so no references are held across growth.
#[derive(Debug)]
pub struct DriverContext {
    pub kind: DriverKind,
    pub device_present: bool,
    pub instances: Vec<DeviceInstance>,
}

/// All driver contexts, one per supported driver.
#[derive(Debug)]
pub struct InstanceStore {
    contexts: Vec<DriverContext>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self {
            contexts: DriverKind::ALL
                .into_iter()
                .map(|kind| DriverContext {
                    kind,
                    device_present: false,
                    instances: Vec::new(),
                })
                .collect(),
        }
    }

    /// Files every matching card under its driver's context and returns how
    /// many instances were created.
    pub fn populate(&mut self, cards: Vec<DeviceCard>, filter: &DeviceFilter) -> usize {
        let mut count = 0;
        for card in cards {
            if !filter.matches(&card) {
                continue;
            }
            let Some(kind) = DriverKind::for_name(&card.driver) else {
                continue;
            };
            let context = self
                .contexts
                .iter_mut()
                .find(|c| c.kind == kind)
                .expect("every DriverKind has a context");
            context.device_present = true;
            context.instances.push(DeviceInstance::new(kind, card));
            count += 1;
        }
        count
    }

    pub fn instances(&self) -> impl Iterator<Item = &DeviceInstance> {
        self.contexts.iter().flat_map(|c| c.instances.iter())
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut DeviceInstance> {
        self.contexts.iter_mut().flat_map(|c| c.instances.iter_mut())
    }
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputop_utils::device_scan::DEFAULT_FILTER;
    use std::path::PathBuf;

    fn card(driver: &str, subsystem: &str, index: usize) -> DeviceCard {
        DeviceCard {
            driver: driver.to_string(),
            subsystem: subsystem.to_string(),
            pci_slot: format!("0000:0{index}:00.0"),
            index,
            card_node: PathBuf::from(format!("/dev/dri/card{index}")),
            render_node: None,
        }
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(DriverKind::for_name("xe"), Some(DriverKind::Xe));
        assert_eq!(DriverKind::for_name("i915"), None);
        assert_eq!(DriverKind::for_name(""), None);
    }

    #[test]
    fn test_populate_groups_by_driver() {
        let filter = DeviceFilter::parse(DEFAULT_FILTER).unwrap();
        let cards = vec![
            card("xe", "pci", 0),
            card("amdgpu", "pci", 1),
            card("xe", "pci", 2),
            card("xe", "platform", 3),
        ];

        let mut store = InstanceStore::new();
        // amdgpu has no registry entry, the platform card fails the filter.
        assert_eq!(store.populate(cards, &filter), 2);

        let indices: Vec<_> = store.instances().map(|i| i.card().index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(store.contexts[0].device_present);
    }

    #[test]
    fn test_populate_nothing_matching() {
        let filter = DeviceFilter::parse("driver=xe").unwrap();
        let mut store = InstanceStore::new();
        assert_eq!(store.populate(vec![card("nouveau", "pci", 0)], &filter), 0);
        assert!(!store.contexts[0].device_present);
        assert_eq!(store.instances().count(), 0);
    }
}
