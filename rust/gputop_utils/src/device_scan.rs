// SPDX-License-Identifier: GPL-2.0

//! DRM device enumeration over sysfs, with an igt-style filter expression
//! (`device:subsystem=pci,card=all`) to restrict which cards are picked up.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use glob::glob;

pub const DEFAULT_FILTER: &str = "device:subsystem=pci,card=all";

const SYSFS_DRM: &str = "/sys/class/drm";
const DEV_DRI: &str = "/dev/dri";

/// One enumerated DRM card. Identity only; no file descriptors are held.
#[derive(Debug, Clone)]
pub struct DeviceCard {
    pub driver: String,
    pub subsystem: String,
    /// PCI slot name (BDF), e.g. 0000:03:00.0.
    pub pci_slot: String,
    /// Card index, the N in /dev/dri/cardN.
    pub index: usize,
    pub card_node: PathBuf,
    pub render_node: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardSelect {
    All,
    Index(usize),
}

/// Parsed device filter. Unknown keys are a hard parse error so a typo does
/// not silently widen the match to every device.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    subsystem: Option<String>,
    card: CardSelect,
    driver: Option<String>,
    slot: Option<String>,
}

impl DeviceFilter {
    pub fn parse(expr: &str) -> Result<Self> {
        let body = expr.strip_prefix("device:").unwrap_or(expr);

        let mut filter = DeviceFilter {
            subsystem: None,
            card: CardSelect::All,
            driver: None,
            slot: None,
        };

        for term in body.split(',').filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once('=')
                .with_context(|| format!("filter term '{term}' is not key=value"))?;
            match key {
                "subsystem" => filter.subsystem = Some(value.to_string()),
                "driver" => filter.driver = Some(value.to_string()),
                "slot" | "pci_slot" => filter.slot = Some(value.to_string()),
                "card" => {
                    filter.card = if value == "all" {
                        CardSelect::All
                    } else {
                        CardSelect::Index(
                            value
                                .parse()
                                .with_context(|| format!("bad card index '{value}'"))?,
                        )
                    };
                }
                _ => bail!("unknown filter key '{key}'"),
            }
        }

        Ok(filter)
    }

    pub fn matches(&self, card: &DeviceCard) -> bool {
        if let Some(subsystem) = &self.subsystem {
            if card.subsystem != *subsystem {
                return false;
            }
        }
        if let Some(driver) = &self.driver {
            if card.driver != *driver {
                return false;
            }
        }
        if let Some(slot) = &self.slot {
            if card.pci_slot != *slot {
                return false;
            }
        }
        match self.card {
            CardSelect::All => true,
            CardSelect::Index(index) => card.index == index,
        }
    }
}

fn link_basename(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

fn card_index(name: &str) -> Option<usize> {
    // Only bare cardN entries; connector dirs (card0-DP-1) also match the
    // glob and must be skipped.
    name.strip_prefix("card")?.parse().ok()
}

fn render_nodes_by_slot() -> HashMap<String, PathBuf> {
    let mut nodes = HashMap::new();
    let Ok(paths) = glob(&format!("{SYSFS_DRM}/renderD*")) else {
        return nodes;
    };
    for path in paths.flatten() {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(slot) = link_basename(&path.join("device")) {
            nodes.insert(slot, PathBuf::from(DEV_DRI).join(name));
        }
    }
    nodes
}

/// Enumerates every DRM card node visible in sysfs.
pub fn scan_cards() -> Result<Vec<DeviceCard>> {
    let render_nodes = render_nodes_by_slot();
    let mut cards = Vec::new();

    for path in glob(&format!("{SYSFS_DRM}/card[0-9]*"))
        .context("bad sysfs glob")?
        .flatten()
    {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some(index) = card_index(&name) else {
            continue;
        };

        let device = path.join("device");
        let (Some(driver), Some(subsystem), Some(pci_slot)) = (
            link_basename(&device.join("driver")),
            link_basename(&device.join("subsystem")),
            link_basename(&device),
        ) else {
            continue;
        };

        cards.push(DeviceCard {
            render_node: render_nodes.get(&pci_slot).cloned(),
            driver,
            subsystem,
            pci_slot,
            index,
            card_node: PathBuf::from(DEV_DRI).join(name),
        });
    }

    cards.sort_by_key(|c| c.index);
    Ok(cards)
}
