// SPDX-License-Identifier: GPL-2.0

//! Per-process DRM client accounting, built from the `drm-*` key/value
//! blocks the kernel exposes in /proc/<pid>/fdinfo/<fd>.
//!
//! The scanner keeps one state entry per (device minor, drm-client-id) so
//! that successive scans produce per-interval deltas; everything handed out
//! in a [`ClientSnapshot`] is already delta'd and safe to drop after use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use anyhow::Result;

const DRM_MAJOR: u32 = 226;

/// Engine identity of one DRM client: display names and rated capacity,
/// index-aligned. Compared by value; two clients exposing the same names and
/// capacities have equal engine sets no matter where the strings live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientEngines {
    pub names: Vec<String>,
    pub capacity: Vec<u64>,
}

impl ClientEngines {
    pub fn num_engines(&self) -> usize {
        self.names.len()
    }
}

/// Per-interval utilization of one engine, in whichever representations the
/// driver exposes. Missing representations stay zero and are gated by the
/// `supports_*` flags on the record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineUtilization {
    /// Busy nanoseconds this interval (drm-engine-*).
    pub delta_engine_time: u64,
    /// Busy GPU cycles this interval (drm-cycles-*).
    pub delta_cycles: u64,
    /// Elapsed GPU cycles this interval (drm-total-cycles-*).
    pub delta_total_cycles: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRegion {
    pub total: u64,
    pub resident: u64,
}

/// One process-level record handed to the renderer. Rebuilt on every scan.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// DRM minor of the device node the client has open.
    pub device_minor: u32,
    /// Stable drm-client-id, unique per device.
    pub id: u64,
    pub pid: u32,
    pub pid_str: String,
    pub name: String,
    pub engines: ClientEngines,
    pub utilization: Vec<EngineUtilization>,
    pub supports_engine_time: bool,
    pub supports_cycles: bool,
    pub regions: Vec<MemRegion>,
    /// Number of scans this client has been observed in.
    pub samples: u32,
    /// Last-interval busy aggregate across engines, in the preferred
    /// representation; sort key only.
    pub agg_busy: u64,
    pub total_engine_time: u64,
    pub total_cycles: u64,
    pub total_total_cycles: u64,
}

#[derive(Debug, Default)]
pub struct ClientSnapshot {
    pub clients: Vec<ClientRecord>,
    pub max_pid_len: usize,
    pub max_name_len: usize,
}

/// Raw cumulative counters of one engine as parsed from fdinfo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub engine_time: Option<u64>,
    pub cycles: Option<u64>,
    pub total_cycles: Option<u64>,
}

/// One client as parsed out of a single fdinfo file plus /proc metadata,
/// before any delta tracking.
#[derive(Debug, Clone, Default)]
pub struct ParsedClient {
    pub device_minor: u32,
    pub id: u64,
    pub pid: u32,
    pub name: String,
    /// Engine name -> (capacity, cumulative counters), name-sorted.
    pub engines: BTreeMap<String, (u64, EngineCounters)>,
    pub regions: Vec<MemRegion>,
}

#[derive(Debug, Default)]
struct FdinfoData {
    driver: Option<String>,
    client_id: Option<u64>,
    engines: BTreeMap<String, (Option<u64>, EngineCounters)>,
    regions: BTreeMap<String, MemRegion>,
}

/// Parses "123 KiB"-style size values; bare numbers are bytes.
fn parse_size(value: &str) -> Option<u64> {
    let mut it = value.split_whitespace();
    let amount: u64 = it.next()?.parse().ok()?;
    let scale = match it.next() {
        None => 1,
        Some("KiB") => 1024,
        Some("MiB") => 1024 * 1024,
        Some("GiB") => 1024 * 1024 * 1024,
        Some(_) => return None,
    };
    Some(amount * scale)
}

/// Parses "12345 ns"-style or bare counter values.
fn parse_counter(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

fn parse_fdinfo(contents: &str) -> FdinfoData {
    let mut data = FdinfoData::default();

    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if key == "drm-driver" {
            data.driver = Some(value.to_string());
        } else if key == "drm-client-id" {
            data.client_id = value.parse().ok();
        } else if let Some(name) = key.strip_prefix("drm-engine-capacity-") {
            if let Some(capacity) = parse_counter(value) {
                data.engines.entry(name.to_string()).or_default().0 = Some(capacity);
            }
        } else if let Some(name) = key.strip_prefix("drm-engine-") {
            if let Some(ns) = parse_counter(value) {
                data.engines.entry(name.to_string()).or_default().1.engine_time = Some(ns);
            }
        } else if let Some(name) = key.strip_prefix("drm-total-cycles-") {
            if let Some(cycles) = parse_counter(value) {
                data.engines.entry(name.to_string()).or_default().1.total_cycles = Some(cycles);
            }
        } else if let Some(name) = key.strip_prefix("drm-cycles-") {
            if let Some(cycles) = parse_counter(value) {
                data.engines.entry(name.to_string()).or_default().1.cycles = Some(cycles);
            }
        } else if let Some(region) = key.strip_prefix("drm-total-") {
            if let Some(size) = parse_size(value) {
                data.regions.entry(region.to_string()).or_default().total = size;
            }
        } else if let Some(region) = key.strip_prefix("drm-resident-") {
            if let Some(size) = parse_size(value) {
                data.regions.entry(region.to_string()).or_default().resident = size;
            }
        } else if let Some(region) = key.strip_prefix("drm-memory-") {
            // Legacy i915 spelling of drm-total-.
            if let Some(size) = parse_size(value) {
                data.regions.entry(region.to_string()).or_default().total = size;
            }
        }
    }

    data
}

#[derive(Debug)]
struct ClientState {
    engines: ClientEngines,
    prev: Vec<EngineCounters>,
    samples: u32,
}

/// Stateful /proc scanner producing delta'd client snapshots.
#[derive(Debug, Default)]
pub struct ClientScanner {
    states: HashMap<(u32, u64), ClientState>,
}

impl ClientScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks /proc for DRM fds and returns the current client snapshot.
    pub fn scan(&mut self) -> Result<ClientSnapshot> {
        let mut parsed = Vec::new();
        let mut seen = HashSet::new();

        for entry in fs::read_dir("/proc")?.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            scan_pid(pid, &mut parsed, &mut seen);
        }

        Ok(self.ingest(parsed))
    }

    /// Folds one scan's parsed clients into the delta state. Clients absent
    /// from `parsed` are forgotten.
    pub fn ingest(&mut self, parsed: Vec<ParsedClient>) -> ClientSnapshot {
        let mut states = HashMap::new();
        let mut clients = Vec::with_capacity(parsed.len());

        for client in parsed {
            let key = (client.device_minor, client.id);
            let engines = ClientEngines {
                names: client.engines.keys().cloned().collect(),
                capacity: client.engines.values().map(|(cap, _)| *cap).collect(),
            };
            let current: Vec<EngineCounters> =
                client.engines.values().map(|(_, c)| *c).collect();

            // A client whose engine set changed identity is a new client as
            // far as delta tracking goes.
            let state = match self.states.remove(&key) {
                Some(state) if state.engines == engines => state,
                _ => ClientState {
                    engines: engines.clone(),
                    prev: vec![EngineCounters::default(); current.len()],
                    samples: 0,
                },
            };

            let samples = state.samples + 1;
            let utilization: Vec<EngineUtilization> = if samples > 1 {
                current
                    .iter()
                    .zip(&state.prev)
                    .map(|(cur, prev)| EngineUtilization {
                        delta_engine_time: delta(cur.engine_time, prev.engine_time),
                        delta_cycles: delta(cur.cycles, prev.cycles),
                        delta_total_cycles: delta(cur.total_cycles, prev.total_cycles),
                    })
                    .collect()
            } else {
                vec![EngineUtilization::default(); current.len()]
            };

            let supports_engine_time = current.iter().any(|c| c.engine_time.is_some());
            let supports_cycles = current
                .iter()
                .any(|c| c.cycles.is_some() && c.total_cycles.is_some());

            let total_engine_time = utilization.iter().map(|u| u.delta_engine_time).sum();
            let total_cycles = utilization.iter().map(|u| u.delta_cycles).sum();
            let total_total_cycles = utilization.iter().map(|u| u.delta_total_cycles).sum();
            let agg_busy = if supports_cycles {
                total_cycles
            } else {
                total_engine_time
            };

            states.insert(
                key,
                ClientState {
                    engines: engines.clone(),
                    prev: current,
                    samples,
                },
            );

            clients.push(ClientRecord {
                device_minor: client.device_minor,
                id: client.id,
                pid: client.pid,
                pid_str: client.pid.to_string(),
                name: client.name,
                engines,
                utilization,
                supports_engine_time,
                supports_cycles,
                regions: client.regions,
                samples,
                agg_busy,
                total_engine_time,
                total_cycles,
                total_total_cycles,
            });
        }

        self.states = states;

        let max_pid_len = clients
            .iter()
            .map(|c| c.pid_str.len())
            .max()
            .unwrap_or(0)
            .max("PID".len());
        let max_name_len = clients.iter().map(|c| c.name.len()).max().unwrap_or(0);

        ClientSnapshot {
            clients,
            max_pid_len,
            max_name_len,
        }
    }
}

fn delta(cur: Option<u64>, prev: Option<u64>) -> u64 {
    match (cur, prev) {
        (Some(cur), Some(prev)) => cur.saturating_sub(prev),
        _ => 0,
    }
}

fn scan_pid(pid: u32, parsed: &mut Vec<ParsedClient>, seen: &mut HashSet<(u32, u64)>) {
    let fdinfo_dir = format!("/proc/{pid}/fdinfo");
    let Ok(entries) = fs::read_dir(&fdinfo_dir) else {
        return;
    };

    let name = fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    for entry in entries.flatten() {
        let fd_name = entry.file_name();
        let fd_path = format!("/proc/{pid}/fd/{}", fd_name.to_string_lossy());

        let Some(minor) = drm_minor(Path::new(&fd_path)) else {
            continue;
        };
        let Ok(contents) = fs::read_to_string(entry.path()) else {
            continue;
        };

        let data = parse_fdinfo(&contents);
        let (Some(_driver), Some(client_id)) = (data.driver, data.client_id) else {
            continue;
        };

        // Several fds of one process can share a DRM client; count it once.
        if !seen.insert((minor, client_id)) {
            continue;
        }

        parsed.push(ParsedClient {
            device_minor: minor,
            id: client_id,
            pid,
            name: name.clone(),
            engines: data
                .engines
                .into_iter()
                .map(|(name, (capacity, counters))| (name, (capacity.unwrap_or(1), counters)))
                .collect(),
            regions: data.regions.into_values().collect(),
        });
    }
}

/// DRM minor of the device an fd points at, or None for non-DRM fds.
fn drm_minor(fd_path: &Path) -> Option<u32> {
    let metadata = fs::metadata(fd_path).ok()?;
    if !metadata.file_type().is_char_device() {
        return None;
    }
    let rdev = metadata.rdev();
    (libc::major(rdev) == DRM_MAJOR).then_some(libc::minor(rdev))
}
