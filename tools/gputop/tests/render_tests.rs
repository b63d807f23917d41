// SPDX-License-Identifier: GPL-2.0

use std::path::PathBuf;
use std::time::Duration;

use gputop::driver::{DeviceInstance, DriverKind};
use gputop::render::{render_clients, sort_clients, Frame, NO_CLIENTS_MSG};
use gputop_utils::device_scan::DeviceCard;
use gputop_utils::drm_clients::{
    ClientEngines, ClientRecord, ClientSnapshot, EngineUtilization, MemRegion,
};

const WIDTH: usize = 100;
const HEIGHT: usize = 40;
const PERIOD: Duration = Duration::from_secs(2);

fn engines(names: &[&str]) -> ClientEngines {
    ClientEngines {
        names: names.iter().map(|n| n.to_string()).collect(),
        capacity: vec![1; names.len()],
    }
}

fn client(minor: u32, id: u64, busy_cycles: u64, names: &[&str]) -> ClientRecord {
    let engines = engines(names);
    let utilization: Vec<_> = (0..names.len())
        .map(|i| EngineUtilization {
            delta_engine_time: 0,
            delta_cycles: if i == 0 { busy_cycles } else { 0 },
            delta_total_cycles: 1000,
        })
        .collect();
    ClientRecord {
        device_minor: minor,
        id,
        pid: 4000 + id as u32,
        pid_str: (4000 + id).to_string(),
        name: format!("app-{id}"),
        engines,
        utilization,
        supports_engine_time: false,
        supports_cycles: true,
        regions: vec![MemRegion {
            total: 64 * 1024 * 1024,
            resident: 32 * 1024 * 1024,
        }],
        samples: 3,
        agg_busy: busy_cycles,
        total_engine_time: 0,
        total_cycles: busy_cycles,
        total_total_cycles: 1000 * names.len() as u64,
    }
}

fn snapshot(clients: Vec<ClientRecord>) -> ClientSnapshot {
    let max_pid_len = clients
        .iter()
        .map(|c| c.pid_str.len())
        .max()
        .unwrap_or(0)
        .max(3);
    let max_name_len = clients.iter().map(|c| c.name.len()).max().unwrap_or(0);
    ClientSnapshot {
        clients,
        max_pid_len,
        max_name_len,
    }
}

fn render(snapshot: &ClientSnapshot, width: usize, height: usize) -> String {
    let mut frame = Frame::new(width, height);
    if snapshot.clients.is_empty() {
        frame.push_inverse(NO_CLIENTS_MSG);
    }
    render_clients(&mut frame, snapshot, PERIOD);
    frame.finish()
}

#[test]
fn test_render_is_pure() {
    let mut clients = vec![
        client(0, 2, 500, &["bcs", "rcs"]),
        client(0, 1, 900, &["bcs", "rcs"]),
        client(1, 3, 100, &["rcs"]),
    ];
    sort_clients(&mut clients);
    let snapshot = snapshot(clients);

    let first = render(&snapshot, WIDTH, HEIGHT);
    let second = render(&snapshot, WIDTH, HEIGHT);
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_two_devices_emit_two_headers() {
    let mut clients = vec![
        client(1, 3, 400, &["rcs", "vcs"]),
        client(0, 1, 900, &["bcs", "rcs"]),
        client(0, 2, 500, &["bcs", "rcs"]),
    ];
    sort_clients(&mut clients);
    let out = render(&snapshot(clients), WIDTH, HEIGHT);

    assert_eq!(out.matches("DRM minor").count(), 2);
    assert!(out.contains("DRM minor 0"));
    assert!(out.contains("DRM minor 1"));
}

#[test]
fn test_value_identical_engine_sets_share_a_header() {
    // Separately allocated but value-equal engine sets must not retrigger
    // the header.
    let mut clients = vec![
        client(0, 1, 900, &["bcs", "rcs"]),
        client(0, 2, 500, &["bcs", "rcs"]),
        client(0, 3, 100, &["bcs", "rcs"]),
    ];
    sort_clients(&mut clients);
    let out = render(&snapshot(clients), WIDTH, HEIGHT);
    assert_eq!(out.matches("DRM minor").count(), 1);
}

#[test]
fn test_differing_engine_sets_retrigger_header_on_same_device() {
    // One device, but a client with a sparser engine set needs its own
    // header so the per-engine columns stay sized correctly.
    let mut clients = vec![
        client(0, 1, 900, &["bcs", "rcs"]),
        client(0, 2, 500, &["rcs"]),
    ];
    sort_clients(&mut clients);
    let out = render(&snapshot(clients), WIDTH, HEIGHT);
    assert_eq!(out.matches("DRM minor").count(), 2);
}

#[test]
fn test_idle_and_warming_clients_are_hidden() {
    let busy = client(0, 1, 900, &["rcs"]);

    let mut idle = client(0, 2, 0, &["rcs"]);
    idle.total_cycles = 0;
    idle.total_total_cycles = 0;

    let mut warming = client(0, 3, 700, &["rcs"]);
    warming.samples = 1;

    let mut no_repr = client(0, 4, 700, &["rcs"]);
    no_repr.supports_cycles = false;

    let mut clients = vec![busy, idle, warming, no_repr];
    sort_clients(&mut clients);
    let out = render(&snapshot(clients), WIDTH, HEIGHT);

    assert!(out.contains("app-1"));
    assert!(!out.contains("app-2"));
    assert!(!out.contains("app-3"));
    assert!(!out.contains("app-4"));
}

#[test]
fn test_rows_past_console_height_are_dropped() {
    let mut clients: Vec<_> = (0..30)
        .map(|id| client(0, id, 1000 - id, &["rcs"]))
        .collect();
    sort_clients(&mut clients);

    // Header takes two lines; five rows fit afterwards.
    let out = render(&snapshot(clients), WIDTH, 7);
    assert_eq!(out.lines().count(), 7);
    assert!(out.contains("app-0"));
    assert!(out.contains("app-4"));
    assert!(!out.contains("app-5"));
    // Silent drop: no truncation marker of any kind.
    assert!(!out.contains("..."));
}

#[test]
fn test_no_clients_banner() {
    let out = render(&snapshot(Vec::new()), WIDTH, HEIGHT);
    assert!(out.contains(NO_CLIENTS_MSG));
    assert_eq!(out.lines().count(), 1);
}

#[test]
fn test_rows_are_padded_to_console_width() {
    let mut clients = vec![client(0, 1, 900, &["bcs", "rcs"])];
    sort_clients(&mut clients);
    let out = render(&snapshot(clients), WIDTH, HEIGHT);

    for line in out.lines() {
        let visible: String = strip_ansi(line);
        assert_eq!(visible.chars().count(), WIDTH, "short line: {line:?}");
    }
}

#[test]
fn test_memory_columns_follow_region_presence() {
    let with_mem = client(0, 1, 900, &["rcs"]);
    let out = render(&snapshot(vec![with_mem]), WIDTH, HEIGHT);
    assert!(out.contains("MEM"));
    assert!(out.contains("64M"));
    assert!(out.contains("32M"));

    let mut without_mem = client(0, 1, 900, &["rcs"]);
    without_mem.regions.clear();
    let out = render(&snapshot(vec![without_mem]), WIDTH, HEIGHT);
    assert!(!out.contains("MEM"));
}

#[test]
fn test_device_section_renders_without_counters() {
    let card = DeviceCard {
        driver: "xe".to_string(),
        subsystem: "pci".to_string(),
        pci_slot: "0000:03:00.0".to_string(),
        index: 0,
        card_node: PathBuf::from("/dev/dri/card0"),
        render_node: None,
    };
    let instance = DeviceInstance::new(DriverKind::Xe, card);

    let mut frame = Frame::new(WIDTH, HEIGHT);
    instance.render(&mut frame);
    let out = frame.finish();

    assert!(out.contains("DRIVER: xe || BDF: 0000:03:00.0"));
    // No counters opened yet, so no ENGINES banner.
    assert!(!out.contains("ENGINES"));
}

fn strip_ansi(line: &str) -> String {
    let mut out = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c in chars.by_ref() {
                if c == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
