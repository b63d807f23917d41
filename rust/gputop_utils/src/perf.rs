// SPDX-License-Identifier: GPL-2.0

//! perf_event_open(2) access to PMU event sources registered under
//! /sys/bus/event_source/devices.
//!
//! Counters opened through [`open_group`] share one group leader so the
//! whole set can be read atomically with a single read(2) on the leader.
//! The leader is opened with `PERF_FORMAT_GROUP | PERF_FORMAT_TOTAL_TIME_ENABLED`,
//! so a group read returns `{ nr, time_enabled, value[nr] }`.

use std::fs;
use std::io;
use std::mem;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

const PERF_ATTR_FLAG_USE_CLOCKID: u64 = 1 << 25;

const EVENT_SOURCE_DIR: &str = "/sys/bus/event_source/devices";

/// perf_event_attr, PERF_ATTR_SIZE_VER6 layout. Unions with identically
/// sized members are flattened to their first member.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> io::Result<i32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i32)
    }
}

fn open(type_: u32, config: u64, group: i32, mut format: u64) -> io::Result<i32> {
    // Only the group leader carries the group read format.
    if group >= 0 {
        format &= !PERF_FORMAT_GROUP;
    }

    let attr = PerfEventAttr {
        type_,
        size: mem::size_of::<PerfEventAttr>() as u32,
        config,
        read_format: format,
        flags: PERF_ATTR_FLAG_USE_CLOCKID,
        clockid: libc::CLOCK_MONOTONIC,
        ..Default::default()
    };

    // Uncore PMUs are typically exposed on one CPU only; probe until a CPU
    // accepts the event or we run out.
    let nr_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) }.max(1) as i32;
    let mut cpu = 0;
    loop {
        match perf_event_open(&attr, -1, cpu, group, 0) {
            Ok(fd) => return Ok(fd),
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) && cpu + 1 < nr_cpus => {
                cpu += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Opens a counter chained under `group` (pass -1 to create a group leader).
/// The returned fd is owned by the caller.
pub fn open_group(type_: u32, config: u64, group: i32) -> io::Result<i32> {
    open(
        type_,
        config,
        group,
        PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_GROUP,
    )
}

fn event_source_path(pmu: &str) -> PathBuf {
    PathBuf::from(EVENT_SOURCE_DIR).join(pmu)
}

/// Dynamic perf type id of an event source, from its sysfs `type` file.
pub fn event_source_type(pmu: &str) -> Result<u32> {
    let path = event_source_path(pmu).join("type");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("failed to parse perf type id from {}", path.display()))
}

/// Base config of a named event, from the event source's `events/<name>` file.
pub fn event_config(pmu: &str, event: &str) -> Result<u64> {
    let path = event_source_path(pmu).join("events").join(event);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_event_config(&contents).with_context(|| format!("malformed event {}", path.display()))
}

/// Start bit of a config format field, from the event source's
/// `format/<field>` file (e.g. `config:60-63` -> 60).
pub fn format_shift(pmu: &str, field: &str) -> Result<u32> {
    let path = event_source_path(pmu).join("format").join(field);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_format_shift(&contents).with_context(|| format!("malformed format {}", path.display()))
}

/// Event source name of a xe device, derived from its PCI slot
/// (0000:03:00.0 -> xe_0000_03_00.0).
pub fn xe_perf_device(pci_slot: &str) -> String {
    format!("xe_{}", pci_slot.replace(':', "_"))
}

fn parse_u64(value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.with_context(|| format!("failed to parse '{value}'"))
}

fn parse_event_config(contents: &str) -> Result<u64> {
    for term in contents.trim().split(',') {
        if let Some((key, value)) = term.split_once('=') {
            if key.trim() == "event" {
                return parse_u64(value);
            }
        }
    }
    bail!("no event= term in '{}'", contents.trim());
}

fn parse_format_shift(contents: &str) -> Result<u32> {
    let (field, bits) = contents
        .trim()
        .split_once(':')
        .with_context(|| format!("no bit range in '{}'", contents.trim()))?;
    if field != "config" {
        bail!("unsupported format field '{field}'");
    }
    let start = bits.split('-').next().unwrap_or(bits);
    start
        .parse()
        .with_context(|| format!("failed to parse bit range '{bits}'"))
}
