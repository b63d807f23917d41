// SPDX-License-Identifier: GPL-2.0

//! The xe driver backend: engine enumeration through the xe device-query
//! ioctl, PMU event composition from the device's perf event source, and the
//! per-device render pass.

use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;

use anyhow::{bail, Context, Result};

use gputop_utils::device_scan::DeviceCard;
use gputop_utils::perf;

use crate::pmu::{busy_percent, CounterGroup, Metric, PmuCounter, SlotKey};
use crate::render::{percentage_bar, Frame};

pub const DRM_XE_ENGINE_CLASS_RENDER: u16 = 0;
pub const DRM_XE_ENGINE_CLASS_COPY: u16 = 1;
pub const DRM_XE_ENGINE_CLASS_VIDEO_DECODE: u16 = 2;
pub const DRM_XE_ENGINE_CLASS_VIDEO_ENHANCE: u16 = 3;
pub const DRM_XE_ENGINE_CLASS_COMPUTE: u16 = 4;

const DRM_IOCTL_BASE: u64 = 0x64; // 'd'
const DRM_COMMAND_BASE: u64 = 0x40;
const DRM_XE_DEVICE_QUERY: u64 = 0x00;
const DRM_XE_DEVICE_QUERY_ENGINES: u32 = 0;

/// Width of the engine label column, sized to the ENGINES banner prefix.
const ENGINE_LABEL_WIDTH: usize = 19;
const ENGINES_BANNER: &str = "            ENGINES   ACTIVITY  ";

const ACTIVE_TICKS_EVENT: &str = "engine-active-ticks";
const TOTAL_TICKS_EVENT: &str = "engine-total-ticks";

#[repr(C)]
#[derive(Default)]
struct DrmXeDeviceQuery {
    extensions: u64,
    query: u32,
    size: u32,
    data: u64,
    reserved: [u64; 2],
}

const fn drm_iowr(nr: u64, size: usize) -> u64 {
    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    ((IOC_READ | IOC_WRITE) << 30) | ((size as u64) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

fn class_display_name(class: u16) -> &'static str {
    match class {
        DRM_XE_ENGINE_CLASS_RENDER => "Render/3D",
        DRM_XE_ENGINE_CLASS_COPY => "Blitter",
        DRM_XE_ENGINE_CLASS_VIDEO_DECODE => "Video",
        DRM_XE_ENGINE_CLASS_VIDEO_ENHANCE => "VideoEnhance",
        DRM_XE_ENGINE_CLASS_COMPUTE => "Compute",
        _ => "[unknown]",
    }
}

/// One hardware engine with its two tick counters.
#[derive(Debug)]
pub struct XeEngine {
    pub gt: u16,
    pub class: u16,
    pub instance: u16,
    pub display_name: String,
    pub active_ticks: PmuCounter,
    pub total_ticks: PmuCounter,
}

/// Engines sort by (gt, class, instance) once at discovery. Counter opens
/// and every subsequent group read iterate in this order, so the sort must
/// never be repeated with a different key.
pub(crate) fn sort_engines(engines: &mut [XeEngine]) {
    engines.sort_by_key(|e| (e.gt, e.class, e.instance));
}

/// One xe device instance: identity, discovered engines and, once opened,
/// the counter group they are chained under.
#[derive(Debug)]
pub struct XeDevice {
    card: DeviceCard,
    perf_device: String,
    engines: Vec<XeEngine>,
    group: Option<CounterGroup>,
}

impl XeDevice {
    pub fn new(card: DeviceCard) -> Self {
        Self {
            card,
            perf_device: String::new(),
            engines: Vec::new(),
            group: None,
        }
    }

    pub fn card(&self) -> &DeviceCard {
        &self.card
    }

    pub fn engines(&self) -> &[XeEngine] {
        &self.engines
    }

    /// Queries the device's hardware engines and composes each engine's PMU
    /// event configs. The engine list is final after this call.
    pub fn discover_engines(&mut self) -> Result<()> {
        let node = self.card.card_node.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&node)
            .with_context(|| format!("failed to open {}", node.display()))?;
        let hw_engines = query_engines(file.as_raw_fd())
            .with_context(|| format!("engine query failed for {}", node.display()))?;
        if hw_engines.is_empty() {
            bail!("{} exposes no engines", node.display());
        }

        self.perf_device = perf::xe_perf_device(&self.card.pci_slot);
        let gt_shift = perf::format_shift(&self.perf_device, "gt")?;
        let class_shift = perf::format_shift(&self.perf_device, "engine_class")?;
        let instance_shift = perf::format_shift(&self.perf_device, "engine_instance")?;
        let active_config = perf::event_config(&self.perf_device, ACTIVE_TICKS_EVENT)?;
        let total_config = perf::event_config(&self.perf_device, TOTAL_TICKS_EVENT)?;

        self.engines = hw_engines
            .into_iter()
            .map(|(class, instance, gt)| {
                let param = (gt as u64) << gt_shift
                    | (class as u64) << class_shift
                    | (instance as u64) << instance_shift;
                XeEngine {
                    gt,
                    class,
                    instance,
                    display_name: format!("GT:{gt} {}/{instance}", class_display_name(class)),
                    active_ticks: PmuCounter::new(active_config | param),
                    total_ticks: PmuCounter::new(total_config | param),
                }
            })
            .collect();
        sort_engines(&mut self.engines);

        Ok(())
    }

    /// Opens both counters of every engine, chained under one group leader.
    /// Any open failure rejects the whole device: a partial counter set
    /// would desynchronize the positional read contract.
    pub fn open_counters(&mut self) -> Result<()> {
        let pmu_type = perf::event_source_type(&self.perf_device)?;
        let mut group = CounterGroup::new(pmu_type);

        for engine in &mut self.engines {
            for metric in [Metric::ActiveTicks, Metric::TotalTicks] {
                let key = SlotKey {
                    gt: engine.gt,
                    class: engine.class,
                    instance: engine.instance,
                    metric,
                };
                let counter = match metric {
                    Metric::ActiveTicks => &mut engine.active_ticks,
                    Metric::TotalTicks => &mut engine.total_ticks,
                };
                group.open(key, counter).with_context(|| {
                    format!(
                        "failed to open PMU counter for {} on {}",
                        engine.display_name, self.perf_device
                    )
                })?;
            }
        }

        self.group = Some(group);
        Ok(())
    }

    /// One batched counter read, rotating every engine's samples. The first
    /// call after [`open_counters`] is a warm-up whose deltas are not valid.
    ///
    /// [`open_counters`]: XeDevice::open_counters
    pub fn sample(&mut self) -> Result<()> {
        let group = self
            .group
            .as_ref()
            .context("sampled before counters were opened")?;
        let values = group
            .read_values()
            .with_context(|| format!("counter read failed for {}", self.perf_device))?;

        for engine in &mut self.engines {
            engine.active_ticks.update(&values);
            engine.total_ticks.update(&values);
        }
        Ok(())
    }

    /// Renders this device's banner and engine activity rows into `frame`.
    pub fn render(&self, frame: &mut Frame) {
        if frame.full() {
            return;
        }
        frame.push_inverse(&format!(
            "DRIVER: {} || BDF: {}",
            self.card.driver, self.card.pci_slot
        ));

        let num_counters = self.group.as_ref().map_or(0, CounterGroup::num_counters);
        if num_counters > 0 && !frame.full() {
            frame.push_inverse(ENGINES_BANNER);
        }

        for engine in &self.engines {
            if frame.full() {
                break;
            }
            let percent = busy_percent(&engine.active_ticks.val, &engine.total_ticks.val);
            let mut line = format!("{:>ENGINE_LABEL_WIDTH$}", engine.display_name);
            line.push_str(&percentage_bar(
                percent,
                frame.width().saturating_sub(ENGINE_LABEL_WIDTH),
            ));
            frame.push_line(&line);
        }

        if !frame.full() {
            frame.push_line("");
        }
    }
}

/// Runs the xe engine query twice, first to size the payload and then to
/// fetch it. Returns (class, instance, gt) tuples.
fn query_engines(fd: i32) -> Result<Vec<(u16, u16, u16)>> {
    let request = drm_iowr(
        DRM_COMMAND_BASE + DRM_XE_DEVICE_QUERY,
        mem::size_of::<DrmXeDeviceQuery>(),
    );
    let mut query = DrmXeDeviceQuery {
        query: DRM_XE_DEVICE_QUERY_ENGINES,
        ..Default::default()
    };

    if unsafe { libc::ioctl(fd, request as libc::c_ulong, &mut query) } != 0 {
        return Err(io::Error::last_os_error()).context("engine query (size) ioctl failed");
    }

    let mut buf = vec![0u8; query.size as usize];
    query.data = buf.as_mut_ptr() as u64;
    if unsafe { libc::ioctl(fd, request as libc::c_ulong, &mut query) } != 0 {
        return Err(io::Error::last_os_error()).context("engine query ioctl failed");
    }

    parse_engine_query(&buf)
}

/// Payload layout: u32 engine count, u32 pad, then one 32-byte entry per
/// engine whose first three u16s are class, instance and gt.
fn parse_engine_query(buf: &[u8]) -> Result<Vec<(u16, u16, u16)>> {
    const HEADER: usize = 8;
    const ENTRY: usize = 32;

    if buf.len() < HEADER {
        bail!("engine query payload too short: {} bytes", buf.len());
    }
    let num = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < HEADER + num * ENTRY {
        bail!("engine query payload truncated: {} engines in {} bytes", num, buf.len());
    }

    let mut engines = Vec::with_capacity(num);
    for i in 0..num {
        let off = HEADER + i * ENTRY;
        let class = u16::from_ne_bytes(buf[off..off + 2].try_into().unwrap());
        let instance = u16::from_ne_bytes(buf[off + 2..off + 4].try_into().unwrap());
        let gt = u16::from_ne_bytes(buf[off + 4..off + 6].try_into().unwrap());
        engines.push((class, instance, gt));
    }
    Ok(engines)
}
