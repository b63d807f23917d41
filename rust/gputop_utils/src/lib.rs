// SPDX-License-Identifier: GPL-2.0

//! Support plumbing for gputop: DRM device discovery, per-process DRM client
//! accounting from fdinfo, perf event-source access and the sysfs profiling
//! knob. The tool itself only consumes the types and snapshots exposed here.

pub mod device_scan;
pub mod drm_clients;
pub mod perf;
pub mod profiling;

pub use device_scan::{scan_cards, DeviceCard, DeviceFilter, DEFAULT_FILTER};
pub use drm_clients::{ClientRecord, ClientScanner, ClientSnapshot};
pub use profiling::ProfiledDevices;
