// SPDX-License-Identifier: GPL-2.0

//! Live per-engine GPU utilization monitor.
//!
//! The tool samples each device's PMU tick counters through one grouped
//! perf read per refresh, folds in per-process DRM client accounting, and
//! redraws a top-style table bounded by the console size.

pub mod driver;
pub mod pmu;
pub mod render;
pub mod xe;

pub use driver::{DeviceInstance, DriverContext, DriverKind, InstanceStore};
pub use render::Frame;
