// SPDX-License-Identifier: GPL-2.0

//! Control of the per-device sysfs `profiling` knob some DRM drivers gate
//! their telemetry behind. Everything here is best-effort: a device whose
//! knob cannot be read or written is skipped with a warning, never an error.

use std::fs;
use std::path::PathBuf;

use glob::glob;
use log::warn;

const PROFILING_GLOB: &str = "/sys/class/drm/renderD*/device/profiling";

#[derive(Debug)]
struct ProfiledDevice {
    path: PathBuf,
    original_state: u8,
}

/// The set of devices exposing a profiling knob, with each knob's pre-run
/// state recorded so it can be restored at shutdown.
#[derive(Debug)]
pub struct ProfiledDevices {
    devices: Vec<ProfiledDevice>,
}

impl ProfiledDevices {
    /// Probes sysfs for profiling knobs. None when no device has one.
    pub fn discover() -> Option<Self> {
        let paths = glob(PROFILING_GLOB).ok()?.flatten().collect();
        Self::from_paths(paths)
    }

    fn from_paths(paths: Vec<PathBuf>) -> Option<Self> {
        let mut devices = Vec::new();
        for path in paths {
            match fs::read(&path) {
                Ok(contents) if !contents.is_empty() => devices.push(ProfiledDevice {
                    path,
                    original_state: contents[0],
                }),
                Ok(_) => {}
                Err(err) => warn!("failed to read {}: {err}", path.display()),
            }
        }
        (!devices.is_empty()).then_some(Self { devices })
    }

    /// Turns profiling on for every device, or restores each knob to the
    /// state recorded at discovery.
    pub fn configure(&self, enable: bool) {
        for device in &self.devices {
            let state = if enable {
                b'1'
            } else {
                device.original_state
            };
            if let Err(err) = fs::write(&device.path, [state]) {
                warn!("failed to write {}: {err}", device.path.display());
            }
        }
    }

    /// Re-asserts profiling on knobs some other writer turned off since the
    /// last tick. The recorded original state follows the outside writer so
    /// shutdown restores their choice, not ours.
    pub fn reconcile(&mut self) {
        for device in &mut self.devices {
            let state = match fs::read(&device.path) {
                Ok(contents) if !contents.is_empty() => contents[0],
                _ => continue,
            };
            if state == b'0' {
                if let Err(err) = fs::write(&device.path, b"1") {
                    warn!("failed to write {}: {err}", device.path.display());
                    continue;
                }
                device.original_state = b'0';
            }
        }
    }
}
