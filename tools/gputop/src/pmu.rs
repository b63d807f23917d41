// SPDX-License-Identifier: GPL-2.0

//! Per-device PMU counter groups.
//!
//! All counters of one device are chained under the first-opened fd (the
//! group leader) so one read(2) on the leader returns every counter value
//! atomically. The read is positional: the kernel hands back values in open
//! order, so [`CounterGroup`] records a [`SlotKey`] per successful open and
//! a counter's `idx` is its position in that slot table, which is also its
//! position in the read buffer.

use std::io;

use anyhow::{bail, Context, Result};

use gputop_utils::perf;

/// Current and previous raw value of one counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PmuPair {
    pub cur: u64,
    pub prev: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    ActiveTicks,
    TotalTicks,
}

/// Identity of one opened counter within a device's read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotKey {
    pub gt: u16,
    pub class: u16,
    pub instance: u16,
    pub metric: Metric,
}

/// One hardware counter. `idx` is only meaningful while `present` is set.
#[derive(Debug)]
pub struct PmuCounter {
    pub config: u64,
    pub idx: usize,
    pub present: bool,
    pub val: PmuPair,
    fd: i32,
}

impl PmuCounter {
    pub fn new(config: u64) -> Self {
        Self {
            config,
            idx: 0,
            present: false,
            val: PmuPair::default(),
            fd: -1,
        }
    }

    /// Rotates in the freshly read raw value for this counter. `values` is
    /// the counter-word section of a validated group read.
    pub fn update(&mut self, values: &[u64]) {
        if self.present {
            self.val.prev = self.val.cur;
            self.val.cur = values[self.idx];
        }
    }
}

impl Drop for PmuCounter {
    fn drop(&mut self) {
        if self.present && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// The chained counter set of one device. Does not own any fd: the leader fd
/// belongs to the first-opened [`PmuCounter`] and stays valid for as long as
/// the device's engine list is alive.
#[derive(Debug)]
pub struct CounterGroup {
    pmu_type: u32,
    leader: i32,
    slots: Vec<SlotKey>,
}

impl CounterGroup {
    pub fn new(pmu_type: u32) -> Self {
        Self {
            pmu_type,
            leader: -1,
            slots: Vec::new(),
        }
    }

    /// Records `key` as the next read-buffer slot and returns its index.
    pub(crate) fn assign_slot(&mut self, key: SlotKey) -> usize {
        self.slots.push(key);
        self.slots.len() - 1
    }

    /// Opens `counter` chained under this group's leader (or as the leader
    /// when it is the first open). On success the counter's buffer index is
    /// fixed for the lifetime of the group.
    pub fn open(&mut self, key: SlotKey, counter: &mut PmuCounter) -> io::Result<()> {
        let fd = perf::open_group(self.pmu_type, counter.config, self.leader)?;
        if self.leader < 0 {
            self.leader = fd;
        }
        counter.fd = fd;
        counter.present = true;
        counter.idx = self.assign_slot(key);
        Ok(())
    }

    pub fn num_counters(&self) -> usize {
        self.slots.len()
    }

    /// The engine/metric identity behind each read-buffer slot, in buffer
    /// order.
    pub fn slots(&self) -> &[SlotKey] {
        &self.slots
    }

    /// One atomic read of every counter in the group. Returns the counter
    /// words only; the two header words are validated and dropped.
    pub fn read_values(&self) -> Result<Vec<u64>> {
        let expected = 2 + self.slots.len();
        let mut buf = vec![0u64; expected];

        let len = unsafe {
            libc::read(
                self.leader,
                buf.as_mut_ptr() as *mut libc::c_void,
                expected * 8,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error()).context("group leader read failed");
        }

        let words = len as usize / 8;
        let (_timestamp, values) = decode_group_read(&buf[..words], self.slots.len())?;
        Ok(values.to_vec())
    }
}

/// Validates one group read against the fixed counter set: word 0 must
/// report the expected member count and word 1 carries the time-enabled
/// timestamp. Anything shorter is a protocol violation, not a truncation to
/// tolerate.
pub fn decode_group_read(words: &[u64], num_counters: usize) -> Result<(u64, &[u64])> {
    let expected = 2 + num_counters;
    if words.len() < expected {
        bail!(
            "group read returned {} of {} expected values",
            words.len(),
            expected
        );
    }
    if words[0] as usize != num_counters {
        bail!(
            "group read reports {} members, {} counters are open",
            words[0],
            num_counters
        );
    }
    Ok((words[1], &words[2..2 + num_counters]))
}

/// Busy percentage over the last interval. A zero total-ticks delta means
/// the engine clock was gated the whole interval and reads as idle.
pub fn busy_percent(active: &PmuPair, total: &PmuPair) -> f64 {
    let active_delta = active.cur.saturating_sub(active.prev);
    let total_delta = total.cur.saturating_sub(total.prev);
    if total_delta == 0 {
        return 0.0;
    }
    ((active_delta as f64 * 100.0) / total_delta as f64).min(100.0)
}
