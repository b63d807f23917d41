// SPDX-License-Identifier: GPL-2.0

//! Frame composition. A refresh builds one [`Frame`] bounded by the console
//! size and writes it in a single pass; nothing here touches the terminal,
//! so rendering the same snapshot twice yields byte-identical output.

use std::time::Duration;

use gputop_utils::drm_clients::{ClientRecord, ClientSnapshot, EngineUtilization};

pub const ANSI_HEADER: &str = "\x1b[7m";
pub const ANSI_RESET: &str = "\x1b[0m";

/// Sub-character resolution of the bar glyphs (eighth blocks).
const BAR_STEPS: usize = 8;
const BARS: [&str; 9] = [" ", "▏", "▎", "▍", "▌", "▋", "▊", "▉", "█"];

pub const NO_CLIENTS_MSG: &str = " (No GPU clients yet. Start workload to see stats)";

/// One refresh worth of output, capped at `height` lines. Lines pushed past
/// the cap are dropped; there is no truncation marker by design.
#[derive(Debug)]
pub struct Frame {
    out: String,
    width: usize,
    height: usize,
    lines: usize,
}

impl Frame {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            out: String::new(),
            width,
            height,
            lines: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn full(&self) -> bool {
        self.lines >= self.height
    }

    pub fn push_line(&mut self, line: &str) {
        if self.full() {
            return;
        }
        self.out.push_str(line);
        self.out.push('\n');
        self.lines += 1;
    }

    /// Pushes `text` as an inverse-video banner padded to the full width.
    pub fn push_inverse(&mut self, text: &str) {
        let pad = self.width.saturating_sub(text.chars().count());
        let mut line = String::from(ANSI_HEADER);
        line.push_str(text);
        line.push_str(&" ".repeat(pad));
        line.push_str(ANSI_RESET);
        self.push_line(&line);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// `|xx.x% ▊...   |` over `max_len` columns.
pub fn percentage_bar(percent: f64, max_len: usize) -> String {
    let mut out = format!("|{percent:5.1}% ");
    let prefix = out.chars().count();
    let len = max_len.saturating_sub(1).saturating_sub(prefix);

    let mut bar_len = (BAR_STEPS as f64 * percent * len as f64 / 100.0).ceil() as usize;
    bar_len = bar_len.min(BAR_STEPS * len);

    for _ in 0..bar_len / BAR_STEPS {
        out.push_str(BARS[BAR_STEPS]);
    }
    if bar_len % BAR_STEPS > 0 {
        out.push_str(BARS[bar_len % BAR_STEPS]);
    }

    out.push_str(&" ".repeat(len - bar_len.div_ceil(BAR_STEPS)));
    out.push('|');
    out
}

/// Scales a byte count to the first unit it fits under 1024 of, in a fixed
/// 9-column field.
pub fn human_size(mut size: u64) -> String {
    const UNITS: [char; 4] = ['B', 'K', 'M', 'G'];
    let mut unit = 0;
    while unit < UNITS.len() - 1 && size >= 1024 {
        size /= 1024;
        unit += 1;
    }
    format!("{size:7}{} ", UNITS[unit])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UtilizationKind {
    EngineTime,
    TotalCycles,
}

/// Cycle-based utilization has higher fidelity than the wall-clock ratio, so
/// it wins when the driver exposes both.
fn utilization_kind(client: &ClientRecord) -> Option<UtilizationKind> {
    if client.supports_cycles {
        Some(UtilizationKind::TotalCycles)
    } else if client.supports_engine_time {
        Some(UtilizationKind::EngineTime)
    } else {
        None
    }
}

fn is_idle(client: &ClientRecord, kind: UtilizationKind) -> bool {
    match kind {
        UtilizationKind::EngineTime => client.total_engine_time == 0,
        UtilizationKind::TotalCycles => client.total_total_cycles == 0,
    }
}

/// Device buckets first so each device's header prints once, busiest clients
/// on top within a bucket, client id as the tie-breaker.
pub fn sort_clients(clients: &mut [ClientRecord]) {
    clients.sort_by(|a, b| {
        a.device_minor
            .cmp(&b.device_minor)
            .then(b.agg_busy.cmp(&a.agg_busy))
            .then(a.id.cmp(&b.id))
    });
}

/// A header is due when the device changes, or when the engine set differs
/// by value from the previous client's. Drivers that omit unused engines
/// would otherwise mis-size the per-engine columns.
fn needs_header(client: &ClientRecord, prev: Option<&ClientRecord>) -> bool {
    match prev {
        None => true,
        Some(prev) => {
            client.device_minor != prev.device_minor || client.engines != prev.engines
        }
    }
}

fn push_client_header(
    frame: &mut Frame,
    client: &ClientRecord,
    max_pid_len: usize,
    max_name_len: usize,
    engine_w: &mut usize,
) {
    if frame.full() {
        return;
    }
    frame.push_inverse(&format!("DRM minor {}", client.device_minor));
    if frame.full() {
        return;
    }

    let mut line = if client.regions.is_empty() {
        format!("{:>max_pid_len$} ", "PID")
    } else {
        format!("{:>max_pid_len$}      MEM      RSS ", "PID")
    };
    let mut len = line.chars().count();

    let num_engines = client.engines.num_engines();
    if num_engines > 0 {
        *engine_w = frame
            .width()
            .saturating_sub(len + max_name_len + 1)
            / num_engines;

        for name in &client.engines.names {
            let name_len = name.chars().count();
            if name_len > *engine_w {
                continue;
            }
            let pad = (*engine_w - name_len) / 2;
            let spaces = *engine_w - pad - name_len;
            line.push_str(&" ".repeat(pad));
            line.push_str(name);
            line.push_str(&" ".repeat(spaces));
            len += *engine_w;
        }
    }

    let name_w = frame.width().saturating_sub(len + 1);
    line.push(' ');
    line.push_str(&format!("{:<name_w$}", "NAME"));
    frame.push_inverse(&line);
}

fn engine_percent(
    utilization: &EngineUtilization,
    kind: UtilizationKind,
    capacity: u64,
    period: Duration,
) -> f64 {
    let pct = match kind {
        UtilizationKind::EngineTime => {
            let period_ns = period.as_nanos() as f64;
            if period_ns == 0.0 {
                0.0
            } else {
                utilization.delta_engine_time as f64 / period_ns * 100.0 / capacity as f64
            }
        }
        UtilizationKind::TotalCycles => {
            if utilization.delta_total_cycles == 0 {
                0.0
            } else {
                utilization.delta_cycles as f64 / utilization.delta_total_cycles as f64 * 100.0
                    / capacity as f64
            }
        }
    };
    // The scan interval and the kernel's accounting are not phase-locked, so
    // a busy client can land slightly above 100.
    pct.min(100.0)
}

fn push_client_row(
    frame: &mut Frame,
    client: &ClientRecord,
    max_pid_len: usize,
    engine_w: usize,
    kind: UtilizationKind,
    period: Duration,
) {
    if frame.full() {
        return;
    }

    let mut line = format!("{:>max_pid_len$} ", client.pid_str);

    if !client.regions.is_empty() {
        let total = client.regions.iter().map(|r| r.total).sum();
        let resident = client.regions.iter().map(|r| r.resident).sum();
        line.push_str(&human_size(total));
        line.push_str(&human_size(resident));
    }

    for (i, &capacity) in client.engines.capacity.iter().enumerate() {
        if capacity == 0 {
            continue;
        }
        let pct = engine_percent(&client.utilization[i], kind, capacity, period);
        line.push_str(&percentage_bar(pct, engine_w));
    }

    let len = line.chars().count();
    let name_w = frame.width().saturating_sub(len + 1);
    line.push(' ');
    line.push_str(&format!("{:<name_w$}", client.name));
    frame.push_line(&line);
}

/// Renders the sorted client table. Clients with no usable utilization
/// representation, fewer than two samples, or an all-idle interval are
/// filtered out entirely rather than shown at 0%.
pub fn render_clients(frame: &mut Frame, snapshot: &ClientSnapshot, period: Duration) {
    let mut prev: Option<&ClientRecord> = None;
    let mut engine_w = 0;

    for client in &snapshot.clients {
        if frame.full() {
            break;
        }
        let Some(kind) = utilization_kind(client) else {
            continue;
        };
        if client.samples < 2 || is_idle(client, kind) {
            continue;
        }

        if needs_header(client, prev) {
            push_client_header(
                frame,
                client,
                snapshot.max_pid_len,
                snapshot.max_name_len,
                &mut engine_w,
            );
            if frame.full() {
                break;
            }
        }
        prev = Some(client);

        push_client_row(frame, client, snapshot.max_pid_len, engine_w, kind, period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputop_utils::drm_clients::ClientEngines;

    fn client(minor: u32, id: u64, agg_busy: u64) -> ClientRecord {
        ClientRecord {
            device_minor: minor,
            id,
            pid: 1000 + id as u32,
            pid_str: (1000 + id).to_string(),
            name: format!("client-{id}"),
            engines: ClientEngines {
                names: vec!["rcs".to_string()],
                capacity: vec![1],
            },
            utilization: vec![EngineUtilization {
                delta_engine_time: 0,
                delta_cycles: agg_busy,
                delta_total_cycles: 1000,
            }],
            supports_engine_time: false,
            supports_cycles: true,
            regions: Vec::new(),
            samples: 2,
            agg_busy,
            total_engine_time: 0,
            total_cycles: agg_busy,
            total_total_cycles: 1000,
        }
    }

    #[test]
    fn test_bar_extremes() {
        let empty = percentage_bar(0.0, 20);
        let full = percentage_bar(100.0, 20);
        assert_eq!(empty.chars().count(), 20);
        assert_eq!(full.chars().count(), 20);
        assert!(empty.starts_with("|  0.0% "));
        assert!(full.starts_with("|100.0% "));
        assert!(!empty.contains('█'));
        // 19 usable columns minus the 8-char prefix leaves 11 bar cells.
        assert_eq!(full.matches('█').count(), 11);
    }

    #[test]
    fn test_bar_partial_cells() {
        // 50% of 8 cells is 4 full blocks, no partial glyph.
        let half = percentage_bar(50.0, 17);
        assert_eq!(half.matches('█').count(), 4);
        // Fractional fills round up into an eighth-block glyph.
        let sliver = percentage_bar(1.0, 17);
        assert!(sliver.contains('▏'));
    }

    #[test]
    fn test_bar_when_too_narrow_for_cells() {
        // No room after the numeric prefix; bar degrades to prefix + pipe.
        let bar = percentage_bar(75.0, 9);
        assert_eq!(bar, "| 75.0% |");
    }

    #[test]
    fn test_human_size_units() {
        assert_eq!(human_size(0), "      0B ");
        assert_eq!(human_size(1023), "   1023B ");
        assert_eq!(human_size(1024), "      1K ");
        assert_eq!(human_size(4 * 1024 * 1024), "      4M ");
        assert_eq!(human_size(8 * 1024 * 1024 * 1024), "      8G ");
        // Stops at the largest unit.
        assert_eq!(human_size(5000 * 1024 * 1024 * 1024), "   5000G ");
    }

    #[test]
    fn test_sort_buckets_by_device_then_busy() {
        let mut clients = vec![client(1, 1, 500), client(0, 2, 100), client(0, 3, 900)];
        sort_clients(&mut clients);
        let order: Vec<_> = clients.iter().map(|c| (c.device_minor, c.id)).collect();
        assert_eq!(order, vec![(0, 3), (0, 2), (1, 1)]);
    }

    #[test]
    fn test_sort_ties_break_on_client_id() {
        // Equal busy time must order by id ascending no matter the input
        // permutation.
        let ids = [5u64, 1, 4, 2, 3];
        let permutations: [&[u64]; 4] = [
            &[5, 1, 4, 2, 3],
            &[3, 2, 4, 1, 5],
            &[1, 2, 3, 4, 5],
            &[5, 4, 3, 2, 1],
        ];
        for perm in permutations {
            let mut clients: Vec<_> = perm.iter().map(|&id| client(0, id, 700)).collect();
            sort_clients(&mut clients);
            let mut sorted = ids.to_vec();
            sorted.sort();
            let order: Vec<_> = clients.iter().map(|c| c.id).collect();
            assert_eq!(order, sorted);
        }
    }

    #[test]
    fn test_cycles_preferred_over_engine_time() {
        let mut c = client(0, 1, 100);
        c.supports_engine_time = true;
        assert_eq!(utilization_kind(&c), Some(UtilizationKind::TotalCycles));

        c.supports_cycles = false;
        assert_eq!(utilization_kind(&c), Some(UtilizationKind::EngineTime));

        c.supports_engine_time = false;
        assert_eq!(utilization_kind(&c), None);
    }

    #[test]
    fn test_engine_percent_clamped_and_guarded() {
        let skewed = EngineUtilization {
            delta_engine_time: 3_000_000_000,
            delta_cycles: 1100,
            delta_total_cycles: 1000,
        };
        let period = Duration::from_secs(2);
        assert_eq!(
            engine_percent(&skewed, UtilizationKind::TotalCycles, 1, period),
            100.0
        );
        assert_eq!(
            engine_percent(&skewed, UtilizationKind::EngineTime, 1, period),
            100.0
        );

        let gated = EngineUtilization::default();
        assert_eq!(
            engine_percent(&gated, UtilizationKind::TotalCycles, 1, period),
            0.0
        );
    }

    #[test]
    fn test_engine_percent_capacity_scaling() {
        let u = EngineUtilization {
            delta_engine_time: 0,
            delta_cycles: 500,
            delta_total_cycles: 1000,
        };
        let period = Duration::from_secs(2);
        assert_eq!(engine_percent(&u, UtilizationKind::TotalCycles, 2, period), 25.0);
    }

    #[test]
    fn test_frame_height_budget() {
        let mut frame = Frame::new(40, 3);
        for i in 0..10 {
            frame.push_line(&format!("line {i}"));
        }
        let out = frame.finish();
        assert_eq!(out.lines().count(), 3);
        assert!(out.ends_with("line 2\n"));
    }

    #[test]
    fn test_inverse_banner_padding() {
        let mut frame = Frame::new(20, 5);
        frame.push_inverse("HDR");
        let out = frame.finish();
        assert!(out.starts_with(ANSI_HEADER));
        assert!(out.contains("HDR                 "));
        assert!(out.trim_end_matches('\n').ends_with(ANSI_RESET));
    }
}
