// SPDX-License-Identifier: GPL-2.0

use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use gputop::driver::InstanceStore;
use gputop::render::{render_clients, sort_clients, Frame, NO_CLIENTS_MSG};
use gputop_utils::device_scan::{scan_cards, DeviceFilter, DEFAULT_FILTER};
use gputop_utils::drm_clients::ClientScanner;
use gputop_utils::profiling::ProfiledDevices;

const CAP_PERFMON_HELP: &str = "\
When running as a normal user CAP_PERFMON is required to access performance
monitoring. See \"man 7 capabilities\", \"man 8 setcap\", or contact your
distribution vendor for assistance.

More information can be found at 'Perf events and tool security' document:
https://www.kernel.org/doc/html/latest/admin-guide/perf-security.html";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gputop",
    version,
    about = "Live per-engine GPU utilization monitor"
)]
struct Opts {
    /// Number of refresh iterations; -1 runs until interrupted.
    #[clap(short = 'n', long, default_value_t = -1, allow_hyphen_values = true)]
    iterations: i64,

    /// Refresh delay as SEC[.TENTHS].
    #[clap(short = 'd', long, default_value = "2", value_parser = parse_delay)]
    delay: Duration,

    /// Device filter, e.g. device:subsystem=pci,card=all.
    #[clap(short = 'D', long)]
    device: Option<String>,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

/// Parses the delay as whole seconds with an optional tenths part, the value
/// must come out positive.
fn parse_delay(arg: &str) -> Result<Duration, String> {
    let bad = || format!("invalid delay value: {arg}");

    let (secs, tenths) = match arg.split_once('.') {
        Some((secs, tenths)) => (secs, tenths),
        None => (arg, ""),
    };
    let parse = |part: &str| -> Result<u64, String> {
        if part.is_empty() {
            Ok(0)
        } else {
            part.parse().map_err(|_| bad())
        }
    };

    let delay = Duration::from_secs(parse(secs)?) + Duration::from_millis(parse(tenths)? * 100);
    if delay.is_zero() {
        return Err(bad());
    }
    Ok(delay)
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn console_size() -> (usize, usize) {
    match crossterm::terminal::size() {
        Ok((w, h)) if w > 0 && h > 0 => (w as usize, h as usize),
        // Serial console.
        _ => (80, 24),
    }
}

fn permission_denied(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
}

fn run_loop(
    opts: &Opts,
    store: &mut InstanceStore,
    scanner: &mut ClientScanner,
    profiled: &mut Option<ProfiledDevices>,
    stop: &AtomicBool,
) -> Result<()> {
    let mut remaining = opts.iterations;

    while remaining != 0 && !stop.load(Ordering::Relaxed) {
        let mut snapshot = scanner.scan()?;

        for instance in store.instances_mut() {
            instance.sample()?;
        }

        sort_clients(&mut snapshot.clients);

        let (width, height) = console_size();
        let mut frame = Frame::new(width, height);

        for instance in store.instances() {
            instance.render(&mut frame);
        }

        if snapshot.clients.is_empty() {
            frame.push_inverse(NO_CLIENTS_MSG);
        }
        render_clients(&mut frame, &snapshot, opts.delay);

        if !frame.full() {
            frame.push_line("");
        }

        // Home the cursor, wipe, and repaint the whole frame in one write.
        print!("\x1b[H\x1b[J{}", frame.finish());
        io::stdout().flush()?;

        thread::sleep(opts.delay);
        if remaining > 0 {
            remaining -= 1;
        }

        if let Some(profiled) = profiled.as_mut() {
            profiled.reconcile();
        }
    }

    Ok(())
}

fn run(opts: &Opts) -> Result<()> {
    let filter = DeviceFilter::parse(opts.device.as_deref().unwrap_or(DEFAULT_FILTER))?;

    let mut store = InstanceStore::new();
    let count = store.populate(scan_cards()?, &filter);
    if count == 0 {
        println!("No device found.");
        process::exit(1);
    }
    debug!("monitoring {count} device(s)");

    for instance in store.instances_mut() {
        let slot = instance.card().pci_slot.clone();
        instance
            .discover_engines()
            .with_context(|| format!("failed to initialize engines for {slot}"))?;

        if let Err(err) = instance.open_counters() {
            if permission_denied(&err) && unsafe { libc::geteuid() } != 0 {
                eprintln!("{CAP_PERFMON_HELP}");
            }
            return Err(err.context(format!("failed to initialize PMU for {slot}")));
        }
    }

    // Warm-up pass: the first read only seeds the previous-value side of
    // every counter, its deltas are never rendered.
    for instance in store.instances_mut() {
        instance.sample()?;
    }

    let mut scanner = ClientScanner::new();

    let mut profiled = ProfiledDevices::discover();
    match &profiled {
        Some(profiled) => profiled.configure(true),
        None => debug!("no profiling knobs found"),
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("failed to install signal handler")?;
    }

    // Seed the client scanner so the first rendered tick already has deltas.
    scanner.scan()?;

    let result = run_loop(opts, &mut store, &mut scanner, &mut profiled, &stop);

    if let Some(profiled) = &profiled {
        profiled.configure(false);
    }
    info!("shutting down");

    result
}

fn main() {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            // Help and version requests land here too; only real parse
            // errors exit non-zero.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };

    if let Err(err) = init_logging(opts.verbose) {
        eprintln!("gputop: {err:#}");
        process::exit(1);
    }

    if let Err(err) = run(&opts) {
        eprintln!("gputop: {err:#}");
        process::exit(1);
    }
}
