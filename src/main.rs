#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use indicatif::ProgressBar;

use tachyon::config::{Config, RecordDuration, Subcommand};
use tachyon::{dump, Collector};

/// Resolves the path to the executable backing `pid`, used as the hint
/// `find_section` searches for `PyRuntime`/`AsyncioDebug`. Grounded on
/// `examples/benfred-py-spy/remoteprocess/src/linux/mod.rs::Process::exe`,
/// which reads the same `/proc/<pid>/exe` symlink.
fn target_exe(pid: i32) -> Result<String> {
    target_exe_impl(pid)
}

#[cfg(target_os = "linux")]
fn target_exe_impl(pid: i32) -> Result<String> {
    let path = std::fs::read_link(format!("/proc/{}/exe", pid))?;
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn target_exe_impl(_pid: i32) -> Result<String> {
    Err(format_err!("resolving a target's executable path is only implemented for linux in this crate"))
}

#[cfg(unix)]
fn permission_denied(err: &Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|e| e.kind() == std::io::ErrorKind::PermissionDenied)
            .unwrap_or(false)
    })
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn run_attach(config: &Config) -> Result<()> {
    let pid = config.pid.ok_or_else(|| format_err!("--pid is required"))?;
    let exe = target_exe(pid)?;
    dump::print_live_traces(pid, &exe, config, None)
}

fn run_record(config: &Config) -> Result<()> {
    let pid = config.pid.ok_or_else(|| format_err!("--pid is required"))?;
    let exe = target_exe(pid)?;
    let output = config.output.as_ref().ok_or_else(|| format_err!("--output is required"))?;

    let start_time_us = now_micros();
    let interval_us = 1_000_000 / config.sampling_rate.max(1);
    let mut writer = tachyon::codec::Writer::new(output, interval_us, tachyon::codec::COMPRESSION_NONE, start_time_us)?;
    let collector = Collector::spawn(pid, exe, config.sampling_rate, start_time_us, config.mode)?;

    println!("Sampling process {} times a second. Press Control-C to exit.", config.sampling_rate);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let max_samples = match config.duration {
        RecordDuration::Unlimited => None,
        RecordDuration::Seconds(secs) => Some(secs * config.sampling_rate),
    };

    let progress = match max_samples {
        Some(n) => ProgressBar::new(n),
        None => ProgressBar::new_spinner(),
    };

    let mut collected = 0u64;
    let mut errors = 0u64;

    for sample in collector {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(delay) = sample.late {
            if delay > Duration::from_secs(1) {
                warn!("{:.2?} behind in sampling, results may be inaccurate", delay);
            }
        }

        match sample.error {
            Some(e) => {
                errors += 1;
                warn!("Failed to sample process {}: {}", pid, e);
            }
            None => {
                writer.write_sample(&sample.interpreters, sample.timestamp_us)?;
                collected += 1;
            }
        }

        progress.set_message(format!("Collected {} samples ({} errors)", collected, errors));
        progress.inc(1);

        if let Some(max) = max_samples {
            if collected + errors >= max {
                break;
            }
        }
    }

    progress.finish();
    let stats = writer.finalize()?;
    println!(
        "Wrote {} ({} samples, {} errors)",
        output, stats.total_samples, errors
    );
    Ok(())
}

fn run_dump(config: &Config) -> Result<()> {
    let input = config.input.as_ref().ok_or_else(|| format_err!("input filename is required"))?;
    dump::print_file_summary(input, config.json)
}

fn run_replay(config: &Config) -> Result<()> {
    let input = config.input.as_ref().ok_or_else(|| format_err!("input filename is required"))?;
    dump::replay_file(input, config.json)
}

fn run_tachyon() -> Result<()> {
    let config = Config::from_commandline();
    match config.command {
        Subcommand::Attach => run_attach(&config),
        Subcommand::Record => run_record(&config),
        Subcommand::Dump => run_dump(&config),
        Subcommand::Replay => run_replay(&config),
    }
}

fn main() {
    env_logger::builder().format_timestamp_nanos().try_init().ok();

    if let Err(err) = run_tachyon() {
        #[cfg(unix)]
        {
            if permission_denied(&err) && unsafe { libc::geteuid() } != 0 {
                eprintln!("Permission denied: try running again with elevated permissions (sudo)");
                std::process::exit(1);
            }
        }

        eprintln!("Error: {}", err);
        for (i, suberror) in err.chain().enumerate() {
            if i > 0 {
                eprintln!("Reason: {}", suberror);
            }
        }
        std::process::exit(1);
    }
}
