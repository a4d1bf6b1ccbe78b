//! Human-readable and JSON rendering for the `attach`, `dump`, and `replay`
//! subcommands.
//!
//! Grounded on `examples/benfred-py-spy/src/dump.rs::print_traces`: the same
//! colorized `console::style` layout (pid/version header, one block per
//! thread, indented frames), the same JSON-vs-pretty branch on a config
//! flag, and the same "a `-`-rule separates recursed subprocess output"
//! convention for `--subprocesses`.

use anyhow::Result;
use console::{style, Term};
use serde_json;

use crate::codec::{Reader, ReplayedSample};
use crate::collector::Attached;
use crate::config::Config;
use crate::types::{FrameInfo, FrameKind, InterpreterInfo, Pid, TaskInfo};

/// Attaches to `pid` once, prints its current stack traces, and (with
/// `--subprocesses`) recurses into its children, matching
/// `print_traces`'s own recursion.
pub fn print_live_traces(pid: Pid, target_exe: &str, config: &Config, parent: Option<Pid>) -> Result<()> {
    let mut attached = Attached::new(pid, target_exe, config.mode)?;
    let interpreters = attached.sample()?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&interpreters)?);
    } else {
        print_interpreters_pretty(pid, parent, &interpreters);

        if config.asyncio {
            let tasks = attached.sample_asyncio_tasks()?;
            for task in &tasks {
                print_task_tree(task, 0);
            }
        }
    }

    if config.subprocesses {
        for child in crate::collector::discover_subprocess_pids(pid, config.recursive_subprocesses) {
            let term = Term::stdout();
            let (_, width) = term.size();
            println!("\n{}", style("-".repeat(width as usize)).dim());
            print_live_traces(child, target_exe, config, Some(pid))?;
        }
    }

    Ok(())
}

fn print_interpreters_pretty(pid: Pid, parent: Option<Pid>, interpreters: &[InterpreterInfo]) {
    println!("Process {}", style(pid).bold().yellow());
    if let Some(parent_pid) = parent {
        println!("Parent Process {}", style(parent_pid).bold().yellow());
    }
    println!();

    for interp in interpreters {
        for thread in &interp.threads {
            println!(
                "Thread {} ({:?})",
                style(thread.thread_id).bold().yellow(),
                thread.status_flags
            );
            for frame in &thread.frames {
                print_frame(frame);
            }
        }
    }
}

fn print_frame(frame: &FrameInfo) {
    match &frame.kind {
        FrameKind::Python { file, qualname, location, .. } => {
            match location {
                Some(loc) => println!("    {} ({}:{})", style(qualname).green(), style(file).cyan(), style(loc.line).dim()),
                None => println!("    {} ({})", style(qualname).green(), style(file).cyan()),
            }
        }
        FrameKind::Gc => println!("    {}", style("<GC>").dim()),
        FrameKind::Native => println!("    {}", style("<native>").dim()),
    }
}

fn print_task_tree(task: &TaskInfo, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}Task {} \"{}\"", indent, style(task.task_id).bold().yellow(), task.task_name);
    for frame in &task.coroutine_stack {
        print!("{}", indent);
        print_frame(frame);
    }
    for waiter in &task.awaited_by {
        print_task_tree(waiter, depth + 1);
    }
}

/// Prints a short summary of a recorded sample log, matching `dump`'s
/// purpose of letting a user sanity-check a file before replaying it.
pub fn print_file_summary(path: &str, json: bool) -> Result<()> {
    let reader = Reader::open(path)?;
    let info = reader.info();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "start_time_us": info.start_time_us,
                "sample_interval_us": info.sample_interval_us,
                "sample_count": info.sample_count,
                "thread_count": info.thread_count,
                "compression_type": info.compression_type,
            })
        );
        return Ok(());
    }

    println!("Sample log {}", style(path).bold());
    println!("  start time (us):     {}", info.start_time_us);
    println!("  sample interval (us): {}", info.sample_interval_us);
    println!("  samples:             {}", info.sample_count);
    println!("  threads seen:        {}", info.thread_count);
    Ok(())
}

/// Replays every sample in a recorded log to stdout, in the same
/// JSON-or-pretty style as `print_live_traces`.
pub fn replay_file(path: &str, json: bool) -> Result<()> {
    let reader = Reader::open(path)?;
    let (samples, _stats) = reader.replay()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&samples)?);
        return Ok(());
    }

    for sample in &samples {
        print_replayed_sample(sample);
    }
    Ok(())
}

fn print_replayed_sample(sample: &ReplayedSample) {
    println!(
        "t={}us thread={} interp={}",
        sample.timestamp_us,
        style(sample.thread_id).bold().yellow(),
        sample.interpreter_id
    );
    for (filename, funcname, lineno) in &sample.stack {
        if *lineno != 0 {
            println!("    {} ({}:{})", style(funcname).green(), style(filename).cyan(), style(lineno).dim());
        } else {
            println!("    {} ({})", style(funcname).green(), style(filename).cyan());
        }
    }
}
