//! Subprocess discovery (spec §4.7): finds a target's child processes so
//! the collector can attach to a whole process tree.
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/subprocess.c`
//! (`find_children_bfs`: breadth-first walk of a pid->ppid mapping,
//! recursive or immediate-children-only) for the traversal algorithm, and
//! on `examples/benfred-py-spy/remoteprocess/src/linux/mod.rs`
//! (`get_process_tree`/`get_ppid_status`) for how to build that mapping on
//! Linux by scanning `/proc` and parsing each process's `stat` file.

use crate::types::Pid;

/// Returns every pid whose ppid chain leads back to `target_pid`, found by
/// scanning `/proc` once to build a full pid->ppid table and then doing a
/// breadth-first walk from `target_pid`, matching `find_children_bfs`.
/// `recursive = false` returns only immediate children.
pub fn find_children(target_pid: Pid, recursive: bool) -> Vec<Pid> {
    let table = scan_pid_table();
    let mut result = Vec::new();
    let mut to_process = vec![target_pid];
    let mut idx = 0;

    while idx < to_process.len() {
        let current = to_process[idx];
        idx += 1;

        for &(pid, ppid) in &table {
            if ppid == current && !result.contains(&pid) {
                result.push(pid);
                if recursive {
                    to_process.push(pid);
                }
            }
        }

        if !recursive {
            break;
        }
    }

    result
}

#[cfg(target_os = "linux")]
fn scan_pid_table() -> Vec<(Pid, Pid)> {
    let mut table = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else { return table };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<Pid>().ok()) else {
            continue;
        };
        if let Some(ppid) = read_ppid(pid) {
            table.push((pid, ppid));
        }
    }
    table
}

#[cfg(target_os = "linux")]
fn read_ppid(pid: Pid) -> Option<Pid> {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = contents.rfind(')').map(|idx| &contents[idx + 1..])?;
    // Fields after "comm)" are: state ppid pgrp ... — ppid is the second.
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn scan_pid_table() -> Vec<(Pid, Pid)> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bfs_finds_only_immediate_children_when_not_recursive() {
        let table = vec![(2, 1), (3, 2), (4, 1)];
        let result = bfs_over(&table, 1, false);
        assert_eq!(result, vec![2, 4]);
    }

    #[test]
    fn bfs_finds_all_descendants_when_recursive() {
        let table = vec![(2, 1), (3, 2), (4, 1)];
        let mut result = bfs_over(&table, 1, true);
        result.sort();
        assert_eq!(result, vec![2, 3, 4]);
    }

    fn bfs_over(table: &[(Pid, Pid)], target_pid: Pid, recursive: bool) -> Vec<Pid> {
        let mut result = Vec::new();
        let mut to_process = vec![target_pid];
        let mut idx = 0;
        while idx < to_process.len() {
            let current = to_process[idx];
            idx += 1;
            for &(pid, ppid) in table {
                if ppid == current && !result.contains(&pid) {
                    result.push(pid);
                    if recursive {
                        to_process.push(pid);
                    }
                }
            }
            if !recursive {
                break;
            }
        }
        result
    }
}
