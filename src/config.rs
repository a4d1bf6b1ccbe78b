//! CLI configuration (ambient stack; spec §1 scopes the public CLI surface
//! itself out, but argument parsing ergonomics still follow the teacher).
//!
//! Grounded on `examples/benfred-py-spy/src/config.rs::Config::from_args`:
//! same `clap` builder style (no derive), same pattern of a flat `Config`
//! struct filled in from whichever subcommand matched, same
//! `Config::from_commandline` top-level entry point.

use clap::{crate_description, crate_name, crate_version, Arg, Command};
use log::info;

use crate::types::{Mode, Pid};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub command: Subcommand,
    pub pid: Option<Pid>,
    pub sampling_rate: u64,
    pub duration: RecordDuration,
    pub subprocesses: bool,
    pub recursive_subprocesses: bool,
    /// Profiling mode for C7's thread enumerator (spec §4.6's Mode table),
    /// derived from `--idle`/`--gil`: `--gil` selects `Mode::Gil`; otherwise
    /// `--idle` selects `Mode::All`; otherwise `Mode::Cpu` (the default —
    /// idle threads are hidden unless asked for).
    pub mode: Mode,
    pub output: Option<String>,
    pub input: Option<String>,
    pub json: bool,
    pub asyncio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Attach,
    Record,
    Dump,
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDuration {
    Unlimited,
    Seconds(u64),
}

impl Default for Config {
    fn default() -> Config {
        Config {
            command: Subcommand::Attach,
            pid: None,
            sampling_rate: 100,
            duration: RecordDuration::Unlimited,
            subprocesses: false,
            recursive_subprocesses: false,
            mode: Mode::Wall,
            output: None,
            input: None,
            json: false,
            asyncio: false,
        }
    }
}

impl Config {
    pub fn from_commandline() -> Config {
        let args: Vec<String> = std::env::args().collect();
        Config::from_args(&args).unwrap_or_else(|e| e.exit())
    }

    pub fn from_args(args: &[String]) -> clap::Result<Config> {
        let pid = Arg::new("pid")
            .short('p')
            .long("pid")
            .value_name("pid")
            .help("PID of a running process to attach to")
            .takes_value(true)
            .required(true);

        let rate = Arg::new("rate")
            .short('r')
            .long("rate")
            .value_name("rate")
            .help("The number of samples to collect per second")
            .default_value("100")
            .takes_value(true);

        let subprocesses = Arg::new("subprocesses")
            .short('s')
            .long("subprocesses")
            .help("Also sample immediate subprocesses of the target");

        let recursive = Arg::new("recursive")
            .long("recursive")
            .help("With --subprocesses, sample the whole process tree instead of only immediate children");

        let idle = Arg::new("idle")
            .short('i')
            .long("idle")
            .help("Include threads that are idle (not currently scheduled on a CPU)");

        let gil = Arg::new("gil")
            .short('g')
            .long("gil")
            .help("Only include threads currently holding the GIL");

        let asyncio = Arg::new("asyncio")
            .short('a')
            .long("asyncio")
            .help("Additionally walk and print the asyncio task graph");

        let json = Arg::new("json")
            .short('j')
            .long("json")
            .help("Format output as JSON");

        let attach = Command::new("attach")
            .about("Attaches to a running process and prints its current stack traces once")
            .arg(pid.clone())
            .arg(idle.clone())
            .arg(gil.clone())
            .arg(asyncio.clone())
            .arg(json.clone())
            .arg(subprocesses.clone())
            .arg(recursive.clone());

        let record = Command::new("record")
            .about("Samples a running process and writes a binary sample log")
            .arg(pid.clone())
            .arg(rate.clone())
            .arg(
                Arg::new("duration")
                    .short('d')
                    .long("duration")
                    .value_name("seconds")
                    .help("The number of seconds to sample for")
                    .default_value("unlimited")
                    .takes_value(true),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("filename")
                    .help("Output filename")
                    .takes_value(true)
                    .required(true),
            )
            .arg(idle.clone())
            .arg(gil.clone())
            .arg(subprocesses.clone())
            .arg(recursive.clone());

        let dump = Command::new("dump")
            .about("Prints a summary of a recorded sample log")
            .arg(
                Arg::new("input")
                    .value_name("filename")
                    .help("Binary sample log to read")
                    .takes_value(true)
                    .required(true),
            )
            .arg(json.clone());

        let replay = Command::new("replay")
            .about("Replays every sample in a recorded sample log to stdout")
            .arg(
                Arg::new("input")
                    .value_name("filename")
                    .help("Binary sample log to read")
                    .takes_value(true)
                    .required(true),
            )
            .arg(json.clone());

        let matches = Command::new(crate_name!())
            .version(crate_version!())
            .about(crate_description!())
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(attach)
            .subcommand(record)
            .subcommand(dump)
            .subcommand(replay)
            .try_get_matches_from(args)?;

        info!("Command line args: {:?}", matches);

        let mut config = Config::default();
        let (subcommand, matches) = matches.subcommand().unwrap();

        match subcommand {
            "attach" => {
                config.command = Subcommand::Attach;
                config.pid = Some(matches.value_of_t("pid")?);
                config.mode = mode_from_flags(matches);
                config.asyncio = matches.occurrences_of("asyncio") > 0;
                config.json = matches.occurrences_of("json") > 0;
            }
            "record" => {
                config.command = Subcommand::Record;
                config.pid = Some(matches.value_of_t("pid")?);
                config.sampling_rate = matches.value_of_t("rate")?;
                config.output = matches.value_of("output").map(str::to_owned);
                config.mode = mode_from_flags(matches);
                config.duration = match matches.value_of("duration") {
                    Some("unlimited") | None => RecordDuration::Unlimited,
                    Some(seconds) => RecordDuration::Seconds(
                        seconds.parse().map_err(|_| {
                            clap::Error::raw(clap::ErrorKind::InvalidValue, "invalid duration")
                        })?,
                    ),
                };
            }
            "dump" => {
                config.command = Subcommand::Dump;
                config.input = matches.value_of("input").map(str::to_owned);
                config.json = matches.occurrences_of("json") > 0;
            }
            "replay" => {
                config.command = Subcommand::Replay;
                config.input = matches.value_of("input").map(str::to_owned);
                config.json = matches.occurrences_of("json") > 0;
            }
            _ => {}
        }

        config.subprocesses = matches.occurrences_of("subprocesses") > 0;
        config.recursive_subprocesses = matches.occurrences_of("recursive") > 0;

        Ok(config)
    }
}

/// Maps `--idle`/`--gil` onto a Mode per spec §4.6's table: `--gil` takes
/// precedence (there's exactly one GIL holder to report, idle or not);
/// otherwise `--idle` asks for every thread regardless of activity;
/// otherwise the default hides idle threads.
fn mode_from_flags(matches: &clap::ArgMatches) -> Mode {
    if matches.occurrences_of("gil") > 0 {
        Mode::Gil
    } else if matches.occurrences_of("idle") > 0 {
        Mode::All
    } else {
        Mode::Cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_config(cmd: &str) -> clap::Result<Config> {
        let args: Vec<String> = cmd.split_whitespace().map(str::to_owned).collect();
        Config::from_args(&args)
    }

    #[test]
    fn attach_requires_pid() {
        assert!(get_config("tachyon attach").is_err());
        let config = get_config("tachyon attach --pid 1234").unwrap();
        assert_eq!(config.pid, Some(1234));
        assert_eq!(config.command, Subcommand::Attach);
    }

    #[test]
    fn record_requires_output() {
        assert!(get_config("tachyon record --pid 1234").is_err());
        let config = get_config("tachyon record --pid 1234 --output out.tach --rate 50").unwrap();
        assert_eq!(config.sampling_rate, 50);
        assert_eq!(config.output, Some("out.tach".to_owned()));
    }

    #[test]
    fn dump_and_replay_take_a_filename() {
        let config = get_config("tachyon dump out.tach --json").unwrap();
        assert_eq!(config.command, Subcommand::Dump);
        assert_eq!(config.input, Some("out.tach".to_owned()));
        assert!(config.json);

        let config = get_config("tachyon replay out.tach").unwrap();
        assert_eq!(config.command, Subcommand::Replay);
    }

    #[test]
    fn subprocesses_flag_is_shared_across_subcommands() {
        let config = get_config("tachyon attach --pid 1 --subprocesses --recursive").unwrap();
        assert!(config.subprocesses);
        assert!(config.recursive_subprocesses);
    }

    #[test]
    fn idle_and_gil_flags_map_to_the_right_mode() {
        assert_eq!(get_config("tachyon attach --pid 1").unwrap().mode, Mode::Cpu);
        assert_eq!(get_config("tachyon attach --pid 1 --idle").unwrap().mode, Mode::All);
        assert_eq!(get_config("tachyon attach --pid 1 --gil").unwrap().mode, Mode::Gil);
        // --gil takes precedence when both are given.
        assert_eq!(get_config("tachyon attach --pid 1 --idle --gil").unwrap().mode, Mode::Gil);
    }
}
