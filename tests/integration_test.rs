use tachyon::codec::{Reader, Writer, COMPRESSION_NONE};
use tachyon::config::{Config, RecordDuration, Subcommand};
use tachyon::types::{FrameInfo, InterpreterInfo, StatusFlags, ThreadInfo};

fn sample(thread_id: u64, frames: Vec<FrameInfo>) -> Vec<InterpreterInfo> {
    vec![InterpreterInfo {
        interpreter_id: 0,
        threads: vec![ThreadInfo {
            thread_id,
            status_flags: StatusFlags::HAS_GIL,
            frames,
        }],
    }]
}

/// End-to-end record/replay round trip: write a short session through the
/// public `Writer`, then read it back through the public `Reader`, matching
/// what `record` followed by `replay` does on the command line.
#[test]
fn record_then_replay_round_trips_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.tach");

    let mut writer = Writer::new(&path, 10_000, COMPRESSION_NONE, 0).unwrap();
    writer
        .write_sample(&sample(1, vec![FrameInfo::python("app.py".into(), "main".into(), None, None)]), 0)
        .unwrap();
    writer
        .write_sample(
            &sample(1, vec![
                FrameInfo::python("app.py".into(), "main".into(), None, None),
                FrameInfo::python("app.py".into(), "helper".into(), None, None),
            ]),
            10_000,
        )
        .unwrap();
    let stats = writer.finalize().unwrap();
    assert_eq!(stats.total_samples, 2);

    let reader = Reader::open(&path).unwrap();
    let info = reader.info();
    assert_eq!(info.sample_count, 2);

    let (samples, _) = reader.replay().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].stack.len(), 1);
    assert_eq!(samples[1].stack.len(), 2);
    assert_eq!(samples[1].stack[1].1, "helper");
}

#[test]
fn config_parses_every_subcommand() {
    let attach = Config::from_args(&arg_vec("tachyon attach --pid 42 --json")).unwrap();
    assert_eq!(attach.command, Subcommand::Attach);
    assert_eq!(attach.pid, Some(42));
    assert!(attach.json);

    let record = Config::from_args(&arg_vec("tachyon record --pid 42 --output out.tach --duration 30")).unwrap();
    assert_eq!(record.command, Subcommand::Record);
    assert_eq!(record.duration, RecordDuration::Seconds(30));

    let dump = Config::from_args(&arg_vec("tachyon dump out.tach")).unwrap();
    assert_eq!(dump.command, Subcommand::Dump);
    assert_eq!(dump.input, Some("out.tach".to_owned()));

    let replay = Config::from_args(&arg_vec("tachyon replay out.tach --json")).unwrap();
    assert_eq!(replay.command, Subcommand::Replay);
    assert!(replay.json);
}

fn arg_vec(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_owned).collect()
}
