#![no_main]

use libfuzzer_sys::fuzz_target;
use lifetrace::config::{ConsistencyMode, TrackerConfig, VforkMode};
use lifetrace::replay::{Replayer, TraceRecord};
use lifetrace::tracker::ProcessTracker;

fuzz_target!(|input: (bool, Vec<TraceRecord>)| {
    let (transient, records) = input;
    let config = TrackerConfig {
        vfork_mode: if transient {
            VforkMode::Transient
        } else {
            VforkMode::Collapsed
        },
        consistency: ConsistencyMode::Strict,
        ..TrackerConfig::default()
    };
    let mut replayer = Replayer::new(ProcessTracker::new(config));
    for (line, record) in records.iter().enumerate() {
        if replayer.apply(line + 1, record).is_err() {
            break;
        }
    }
    let summary = replayer.tracker_mut().teardown();
    assert!(summary.stats.ends <= summary.stats.starts);
});
