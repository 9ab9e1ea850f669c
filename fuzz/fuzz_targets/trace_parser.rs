#![no_main]

use libfuzzer_sys::fuzz_target;
use lifetrace::config::TrackerConfig;
use lifetrace::replay::Replayer;
use lifetrace::tracker::ProcessTracker;

fuzz_target!(|data: &[u8]| {
    // Arbitrary text must be rejected through errors, never panics
    if let Ok(input) = std::str::from_utf8(data) {
        let replayer = Replayer::new(ProcessTracker::new(TrackerConfig::default()));
        let _ = replayer.run(input.as_bytes(), |_| {});
    }
});
