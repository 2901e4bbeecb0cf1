//! `Request`: one in-flight file operation, plus the fan-out/fan-in
//! bookkeeping a parent layer uses to guarantee its callback fires exactly
//! once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// The ~20 op kinds the translator stack understands. Not every adapter
/// implements every kind; unimplemented ops fall back to `ENOSYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Open,
    Creat,
    Close,
    Pread,
    Pwrite,
    Fstat,
    Stat,
    Ftruncate,
    Truncate,
    Lseek,
    FSetXattr,
    SetXattr,
    FGetXattr,
    GetXattr,
    FRemoveXattr,
    RemoveXattr,
    GetUuid,
    Resolve,
    GetHosts,
    Scan,
    Mkdir,
}

/// Per-request fan-out accounting, keyed by layer name: four concurrent maps
/// for return-code, child-count, response-count, and correlation-id.
///
/// A parent's callback may fire only once `response_count == child_count`
/// for its own layer name: `child_count` **must** be recorded
/// before any child callback can run, which is why `begin_fan_out` takes the
/// count up front rather than incrementing per-dispatch.
#[derive(Default)]
pub struct FanIn {
    return_codes: Mutex<HashMap<&'static str, i32>>,
    child_counts: Mutex<HashMap<&'static str, usize>>,
    response_counts: Mutex<HashMap<&'static str, AtomicU64>>,
    correlation_ids: Mutex<HashMap<&'static str, u64>>,
}

impl FanIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `count` children for `layer` before any child is dispatched.
    pub fn begin_fan_out(&self, layer: &'static str, count: usize) {
        self.child_counts.lock().insert(layer, count);
        self.response_counts.lock().insert(layer, AtomicU64::new(0));
    }

    /// Records one child ack; returns true exactly once, on the ack that
    /// brings `response_count` up to `child_count` (i.e. "fire the parent
    /// callback now").
    pub fn ack(&self, layer: &'static str) -> bool {
        let child_count = *self.child_counts.lock().get(layer).unwrap_or(&0) as u64;
        let responses = self.response_counts.lock();
        let counter = responses.get(layer).expect("begin_fan_out not called before ack");
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        now == child_count
    }

    pub fn set_return_code(&self, layer: &'static str, code: i32) {
        self.return_codes.lock().insert(layer, code);
    }

    pub fn return_code(&self, layer: &'static str) -> Option<i32> {
        self.return_codes.lock().get(layer).copied()
    }

    pub fn set_correlation_id(&self, layer: &'static str, id: u64) {
        self.correlation_ids.lock().insert(layer, id);
    }

    pub fn correlation_id(&self, layer: &'static str) -> Option<u64> {
        self.correlation_ids.lock().get(layer).copied()
    }
}

/// Monotonic request-id generator used for perf correlation and
/// backup-service restore sequence numbers.
#[derive(Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_in_fires_exactly_once_at_full_response_count() {
        let fan_in = FanIn::new();
        fan_in.begin_fan_out("perf", 3);
        assert!(!fan_in.ack("perf"));
        assert!(!fan_in.ack("perf"));
        assert!(fan_in.ack("perf"));
    }

    #[test]
    fn sequence_counter_is_monotonic_and_unique() {
        let seq = SequenceCounter::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}
