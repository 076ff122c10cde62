use std::time::Duration;

use tracing::info;

/// Width of the control record: two `i32` slots (fwd, bwd) per stage, for up
/// to 50 stages (§4.4, §6 wire format).
pub const CONTROL_RECORD_LEN: usize = 100;

/// Fixed-width per-stage timing telemetry, piggybacked on the control
/// channel and appended to by every stage as it flows forward. A stage
/// writes its forward/backward duration, in microseconds, into the first
/// pair of slots that are still zero; the last stage periodically logs the
/// accumulated per-stage breakdown (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord(pub [i32; CONTROL_RECORD_LEN]);

impl Default for ControlRecord {
    fn default() -> Self {
        Self([0; CONTROL_RECORD_LEN])
    }
}

impl ControlRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_wire(values: [i32; CONTROL_RECORD_LEN]) -> Self {
        Self(values)
    }

    /// Append this stage's forward/backward durations at the first pair of
    /// zero slots, returning the updated record. A genuinely zero-duration
    /// measurement is encoded as `1` microsecond so it is never mistaken for
    /// the unwritten-slot sentinel.
    pub fn append(mut self, forward: Duration, backward: Duration) -> Self {
        let flag = self
            .0
            .iter()
            .position(|&slot| slot == 0)
            .unwrap_or(CONTROL_RECORD_LEN - 2);
        // Guard against running past the fixed-width record if every stage's
        // slot pair is already filled (more stages than the record supports).
        if flag + 1 < CONTROL_RECORD_LEN {
            self.0[flag] = encode_micros(forward);
            self.0[flag + 1] = encode_micros(backward);
        }
        self
    }

    /// Log the per-stage forward/backward breakdown accumulated so far.
    /// Called by the last stage every 128 minibatches (§4.4).
    pub fn log_stats(&self, minibatch: u64) {
        info!(minibatch, "control record stats:");
        let mut i = 0;
        while i + 1 < CONTROL_RECORD_LEN && self.0[i] != 0 {
            let stage = i / 2;
            let fwd_us = self.0[i];
            let bwd_us = self.0[i + 1];
            info!(
                stage,
                fwd_ms = fwd_us as f64 / 1000.0,
                bwd_ms = bwd_us as f64 / 1000.0,
                "stage timing"
            );
            i += 2;
        }
    }

    pub fn as_wire(&self) -> &[i32; CONTROL_RECORD_LEN] {
        &self.0
    }
}

fn encode_micros(d: Duration) -> i32 {
    let micros = d.as_micros().max(1);
    micros.min(i32::MAX as u128) as i32
}

/// Returns `true` if `minibatch` is a control-record logging point (§4.4:
/// "every 128 minibatches").
pub fn is_log_point(minibatch: u64) -> bool {
    minibatch % 128 == 0
}
