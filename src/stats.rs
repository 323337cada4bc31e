use std::time::{Duration, Instant};

/// Point-in-time copy of the engine's observable state, appended to a
/// time-ordered history. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Time since the recorder was created.
    pub elapsed: Duration,
    pub window_size: u32,
    pub unique_count: u64,
    pub missing_count: u64,
    pub goodput: f64,
}

/// Immutable end-of-session summary.
///
/// The snapshot history is carried along so an external reporter can graph
/// goodput / window size over time - the engine itself performs no I/O.
#[derive(Debug, Clone)]
pub struct FinalReport {
    /// Total wire transmission attempts, retransmissions included.
    pub total_sent: u64,
    pub unique_delivered: u64,
    pub missing_remaining: u64,
    pub goodput: f64,
    /// Bucket `n` counts packets whose terminal retransmit count was `n`
    /// (`max_retries` being the abandonment bucket).
    pub retransmit_histogram: Vec<u64>,
    pub wrap_count: u64,
    pub snapshots: Vec<StatsSnapshot>,
}

/// Passively accumulates snapshots and the retransmission histogram.
///
/// Side-effect-free aside from internal accumulation; never mutates the
/// sender/receiver state it observes.
pub struct StatsRecorder {
    started: Instant,
    histogram: Vec<u64>,
    snapshots: Vec<StatsSnapshot>,
}

impl StatsRecorder {
    pub fn new(max_retries: u32) -> StatsRecorder {
        StatsRecorder {
            started: Instant::now(),
            histogram: vec![0; max_retries as usize + 1],
            snapshots: Vec::new(),
        }
    }

    pub fn record_snapshot(
        &mut self,
        window_size: u32,
        unique_count: u64,
        missing_count: u64,
        goodput: f64,
    ) {
        self.snapshots.push(StatsSnapshot {
            elapsed: self.started.elapsed(),
            window_size,
            unique_count,
            missing_count,
            goodput,
        });
    }

    /// Records a packet reaching its terminal state after `n` retransmissions.
    /// Counts above `max_retries` land in the abandonment bucket.
    pub fn record_retransmission(&mut self, n: u32) {
        let bucket = (n as usize).min(self.histogram.len() - 1);
        self.histogram[bucket] += 1;
    }

    pub fn final_report(
        &self,
        total_sent: u64,
        unique_delivered: u64,
        missing_remaining: u64,
        goodput: f64,
        wrap_count: u64,
    ) -> FinalReport {
        FinalReport {
            total_sent,
            unique_delivered,
            missing_remaining,
            goodput,
            retransmit_histogram: self.histogram.clone(),
            wrap_count,
            snapshots: self.snapshots.clone(),
        }
    }
}
