use super::TestPhase;
use crate::app::TestUpdate;
use crate::error::{Result, SpeedTestError};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Relative expected duration of each phase.
const PING_WEIGHT: f64 = 2.0;
const DOWNLOAD_WEIGHT: f64 = 15.0;
const UPLOAD_WEIGHT: f64 = 6.0;
const TOTAL_WEIGHT: f64 = PING_WEIGHT + DOWNLOAD_WEIGHT + UPLOAD_WEIGHT;

pub fn phase_weight(phase: TestPhase) -> f64 {
    match phase {
        TestPhase::Ping => PING_WEIGHT / TOTAL_WEIGHT,
        TestPhase::Download => DOWNLOAD_WEIGHT / TOTAL_WEIGHT,
        TestPhase::Upload => UPLOAD_WEIGHT / TOTAL_WEIGHT,
        TestPhase::Done => 0.0,
    }
}

/// Share of the run that is complete once `phase` starts.
fn phase_offset(phase: TestPhase) -> f64 {
    match phase {
        TestPhase::Ping => 0.0,
        TestPhase::Download => phase_weight(TestPhase::Ping),
        TestPhase::Upload => phase_weight(TestPhase::Ping) + phase_weight(TestPhase::Download),
        TestPhase::Done => 1.0,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Percent complete of a transfer phase, to one decimal.
///
/// Download progress follows the clock alone; upload takes whichever of the clock
/// or the completed item count is further along.
pub fn phase_percent(
    phase: TestPhase,
    elapsed: Duration,
    budget: Duration,
    completed: usize,
    total: usize,
) -> f64 {
    let time_fraction = if budget.is_zero() {
        1.0
    } else {
        elapsed.as_secs_f64() / budget.as_secs_f64()
    };
    let amount_fraction = match phase {
        TestPhase::Upload if total > 0 => completed as f64 / total as f64,
        _ => 0.0,
    };

    round_to(time_fraction.max(amount_fraction).min(1.0) * 100.0, 1)
}

/// Single progress value spanning every phase of a run. Never moves backwards.
#[derive(Debug, Default)]
pub struct OverallProgress {
    last: f64,
}

impl OverallProgress {
    pub fn update(&mut self, phase: TestPhase, fraction: f64) -> f64 {
        let share = phase_weight(phase) * fraction.clamp(0.0, 1.0);
        let value = (phase_offset(phase) + share).min(1.0);
        self.last = self.last.max(value);
        self.last
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: TestPhase,
    /// Phase progress in percent, one decimal.
    pub percent: f64,
    pub raw_bytes_per_sec: f64,
    pub corrected_bytes_per_sec: f64,
    /// Whole-run progress in `[0, 1]`.
    pub overall: f64,
}

impl ProgressEvent {
    /// A finished phase that moved no measured payload, such as latency probing.
    pub fn finished(phase: TestPhase, overall: f64) -> Self {
        Self {
            phase,
            percent: 100.0,
            raw_bytes_per_sec: 0.0,
            corrected_bytes_per_sec: 0.0,
            overall,
        }
    }
}

/// Publishes updates for one run. Once the run is cancelled nothing more is sent.
pub struct Reporter {
    tx: mpsc::Sender<TestUpdate>,
    cancel: CancellationToken,
    progress: OverallProgress,
}

impl Reporter {
    pub fn new(tx: mpsc::Sender<TestUpdate>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            progress: OverallProgress::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SpeedTestError::Aborted)
        } else {
            Ok(())
        }
    }

    pub fn advance(&mut self, phase: TestPhase, fraction: f64) -> f64 {
        self.progress.update(phase, fraction)
    }

    pub async fn emit(&self, update: TestUpdate) {
        if self.is_cancelled() {
            return;
        }
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(update).await;
    }
}
