//! Time-boxed throughput measurement shared by the download and upload phases.
//!
//! Work items are queued up front and pulled by a fixed number of worker slots.
//! Once the time budget is spent no new item is started, but transfers already in
//! flight are awaited and counted.

use super::progress::{phase_percent, ProgressEvent, Reporter};
use super::TestPhase;
use crate::app::TestUpdate;
use crate::error::{Result, SpeedTestError};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Transfers kept in flight at once.
pub const CONCURRENCY: usize = 2;

pub const DOWNLOAD_CORRECTION: f64 = 1.135;
pub const UPLOAD_CORRECTION: f64 = 1.139;

const BYTES_PER_MEGABIT: f64 = 125_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn phase(self) -> TestPhase {
        match self {
            Direction::Download => TestPhase::Download,
            Direction::Upload => TestPhase::Upload,
        }
    }

    /// Byte-counted throughput understates what reference tools report; these
    /// empirical factors bring the two in line.
    pub fn correction_factor(self) -> f64 {
        match self {
            Direction::Download => DOWNLOAD_CORRECTION,
            Direction::Upload => UPLOAD_CORRECTION,
        }
    }

    fn progress_update(self, event: ProgressEvent) -> TestUpdate {
        match self {
            Direction::Download => TestUpdate::DownloadProgress(event),
            Direction::Upload => TestUpdate::UploadProgress(event),
        }
    }

    fn speed_update(self, mbps: f64) -> TestUpdate {
        match self {
            Direction::Download => TestUpdate::DownloadSpeedProgress(mbps),
            Direction::Upload => TestUpdate::UploadSpeedProgress(mbps),
        }
    }
}

/// Converts bytes per second to megabits per second, rounded to three decimals.
pub fn to_mbps(bytes_per_sec: f64) -> f64 {
    (bytes_per_sec / BYTES_PER_MEGABIT * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed: Duration,
    pub completed: usize,
    pub raw_bytes_per_sec: f64,
    pub corrected_bytes_per_sec: f64,
}

impl Throughput {
    pub fn mbps(&self) -> f64 {
        to_mbps(self.corrected_bytes_per_sec)
    }
}

/// State of one phase of one run.
#[derive(Debug)]
struct MeasurementSession {
    direction: Direction,
    budget: Duration,
    total: usize,
    started_at: Option<Instant>,
    dispatched: usize,
    completed: usize,
    bytes: u64,
    /// Elapsed time at the latest completion; `last_speed` is measured over it.
    last_elapsed: Duration,
    last_speed: f64,
    last_percent: f64,
    accepting: bool,
}

impl MeasurementSession {
    fn new(direction: Direction, budget: Duration, total: usize) -> Self {
        Self {
            direction,
            budget,
            total,
            started_at: None,
            dispatched: 0,
            completed: 0,
            bytes: 0,
            last_elapsed: Duration::ZERO,
            last_speed: 0.0,
            last_percent: 0.0,
            accepting: true,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn dispatch(&mut self) {
        self.started_at.get_or_insert_with(Instant::now);
        self.dispatched += 1;
    }

    /// Counts a finished transfer and returns the progress it amounts to.
    fn complete(&mut self, bytes: u64) -> (f64, f64) {
        self.completed += 1;
        self.bytes += bytes;

        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        self.last_elapsed = elapsed;
        self.last_speed = if secs > 0.0 { self.bytes as f64 / secs } else { 0.0 };
        self.last_percent = phase_percent(
            self.direction.phase(),
            elapsed,
            self.budget,
            self.completed,
            self.total,
        );

        if self.accepting && elapsed > self.budget {
            tracing::debug!(
                phase = %self.direction.phase(),
                completed = self.completed,
                in_flight = self.dispatched - self.completed,
                "Time budget spent, draining in-flight transfers"
            );
            self.accepting = false;
        }

        (self.last_speed, self.last_percent)
    }

    fn result(&self) -> Throughput {
        Throughput {
            bytes: self.bytes,
            elapsed: self.last_elapsed,
            completed: self.completed,
            raw_bytes_per_sec: self.last_speed,
            corrected_bytes_per_sec: self.last_speed * self.direction.correction_factor(),
        }
    }
}

/// Runs `transfer` over `items` with [`CONCURRENCY`] workers until the queue is
/// exhausted or `budget` is spent, publishing progress after every completion.
///
/// `transfer` resolves to the number of bytes moved. The first failing transfer
/// ends the phase with its error.
pub async fn measure<T, F, Fut>(
    direction: Direction,
    items: Vec<T>,
    budget: Duration,
    reporter: &mut Reporter,
    transfer: F,
) -> Result<Throughput>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    reporter.checkpoint()?;

    let phase = direction.phase();
    let mut session = MeasurementSession::new(direction, budget, items.len());
    let mut queue = items.into_iter();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while session.accepting && in_flight.len() < CONCURRENCY {
            match queue.next() {
                Some(item) => {
                    session.dispatch();
                    in_flight.push(transfer(item));
                }
                None => break,
            }
        }

        let Some(outcome) = in_flight.next().await else {
            break;
        };
        let bytes = outcome?;
        let (raw, percent) = session.complete(bytes);

        if reporter.is_cancelled() {
            session.accepting = false;
            continue;
        }

        let corrected = raw * direction.correction_factor();
        let overall = reporter.advance(phase, percent / 100.0);
        reporter
            .emit(direction.progress_update(ProgressEvent {
                phase,
                percent,
                raw_bytes_per_sec: raw,
                corrected_bytes_per_sec: corrected,
                overall,
            }))
            .await;
        reporter.emit(direction.speed_update(to_mbps(corrected))).await;
    }

    if reporter.is_cancelled() {
        return Err(SpeedTestError::Aborted);
    }

    let result = session.result();
    tracing::info!(
        %phase,
        bytes = result.bytes,
        completed = result.completed,
        elapsed_ms = result.elapsed.as_millis() as u64,
        mbps = result.mbps(),
        "Phase finished"
    );
    Ok(result)
}
