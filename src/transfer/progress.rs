//! Shared progress counter and the periodic reporter that samples it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::config::ProgressCallback;

/// Byte counters for one transfer. Workers add to `processed` concurrently.
#[derive(Debug)]
pub struct ProgressStatus {
    total: u64,
    processed: AtomicU64,
    started: Instant,
}

impl ProgressStatus {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            processed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Adds `bytes` to the processed counter and returns the new value.
    pub fn add(&self, bytes: u64) -> u64 {
        self.processed.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Builds a record relative to the previous sample, if any.
    pub fn sample(&self, previous: Option<&Sample>, finished: bool) -> (ProgressRecord, Sample) {
        let now = Instant::now();
        let processed = self.processed();
        let elapsed = now.duration_since(self.started);

        let average_rate = rate(processed, elapsed);
        let instant_rate = match previous {
            Some(prev) => rate(
                processed.saturating_sub(prev.processed),
                now.duration_since(prev.at),
            ),
            None => average_rate,
        };
        let remaining = self.total.saturating_sub(processed);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if average_rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / average_rate))
        } else {
            None
        };
        let percent = if self.total == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / self.total as f64
        };

        let record = ProgressRecord {
            total: self.total,
            processed,
            percent,
            instant_rate,
            average_rate,
            elapsed,
            eta,
            finished,
        };
        (record, Sample { at: now, processed })
    }
}

fn rate(bytes: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Point-in-time reading used to derive the instantaneous rate.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    at: Instant,
    processed: u64,
}

/// One progress report handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub total: u64,
    pub processed: u64,
    pub percent: f64,
    /// Bytes per second since the previous record.
    pub instant_rate: f64,
    /// Bytes per second since the transfer started.
    pub average_rate: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub eta: Option<Duration>,
    /// Set on the terminal record only.
    pub finished: bool,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Background task reporting a [`ProgressStatus`] on a fixed interval.
///
/// The task only reads the atomic counter, so it never waits on the
/// transfer's file lock. Dropping the tracker ends the loop.
pub struct ProgressTracker {
    stop: DropGuard,
    handle: JoinHandle<()>,
}

impl ProgressTracker {
    /// Spawns the reporting loop. The first record is emitted after one interval.
    pub fn start(
        status: Arc<ProgressStatus>,
        interval: Duration,
        callback: ProgressCallback,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            let mut previous = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (record, sample) = status.sample(previous.as_ref(), false);
                        previous = Some(sample);
                        callback(&record);
                    }
                    _ = token.cancelled() => break,
                }
            }

            let (record, _) = status.sample(previous.as_ref(), true);
            debug!(
                "progress finished at {}/{} bytes in {:?}",
                record.processed, record.total, record.elapsed
            );
            callback(&record);
        });

        Self {
            stop: stop.drop_guard(),
            handle,
        }
    }

    /// Stops the loop and waits for the final record to be delivered.
    pub async fn stop(self) {
        let Self { stop, handle } = self;
        stop.disarm().cancel();
        if let Err(e) = handle.await {
            warn!("progress reporter ended abnormally: {}", e);
        }
    }
}
