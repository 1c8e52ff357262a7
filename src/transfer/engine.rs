//! Bounded parallel download of a range source into a local file.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::{BufferPool, ProgressStatus, ProgressTracker, DEFAULT_BUFFERS_PER_CLASS};
use crate::config::TransferOptions;
use crate::error::{ErrorCode, RangeFailure, SyncError, SyncResult, TransferError};
use crate::models::{chunk_ranges, merge_ranges, total_length, IndexRange, TransferOutcome};
use crate::remote::RangeSource;

/// Downloads every data range of `source` into `local_path`.
///
/// The file is created (or truncated) and sized to the source length first,
/// so bytes outside the reported ranges read back as zero.
pub async fn download(
    source: Arc<dyn RangeSource>,
    local_path: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<TransferOutcome, TransferError> {
    let local_path = local_path.as_ref();
    let length = source.length();
    let file = create_sized(local_path, length).await?;
    let ranges = source.ranges().await?;
    info!(
        "downloading {} bytes in {} ranges to {}",
        total_length(&ranges),
        ranges.len(),
        local_path.display()
    );
    transfer(source, file, ranges, length, options).await
}

/// Transfers only `ranges` into an existing file, leaving other bytes intact.
///
/// Used to retry the ranges reported by a failed or cancelled [`download`].
pub async fn download_ranges(
    source: Arc<dyn RangeSource>,
    local_path: impl AsRef<Path>,
    ranges: Vec<IndexRange>,
    options: &TransferOptions,
) -> Result<TransferOutcome, TransferError> {
    let local_path = local_path.as_ref();
    let length = source.length();
    let file = OpenOptions::new()
        .write(true)
        .open(local_path)
        .await
        .map_err(|e| io_error(local_path, e))?;
    let current = file.metadata().await.map_err(|e| io_error(local_path, e))?.len();
    if current < length {
        file.set_len(length).await.map_err(|e| io_error(local_path, e))?;
    }
    transfer(source, file, ranges, length, options).await
}

async fn create_sized(path: &Path, length: u64) -> SyncResult<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    file.set_len(length).await.map_err(|e| io_error(path, e))?;
    Ok(file)
}

fn io_error(path: &Path, e: std::io::Error) -> SyncError {
    SyncError::with_message(ErrorCode::Io, format!("{}: {e}", path.display()))
}

/// State shared by every worker of one transfer.
struct Shared {
    source: Arc<dyn RangeSource>,
    queue: Mutex<VecDeque<IndexRange>>,
    file: AsyncMutex<File>,
    pool: Arc<BufferPool>,
    status: Arc<ProgressStatus>,
    failures: Mutex<Vec<RangeFailure>>,
    /// Range each worker currently holds, indexed by worker id.
    in_flight: Mutex<Vec<Option<IndexRange>>>,
}

async fn transfer(
    source: Arc<dyn RangeSource>,
    file: File,
    ranges: Vec<IndexRange>,
    length: u64,
    options: &TransferOptions,
) -> Result<TransferOutcome, TransferError> {
    let started = Instant::now();
    let merged = merge_ranges(ranges);
    if let Some(out) = merged
        .iter()
        .find(|r| r.checked_end().map_or(true, |end| end > length))
    {
        return Err(SyncError::with_message(
            ErrorCode::InvalidInput,
            format!("range {out} exceeds source length {length}"),
        )
        .into());
    }

    let work = chunk_ranges(&merged, options.max_range_size.max(1));
    let attempted = work.len();
    let workers = options.parallelism.max(1).min(attempted.max(1));
    debug!("starting {} workers for {} ranges", workers, attempted);
    let status = Arc::new(ProgressStatus::new(total_length(&work)));
    let tracker = options.on_progress.clone().map(|callback| {
        ProgressTracker::start(Arc::clone(&status), options.progress_interval, callback)
    });

    let shared = Arc::new(Shared {
        source,
        queue: Mutex::new(work.into_iter().collect()),
        file: AsyncMutex::new(file),
        pool: BufferPool::new(DEFAULT_BUFFERS_PER_CLASS),
        status: Arc::clone(&status),
        failures: Mutex::new(Vec::new()),
        in_flight: Mutex::new(vec![None; workers]),
    });

    let mut tasks = JoinSet::new();
    for id in 0..workers {
        let worker = Worker {
            id,
            state: WorkerState::Idle,
            shared: Arc::clone(&shared),
            cancel: options.cancel.clone(),
        };
        tasks.spawn(worker.run());
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("transfer worker aborted: {}", e);
        }
    }
    // A worker that died mid-range leaves its slot set.
    for (id, range) in shared.in_flight.lock().iter_mut().enumerate() {
        if let Some(range) = range.take() {
            shared.failures.lock().push(RangeFailure {
                range,
                error: SyncError::transfer(format!("range {range}: worker {id} panicked")),
            });
        }
    }

    if let Some(tracker) = tracker {
        tracker.stop().await;
    }

    let bytes_transferred = status.processed();
    let mut pending: Vec<IndexRange> = shared.queue.lock().drain(..).collect();
    let mut failures = std::mem::take(&mut *shared.failures.lock());
    if !options.cancel.is_cancelled() {
        // Every worker died before the queue drained.
        failures.extend(pending.drain(..).map(|range| RangeFailure {
            range,
            error: SyncError::transfer(format!("range {range}: no worker left to transfer it")),
        }));
    }
    failures.sort_by_key(|f| f.range.start_index);

    if !pending.is_empty() {
        warn!(
            "transfer cancelled after {} bytes, {} ranges not started",
            bytes_transferred,
            pending.len()
        );
        return Err(TransferError::Cancelled {
            bytes_transferred,
            pending,
            failures,
        });
    }
    if !failures.is_empty() {
        warn!("{} of {} ranges failed", failures.len(), attempted);
        return Err(TransferError::RangesFailed {
            bytes_transferred,
            attempted,
            failures,
        });
    }

    let outcome = TransferOutcome {
        bytes_transferred,
        ranges_transferred: attempted,
        total_length: length,
        elapsed: started.elapsed(),
    };
    info!(
        "transferred {} bytes in {} ranges ({:?})",
        outcome.bytes_transferred, outcome.ranges_transferred, outcome.elapsed
    );
    Ok(outcome)
}

/// Lifecycle of a worker around each range it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reading(IndexRange),
    Writing(IndexRange),
    Done(IndexRange),
    Failed(IndexRange),
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("idle"),
            WorkerState::Reading(r) => write!(f, "reading {r}"),
            WorkerState::Writing(r) => write!(f, "writing {r}"),
            WorkerState::Done(r) => write!(f, "done {r}"),
            WorkerState::Failed(r) => write!(f, "failed {r}"),
        }
    }
}

struct Worker {
    id: usize,
    state: WorkerState,
    shared: Arc<Shared>,
    cancel: tokio_util::sync::CancellationToken,
}

impl Worker {
    fn set_state(&mut self, state: WorkerState) {
        trace!("worker {}: {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!("worker {} observed cancellation", self.id);
                break;
            }
            let next = self.shared.queue.lock().pop_front();
            let Some(range) = next else {
                break;
            };
            self.shared.in_flight.lock()[self.id] = Some(range);

            match self.transfer_range(range).await {
                Ok(()) => {
                    self.shared.status.add(range.length);
                    self.set_state(WorkerState::Done(range));
                }
                Err(error) => {
                    warn!("worker {}: range {} failed: {}", self.id, range, error.message);
                    self.set_state(WorkerState::Failed(range));
                    self.shared.failures.lock().push(RangeFailure { range, error });
                }
            }
            self.shared.in_flight.lock()[self.id] = None;
            self.set_state(WorkerState::Idle);
        }
    }

    async fn transfer_range(&mut self, range: IndexRange) -> SyncResult<()> {
        self.set_state(WorkerState::Reading(range));
        let len = usize::try_from(range.length)
            .map_err(|_| SyncError::transfer(format!("range {range} does not fit in memory")))?;

        let mut reader = self.shared.source.open_range(range).await.map_err(|e| match e.code {
            ErrorCode::RangeTransferFailure => e,
            _ => SyncError::transfer(format!("range {range}: {}", e.message)),
        })?;

        let mut buffer = self.shared.pool.take(len);
        let mut filled = 0;
        while filled < len {
            let n = reader
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| SyncError::transfer(format!("range {range}: read failed: {e}")))?;
            if n == 0 {
                return Err(SyncError::transfer(format!(
                    "range {range}: stream ended after {filled} of {len} bytes"
                )));
            }
            filled += n;
        }

        self.set_state(WorkerState::Writing(range));
        let write_failed =
            |e: std::io::Error| SyncError::transfer(format!("range {range}: write failed: {e}"));
        let mut file = self.shared.file.lock().await;
        file.seek(SeekFrom::Start(range.start_index))
            .await
            .map_err(write_failed)?;
        file.write_all(&buffer).await.map_err(write_failed)?;
        file.flush().await.map_err(write_failed)?;
        Ok(())
    }
}
