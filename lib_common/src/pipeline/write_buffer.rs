//! # Write Buffer
//!
//! Many submitters, one worker. Submitters push readings into a bounded
//! channel; the worker moves them into its pending list and flushes the list
//! to the store in batches, either when a full batch is pending or on every
//! tick of the flush interval.
//!
//! A flush that keeps failing transiently leaves its batch at the head of the
//! pending list, so order is preserved and the next flush starts with it.
//! Until a flush succeeds again only the ticker flushes; the worker keeps
//! receiving in between, and once the pending list reaches its cap the oldest
//! readings are dropped.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::stats::{WriteBufferSnapshot, WriteBufferStats};
use crate::core::{retry_transient, DuplicateFilter, KeyState, RetryError, RetryPolicy};
use crate::readings::SensorReading;
use crate::storage::{StoreError, TimeSeriesStore};

/// Tuning knobs of the write buffer.
#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    /// Flush as soon as this many readings are pending.
    pub batch_size: usize,
    /// Flush whatever is pending at this period.
    pub flush_interval: Duration,
    /// Capacity of the channel between submitters and the worker.
    pub queue_capacity: usize,
    /// How long `submit` waits for room in a full channel.
    pub enqueue_timeout: Duration,
    /// Retry bounds of a single flush.
    pub retry: RetryPolicy,
    /// Cap on readings held by the worker while the store is failing.
    pub max_pending: usize,
    /// Number of idempotency keys remembered for duplicate suppression.
    pub dedupe_capacity: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            queue_capacity: 10_000,
            enqueue_timeout: Duration::from_secs(2),
            retry: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30))
                .with_max_attempts(5),
            max_pending: 50_000,
            dedupe_capacity: 4096,
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for writing.
    Accepted,
    /// Same idempotency key queued recently; acknowledged, not queued.
    Duplicate,
}

/// Why a reading could not be queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue stayed full for the whole enqueue timeout.
    #[error("write queue full for {0:?}")]
    Overloaded(Duration),

    /// Another submission with the same key is still waiting for room.
    #[error("a reading with the same key is still being queued")]
    KeyInFlight,

    /// The worker has shut down.
    #[error("write buffer is closed")]
    Closed,
}

fn lock(filter: &Mutex<DuplicateFilter>) -> MutexGuard<'_, DuplicateFilter> {
    filter.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A key reserved in the duplicate filter for one submission. Dropping it
/// uncommitted releases the key, including when the submitting future is
/// dropped mid-wait.
struct KeyReservation<'a> {
    filter: &'a Mutex<DuplicateFilter>,
    key: &'a str,
    committed: bool,
}

impl KeyReservation<'_> {
    fn commit(mut self) {
        lock(self.filter).commit(self.key);
        self.committed = true;
    }
}

impl Drop for KeyReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            lock(self.filter).release(self.key);
        }
    }
}

/// Cloneable submit side of the buffer.
#[derive(Clone)]
pub struct WriteBufferHandle {
    tx: mpsc::Sender<SensorReading>,
    dedupe: Arc<Mutex<DuplicateFilter>>,
    stats: Arc<WriteBufferStats>,
    enqueue_timeout: Duration,
}

impl WriteBufferHandle {
    /// Queues `reading`, waiting up to the enqueue timeout for room.
    ///
    /// With a `key`, a reading whose key is still in the suppression window
    /// is reported as [`SubmitOutcome::Duplicate`] and not queued. The key
    /// enters the window only once its reading is queued; a concurrent
    /// submission of the same key meanwhile gets [`SubmitError::KeyInFlight`].
    pub async fn submit(
        &self,
        reading: SensorReading,
        key: Option<&str>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let reservation = match key {
            Some(k) => {
                let state = lock(&self.dedupe).reserve(k);
                match state {
                    KeyState::New => Some(KeyReservation {
                        filter: &self.dedupe,
                        key: k,
                        committed: false,
                    }),
                    KeyState::InFlight => return Err(SubmitError::KeyInFlight),
                    KeyState::Seen => {
                        self.stats.add_duplicate();
                        log::debug!("Duplicate reading {} ignored", k);
                        return Ok(SubmitOutcome::Duplicate);
                    }
                }
            }
            None => None,
        };

        match self.tx.send_timeout(reading, self.enqueue_timeout).await {
            Ok(()) => {
                if let Some(r) = reservation {
                    r.commit();
                }
                self.stats.add_accepted();
                Ok(SubmitOutcome::Accepted)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.add_rejected_overload();
                Err(SubmitError::Overloaded(self.enqueue_timeout))
            }
            Err(SendTimeoutError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> WriteBufferSnapshot {
        self.stats.snapshot()
    }

    /// Readings sitting in the channel, not yet picked up by the worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Entry point for starting the buffer.
pub struct WriteBuffer;

impl WriteBuffer {
    /// Starts the worker. It runs until `cancel` fires (or every handle is
    /// dropped), then drains the channel and makes a final flush.
    pub fn spawn(
        store: Arc<dyn TimeSeriesStore>,
        config: WriteBufferConfig,
        cancel: CancellationToken,
    ) -> (WriteBufferHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(WriteBufferStats::default());

        let handle = WriteBufferHandle {
            tx,
            dedupe: Arc::new(Mutex::new(DuplicateFilter::new(config.dedupe_capacity))),
            stats: Arc::clone(&stats),
            enqueue_timeout: config.enqueue_timeout,
        };

        let worker = Worker {
            rx,
            store,
            config,
            stats,
            pending: VecDeque::new(),
            store_down: false,
        };

        (handle, tokio::spawn(worker.run(cancel)))
    }
}

struct Worker {
    rx: mpsc::Receiver<SensorReading>,
    store: Arc<dyn TimeSeriesStore>,
    config: WriteBufferConfig,
    stats: Arc<WriteBufferStats>,
    pending: VecDeque<SensorReading>,
    /// Set when a flush ran out of retries, cleared by the next good write.
    store_down: bool,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        log::info!(
            "Write buffer started (batch {}, interval {:?}, queue {})",
            self.config.batch_size,
            self.config.flush_interval,
            self.config.queue_capacity
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(reading) => {
                        self.push(reading);
                        if !self.store_down && self.pending.len() >= self.config.batch_size {
                            self.flush(Some(&cancel), false).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush(Some(&cancel), true).await;
                    }
                }
            }
        }

        // Refuse new submissions, keep what is already queued.
        self.rx.close();
        while let Ok(reading) = self.rx.try_recv() {
            self.push(reading);
        }

        log::info!("Write buffer stopping, {} readings to flush", self.pending.len());
        self.flush(None, true).await;

        if !self.pending.is_empty() {
            log::error!(
                "Write buffer stopped with {} unwritten readings",
                self.pending.len()
            );
            self.stats.add_dropped(self.pending.len());
            self.pending.clear();
            self.stats.set_pending(0);
        }
    }

    fn push(&mut self, reading: SensorReading) {
        if self.pending.len() >= self.config.max_pending.max(1) {
            if let Some(oldest) = self.pending.pop_front() {
                log::warn!(
                    "Pending cap {} reached, dropping reading of {} at {}",
                    self.config.max_pending,
                    oldest.device_id,
                    oldest.timestamp
                );
                self.stats.add_dropped(1);
            }
        }
        self.pending.push_back(reading);
        self.stats.set_pending(self.pending.len());
    }

    /// Writes pending batches until the list is empty (`drain_all`) or less
    /// than a full batch remains, or a batch fails transiently.
    async fn flush(&mut self, cancel: Option<&CancellationToken>, drain_all: bool) {
        let batch_size = self.config.batch_size.max(1);

        while !self.pending.is_empty() && (drain_all || self.pending.len() >= batch_size) {
            let n = self.pending.len().min(batch_size);
            self.pending.make_contiguous();
            let batch = &self.pending.as_slices().0[..n];

            match self.write_with_retry(batch, cancel).await {
                Ok(stored) => {
                    self.pending.drain(..n);
                    self.stats.add_written(stored);
                    if stored < n {
                        self.stats.add_dropped(n - stored);
                        log::warn!("Store left out {} of {} readings", n - stored, n);
                    }
                    if self.store_down {
                        log::info!("Store is back, {} readings still pending", self.pending.len());
                        self.store_down = false;
                    }
                    log::debug!("Flushed {} readings", stored);
                }
                Err(RetryError::Rejected(e)) => {
                    self.pending.drain(..n);
                    self.stats.add_dropped(n);
                    log::error!("Store rejected a batch of {} readings, dropping it: {}", n, e);
                }
                Err(e) => {
                    self.store_down = true;
                    self.stats.add_failed_flush();
                    log::warn!(
                        "Flush of {} readings failed, keeping {} pending until the next tick: {}",
                        n,
                        self.pending.len(),
                        e
                    );
                    break;
                }
            }
        }

        self.stats.set_pending(self.pending.len());
    }

    async fn write_with_retry(
        &self,
        batch: &[SensorReading],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, RetryError<StoreError>> {
        let store = &self.store;
        retry_transient(
            self.config.retry,
            cancel,
            |_| store.write_points(batch),
            StoreError::is_transient,
            |attempt, err, next| match next {
                Some(delay) => {
                    log::warn!("Write attempt {} failed: {}. Retrying in {:?}", attempt, err, delay)
                }
                None => log::error!("Write attempt {} failed: {}. Giving up on this flush", attempt, err),
            },
        )
        .await
    }
}
