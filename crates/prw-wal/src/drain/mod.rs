//! The background task that moves persisted requests from the log to the
//! export sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec;
use crate::cursor::IndexCursor;
use crate::log::{DurableLog, LogError};
use crate::sink::ExportSink;
use crate::wal::WalError;

/// Wakes the drain loop early once enough entries have been persisted.
#[derive(Debug)]
pub(crate) struct DrainTrigger {
    pending: AtomicUsize,
    threshold: usize,
    notify: Notify,
}

impl DrainTrigger {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            threshold: threshold.max(1),
            notify: Notify::new(),
        }
    }

    /// Count one appended entry, waking the drain loop if the threshold is
    /// reached.
    pub(crate) fn record_append(&self) {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.threshold {
            self.notify.notify_one();
        }
    }

    /// Start counting again from zero. Called at the top of every cycle, so
    /// entries appended while a cycle runs count towards the next one.
    fn reset(&self) {
        self.pending.store(0, Ordering::Release);
    }

    async fn triggered(&self) {
        self.notify.notified().await;
    }
}

/// What one drain cycle read from the log.
struct Snapshot {
    first_index: u64,
    last_index: u64,
    /// `(index, payload)` for at most one batch of entries from the cursor.
    entries: Vec<(u64, Bytes)>,
    /// Index of the last entry read; everything after it waits for the next
    /// cycle.
    last_read: u64,
}

/// Owns the index cursor. Only this task moves it or truncates the log.
pub(crate) struct Drainer<S> {
    log: Arc<DurableLog>,
    sink: Arc<S>,
    trigger: Arc<DrainTrigger>,
    cursor: IndexCursor,
    truncate_frequency: Duration,
    max_entries: u64,
}

impl<S: ExportSink> Drainer<S> {
    /// Build a drainer whose cursor is reconciled with what is in the log.
    pub(crate) fn new(
        log: Arc<DurableLog>,
        sink: Arc<S>,
        trigger: Arc<DrainTrigger>,
        truncate_frequency: Duration,
        max_entries: usize,
    ) -> Result<Self, LogError> {
        let cursor = IndexCursor::reconcile(log.first_index()?, log.last_index()?);
        debug!(
            first_unconsumed = cursor.first_unconsumed(),
            last_persisted = cursor.last_persisted(),
            "index cursor reconciled with log"
        );
        Ok(Self {
            log,
            sink,
            trigger,
            cursor,
            truncate_frequency,
            max_entries: max_entries.max(1) as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> IndexCursor {
        self.cursor
    }

    /// Drain until `cancel` fires. Cancellation is only observed between
    /// cycles; a cycle that has started always runs to completion.
    ///
    /// While a backlog larger than one batch remains, cycles follow each other
    /// without waiting for the timer or the trigger.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.truncate_frequency);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backlog = false;

        loop {
            if backlog {
                if cancel.is_cancelled() {
                    break;
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                    _ = self.trigger.triggered() => {}
                }
            }

            let before = self.cursor.first_unconsumed();
            let result = self.drain_once(&cancel).await;
            backlog = result.is_ok()
                && self.cursor.first_unconsumed() > before
                && self.cursor.pending().is_some();

            match result {
                Ok(0) => {}
                Ok(exported) => debug!(
                    exported,
                    first_unconsumed = self.cursor.first_unconsumed(),
                    "drained write-ahead log"
                ),
                Err(e) => error!(
                    error = %e,
                    first_unconsumed = self.cursor.first_unconsumed(),
                    "drain cycle failed, will retry"
                ),
            }
            timer.reset();
        }

        debug!(
            first_unconsumed = self.cursor.first_unconsumed(),
            "drain loop stopped"
        );
    }

    /// Run one cycle: export up to one batch of entries past the cursor and
    /// reclaim them.
    ///
    /// Returns the number of requests handed to the sink. On error the cursor
    /// is left where it was, so the same range is offered again next cycle.
    pub(crate) async fn drain_once(&mut self, cancel: &CancellationToken) -> Result<usize, WalError> {
        self.trigger.reset();

        let snapshot = self.read_pending().await?;
        self.cursor.observe(snapshot.last_index);

        if snapshot.entries.is_empty() {
            // Nothing new. Catch up on a truncation an earlier cycle could
            // not finish.
            if snapshot.first_index < self.cursor.first_unconsumed() {
                self.truncate().await?;
            }
            return Ok(0);
        }

        let mut requests = Vec::with_capacity(snapshot.entries.len());
        for (index, payload) in snapshot.entries {
            match codec::decode(payload) {
                Ok(request) => requests.push(request),
                // A payload that does not decode now never will. Holding the
                // cursor back for it would stall the log forever.
                Err(e) => warn!(index, error = %e, "skipping undecodable log entry"),
            }
        }

        if !requests.is_empty() {
            self.sink.export(cancel, &requests).await?;
        }

        self.cursor.advance_past(snapshot.last_read);
        self.truncate().await?;
        Ok(requests.len())
    }

    async fn read_pending(&self) -> Result<Snapshot, WalError> {
        let log = Arc::clone(&self.log);
        let from = self.cursor.first_unconsumed();
        let max_entries = self.max_entries;

        let snapshot = tokio::task::spawn_blocking(move || -> Result<Snapshot, LogError> {
            let first_index = log.first_index()?;
            let last_index = log.last_index()?;
            let start = from.max(first_index);
            let last_read = last_index.min(start.saturating_add(max_entries - 1));
            let entries = (start..=last_read)
                .map(|index| Ok((index, log.read(index)?)))
                .collect::<Result<Vec<_>, LogError>>()?;
            Ok(Snapshot {
                first_index,
                last_index,
                entries,
                last_read,
            })
        })
        .await??;

        Ok(snapshot)
    }

    /// Drop every exported entry from the log.
    async fn truncate(&self) -> Result<(), WalError> {
        let log = Arc::clone(&self.log);
        let index = self.cursor.first_unconsumed();
        tokio::task::spawn_blocking(move || log.truncate_front(index)).await??;
        Ok(())
    }
}
