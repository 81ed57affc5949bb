//! Write-ahead buffering of remote-write requests.
//!
//! Producers call [`Wal::persist_to_wal`], which returns once every request is
//! on disk. A single background task started by [`Wal::run`] drains the log to
//! the [`ExportSink`] and truncates what has been delivered.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{self, CodecError};
use crate::config::WalConfig;
use crate::drain::{DrainTrigger, Drainer};
use crate::log::{DurableLog, LogError};
use crate::proto::WriteRequest;
use crate::sink::{ExportError, ExportSink};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("write-ahead log already closed")]
    AlreadyClosed,

    #[error("write-ahead log drain loop already running")]
    AlreadyRunning,

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("failed to decode log entry: {0}")]
    Codec(#[from] CodecError),

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("log I/O task failed: {0}")]
    Task(#[from] JoinError),
}

enum Lifecycle {
    Created,
    Running {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

pub struct Wal<S> {
    config: WalConfig,
    log: Arc<DurableLog>,
    sink: Arc<S>,
    trigger: Arc<DrainTrigger>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: ExportSink> Wal<S> {
    /// Open the log described by `config`. Without a config there is nothing
    /// to buffer and `Ok(None)` is returned.
    pub fn new(config: Option<WalConfig>, sink: Arc<S>) -> Result<Option<Self>, WalError> {
        let Some(config) = config else {
            return Ok(None);
        };
        let config = config.normalized();
        let log = DurableLog::open(&config.directory, config.log_options())?;

        Ok(Some(Self {
            trigger: Arc::new(DrainTrigger::new(config.buffer_size)),
            log: Arc::new(log),
            sink,
            lifecycle: Mutex::new(Lifecycle::Created),
            config,
        }))
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// The underlying log, for inspection.
    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    /// Read back and decode the request stored at `index`.
    pub fn read_request(&self, index: u64) -> Result<WriteRequest, WalError> {
        let payload = self.log.read(index).map_err(closed_to_wal)?;
        Ok(codec::decode(payload)?)
    }

    /// Append each request to the log as its own entry, in order.
    ///
    /// Blocks until every append is durable, so async callers run it on the
    /// blocking pool as [`crate::pipeline::RemoteWritePipeline::push`] does.
    /// Stops at the first failure; requests appended before it stay in the log.
    pub fn persist_to_wal(&self, requests: &[WriteRequest]) -> Result<(), WalError> {
        if matches!(*self.lifecycle(), Lifecycle::Stopped) {
            return Err(WalError::AlreadyClosed);
        }

        for request in requests {
            let payload = codec::encode(request);
            let index = self.log.append(&payload).map_err(closed_to_wal)?;
            self.trigger.record_append();
            debug!(index, bytes = payload.len(), "persisted write request");
        }
        Ok(())
    }

    /// Start the drain loop on a child of `cancel`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(), WalError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running { .. } => return Err(WalError::AlreadyRunning),
            Lifecycle::Stopped => return Err(WalError::AlreadyClosed),
        }

        let drainer = Drainer::new(
            Arc::clone(&self.log),
            Arc::clone(&self.sink),
            Arc::clone(&self.trigger),
            self.config.truncate_frequency,
            self.config.buffer_size,
        )?;
        let cancel = cancel.child_token();
        let task = tokio::spawn(drainer.run(cancel.clone()));
        *lifecycle = Lifecycle::Running { cancel, task };

        info!(
            dir = %self.config.directory.display(),
            truncate_frequency_ms = self.config.truncate_frequency.as_millis() as u64,
            buffer_size = self.config.buffer_size,
            "write-ahead log drain loop started"
        );
        Ok(())
    }

    /// Stop draining and close the log.
    ///
    /// Waits for an in-flight drain cycle to finish first. Only the first call
    /// does anything; every later one returns [`WalError::AlreadyClosed`].
    pub async fn stop(&self) -> Result<(), WalError> {
        let previous = mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Stopped => return Err(WalError::AlreadyClosed),
            Lifecycle::Created => {}
            Lifecycle::Running { cancel, task } => {
                cancel.cancel();
                if let Err(e) = task.await {
                    error!(error = %e, "drain loop terminated abnormally");
                }
            }
        }

        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.close()).await??;
        Ok(())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Drop for Wal<S> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running { cancel, .. } = lifecycle {
            cancel.cancel();
        }
    }
}

/// A log closed underneath a producer means the WAL was stopped.
fn closed_to_wal(e: LogError) -> WalError {
    match e {
        LogError::Closed => WalError::AlreadyClosed,
        e => WalError::Log(e),
    }
}

#[cfg(test)]
mod tests;
