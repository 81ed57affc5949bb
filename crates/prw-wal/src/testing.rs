use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::proto::{Label, Sample, TimeSeries, WriteRequest};
use crate::sink::{ExportError, ExportSink};

/// Accepts everything and remembers what it was given.
#[derive(Default)]
pub struct RecordingSink {
    exports: Mutex<Vec<Vec<WriteRequest>>>,
}

impl RecordingSink {
    /// Every request received, in delivery order.
    pub fn requests(&self) -> Vec<WriteRequest> {
        self.exports().into_iter().flatten().collect()
    }

    /// One entry per successful `export` call.
    pub fn exports(&self) -> Vec<Vec<WriteRequest>> {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn series_count(&self) -> usize {
        self.requests().iter().map(|r| r.timeseries.len()).sum()
    }
}

impl ExportSink for RecordingSink {
    async fn export(
        &self,
        _cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(requests.to_vec());
        Ok(())
    }
}

/// Rejects every export.
#[derive(Default)]
pub struct FailingSink {
    pub calls: AtomicU32,
}

impl ExportSink for FailingSink {
    async fn export(
        &self,
        _cancel: &CancellationToken,
        _requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExportError::Rejected {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        })
    }
}

/// Rejects the first `failures` exports, then records like [`RecordingSink`].
pub struct FlakySink {
    failures: u32,
    pub calls: AtomicU32,
    pub inner: RecordingSink,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            inner: RecordingSink::default(),
        }
    }
}

impl ExportSink for FlakySink {
    async fn export(
        &self,
        cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ExportError::Rejected {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        self.inner.export(cancel, requests).await
    }
}

/// Takes a while to accept, ignoring cancellation.
#[derive(Default)]
pub struct SlowSink {
    pub inner: RecordingSink,
}

impl ExportSink for SlowSink {
    async fn export(
        &self,
        cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.export(cancel, requests).await
    }
}

pub fn series(labels: &[(&str, &str)], samples: &[(f64, i64)]) -> TimeSeries {
    TimeSeries {
        labels: labels
            .iter()
            .map(|(name, value)| Label {
                name: (*name).to_owned(),
                value: (*value).to_owned(),
            })
            .collect(),
        samples: samples
            .iter()
            .map(|&(value, timestamp)| Sample { value, timestamp })
            .collect(),
    }
}

/// A request of `count` series labelled `batch=<batch>, series=<n>`.
pub fn batch(batch: usize, count: usize) -> WriteRequest {
    let batch = batch.to_string();
    WriteRequest {
        timeseries: (0..count)
            .map(|n| {
                let n_label = n.to_string();
                series(
                    &[("batch", batch.as_str()), ("series", n_label.as_str())],
                    &[(n as f64, 1_700_000_000_000 + n as i64)],
                )
            })
            .collect(),
    }
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
