//! [`ExportSink`] that POSTs to a Prometheus remote-write endpoint.
//!
//! Bodies are snappy block-encoded protobuf, as remote-write 0.1.0 requires.

use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ExporterConfig, RetryPolicy};
use crate::proto::{TimeSeries, WriteRequest};
use crate::sink::{ExportError, ExportSink};

const REMOTE_WRITE_VERSION: &str = "0.1.0";

pub struct RemoteWriteExporter {
    client: Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
    max_batch_size_bytes: usize,
    retry: RetryPolicy,
}

impl RemoteWriteExporter {
    pub fn new(config: &ExporterConfig) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(config.export_timeout)
            .user_agent(concat!("prw-wal/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            headers: config.export_headers.clone(),
            max_batch_size_bytes: config.max_batch_size_bytes,
            retry: config.retry,
        })
    }

    async fn post(&self, body: Bytes) -> Result<(), ExportError> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/x-protobuf")
            .header("content-encoding", "snappy")
            .header("x-prometheus-remote-write-version", REMOTE_WRITE_VERSION);

        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let resp = req.body(body).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ExportError::Rejected {
                status: resp.status(),
            })
        }
    }

    /// Send one request body, backing off between retryable failures.
    ///
    /// Cancellation is honoured while waiting between attempts, not during
    /// an attempt; `export_timeout` bounds those.
    async fn send_with_retry(
        &self,
        cancel: &CancellationToken,
        body: Bytes,
    ) -> Result<(), ExportError> {
        let started = Instant::now();
        let mut delay = self.retry.initial_interval;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            attempts += 1;

            let err = match self.post(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if let Some(max_elapsed) = self.retry.max_elapsed
                && started.elapsed() + delay > max_elapsed
            {
                return Err(ExportError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            warn!(
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "remote write failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ExportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, self.retry.max_interval);
        }
    }
}

impl ExportSink for RemoteWriteExporter {
    async fn export(
        &self,
        cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        let batches = split_series(requests, self.max_batch_size_bytes);

        for (n, timeseries) in batches.into_iter().enumerate() {
            let series = timeseries.len();
            let encoded = WriteRequest { timeseries }.encode_to_vec();
            let body = Bytes::from(compress_snappy(&encoded)?);
            debug!(
                batch = n,
                series,
                bytes = encoded.len(),
                compressed_bytes = body.len(),
                "sending remote write request"
            );
            self.send_with_retry(cancel, body).await?;
        }
        Ok(())
    }
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>, snap::Error> {
    snap::raw::Encoder::new().compress_vec(data)
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

/// Bytes a series adds to an encoded `WriteRequest`: field tag, length
/// prefix and message.
fn series_size(series: &TimeSeries) -> usize {
    let len = series.encoded_len();
    1 + prost::length_delimiter_len(len) + len
}

/// Merge the series of every request, in order, into batches whose encoded
/// size stays within `max_bytes`. A series too large on its own gets a batch
/// to itself.
fn split_series(requests: &[WriteRequest], max_bytes: usize) -> Vec<Vec<TimeSeries>> {
    let mut batches = Vec::new();
    let mut current: Vec<TimeSeries> = Vec::new();
    let mut current_size = 0;

    for series in requests.iter().flat_map(|r| &r.timeseries) {
        let size = series_size(series);
        if !current.is_empty() && current_size + size > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(series.clone());
        current_size += size;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
