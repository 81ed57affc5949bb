use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::proto::WriteRequest;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote endpoint rejected write request: {status}")]
    Rejected { status: reqwest::StatusCode },

    #[error("snappy compression failed: {0}")]
    Compression(#[from] snap::Error),

    #[error("export cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ExportError>,
    },
}

impl ExportError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            // A request that could not be built fails the same way every time.
            ExportError::Http(e) => !e.is_builder(),
            ExportError::Rejected { status } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ExportError::Compression(_)
            | ExportError::Cancelled
            | ExportError::RetriesExhausted { .. } => false,
        }
    }
}

/// Delivers write requests to their final destination.
///
/// The drain loop hands over every request read from the log in index order
/// and only considers them delivered when this returns `Ok`. On `Err` the same
/// requests are offered again on a later cycle, so an implementation must
/// tolerate seeing a payload more than once. Retries and timeouts within one
/// call are the implementation's business; `cancel` fires when the owner is
/// shutting down.
pub trait ExportSink: Send + Sync + 'static {
    fn export(
        &self,
        cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> impl Future<Output = Result<(), ExportError>> + Send;
}
