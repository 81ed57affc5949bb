use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::WalConfig;
use crate::proto::WriteRequest;
use crate::sink::ExportSink;
use crate::wal::{Wal, WalError};

/// Front door for an exporter that may or may not buffer through a WAL.
///
/// With a WAL, pushed requests are persisted and delivered later by the
/// drain loop. Without one they go straight to the sink.
pub struct RemoteWritePipeline<S> {
    sink: Arc<S>,
    wal: Option<Arc<Wal<S>>>,
}

impl<S: ExportSink> RemoteWritePipeline<S> {
    pub fn new(wal_config: Option<WalConfig>, sink: Arc<S>) -> Result<Self, WalError> {
        let wal = Wal::new(wal_config, Arc::clone(&sink))?.map(Arc::new);
        if wal.is_none() {
            info!("write-ahead log disabled, exporting directly");
        }
        Ok(Self { sink, wal })
    }

    pub fn is_buffered(&self) -> bool {
        self.wal.is_some()
    }

    pub fn wal(&self) -> Option<&Wal<S>> {
        self.wal.as_deref()
    }

    /// Start draining the WAL, if there is one.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), WalError> {
        match &self.wal {
            Some(wal) => wal.run(cancel),
            None => Ok(()),
        }
    }

    /// Hand `requests` on for delivery. With a WAL this returns once they are
    /// durable; the appends and syncs run on the blocking pool.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), WalError> {
        if requests.is_empty() {
            return Ok(());
        }
        match &self.wal {
            Some(wal) => {
                let wal = Arc::clone(wal);
                let requests = requests.to_vec();
                tokio::task::spawn_blocking(move || wal.persist_to_wal(&requests)).await?
            }
            None => Ok(self.sink.export(cancel, requests).await?),
        }
    }

    /// Stop the WAL. Without a WAL there is nothing to stop.
    pub async fn shutdown(&self) -> Result<(), WalError> {
        match &self.wal {
            Some(wal) => wal.stop().await,
            None => Ok(()),
        }
    }
}
