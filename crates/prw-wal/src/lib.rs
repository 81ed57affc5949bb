//! Durable write-ahead buffering for Prometheus remote-write.
//!
//! Requests handed to a [`Wal`] are appended to an on-disk log before the
//! caller returns, then drained to an [`ExportSink`] in the background and
//! truncated once delivered. Nothing acknowledged is lost to a crash or
//! restart; a request may be delivered more than once.

pub mod codec;
pub mod config;
pub mod cursor;
mod drain;
pub mod exporter;
pub mod log;
pub mod pipeline;
pub mod proto;
pub mod sink;
pub mod wal;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, ExporterConfig, RetryPolicy, WalConfig};
pub use exporter::RemoteWriteExporter;
pub use log::{DurableLog, LogError, LogOptions};
pub use pipeline::RemoteWritePipeline;
pub use proto::WriteRequest;
pub use sink::{ExportError, ExportSink};
pub use wal::{Wal, WalError};
