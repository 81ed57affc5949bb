#![allow(dead_code)]

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use prw_wal::proto::{Label, Sample, TimeSeries};
use prw_wal::{ExportError, ExportSink, WriteRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// In-process sink that records what the drain loop delivers.
#[derive(Default)]
pub struct CollectingSink {
    requests: Mutex<Vec<WriteRequest>>,
}

impl CollectingSink {
    pub fn requests(&self) -> Vec<WriteRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExportSink for CollectingSink {
    async fn export(
        &self,
        _cancel: &CancellationToken,
        requests: &[WriteRequest],
    ) -> Result<(), ExportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(requests);
        Ok(())
    }
}

/// A single-series request identified by `name`.
pub fn request(name: &str, value: f64, timestamp: i64) -> WriteRequest {
    WriteRequest {
        timeseries: vec![TimeSeries {
            labels: vec![Label {
                name: "__name__".into(),
                value: name.into(),
            }],
            samples: vec![Sample { value, timestamp }],
        }],
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A remote-write endpoint answering every request with `status` and
/// forwarding the snappy-decoded bodies.
pub struct RemoteWriteServer {
    pub url: Url,
    pub received: mpsc::UnboundedReceiver<WriteRequest>,
}

impl RemoteWriteServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(handle(stream, status, tx));
            }
        });

        Self {
            url: Url::parse(&format!("http://127.0.0.1:{port}/api/v1/write")).unwrap(),
            received,
        }
    }
}

async fn handle(mut stream: TcpStream, status: u16, tx: mpsc::UnboundedSender<WriteRequest>) {
    use prost::Message;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    if (200..300).contains(&status) {
        let body = &buf[head_end..head_end + content_length];
        let raw = snap::raw::Decoder::new().decompress_vec(body).unwrap();
        let _ = tx.send(WriteRequest::decode(raw.as_slice()).unwrap());
    }

    let response =
        format!("HTTP/1.1 {status} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
