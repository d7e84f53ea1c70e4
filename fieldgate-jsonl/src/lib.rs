//! JSONL backends for `fieldgate`. Each write appends one line.
//! Always appends; bring your own path.

use async_trait::async_trait;
use fieldgate::telemetry::{event_to_json, AdmissionEvent, TelemetrySink};
use fieldgate::{Persistence, Submission};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::UNIX_EPOCH;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Appends each accepted submission to a file as one JSON object per line.
///
/// Workers share one file handle; appends are serialized so lines never
/// interleave. The file is opened on first write.
#[derive(Debug, Clone)]
pub struct JsonlPersistence {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl JsonlPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: Arc::new(Mutex::new(None)) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path).await
    }
}

/// One line of output for `submission`.
///
/// A body that parses as JSON is embedded as-is; anything else is stored as a
/// (lossy) UTF-8 string.
pub fn submission_to_json(submission: &Submission) -> serde_json::Value {
    let body = serde_json::from_slice::<serde_json::Value>(&submission.body)
        .unwrap_or_else(|_| json!(String::from_utf8_lossy(&submission.body)));
    let received_at_ms = submission
        .received_at
        .duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default();
    json!({
        "submitter": submission.submitter,
        "fingerprint": submission.fingerprint,
        "received_at_ms": received_at_ms,
        "body": body,
    })
}

#[async_trait]
impl Persistence<Submission> for JsonlPersistence {
    type Error = io::Error;

    async fn store(&self, item: Submission) -> Result<(), io::Error> {
        let line = submission_to_json(&item).to_string() + "\n";
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "jsonl file not open"));
        };
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), io::Error> {
        self.open().await.map(drop)
    }

    async fn close(&self) -> Result<(), io::Error> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tracing::debug!(target: "fieldgate::jsonl", path = %self.path.display(), "jsonl persistence closed");
        Ok(())
    }
}

/// Telemetry sink writing one admission event per line.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl tower::Service<AdmissionEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn submission(body: &[u8]) -> Submission {
        Submission {
            submitter: "crew-1".into(),
            fingerprint: "ab".repeat(32),
            body: body.to_vec(),
            received_at: UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
        }
    }

    #[test]
    fn json_bodies_are_embedded() {
        let value = submission_to_json(&submission(br#"{"status":"working","progress":40}"#));
        assert_eq!(value["submitter"], "crew-1");
        assert_eq!(value["received_at_ms"], 1_700_000_000_123u64);
        assert_eq!(value["body"]["progress"], 40);
    }

    #[test]
    fn other_bodies_are_strings() {
        let value = submission_to_json(&Submission {
            received_at: SystemTime::UNIX_EPOCH,
            ..submission(b"lat=1.0;lon=2.0")
        });
        assert_eq!(value["body"], "lat=1.0;lon=2.0");
        assert_eq!(value["received_at_ms"], 0);
    }
}
