//! Audit event storage backends

use crate::AuditEvent;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// Destination of saved audit events
///
/// [`AuditScope::save`](crate::AuditScope::save) calls [`write`](AuditBackend::write)
/// at most once per event, from a task of its own, so a write is never cut
/// short by the request that produced the event being dropped.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Persist an audit event
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditBackendError>;
}

/// Audit backend errors
#[derive(Debug, thiserror::Error)]
pub enum AuditBackendError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Other(String),
}

/// Append-only JSON-lines audit log
///
/// The file is opened on the first write and the handle is kept for later
/// ones. Each event is one line, flushed before `write` returns. After a
/// failed write the handle is dropped and the next write reopens the file.
pub struct FileBackend {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileBackend {
    /// Create a backend appending to `path`
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use armature_request_audit::*;
    ///
    /// let backend = FileBackend::new("audit.log");
    /// ```
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        debug!(path = %self.path.display(), "Audit log opened");
        Ok(BufWriter::new(file))
    }
}

async fn append_line(writer: &mut BufWriter<File>, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

#[async_trait]
impl AuditBackend for FileBackend {
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditBackendError> {
        let mut line = event.to_json()?.into_bytes();
        line.push(b'\n');

        let mut slot = self.writer.lock().await;
        let mut writer = match slot.take() {
            Some(writer) => writer,
            None => self.open().await?,
        };

        // a failed append leaves the slot empty
        append_line(&mut writer, &line).await?;
        *slot = Some(writer);
        Ok(())
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// In-memory backend
///
/// Clones share the same storage, so a test can keep one clone and hand the
/// other to the middleware.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved events, oldest first
    pub async fn get_events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Saved events of one request
    pub async fn events_for_trace(&self, trace_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.action.trace_id == trace_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditBackend for MemoryBackend {
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditBackendError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditAction;

    fn event(event_type: &str, trace_id: &str) -> AuditEvent {
        let action = AuditAction {
            trace_id: trace_id.to_string(),
            ..Default::default()
        };
        AuditEvent::new(event_type, action)
    }

    #[tokio::test]
    async fn test_memory_backend_filters_by_trace() {
        let backend = MemoryBackend::new();
        backend.write(&event("GET /a", "t-1")).await.unwrap();
        backend.write(&event("GET /b", "t-2")).await.unwrap();
        backend.write(&event("GET /c", "t-1")).await.unwrap();

        assert_eq!(backend.get_events().await.len(), 3);
        let events = backend.events_for_trace("t-1").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "GET /c");
    }

    #[tokio::test]
    async fn test_file_backend_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let backend = FileBackend::new(&path);

        backend.write(&event("GET /one", "t-1")).await.unwrap();
        backend.write(&event("GET /two", "t-2")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["eventType"], "GET /one");
        assert_eq!(first["action"]["traceId"], "t-1");
    }

    #[tokio::test]
    async fn test_file_backend_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        tokio::fs::write(&path, "{\"eventType\":\"earlier\"}\n")
            .await
            .unwrap();

        let backend = FileBackend::new(&path);
        backend.write(&event("GET /later", "t-3")).await.unwrap();

        let contents = tokio::fs::read_to_string(backend.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.starts_with("{\"eventType\":\"earlier\"}"));
    }

    #[tokio::test]
    async fn test_file_backend_reports_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("missing").join("audit.log"));

        let result = backend.write(&event("GET /", "t-4")).await;
        assert!(matches!(result, Err(AuditBackendError::Io(_))));
    }
}
