//! File-based audit sink.
//!
//! Appends one JSON record per line. The file is opened in append mode and
//! every line is flushed and synced before `append` returns, so a record the
//! vault reports as written survives a crash. Only a full-vault wipe ever
//! truncates it.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::AuditSink;
use crate::error::AuditError;

const SINK_NAME: &str = "file";

/// Audit sink writing JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl FileAuditSink {
    /// The file is created (or opened for append) lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failure(&self, what: &str, e: impl std::fmt::Display) -> AuditError {
        AuditError::SinkFailure {
            sink: SINK_NAME.to_owned(),
            reason: format!("{what} '{}': {e}", self.path.display()),
        }
    }

    async fn writer(&self) -> Result<MutexGuard<'_, Option<File>>, AuditError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.failure("cannot create directory for", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure("failed to open audit file", e))?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn append(&self, line: &str) -> Result<(), AuditError> {
        let mut buf = Vec::with_capacity(line.len().saturating_add(1));
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let mut guard = self.writer().await?;
        let result = match guard.as_mut() {
            Some(file) => match file.write_all(&buf).await {
                Ok(()) => match file.flush().await {
                    Ok(()) => file.sync_data().await.map_err(|e| self.failure("sync failed on", e)),
                    Err(e) => Err(self.failure("flush failed on", e)),
                },
                Err(e) => Err(self.failure("write failed on", e)),
            },
            None => Err(self.failure("no open handle for", "writer missing after open")),
        };
        if result.is_err() {
            // Reopen on the next attempt.
            *guard = None;
        }
        result
    }

    async fn read_all(&self) -> Result<Vec<String>, AuditError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.failure("failed to read audit file", e)),
        };
        Ok(bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect())
    }

    async fn reset(&self) -> Result<(), AuditError> {
        let mut guard = self.writer.lock().await;
        *guard = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| self.failure("failed to truncate audit file", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.failure("sync failed on", e))
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");
        let sink = FileAuditSink::new(&path);
        sink.append(r#"{"sequence":1}"#).await.unwrap();
        sink.append(r#"{"sequence":2}"#).await.unwrap();

        let again = FileAuditSink::new(&path);
        assert_eq!(
            again.read_all().await.unwrap(),
            vec![r#"{"sequence":1}"#, r#"{"sequence":2}"#]
        );
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"sequence\":1}\n{\"sequence\":2}\n"
        );
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("absent.jsonl"));
        assert!(sink.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_truncates_and_appends_continue() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("audit.jsonl"));
        sink.append("one").await.unwrap();
        sink.reset().await.unwrap();
        assert!(sink.read_all().await.unwrap().is_empty());
        sink.append("two").await.unwrap();
        assert_eq!(sink.read_all().await.unwrap(), vec!["two"]);
    }
}
