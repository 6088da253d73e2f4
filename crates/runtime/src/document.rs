//! Document writes and the per-document write lock.
//!
//! The coordinator takes the lock only around inserting content, never
//! around server calls.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document write rejected: {0}")]
    Rejected(String),
}

/// Scoped write lock for one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentLock {
    inner: Arc<Mutex<()>>,
}

/// A held document lock; dropping it releases the lock.
#[derive(Debug)]
pub struct DocumentGuard {
    _guard: OwnedMutexGuard<()>,
}

impl DocumentGuard {
    pub fn release(self) {}
}

impl DocumentLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    pub async fn acquire(&self) -> DocumentGuard {
        DocumentGuard {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self) -> Option<DocumentGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| DocumentGuard { _guard: guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Where generated content ends up.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    fn path(&self) -> &str;

    fn lock(&self) -> &DocumentLock;

    /// Insert `text` at the writer's cursor. Callers hold [`lock`](Self::lock).
    async fn insert(&self, text: &str) -> Result<(), DocumentError>;
}

/// Appends to a file on disk.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    display: String,
    lock: DocumentLock,
}

impl FileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            display: path.display().to_string(),
            path,
            lock: DocumentLock::new(),
        }
    }
}

#[async_trait]
impl DocumentWriter for FileWriter {
    fn path(&self) -> &str {
        &self.display
    }

    fn lock(&self) -> &DocumentLock {
        &self.lock
    }

    async fn insert(&self, text: &str) -> Result<(), DocumentError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Collects writes in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    path: String,
    lock: DocumentLock,
    content: SyncMutex<String>,
}

impl MemoryWriter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn content(&self) -> String {
        self.content.lock().clone()
    }
}

#[async_trait]
impl DocumentWriter for MemoryWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> &DocumentLock {
        &self.lock
    }

    async fn insert(&self, text: &str) -> Result<(), DocumentError> {
        self.content.lock().push_str(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_respects_holder() {
        let lock = DocumentLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        guard.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn run_exclusive_holds_lock() {
        let lock = DocumentLock::new();
        let held = lock
            .run_exclusive(|| async { lock.try_acquire().is_none() })
            .await;
        assert!(held);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn file_writer_appends() {
        let path = std::env::temp_dir().join(format!("steward-{}.md", uuid::Uuid::new_v4()));
        let writer = FileWriter::new(&path);
        writer.insert("one ").await.unwrap();
        writer.insert("two").await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "one two");
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
