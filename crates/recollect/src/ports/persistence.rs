//! Key/value persistence for snapshots

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{MemoryError, Result};

/// Byte-oriented key/value store used to snapshot state across restarts
#[async_trait]
pub trait StatePersistencePort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Stores each key as a file under a base directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    base_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(MemoryError::Validation(format!(
                "invalid persistence key: {key:?}"
            )));
        }
        Ok(self.base_dir.join(format!("{key}.bin")))
    }
}

#[async_trait]
impl StatePersistencePort for FilePersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        // Write-then-rename so a crash never leaves a half-written snapshot
        let tmp = path.with_extension("bin.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Persisted {} bytes to {}", value.len(), path.display());
        Ok(())
    }
}

/// Process-local store, mostly for tests
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatePersistencePort for InMemoryPersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FilePersistence::new(dir.path().join("nested"));

        assert!(store.get("graph").await.unwrap().is_none());
        store.set("graph", b"hello").await.unwrap();
        assert_eq!(store.get("graph").await.unwrap().unwrap(), b"hello");

        store.set("graph", b"replaced").await.unwrap();
        assert_eq!(store.get("graph").await.unwrap().unwrap(), b"replaced");
    }

    #[tokio::test]
    async fn test_file_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FilePersistence::new(dir.path());
        assert!(matches!(
            store.set("../escape", b"x").await,
            Err(MemoryError::Validation(_))
        ));
        assert!(store.get("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryPersistence::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
