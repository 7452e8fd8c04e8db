use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Byte-level persistence used by the story library and the exporters.
/// Keys are `/`-separated paths relative to the storage root.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Keys of the entries directly under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        if tokio::fs::try_exists(&path).await? {
            if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut entries = Vec::new();
        if !dir.is_dir() {
            return Ok(entries);
        }

        let prefix = prefix.trim_matches('/');
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if prefix.is_empty() {
                entries.push(name);
            } else {
                entries.push(format!("{}/{}", prefix, name));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());

        storage.write("stories/b.json", b"{}").await?;
        storage.write("stories/a.json", b"[]").await?;

        assert!(storage.exists("stories/a.json").await?);
        assert_eq!(storage.read("stories/a.json").await?, b"[]".to_vec());
        assert_eq!(
            storage.list("stories").await?,
            vec!["stories/a.json".to_string(), "stories/b.json".to_string()]
        );

        storage.delete("stories/a.json").await?;
        assert!(!storage.exists("stories/a.json").await?);
        // Deleting twice is fine.
        storage.delete("stories/a.json").await?;

        assert!(storage.list("missing").await?.is_empty());
        assert!(storage.read("missing/x").await.is_err());
        Ok(())
    }
}
