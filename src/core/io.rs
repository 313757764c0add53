use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key);
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
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path(prefix);
        let mut entries = Vec::new();

        if dir.is_dir() {
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".tmp") {
                    continue;
                }
                entries.push(join_key(prefix, &name));
            }
        }

        entries.sort();
        Ok(entries)
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        Path::new(prefix).join(name).to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_roundtrip_creates_parents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());

        storage.write("users/1/profile.json", b"{}").await?;
        assert!(storage.exists("users/1/profile.json").await?);
        assert_eq!(storage.read("users/1/profile.json").await?, b"{}");
        assert!(!dir.path().join("users/1/profile.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_returns_keys_under_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());

        storage.write("drafts/b.json", b"1").await?;
        storage.write("drafts/a.json", b"2").await?;

        let keys = storage.list("drafts").await?;
        assert_eq!(keys, vec!["drafts/a.json".to_string(), "drafts/b.json".to_string()]);
        assert!(storage.list("missing").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());

        storage.delete("nothing.json").await?;
        storage.write("x.json", b"1").await?;
        storage.delete("x.json").await?;
        assert!(!storage.exists("x.json").await?);
        Ok(())
    }
}
