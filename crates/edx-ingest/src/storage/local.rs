use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::error::{IngestError, Result};

/// Filesystem-backed object store using the same key layout as S3
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(IngestError::Config(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let key_owned = key.to_string();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| IngestError::upload(&key_owned, e))?
        .map_err(|e| IngestError::upload(&key_owned, e))?;

        debug!(key, "Stored object locally");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IngestError::ObjectMissing(key.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IngestError::upload(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
        let mut keys: Vec<String> = keys.into_iter().filter(|k| k.starts_with(&prefix)).collect();
        keys.sort();
        Ok(keys)
    }

    fn location(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

fn walk(root: &Path) -> std::io::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();

        store.put("p/raw/NRLDC/2025/08/a.zip", b"zip".to_vec(), "x").await.unwrap();
        store.put("p/processed/NRLDC/S/2025/08/s.jsonl", b"{}".to_vec(), "x").await.unwrap();

        assert_eq!(store.get("p/raw/NRLDC/2025/08/a.zip").await.unwrap(), b"zip");
        assert_eq!(
            store.list("p/processed/").await.unwrap(),
            vec!["p/processed/NRLDC/S/2025/08/s.jsonl".to_string()]
        );

        store.delete("p/raw/NRLDC/2025/08/a.zip").await.unwrap();
        assert!(matches!(
            store.get("p/raw/NRLDC/2025/08/a.zip").await,
            Err(IngestError::ObjectMissing(_))
        ));
        // deleting twice is fine
        store.delete("p/raw/NRLDC/2025/08/a.zip").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        assert!(store.put("../escape", vec![], "x").await.is_err());
        assert!(store.put("/abs", vec![], "x").await.is_err());
    }
}
