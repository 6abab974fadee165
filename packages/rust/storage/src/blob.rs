//! Blob store: flat key → bytes containers for page text and the baseline.
//!
//! Keys are `/`-separated relative paths (`contoso/_docs_intro_20240102.txt`).
//! Writes overwrite, deletes of absent keys are no-ops.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use siteindexer_shared::{Result, SiteIndexerError};

/// Key/value content storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `content` under `key`, replacing any previous value.
    async fn put(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Fetch the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(SiteIndexerError::validation(format!(
            "invalid blob key '{key}'"
        )));
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(SiteIndexerError::validation(format!(
            "blob key '{key}' escapes the container"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Blob store backed by a directory, one file per key.
///
/// The directory is created on first write. Writes go to a temporary sibling
/// file that is renamed into place, so readers never observe partial content.
pub struct FsBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SiteIndexerError::io(parent, e))?;
        }

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.{}.{n}.tmp", std::process::id()));

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| SiteIndexerError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SiteIndexerError::io(&path, e));
        }

        tracing::debug!(key, bytes = content.len(), "blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SiteIndexerError::io(&path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(key, "blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SiteIndexerError::io(&path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SiteIndexerError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SiteIndexerError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SiteIndexerError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Blob store held in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| SiteIndexerError::Storage("memory blob store poisoned".into()))
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.lock()?.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.lock()?.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_put_overwrites_and_creates_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("container"));

        store.put("proj/_a_20240101.txt", b"one").await.unwrap();
        store.put("proj/_a_20240101.txt", b"two").await.unwrap();

        assert_eq!(
            store.get("proj/_a_20240101.txt").await.unwrap().as_deref(),
            Some(&b"two"[..])
        );
        assert_eq!(store.list("proj/").await.unwrap(), ["proj/_a_20240101.txt"]);
    }

    #[tokio::test]
    async fn fs_delete_absent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(!store.delete("proj/missing.txt").await.unwrap());
        store.put("proj/x.txt", b"x").await.unwrap();
        assert!(store.delete("proj/x.txt").await.unwrap());
        assert!(store.get("proj/x.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fs_list_filters_prefix_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("a/1.txt", b"1").await.unwrap();
        store.put("a-sitemap/sitemap.csv", b"h").await.unwrap();
        store.put("b/2.txt", b"2").await.unwrap();
        std::fs::write(dir.path().join("a/.1.txt.0.tmp"), b"partial").unwrap();

        assert_eq!(store.list("a/").await.unwrap(), ["a/1.txt"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../evil.txt", b"x").await.is_err());
        assert!(store.put("/abs.txt", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());

        let mem = MemoryBlobStore::new();
        assert!(mem.put("a/../../b", b"x").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        let store = MemoryBlobStore::new();
        store.put("p/a.txt", b"a").await.unwrap();
        store.put("p/a.txt", b"b").await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.delete("p/a.txt").await.unwrap());
        assert!(!store.delete("p/a.txt").await.unwrap());
        assert!(store.is_empty());
    }
}
