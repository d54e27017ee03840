use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

/// Persistent file storage owned by the embedding application.
///
/// Paths handed to the store are always rooted at [`FileStore::default_path`].
/// Names passed to [`FileStore::save`] may contain `/` separators; the store is
/// expected to create intermediate directories.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Root directory the embed cache lives under.
    async fn default_path(&self) -> anyhow::Result<PathBuf>;

    /// Create `dir` (and its parents) unless it already exists.
    async fn exists_or_create(&self, dir: &Path) -> anyhow::Result<()>;

    /// Whether a file or directory exists at `path`.
    async fn exists(&self, path: &Path) -> anyhow::Result<bool>;

    /// Write `content` to `dir/name`. Readers must never observe a partially
    /// written file.
    async fn save(&self, dir: &Path, name: &str, content: &[u8]) -> anyhow::Result<()>;

    /// Read a file, returning `None` when it does not exist.
    async fn open(&self, path: &Path) -> anyhow::Result<Option<Vec<u8>>>;

    /// Relative paths of every file below `dir`, using `/` separators.
    async fn list_directory(&self, dir: &Path) -> anyhow::Result<Vec<String>>;

    /// Delete the file at `path`. A missing file is not an error.
    async fn remove(&self, path: &Path) -> anyhow::Result<()>;
}

/// [`FileStore`] backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Store rooted at `root`, which becomes the default path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn default_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.root.clone())
    }

    async fn exists_or_create(&self, dir: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn save(&self, dir: &Path, name: &str, content: &[u8]) -> anyhow::Result<()> {
        let target = dir.join(name);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.to_path_buf());
        tokio::fs::create_dir_all(&parent).await?;

        // Stage next to the target so the final rename never crosses filesystems.
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut staged = NamedTempFile::new_in(&parent)?;
            staged.write_all(&content)?;
            staged.flush()?;
            staged.as_file().sync_all()?;
            staged.persist(&target)?;
            Ok(())
        })
        .await?
    }

    async fn open(&self, path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_directory(&self, dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        if !tokio::fs::try_exists(dir).await? {
            return Ok(names);
        }

        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(dir) {
                    let name = relative
                        .components()
                        .map(|part| part.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn saves_lists_and_removes_nested_files() {
        let temp = tempdir().unwrap();
        let store = LocalFileStore::new(temp.path());
        let dir = store.default_path().await.unwrap().join("cache");

        store.exists_or_create(&dir).await.unwrap();
        store.save(&dir, "index.html", b"<html/>").await.unwrap();
        store.save(&dir, "static/js/app.js", b"app").await.unwrap();

        let names = store.list_directory(&dir).await.unwrap();
        assert_eq!(names, vec!["index.html".to_string(), "static/js/app.js".to_string()]);

        let content = store.open(&dir.join("static/js/app.js")).await.unwrap();
        assert_eq!(content.as_deref(), Some(&b"app"[..]));

        store.remove(&dir.join("index.html")).await.unwrap();
        assert!(!store.exists(&dir.join("index.html")).await.unwrap());
        // Removing twice is not an error.
        store.remove(&dir.join("index.html")).await.unwrap();
        assert!(store.open(&dir.join("index.html")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_existing_file_without_leftovers() {
        let temp = tempdir().unwrap();
        let store = LocalFileStore::new(temp.path());

        store.save(temp.path(), "release.tag", b"v1.0.0").await.unwrap();
        store.save(temp.path(), "release.tag", b"v1.2.0").await.unwrap();

        let content = store.open(&temp.path().join("release.tag")).await.unwrap();
        assert_eq!(content.as_deref(), Some(&b"v1.2.0"[..]));
        // The staging file was renamed into place, not left beside it.
        assert_eq!(
            store.list_directory(temp.path()).await.unwrap(),
            vec!["release.tag".to_string()]
        );
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_empty() {
        let temp = tempdir().unwrap();
        let store = LocalFileStore::new(temp.path());
        let names = store.list_directory(&temp.path().join("nope")).await.unwrap();
        assert!(names.is_empty());
    }
}
