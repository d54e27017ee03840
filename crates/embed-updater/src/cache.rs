use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EmbedError, Result};
use crate::store::FileStore;

/// Tag of the committed release; its presence defines a local version.
pub const RELEASE_TAG_FILE: &str = "release.tag";
/// Freshness token sent back as `If-Modified-Since`.
pub const MODIFIED_TAG_FILE: &str = "modified.tag";
/// Per-file freshness tokens of the per-file flow.
pub const ETAGS_FILE: &str = "etags.json";

const ASSET_KINDS: [&str; 3] = [".js", ".html", ".css"];

/// Whether `name` is a bundle asset (script, markup or style) rather than
/// bookkeeping.
pub fn is_asset(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    if matches!(file, RELEASE_TAG_FILE | MODIFIED_TAG_FILE | ETAGS_FILE) {
        return false;
    }
    ASSET_KINDS.iter().any(|kind| file.ends_with(kind))
}

/// Server-issued freshness tokens keyed by relative file path.
///
/// Shared between concurrent per-file checks; every file writes only its own key.
#[derive(Debug, Clone, Default)]
pub struct EtagMap {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl EtagMap {
    /// Decode a persisted `etags.json` document.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let map: BTreeMap<String, String> = serde_json::from_slice(raw)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(map)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token recorded for `name`, if any.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    /// Remember the token the server issued for `name`.
    pub fn record(&self, name: &str, token: &str) {
        self.lock().insert(name.to_string(), token.to_string());
    }

    /// Drop the token recorded for `name`.
    pub fn forget(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Keep only the tokens of files named in `names`.
    pub fn retain(&self, names: &[String]) {
        self.lock().retain(|name, _| names.contains(name));
    }

    /// Number of files with a recorded token.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no token is recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Encode for persistence as `etags.json`.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.lock())?)
    }
}

/// Identity of the last fully verified release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVersionMarkers {
    pub release_tag: Option<String>,
    pub modified_tag: Option<String>,
}

/// The local cache directory and everything persisted in it.
#[derive(Clone)]
pub struct CacheDir {
    files: Arc<dyn FileStore>,
    dir: PathBuf,
}

impl CacheDir {
    /// Resolve `subdir` under the store's default path, creating it if needed.
    pub async fn open(files: Arc<dyn FileStore>, subdir: &str) -> Result<Self> {
        let root = files.default_path().await.map_err(store_error)?;
        let dir = root.join(subdir);
        files.exists_or_create(&dir).await.map_err(store_error)?;
        Ok(Self { files, dir })
    }

    /// Absolute cache directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Backing file store.
    pub fn store(&self) -> &dyn FileStore {
        self.files.as_ref()
    }

    async fn read_text(&self, name: &str) -> Option<String> {
        match self.files.open(&self.dir.join(name)).await {
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(file = name, error = %err, "failed to read cache file");
                None
            }
        }
    }

    /// A local version exists once a release tag has been committed.
    pub async fn has_local_version(&self) -> bool {
        self.read_text(RELEASE_TAG_FILE).await.is_some()
    }

    /// Read both markers; missing or blank files read as `None`.
    pub async fn markers(&self) -> LocalVersionMarkers {
        LocalVersionMarkers {
            release_tag: self.read_text(RELEASE_TAG_FILE).await,
            modified_tag: self.read_text(MODIFIED_TAG_FILE).await,
        }
    }

    /// Commit the markers. The release tag goes last: it is what makes the
    /// cache count as a local version.
    pub async fn write_markers(&self, markers: &LocalVersionMarkers) -> Result<()> {
        match markers.modified_tag.as_deref() {
            Some(token) => self.save(MODIFIED_TAG_FILE, token.as_bytes()).await?,
            None => self.remove(MODIFIED_TAG_FILE).await?,
        }
        let tag = markers
            .release_tag
            .as_deref()
            .ok_or_else(|| EmbedError::Other("release tag is required".into()))?;
        self.save(RELEASE_TAG_FILE, tag.as_bytes()).await
    }

    /// Drop the committed release so the cache no longer counts as a local version.
    pub async fn clear_markers(&self) -> Result<()> {
        self.remove(RELEASE_TAG_FILE).await?;
        self.remove(MODIFIED_TAG_FILE).await
    }

    /// Load persisted freshness tokens; a missing or unreadable file yields an empty map.
    pub async fn load_etags(&self) -> EtagMap {
        match self.files.open(&self.dir.join(ETAGS_FILE)).await {
            Ok(Some(raw)) => EtagMap::from_json(&raw).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "discarding unreadable etag cache");
                EtagMap::default()
            }),
            Ok(None) => EtagMap::default(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read etag cache");
                EtagMap::default()
            }
        }
    }

    /// Persist freshness tokens as `etags.json`.
    pub async fn save_etags(&self, etags: &EtagMap) -> Result<()> {
        self.save(ETAGS_FILE, &etags.to_json()?).await
    }

    /// Asset files currently present in the cache.
    pub async fn cached_files(&self) -> Vec<String> {
        match self.files.list_directory(&self.dir).await {
            Ok(names) => names.into_iter().filter(|name| is_asset(name)).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list cached files");
                Vec::new()
            }
        }
    }

    /// Remove cached assets not named in `keep`, so a release with fewer files
    /// leaves nothing stale behind. Markers are left alone.
    pub async fn clear_cached_files(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for name in self.cached_files().await {
            if keep.contains(&name) {
                continue;
            }
            self.remove(&name).await?;
            removed += 1;
        }
        tracing::debug!(removed, "cleared stale cached files");
        Ok(removed)
    }

    /// Whether `name` is present in the cache. Store errors read as absent.
    pub async fn exists(&self, name: &str) -> bool {
        self.files
            .exists(&self.dir.join(name))
            .await
            .unwrap_or(false)
    }

    /// Read a cached file, logging and absorbing store errors.
    pub async fn open_asset(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .open(&self.dir.join(name))
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(file = name, error = %err, "failed to open cached file");
                None
            })
    }

    /// Write `content` as `name` under the cache directory.
    pub async fn save(&self, name: &str, content: &[u8]) -> Result<()> {
        self.files
            .save(&self.dir, name, content)
            .await
            .map_err(store_error)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.files
            .remove(&self.dir.join(name))
            .await
            .map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> EmbedError {
    EmbedError::Other(format!("file store: {err}"))
}
