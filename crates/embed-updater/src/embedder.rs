use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::archive::{rewrite_bytes, Archive, Direction};
use crate::cache::{CacheDir, EtagMap, LocalVersionMarkers};
use crate::config::{BundleFlow, EmbedderConfig};
use crate::crypto::{SignatureVerifier, TrustedKeySet};
use crate::error::{EmbedError, Result};
use crate::files::FileVerifier;
use crate::host::Host;
use crate::notices::Notice;
use crate::release::{Located, ReleaseDescriptor, ReleaseLocator};
use crate::transport::Resolver;

/// Progress of one update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    NoLocalVersion,
    HasLocalVersion,
    CheckingFreshness,
    Updating,
    VerifyingCache,
    /// Terminal: whether a verified bundle is available.
    Settled(bool),
}

/// Drives update checks against one local cache directory.
///
/// The embedding application must not run two checks concurrently on the
/// same cache.
pub struct Embedder {
    config: EmbedderConfig,
    host: Host,
    content_host: String,
    resolver: Resolver,
    verifier: SignatureVerifier,
    locator: ReleaseLocator,
    files: FileVerifier,
    state: Mutex<Option<CheckState>>,
}

impl Embedder {
    /// Validate the configuration and bind it to the host capabilities. Fails
    /// before any network activity when the configuration is unusable.
    pub fn new(config: EmbedderConfig, host: Host) -> Result<Self> {
        config.validate()?;
        let keys = TrustedKeySet::new(&config.trusted_keys)?;
        let verifier = SignatureVerifier::new(keys, host.recovery.clone());
        let resolver = Resolver::new(host.transport.clone(), config.retry.clone());
        let content_host = config.host();
        let locator = ReleaseLocator::new(config.release_url(), config.fallback_release_url());
        let files = FileVerifier::new(
            resolver.clone(),
            verifier.clone(),
            host.digester.clone(),
            host.progress.clone(),
            content_host.clone(),
            config.hash_hosts(),
        );

        Ok(Self {
            config,
            host,
            content_host,
            resolver,
            verifier,
            locator,
            files,
            state: Mutex::new(None),
        })
    }

    /// Configuration this engine was built with.
    pub fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    /// Last state the most recent check reached.
    pub fn state(&self) -> Option<CheckState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, state: CheckState) {
        tracing::info!(?state, "embed check");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    fn notify(&self, notice: Notice) {
        self.host.notifier.notify(notice.title(), notice.message());
    }

    async fn ask(&self, notice: Notice) -> bool {
        self.host.prompter.prompt(notice.title(), notice.message()).await
    }

    async fn open_cache(&self) -> Option<CacheDir> {
        match CacheDir::open(self.host.files.clone(), &self.config.cache_dir).await {
            Ok(cache) => Some(cache),
            Err(err) => {
                tracing::error!(error = %err, "failed to open embed cache");
                None
            }
        }
    }

    async fn markers(&self, cache: &CacheDir) -> LocalVersionMarkers {
        if self.config.force_refresh {
            return LocalVersionMarkers::default();
        }
        cache.markers().await
    }

    /// Whether a fully verified release has been committed locally.
    pub async fn has_local_version(&self) -> bool {
        if self.config.force_refresh {
            return false;
        }
        match self.open_cache().await {
            Some(cache) => cache.has_local_version().await,
            None => false,
        }
    }

    /// Whether `descriptor` differs from the locally committed release.
    pub async fn version_available(&self, descriptor: &ReleaseDescriptor) -> bool {
        let Some(cache) = self.open_cache().await else {
            return true;
        };
        is_newer(descriptor, &self.markers(&cache).await)
    }

    /// Asset files currently cached, as relative paths.
    pub async fn local_files(&self) -> Vec<String> {
        match self.open_cache().await {
            Some(cache) => cache.cached_files().await,
            None => Vec::new(),
        }
    }

    /// Re-verify every cached asset against its published hash.
    pub async fn check_cached_hashes(&self) -> bool {
        let Some(cache) = self.open_cache().await else {
            return false;
        };
        let names = cache.cached_files().await;
        self.files.check_cached_hashes(&names, &cache).await
    }

    /// Download the release package and verify the signature embedded in its
    /// asset name against the package digest.
    pub async fn fetch_archive(&self, descriptor: &ReleaseDescriptor) -> Option<Vec<u8>> {
        match self.download_archive(descriptor).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "release package rejected");
                None
            }
        }
    }

    async fn download_archive(&self, descriptor: &ReleaseDescriptor) -> Result<Vec<u8>> {
        let archive = descriptor.archive().ok_or_else(|| {
            EmbedError::Transport(format!("release {} ships no package", descriptor.tag()))
        })?;
        let signature = archive.signature().ok_or(EmbedError::SignatureRejected)?;

        self.host.progress.progress("Scatter Update 0/1");
        let fetched = self.resolver.fetch_required(archive.url()).await?;
        let digest = self.host.digester.digest(&fetched.body);
        if !self.verifier.verify(&digest, signature) {
            return Err(EmbedError::SignatureRejected);
        }
        self.host.progress.progress("Scatter Update 1/1");
        tracing::info!(package = archive.name(), %digest, "release package verified");
        Ok(fetched.body.to_vec())
    }

    /// Run one update check. Resolves to whether a verified bundle is now
    /// available locally; never fails.
    pub async fn check(&self) -> bool {
        let available = self.run_check().await;
        self.enter(CheckState::Settled(available));
        available
    }

    async fn run_check(&self) -> bool {
        let Some(cache) = self.open_cache().await else {
            return false;
        };
        let markers = self.markers(&cache).await;
        let has_local = markers.release_tag.is_some();
        self.enter(if has_local {
            CheckState::HasLocalVersion
        } else {
            CheckState::NoLocalVersion
        });

        self.enter(CheckState::CheckingFreshness);
        let previous = if has_local {
            markers.modified_tag.as_deref()
        } else {
            None
        };
        let descriptor = match self.locator.locate(&self.resolver, previous).await {
            Ok(Located::Release(descriptor)) => descriptor,
            Ok(Located::NotModified) if has_local => {
                return self.settle_current(&cache, &markers).await;
            }
            Ok(Located::NotModified) => {
                // Without a local version "not modified" proves nothing; ask unconditionally.
                match self.locator.locate(&self.resolver, None).await {
                    Ok(Located::Release(descriptor)) => descriptor,
                    _ => {
                        self.notify(Notice::ReleaseUnavailable);
                        return false;
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "release information unavailable");
                self.notify(Notice::ReleaseUnavailable);
                return false;
            }
        };

        if has_local && !is_newer(&descriptor, &markers) {
            return self.settle_current(&cache, &markers).await;
        }

        if let Err(err) = descriptor.requires_client(&self.config.client_version) {
            tracing::error!(error = %err, "release incompatible with this client");
            self.notify(Notice::ClientOutdated);
            return false;
        }

        if has_local && !self.ask(Notice::UpdateAvailable).await {
            tracing::info!(tag = %descriptor.tag(), "update declined, keeping cached release");
            return true;
        }

        self.update(&cache, &descriptor, has_local).await
    }

    /// No newer release: decide whether the existing cache can be served.
    async fn settle_current(&self, cache: &CacheDir, markers: &LocalVersionMarkers) -> bool {
        if self.config.flow == BundleFlow::Archive {
            return true;
        }

        self.enter(CheckState::VerifyingCache);
        let names = match self.files.list_files(&self.config.files_manifest).await {
            Some(names) => names,
            None => cache.cached_files().await,
        };
        if self.files.check_cached_hashes(&names, cache).await {
            return true;
        }

        if self.ask(Notice::CachedCopyUnverified).await {
            self.enter(CheckState::Updating);
            return self.update_per_file(cache, markers, true, true).await;
        }
        tracing::warn!("keeping cached files that failed verification at the user's request");
        true
    }

    async fn update(&self, cache: &CacheDir, descriptor: &ReleaseDescriptor, has_local: bool) -> bool {
        self.enter(CheckState::Updating);
        let stamp = LocalVersionMarkers {
            release_tag: Some(descriptor.tag().to_string()),
            modified_tag: descriptor.last_modified.clone(),
        };
        match self.config.flow {
            BundleFlow::Archive => self.update_from_archive(cache, descriptor, &stamp, has_local).await,
            BundleFlow::PerFile => self.update_per_file(cache, &stamp, has_local, false).await,
        }
    }

    async fn update_from_archive(
        &self,
        cache: &CacheDir,
        descriptor: &ReleaseDescriptor,
        stamp: &LocalVersionMarkers,
        has_local: bool,
    ) -> bool {
        let archive = match self
            .download_archive(descriptor)
            .await
            .and_then(Archive::open)
        {
            Ok(archive) => archive,
            Err(err) => return self.acquisition_failed(&err, has_local).await,
        };

        let committed = async {
            cache.clear_markers().await?;
            cache.clear_cached_files(&HashSet::new()).await?;
            archive
                .extract(
                    cache.store(),
                    cache.path(),
                    &self.content_host,
                    self.host.progress.as_ref(),
                )
                .await?;
            cache.write_markers(stamp).await?;
            Ok::<_, EmbedError>(())
        };

        match committed.await {
            Ok(()) => {
                tracing::info!(tag = ?stamp.release_tag, "embed release installed");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install release package");
                self.install_failed(cache, &err).await
            }
        }
    }

    async fn update_per_file(
        &self,
        cache: &CacheDir,
        stamp: &LocalVersionMarkers,
        has_local: bool,
        from_scratch: bool,
    ) -> bool {
        let Some(names) = self.files.list_files(&self.config.files_manifest).await else {
            self.notify(Notice::FileListUnavailable);
            return has_local && self.ask(Notice::KeepCached).await;
        };

        let etags = if from_scratch {
            EtagMap::default()
        } else {
            cache.load_etags().await
        };
        let acquisition = self.files.acquire(&names, cache, &etags).await;
        if !acquisition.is_complete() {
            tracing::warn!(
                rejected = ?acquisition.rejected,
                unverifiable = ?acquisition.unverifiable,
                unreachable = ?acquisition.unreachable,
                "per-file acquisition failed"
            );
            let notice = if !acquisition.rejected.is_empty() {
                Some(Notice::HashMismatch)
            } else if !acquisition.unverifiable.is_empty() {
                Some(Notice::ApiUnreachable)
            } else if !has_local {
                Some(Notice::WebAppUnreachable)
            } else {
                None
            };
            if let Some(notice) = notice {
                self.notify(notice);
            }
            return has_local && self.ask(Notice::KeepCached).await;
        }

        let keep: HashSet<String> = acquisition.reused.iter().cloned().collect();
        etags.retain(&names);
        let committed = async {
            cache.clear_markers().await?;
            cache.clear_cached_files(&keep).await?;
            for (name, content) in acquisition.fresh {
                let content = rewrite_bytes(content, &self.content_host, Direction::Outbound);
                cache.save(&name, &content).await?;
            }
            cache.save_etags(&etags).await?;
            cache.write_markers(stamp).await?;
            Ok::<_, EmbedError>(())
        };

        match committed.await {
            Ok(()) => {
                tracing::info!(tag = ?stamp.release_tag, reused = keep.len(), "embed files installed");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to write verified files");
                self.install_failed(cache, &err).await
            }
        }
    }

    /// Download or verification failed before the cache was touched.
    async fn acquisition_failed(&self, err: &EmbedError, has_local: bool) -> bool {
        tracing::warn!(error = %err, "release acquisition failed");
        match err {
            EmbedError::SignatureRejected
            | EmbedError::IntegrityMismatch { .. }
            | EmbedError::CorruptArchive(_) => self.notify(Notice::HashMismatch),
            _ if !has_local => self.notify(Notice::WebAppUnreachable),
            _ => {}
        }
        has_local && self.ask(Notice::KeepCached).await
    }

    /// The cache was already cleared when installing failed. Corrupt entries
    /// inside a verified package are an integrity problem; anything else is
    /// the local disk.
    async fn install_failed(&self, cache: &CacheDir, err: &EmbedError) -> bool {
        if let Err(err) = cache.clear_markers().await {
            tracing::error!(error = %err, "failed to invalidate cache markers");
        }
        let notice = match err {
            EmbedError::CorruptArchive(_) => Notice::HashMismatch,
            _ => Notice::InstallFailed,
        };
        self.notify(notice);
        false
    }
}

fn is_newer(descriptor: &ReleaseDescriptor, markers: &LocalVersionMarkers) -> bool {
    match markers.release_tag.as_deref() {
        Some(local) => local.trim() != descriptor.tag(),
        None => true,
    }
}
