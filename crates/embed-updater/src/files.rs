//! Per-file acquisition and verification, used when a deployment publishes
//! individual files instead of one signed package.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;

use crate::archive::{enclosed_relative, rewrite_bytes, Direction};
use crate::cache::{CacheDir, EtagMap};
use crate::crypto::{Digester, SignatureVerifier};
use crate::error::{EmbedError, Result};
use crate::host::ProgressReporter;
use crate::transport::{Method, Resolver};

/// What happened to one file during an acquisition pass.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    /// The cached copy is still current.
    Reused,
    /// Freshly downloaded and verified.
    Fresh(Vec<u8>),
    /// Could not be downloaded within the retry budget.
    Unreachable,
    /// Downloaded but failed hash or signature verification.
    Rejected,
    /// Downloaded, but its hash companion could not be fetched.
    Unverifiable,
}

/// Aggregate of one acquisition pass.
#[derive(Debug, Default)]
pub struct Acquisition {
    /// Verified content in its signed (relative) form.
    pub fresh: Vec<(String, Vec<u8>)>,
    pub reused: Vec<String>,
    pub unreachable: Vec<String>,
    pub rejected: Vec<String>,
    pub unverifiable: Vec<String>,
}

impl Acquisition {
    /// True only when every file was either reused or verified.
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty() && self.rejected.is_empty() && self.unverifiable.is_empty()
    }
}

/// Fetches and verifies individual bundle files against their signed hashes.
pub struct FileVerifier {
    resolver: Resolver,
    verifier: SignatureVerifier,
    digester: Arc<dyn Digester>,
    progress: Arc<dyn ProgressReporter>,
    content_host: String,
    hash_hosts: Vec<String>,
    cursor: AtomicUsize,
}

impl FileVerifier {
    /// Files are served from `content_host`; hash companions from `hash_hosts`.
    pub fn new(
        resolver: Resolver,
        verifier: SignatureVerifier,
        digester: Arc<dyn Digester>,
        progress: Arc<dyn ProgressReporter>,
        content_host: impl Into<String>,
        hash_hosts: Vec<String>,
    ) -> Self {
        Self {
            resolver,
            verifier,
            digester,
            progress,
            content_host: content_host.into(),
            hash_hosts,
            cursor: AtomicUsize::new(0),
        }
    }

    fn file_url(&self, name: &str) -> String {
        format!("{}/{}", self.content_host, name)
    }

    /// Next hash host, round-robin, preferring hosts other than the content host.
    fn hash_host(&self) -> &str {
        let independent: Vec<&String> = self
            .hash_hosts
            .iter()
            .filter(|host| **host != self.content_host)
            .collect();
        let pool: Vec<&String> = if independent.is_empty() {
            self.hash_hosts.iter().collect()
        } else {
            independent
        };
        match pool.len() {
            0 => &self.content_host,
            len => pool[self.cursor.fetch_add(1, Ordering::Relaxed) % len],
        }
    }

    /// Names of the files making up the latest bundle. The listing is
    /// unsigned, so it is rejected outright when any name could resolve
    /// outside the cache directory.
    pub async fn list_files(&self, manifest: &str) -> Option<Vec<String>> {
        let fetched = self.resolver.fetch(&self.file_url(manifest), Method::Get).await?;
        match serde_json::from_slice::<Vec<String>>(&fetched.body) {
            Ok(names) if !names.is_empty() => {
                let enclosed: Option<Vec<String>> =
                    names.iter().map(|name| enclosed_relative(name)).collect();
                if enclosed.is_none() {
                    tracing::warn!(%manifest, ?names, "file list names a path outside the cache");
                }
                enclosed
            }
            Ok(_) => {
                tracing::warn!(%manifest, "file list is empty");
                None
            }
            Err(err) => {
                tracing::warn!(%manifest, error = %err, "file list malformed");
                None
            }
        }
    }

    /// Accept `content` only when its digest matches the published hash and
    /// the hash carries a trusted signature.
    pub async fn file_verified(&self, name: &str, content: &[u8]) -> bool {
        match self.verify_content(name, content).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(file = %name, error = %err, "file failed verification");
                false
            }
        }
    }

    /// Check `content` against the `{hash}|{signature}` companion published
    /// for `name`. An unreachable companion is a [`EmbedError::Transport`]
    /// error, a digest difference an [`EmbedError::IntegrityMismatch`].
    pub async fn verify_content(&self, name: &str, content: &[u8]) -> Result<()> {
        let url = format!("{}/hashes/{}", self.hash_host(), name);
        let fetched = self
            .resolver
            .fetch(&url, Method::Get)
            .await
            .ok_or_else(|| EmbedError::Transport(format!("hash companion unavailable at {url}")))?;

        let companion = String::from_utf8_lossy(&fetched.body);
        let (hash, signature) = companion.trim().split_once('|').ok_or_else(|| {
            tracing::debug!(file = %name, "hash companion malformed");
            EmbedError::SignatureRejected
        })?;
        let (hash, signature) = (hash.trim(), signature.trim());

        let actual = self.digester.digest(content);
        if !actual.eq_ignore_ascii_case(hash) {
            return Err(EmbedError::IntegrityMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        if !self.verifier.verify(hash, signature) {
            return Err(EmbedError::SignatureRejected);
        }
        Ok(())
    }

    /// Whether the server still reports the token recorded for `name`.
    pub async fn check_etag(&self, name: &str, etags: &EtagMap) -> bool {
        let Some(recorded) = etags.get(name) else {
            return false;
        };
        match self.resolver.fetch(&self.file_url(name), Method::Head).await {
            Some(fetched) => fetched.etag.as_deref() == Some(recorded.as_str()),
            None => false,
        }
    }

    async fn acquire_one(&self, name: &str, cache: &CacheDir, etags: &EtagMap) -> FileOutcome {
        if etags.get(name).is_some() && cache.exists(name).await && self.check_etag(name, etags).await
        {
            tracing::debug!(file = %name, "cached copy still current");
            return FileOutcome::Reused;
        }

        let Some(fetched) = self.resolver.fetch(&self.file_url(name), Method::Get).await else {
            return FileOutcome::Unreachable;
        };
        match self.verify_content(name, &fetched.body).await {
            Ok(()) => {}
            Err(err @ EmbedError::Transport(_)) => {
                tracing::warn!(file = %name, error = %err, "file could not be verified");
                return FileOutcome::Unverifiable;
            }
            Err(err) => {
                tracing::warn!(file = %name, error = %err, "file rejected");
                return FileOutcome::Rejected;
            }
        }

        match fetched.etag.as_deref() {
            Some(token) => etags.record(name, token),
            None => etags.forget(name),
        }
        FileOutcome::Fresh(fetched.body.to_vec())
    }

    /// Acquire every file concurrently. A failure taints the aggregate but
    /// does not cancel sibling checks.
    pub async fn acquire(&self, names: &[String], cache: &CacheDir, etags: &EtagMap) -> Acquisition {
        let total = names.len();
        let done = AtomicUsize::new(0);
        let outcomes = join_all(names.iter().map(|name| {
            let done = &done;
            async move {
                let outcome = self.acquire_one(name, cache, etags).await;
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                self.progress.progress(&format!("{name} {finished}/{total}"));
                (name.clone(), outcome)
            }
        }))
        .await;

        let mut acquisition = Acquisition::default();
        for (name, outcome) in outcomes {
            match outcome {
                FileOutcome::Reused => acquisition.reused.push(name),
                FileOutcome::Fresh(content) => acquisition.fresh.push((name, content)),
                FileOutcome::Unreachable => acquisition.unreachable.push(name),
                FileOutcome::Rejected => acquisition.rejected.push(name),
                FileOutcome::Unverifiable => acquisition.unverifiable.push(name),
            }
        }
        acquisition
    }

    /// Re-verify cached copies of `names`. A missing file fails the check.
    pub async fn check_cached_hashes(&self, names: &[String], cache: &CacheDir) -> bool {
        if names.is_empty() {
            return false;
        }
        let results = join_all(names.iter().map(|name| async move {
            let Some(content) = cache.open_asset(name).await else {
                tracing::warn!(file = %name, "cached file missing");
                return false;
            };
            let signed = rewrite_bytes(content, &self.content_host, Direction::Inbound);
            self.file_verified(name, &signed).await
        }))
        .await;
        results.into_iter().all(|verified| verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::crypto::testing::*;
    use crate::crypto::{Secp256k1Recovery, Sha256Digester, TrustedKeySet};
    use crate::host::TracingProgress;
    use crate::store::LocalFileStore;
    use crate::transport::testing::*;
    use tempfile::tempdir;

    const HOST: &str = "https://embed.example";
    const HASHES: &str = "https://api.example";

    fn verifier(transport: Arc<MockTransport>, hash_hosts: Vec<String>) -> FileVerifier {
        let signer = secret(5);
        FileVerifier::new(
            Resolver::new(
                transport,
                RetryPolicy {
                    attempts: 2,
                    timeout_ms: 500,
                    ..RetryPolicy::default()
                },
            ),
            SignatureVerifier::new(
                TrustedKeySet::new([public_hex(&signer)]).unwrap(),
                Arc::new(Secp256k1Recovery),
            ),
            Arc::new(Sha256Digester),
            Arc::new(TracingProgress),
            HOST,
            hash_hosts,
        )
    }

    fn publish(transport: &MockTransport, name: &str, content: &str, etag: &str) {
        let hash = Sha256Digester.digest(content.as_bytes());
        let signature = sign_hex(&secret(5), &hash);
        transport.route(
            &format!("{HOST}/{name}"),
            with_header(response(200, content.to_string()), "ETag", etag),
        );
        transport.ok(&format!("{HASHES}/hashes/{name}"), format!("{hash}|{signature}"));
    }

    async fn cache(root: &std::path::Path) -> CacheDir {
        CacheDir::open(Arc::new(LocalFileStore::new(root)), "cached_sources")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn verifies_hash_and_signature() {
        let transport = MockTransport::new();
        publish(&transport, "app.js", "console.log(1)", "\"1\"");
        let files = verifier(transport.clone(), vec![HOST.into(), HASHES.into()]);

        assert!(files.file_verified("app.js", b"console.log(1)").await);
        assert!(!files.file_verified("app.js", b"console.log(2)").await);
        // Companion always comes from the independent host.
        assert_eq!(transport.count(&format!("{HOST}/hashes/app.js")), 0);
    }

    #[tokio::test]
    async fn digest_mismatch_reports_both_hashes() {
        let transport = MockTransport::new();
        publish(&transport, "app.js", "console.log(1)", "\"1\"");
        let files = verifier(transport, vec![HASHES.into()]);

        let err = files.verify_content("app.js", b"console.log(2)").await.unwrap_err();
        let EmbedError::IntegrityMismatch { expected, actual } = err else {
            panic!("expected an integrity mismatch, got {err:?}");
        };
        assert_eq!(expected, Sha256Digester.digest(b"console.log(1)"));
        assert_eq!(actual, Sha256Digester.digest(b"console.log(2)"));
    }

    #[tokio::test]
    async fn missing_companion_is_a_transport_error() {
        let files = verifier(MockTransport::new(), vec![HASHES.into()]);
        assert!(matches!(
            files.verify_content("app.js", b"console.log(1)").await,
            Err(EmbedError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn file_list_with_escaping_names_is_rejected() {
        let transport = MockTransport::new();
        transport.ok(&format!("{HOST}/files.json"), r#"["index.html", "../escape.js"]"#);
        let files = verifier(transport.clone(), vec![HASHES.into()]);
        assert!(files.list_files("files.json").await.is_none());

        transport.ok(&format!("{HOST}/files.json"), r#"["index.html", "static//app.js"]"#);
        assert_eq!(
            files.list_files("files.json").await,
            Some(vec!["index.html".to_string(), "static/app.js".to_string()])
        );
    }

    #[tokio::test]
    async fn untrusted_signature_is_rejected() {
        let transport = MockTransport::new();
        let hash = Sha256Digester.digest(b"console.log(1)");
        let forged = sign_hex(&secret(6), &hash);
        transport.ok(&format!("{HASHES}/hashes/app.js"), format!("{hash}|{forged}"));
        let files = verifier(transport, vec![HASHES.into()]);

        assert!(!files.file_verified("app.js", b"console.log(1)").await);
    }

    #[tokio::test]
    async fn one_bad_file_fails_the_whole_pass() {
        let temp = tempdir().unwrap();
        let cache = cache(temp.path()).await;
        let transport = MockTransport::new();
        publish(&transport, "a.js", "a", "\"a\"");
        publish(&transport, "b.js", "b", "\"b\"");
        // Serve content that no longer matches the published hash.
        transport.ok(&format!("{HOST}/c.css"), "tampered");
        transport.ok(
            &format!("{HASHES}/hashes/c.css"),
            format!(
                "{}|{}",
                Sha256Digester.digest(b"original"),
                sign_hex(&secret(5), &Sha256Digester.digest(b"original"))
            ),
        );

        let files = verifier(transport, vec![HASHES.into()]);
        let names: Vec<String> = vec!["a.js".into(), "b.js".into(), "c.css".into()];
        let acquisition = files.acquire(&names, &cache, &EtagMap::default()).await;

        assert!(!acquisition.is_complete());
        assert_eq!(acquisition.rejected, vec!["c.css".to_string()]);
        assert_eq!(acquisition.fresh.len(), 2);
    }

    #[tokio::test]
    async fn matching_etag_reuses_existing_copy_only() {
        let temp = tempdir().unwrap();
        let cache = cache(temp.path()).await;
        let transport = MockTransport::new();
        publish(&transport, "app.js", "console.log(1)", "\"v1\"");
        publish(&transport, "gone.js", "gone", "\"v1\"");
        cache.save("app.js", b"console.log(1)").await.unwrap();

        let etags = EtagMap::default();
        etags.record("app.js", "\"v1\"");
        etags.record("gone.js", "\"v1\"");

        let files = verifier(transport.clone(), vec![HASHES.into()]);
        let names: Vec<String> = vec!["app.js".into(), "gone.js".into()];
        let acquisition = files.acquire(&names, &cache, &etags).await;

        assert!(acquisition.is_complete());
        assert_eq!(acquisition.reused, vec!["app.js".to_string()]);
        // The matching token could not stand in for a missing local copy.
        assert_eq!(acquisition.fresh.len(), 1);
        assert_eq!(acquisition.fresh[0].0, "gone.js");
        assert_eq!(transport.count(&format!("{HASHES}/hashes/app.js")), 0);
    }

    #[tokio::test]
    async fn cached_hashes_detect_tampering_and_deletion() {
        let temp = tempdir().unwrap();
        let cache = cache(temp.path()).await;
        let transport = MockTransport::new();
        publish(&transport, "index.html", "<img src=\"static/assets/a.png\">", "\"1\"");
        cache
            .save(
                "index.html",
                format!("<img src=\"{HOST}/static/assets/a.png\">").as_bytes(),
            )
            .await
            .unwrap();

        let files = verifier(transport, vec![HASHES.into()]);
        let names = vec!["index.html".to_string()];
        assert!(files.check_cached_hashes(&names, &cache).await);

        cache.save("index.html", b"breakme").await.unwrap();
        assert!(!files.check_cached_hashes(&names, &cache).await);

        let missing = vec!["index.html".to_string(), "missing.js".to_string()];
        assert!(!files.check_cached_hashes(&missing, &cache).await);
    }
}
