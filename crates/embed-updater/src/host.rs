use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::{Digester, SignerRecovery};
use crate::error::{EmbedError, Result};
use crate::store::FileStore;
use crate::transport::{HttpTransport, Transport};

/// Fire-and-forget user notification.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Trait implemented by host applications to ask the user a yes/no question.
/// The engine suspends until the answer arrives.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, title: &str, message: &str) -> bool;
}

/// Fire-and-forget progress reporting.
pub trait ProgressReporter: Send + Sync {
    fn progress(&self, update: &str);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        tracing::warn!(%title, %message, "notification");
    }
}

/// Prompter used when the host did not supply one: logs the question and
/// declines.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecliningPrompter;

#[async_trait]
impl Prompter for DecliningPrompter {
    async fn prompt(&self, title: &str, message: &str) -> bool {
        tracing::info!(%title, %message, "prompt declined, no prompter configured");
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn progress(&self, update: &str) {
        tracing::debug!(%update, "progress");
    }
}

/// Capability set injected by the embedding application.
#[derive(Clone)]
pub struct Host {
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) digester: Arc<dyn Digester>,
    pub(crate) recovery: Arc<dyn SignerRecovery>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) prompter: Arc<dyn Prompter>,
    pub(crate) progress: Arc<dyn ProgressReporter>,
}

impl Host {
    /// Create a new builder.
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }
}

/// Builder for [`Host`].
#[derive(Default)]
pub struct HostBuilder {
    files: Option<Arc<dyn FileStore>>,
    digester: Option<Arc<dyn Digester>>,
    recovery: Option<Arc<dyn SignerRecovery>>,
    transport: Option<Arc<dyn Transport>>,
    notifier: Option<Arc<dyn Notifier>>,
    prompter: Option<Arc<dyn Prompter>>,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl HostBuilder {
    /// Storage holding the cache directory.
    pub fn files(mut self, files: impl FileStore + 'static) -> Self {
        self.files = Some(Arc::new(files));
        self
    }

    /// Hash function used for packages and files.
    pub fn digester(mut self, digester: impl Digester + 'static) -> Self {
        self.digester = Some(Arc::new(digester));
        self
    }

    /// Maps a signature back to the identity of its signer.
    pub fn signer_recovery(mut self, recovery: impl SignerRecovery + 'static) -> Self {
        self.recovery = Some(Arc::new(recovery));
        self
    }

    /// Provide a custom transport. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where notifications go. Defaults to [`TracingNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Who answers yes/no prompts. Defaults to [`DecliningPrompter`].
    pub fn prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Where progress updates go. Defaults to [`TracingProgress`].
    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Build the capability set. The file store, digest function and signer
    /// recovery have no sensible default and must be provided.
    pub fn build(self) -> Result<Host> {
        let files = self
            .files
            .ok_or_else(|| EmbedError::configuration("a file store is required"))?;
        let digester = self
            .digester
            .ok_or_else(|| EmbedError::configuration("a digest function is required"))?;
        let recovery = self
            .recovery
            .ok_or_else(|| EmbedError::configuration("a signature recovery function is required"))?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::builder().build()?),
        };

        Ok(Host {
            files,
            digester,
            recovery,
            transport,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            prompter: self.prompter.unwrap_or_else(|| Arc::new(DecliningPrompter)),
            progress: self.progress.unwrap_or_else(|| Arc::new(TracingProgress)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Secp256k1Recovery, Sha256Digester};
    use crate::store::LocalFileStore;

    #[test]
    fn missing_capabilities_are_configuration_errors() {
        let err = Host::builder()
            .digester(Sha256Digester)
            .signer_recovery(Secp256k1Recovery)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EmbedError::Configuration(ref msg) if msg.contains("file store")));

        let err = Host::builder()
            .files(LocalFileStore::new("/tmp/embed"))
            .signer_recovery(Secp256k1Recovery)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EmbedError::Configuration(ref msg) if msg.contains("digest")));
    }

    #[tokio::test]
    async fn default_prompter_declines() {
        assert!(!DecliningPrompter.prompt("title", "message").await);
    }
}
