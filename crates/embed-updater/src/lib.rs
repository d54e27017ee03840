//! Signed, cached and incrementally refreshed web-wallet embed bundles.
//!
//! A host application ships without its web front-end and instead pulls the
//! latest published bundle at startup. This crate discovers the latest
//! release, downloads it, proves that it was signed by one of a fixed set of
//! trusted keys, and installs it into a local cache that the host serves from.
//! The host injects file storage, hashing, signer recovery, networking and
//! user prompts through [`Host`].
//!
//! ```ignore
//! use embed_updater::{
//!     Embedder, EmbedderConfig, Host, LocalFileStore, Secp256k1Recovery, Sha256Digester,
//! };
//!
//! # async fn demo() -> embed_updater::Result<()> {
//! let config = EmbedderConfig {
//!     client_version: "12.0.0".into(),
//!     trusted_keys: vec!["02c0ffee...".into()],
//!     ..EmbedderConfig::default()
//! };
//! let host = Host::builder()
//!     .files(LocalFileStore::new("/var/lib/wallet"))
//!     .digester(Sha256Digester)
//!     .signer_recovery(Secp256k1Recovery)
//!     .build()?;
//!
//! let embedder = Embedder::new(config, host)?;
//! if embedder.check().await {
//!     println!("serving {:?}", embedder.local_files().await);
//! }
//! # Ok(())
//! # }
//! ```

mod archive;
mod cache;
mod config;
mod crypto;
mod embedder;
mod error;
mod files;
mod host;
mod notices;
mod release;
mod store;
mod transport;

pub use archive::{rewrite_bytes, rewrite_paths, Archive, Direction};
pub use cache::{
    is_asset, CacheDir, EtagMap, LocalVersionMarkers, ETAGS_FILE, MODIFIED_TAG_FILE,
    RELEASE_TAG_FILE,
};
pub use config::{BundleFlow, Channel, EmbedderConfig, RetryPolicy};
pub use crypto::{
    Digester, Secp256k1Recovery, Sha256Digester, SignatureVerifier, SignerRecovery, TrustedKeySet,
};
pub use embedder::{CheckState, Embedder};
pub use error::{EmbedError, Result};
pub use files::{Acquisition, FileVerifier};
pub use host::{
    DecliningPrompter, Host, HostBuilder, Notifier, ProgressReporter, Prompter, TracingNotifier,
    TracingProgress,
};
pub use notices::Notice;
pub use release::{ArchiveLocator, Located, ReleaseAsset, ReleaseDescriptor, ReleaseLocator};
pub use store::{FileStore, LocalFileStore};
pub use transport::{
    Fetched, HttpTransport, HttpTransportBuilder, Method, Resolver, Transport, TransportRequest,
    TransportResponse,
};
