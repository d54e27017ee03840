use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, Result};

const BRIDGE_HOST: &str = "https://bridge.get-scatter.com";
const EMBED_HOST: &str = "https://embed.get-scatter.com";
const REGISTRY_API: &str = "https://api.github.com/repos/GetScatter";

/// Which distribution channel the host application consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Bridge,
    Embed,
}

impl Channel {
    /// Default content host serving the bundle for this channel.
    pub fn default_host(self) -> &'static str {
        match self {
            Channel::Bridge => BRIDGE_HOST,
            Channel::Embed => EMBED_HOST,
        }
    }

    /// Repository name used by the fallback release registry.
    pub fn repository(self) -> &'static str {
        match self {
            Channel::Bridge => "Bridge",
            Channel::Embed => "Embed",
        }
    }
}

/// How a release's files are acquired and verified. A deployment uses exactly one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BundleFlow {
    /// One signed archive per release, replacing the whole cache.
    #[default]
    Archive,
    /// Each file fetched and verified against its own `{hash}|{signature}` companion.
    PerFile,
}

/// Bounded retry budget applied to every network call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per resource, including the first one.
    #[serde(default = "RetryPolicy::default_attempts")]
    pub attempts: u32,
    /// Deadline for an ordinary resource, in milliseconds.
    #[serde(default = "RetryPolicy::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline multiplier for the resources listed in `large_files`.
    #[serde(default = "RetryPolicy::default_large_multiplier")]
    pub large_multiplier: u32,
    /// File names that legitimately take longer to download.
    #[serde(default = "RetryPolicy::default_large_files")]
    pub large_files: Vec<String>,
}

impl RetryPolicy {
    fn default_attempts() -> u32 {
        5
    }

    fn default_timeout_ms() -> u64 {
        5_000
    }

    fn default_large_multiplier() -> u32 {
        5
    }

    fn default_large_files() -> Vec<String> {
        vec!["vendor.bundle.js".to_string()]
    }

    /// Deadline for one attempt at `resource` (a URL or a bare file name).
    pub fn timeout_for(&self, resource: &str) -> Duration {
        let path = resource.split(['?', '#']).next().unwrap_or(resource);
        let name = path.rsplit('/').next().unwrap_or(path);
        let base = Duration::from_millis(self.timeout_ms);
        if self.large_files.iter().any(|large| large == name) {
            base * self.large_multiplier.max(1)
        } else {
            base
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            timeout_ms: Self::default_timeout_ms(),
            large_multiplier: Self::default_large_multiplier(),
            large_files: Self::default_large_files(),
        }
    }
}

/// Configuration supplied once by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbedderConfig {
    /// Version of the running host application.
    pub client_version: String,
    #[serde(default)]
    pub channel: Channel,
    /// Overrides the channel's default content host.
    #[serde(default)]
    pub host: Option<String>,
    /// Primary release-metadata endpoint. Defaults to `{host}/release.json`.
    #[serde(default)]
    pub release_url: Option<String>,
    /// Canonical registry consulted when the primary endpoint fails.
    #[serde(default)]
    pub fallback_release_url: Option<String>,
    /// Servers publishing `{hash}|{signature}` companions for the per-file flow.
    #[serde(default)]
    pub hash_hosts: Vec<String>,
    #[serde(default = "EmbedderConfig::default_files_manifest")]
    pub files_manifest: String,
    /// Hex-encoded compressed secp256k1 public keys whose signatures are accepted.
    pub trusted_keys: Vec<String>,
    #[serde(default)]
    pub flow: BundleFlow,
    #[serde(default = "EmbedderConfig::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Development switch: behave as if nothing was cached yet.
    #[serde(default)]
    pub force_refresh: bool,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            client_version: "0.0.0".to_string(),
            channel: Channel::default(),
            host: None,
            release_url: None,
            fallback_release_url: None,
            hash_hosts: Vec::new(),
            files_manifest: Self::default_files_manifest(),
            trusted_keys: Vec::new(),
            flow: BundleFlow::default(),
            cache_dir: Self::default_cache_dir(),
            retry: RetryPolicy::default(),
            force_refresh: false,
        }
    }
}

impl EmbedderConfig {
    fn default_files_manifest() -> String {
        "files.json".to_string()
    }

    fn default_cache_dir() -> String {
        "cached_sources".to_string()
    }

    /// Load a configuration document from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Content host without a trailing slash.
    pub fn host(&self) -> String {
        self.host
            .as_deref()
            .unwrap_or_else(|| self.channel.default_host())
            .trim_end_matches('/')
            .to_string()
    }

    /// Primary release-metadata endpoint.
    pub fn release_url(&self) -> String {
        self.release_url
            .clone()
            .unwrap_or_else(|| format!("{}/release.json", self.host()))
    }

    /// Registry consulted when the primary endpoint fails.
    pub fn fallback_release_url(&self) -> String {
        self.fallback_release_url.clone().unwrap_or_else(|| {
            format!(
                "{REGISTRY_API}/{}/releases/latest",
                self.channel.repository()
            )
        })
    }

    /// Hash companion hosts, falling back to the content host.
    pub fn hash_hosts(&self) -> Vec<String> {
        if self.hash_hosts.is_empty() {
            return vec![self.host()];
        }
        self.hash_hosts
            .iter()
            .map(|host| host.trim_end_matches('/').to_string())
            .collect()
    }

    /// Reject configurations that indicate a programming error by the embedder.
    pub fn validate(&self) -> Result<()> {
        if self.trusted_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(EmbedError::configuration(
                "at least one trusted proof key is required",
            ));
        }
        if self.retry.attempts == 0 {
            return Err(EmbedError::configuration(
                "retry policy must allow at least one attempt",
            ));
        }
        url::Url::parse(&self.host()).map_err(|err| {
            EmbedError::configuration(format!("invalid content host {}: {err}", self.host()))
        })?;
        semver::Version::parse(self.client_version.trim().trim_start_matches('v'))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_selects_host_and_registry() {
        let mut config = EmbedderConfig::default();
        assert_eq!(config.host(), BRIDGE_HOST);
        assert_eq!(
            config.fallback_release_url(),
            "https://api.github.com/repos/GetScatter/Bridge/releases/latest"
        );

        config.channel = Channel::Embed;
        assert_eq!(config.host(), EMBED_HOST);
        assert_eq!(config.release_url(), format!("{EMBED_HOST}/release.json"));

        config.host = Some("http://127.0.0.1:8091/".into());
        assert_eq!(config.host(), "http://127.0.0.1:8091");
        assert_eq!(config.hash_hosts(), vec!["http://127.0.0.1:8091".to_string()]);
    }

    #[test]
    fn large_files_get_a_longer_deadline() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.timeout_for("https://host/vendor.bundle.js?rand=12"),
            Duration::from_secs(25)
        );
        assert_eq!(policy.timeout_for("https://host/app.js"), Duration::from_secs(5));
        assert_eq!(policy.timeout_for("vendor.bundle.js"), Duration::from_secs(25));
    }

    #[test]
    fn validation_requires_trusted_keys() {
        let config = EmbedderConfig::default();
        assert!(matches!(
            config.validate(),
            Err(EmbedError::Configuration(_))
        ));

        let config = EmbedderConfig {
            trusted_keys: vec!["02ab".into()],
            ..EmbedderConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EmbedderConfig = serde_json::from_str(
            r#"{ "client_version": "12.0.0", "trusted_keys": ["02ab"], "flow": "PerFile" }"#,
        )
        .unwrap();
        assert_eq!(config.flow, BundleFlow::PerFile);
        assert_eq!(config.cache_dir, "cached_sources");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.files_manifest, "files.json");
    }
}
