use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, Result};
use crate::transport::{Resolver, TransportRequest};

/// One downloadable item attached to a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url", alias = "download_url")]
    pub download_url: String,
}

/// Remote metadata describing the latest distributable version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    #[serde(rename = "tag_name", alias = "tag")]
    pub tag: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    /// Freshness token taken from the response that carried this descriptor.
    #[serde(skip)]
    pub last_modified: Option<String>,
    /// Oldest host application version able to run this release.
    #[serde(default, alias = "minClientVersion")]
    pub min_client_version: Option<String>,
}

impl ReleaseDescriptor {
    /// Release tag with surrounding whitespace removed.
    pub fn tag(&self) -> &str {
        self.tag.trim()
    }

    /// The signed package asset, if this release ships one.
    pub fn archive(&self) -> Option<ArchiveLocator<'_>> {
        self.assets
            .iter()
            .find(|asset| asset.name.ends_with(".zip"))
            .map(|asset| ArchiveLocator { asset })
    }

    /// Fail when the running client is older than the release's minimum.
    pub fn requires_client(&self, running: &str) -> Result<()> {
        let Some(required) = self.min_client_version.as_deref() else {
            return Ok(());
        };
        let incompatible = || EmbedError::VersionIncompatible {
            required: required.to_string(),
            running: running.to_string(),
        };

        let minimum = parse_version(required).map_err(|_| incompatible())?;
        let current = parse_version(running)?;
        if current < minimum {
            return Err(incompatible());
        }
        Ok(())
    }
}

fn parse_version(raw: &str) -> Result<semver::Version> {
    Ok(semver::Version::parse(raw.trim().trim_start_matches('v'))?)
}

/// Signed package asset named `<tag>.<signature>.zip`.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLocator<'a> {
    asset: &'a ReleaseAsset,
}

impl<'a> ArchiveLocator<'a> {
    /// Download location of the package.
    pub fn url(&self) -> &'a str {
        &self.asset.download_url
    }

    /// Asset file name, including the embedded signature.
    pub fn name(&self) -> &'a str {
        &self.asset.name
    }

    /// Signature over the package digest, embedded as the second-to-last
    /// dot-separated segment of the asset name.
    pub fn signature(&self) -> Option<&'a str> {
        let mut segments = self.asset.name.rsplitn(3, '.');
        let _extension = segments.next()?;
        let signature = segments.next()?;
        segments.next()?;
        (!signature.is_empty()).then_some(signature)
    }
}

/// Result of asking the release sources for the latest release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// The previous freshness token is still current.
    NotModified,
    Release(ReleaseDescriptor),
}

/// Discovers the latest release from the primary host, then a fallback registry.
#[derive(Debug, Clone)]
pub struct ReleaseLocator {
    sources: Vec<String>,
}

impl ReleaseLocator {
    /// Locator trying `primary` first and `fallback` second.
    pub fn new(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            sources: vec![primary.into(), fallback.into()],
        }
    }

    /// Query each source in order with an `If-Modified-Since` precondition
    /// when `previous` is given.
    pub async fn locate(&self, resolver: &Resolver, previous: Option<&str>) -> Result<Located> {
        for source in &self.sources {
            let mut request =
                TransportRequest::get(source.as_str()).header("Accept", "application/json");
            if let Some(token) = previous.filter(|token| !token.trim().is_empty()) {
                request = request.header("If-Modified-Since", token.trim());
            }

            let Some(response) = resolver
                .send(request, resolver.policy().timeout_for(source))
                .await
            else {
                tracing::warn!(%source, "release source unreachable");
                continue;
            };

            if response.status == 304 {
                tracing::debug!(%source, "release not modified");
                return Ok(Located::NotModified);
            }

            match serde_json::from_slice::<ReleaseDescriptor>(&response.body) {
                Ok(mut descriptor) => {
                    descriptor.last_modified = response
                        .header("last-modified")
                        .or_else(|| response.header("etag"))
                        .map(str::to_string);
                    tracing::info!(%source, tag = %descriptor.tag(), "located release");
                    return Ok(Located::Release(descriptor));
                }
                Err(err) => {
                    tracing::warn!(%source, error = %err, "release metadata malformed");
                }
            }
        }

        Err(EmbedError::ReleaseUnavailable)
    }
}
