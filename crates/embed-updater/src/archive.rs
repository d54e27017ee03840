use std::io::{Cursor, Read};
use std::path::{Component, Path};

use zip::ZipArchive;

use crate::error::{EmbedError, Result};
use crate::host::ProgressReporter;
use crate::store::FileStore;

/// Relative static-asset prefixes that are served from the content host
/// instead of being bundled.
const HOSTED_PREFIXES: [&str; 2] = ["static/assets/", "static/fonts/fa-"];

/// Which way [`rewrite_paths`] translates asset references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Qualify relative asset references with the content host.
    Outbound,
    /// Strip host-qualified references back to the signed relative form.
    Inbound,
}

/// Rewrite asset references in `content`. Inbound undoes outbound, so hashes
/// are always computed over the content as it was signed.
pub fn rewrite_paths(content: &str, host: &str, direction: Direction) -> String {
    let host = host.trim_end_matches('/');
    HOSTED_PREFIXES
        .iter()
        .fold(content.to_string(), |content, prefix| {
            let qualified = format!("{host}/{prefix}");
            match direction {
                Direction::Outbound => content.replace(prefix, &qualified),
                Direction::Inbound => content.replace(&qualified, prefix),
            }
        })
}

/// Outbound rewrite for raw file bytes; non UTF-8 content is stored untouched.
pub fn rewrite_bytes(content: Vec<u8>, host: &str, direction: Direction) -> Vec<u8> {
    match String::from_utf8(content) {
        Ok(text) => rewrite_paths(&text, host, direction).into_bytes(),
        Err(err) => err.into_bytes(),
    }
}

/// A downloaded release package whose directory has been parsed.
pub struct Archive {
    inner: ZipArchive<Cursor<Vec<u8>>>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("entries", &self.inner.len())
            .finish()
    }
}

impl Archive {
    /// Parse the package directory. Truncated or malformed packages fail here,
    /// before the local cache is touched.
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let inner = ZipArchive::new(Cursor::new(bytes))?;
        Ok(Self { inner })
    }

    /// Number of entries the package declares.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the package declares no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Stream every entry into `dir`, rewriting asset references outbound.
    ///
    /// Files are saved as soon as they are read. Any entry that cannot be read
    /// or named safely fails the whole extraction.
    pub async fn extract(
        mut self,
        files: &dyn FileStore,
        dir: &Path,
        host: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<String>> {
        let declared = self.inner.len();
        let mut processed = 0usize;
        let mut written = Vec::new();

        for index in 0..declared {
            let (name, content) = {
                let mut entry = self.inner.by_index(index)?;
                if entry.is_dir() {
                    processed += 1;
                    continue;
                }
                let name = entry
                    .enclosed_name()
                    .and_then(relative_name)
                    .ok_or_else(|| {
                        EmbedError::corrupt(format!("unsafe entry name {}", entry.name()))
                    })?;
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(|err| {
                    EmbedError::corrupt(format!("failed to read {name}: {err}"))
                })?;
                (name, content)
            };

            let content = rewrite_bytes(content, host, Direction::Outbound);
            files
                .save(dir, &name, &content)
                .await
                .map_err(|err| EmbedError::Other(format!("failed to save {name}: {err}")))?;
            processed += 1;
            progress.progress(&format!("{name} {processed}/{declared}"));
            tracing::debug!(file = %name, processed, declared, "extracted");
            written.push(name);
        }
        Ok(written)
    }
}

/// Normalised `/`-separated form of a relative name, or `None` when joining
/// it onto a directory could land outside that directory.
pub(crate) fn enclosed_relative(raw: &str) -> Option<String> {
    relative_name(Path::new(raw))
}

fn relative_name(path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;

    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    /// Build a deflated package holding `files`; names ending in `/` become directories.
    pub fn build_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, content) in files {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::build_zip;
    use super::*;
    use crate::host::TracingProgress;
    use crate::store::LocalFileStore;
    use tempfile::tempdir;

    const HOST: &str = "https://embed.example";

    #[test]
    fn outbound_then_inbound_is_identity() {
        let original = r#"<link href="static/assets/app.css"><i class="static/fonts/fa-solid"></i>
            url(static/assets/logo.png) static/js/app.js"#;
        let outbound = rewrite_paths(original, HOST, Direction::Outbound);
        assert!(outbound.contains("https://embed.example/static/assets/app.css"));
        assert!(outbound.contains("https://embed.example/static/fonts/fa-solid"));
        assert!(outbound.contains(" static/js/app.js"));
        assert_eq!(rewrite_paths(&outbound, HOST, Direction::Inbound), original);
    }

    #[test]
    fn round_trip_survives_already_qualified_references() {
        let original = "https://embed.example/static/assets/a.png static/assets/b.png";
        let outbound = rewrite_paths(original, HOST, Direction::Outbound);
        assert_eq!(rewrite_paths(&outbound, HOST, Direction::Inbound), original);
    }

    #[test]
    fn only_enclosed_relative_names_survive() {
        assert_eq!(enclosed_relative("static/js/app.js").as_deref(), Some("static/js/app.js"));
        assert_eq!(enclosed_relative("static//app.js").as_deref(), Some("static/app.js"));
        assert!(enclosed_relative("../escape.js").is_none());
        assert!(enclosed_relative("static/../../escape.js").is_none());
        assert!(enclosed_relative("/etc/passwd").is_none());
        assert!(enclosed_relative("").is_none());
    }

    #[test]
    fn binary_content_is_left_alone() {
        let raw = vec![0xff, 0xfe, b's'];
        assert_eq!(rewrite_bytes(raw.clone(), HOST, Direction::Outbound), raw);
    }

    #[tokio::test]
    async fn extracts_files_and_skips_directories() {
        let temp = tempdir().unwrap();
        let store = LocalFileStore::new(temp.path());
        let bytes = build_zip(&[
            ("index.html", "<img src=\"static/assets/logo.png\">"),
            ("static/", ""),
            ("static/js/app.js", "console.log(1)"),
        ]);

        let archive = Archive::open(bytes).unwrap();
        assert_eq!(archive.len(), 3);
        let written = archive
            .extract(&store, temp.path(), HOST, &TracingProgress)
            .await
            .unwrap();
        assert_eq!(written, vec!["index.html".to_string(), "static/js/app.js".to_string()]);

        let index = std::fs::read_to_string(temp.path().join("index.html")).unwrap();
        assert_eq!(index, "<img src=\"https://embed.example/static/assets/logo.png\">");
        assert!(temp.path().join("static/js/app.js").exists());
    }

    #[test]
    fn truncated_package_is_rejected() {
        let mut bytes = build_zip(&[("index.html", "<html></html>")]);
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(
            Archive::open(bytes),
            Err(EmbedError::CorruptArchive(_))
        ));
        assert!(Archive::open(b"definitely not a zip".to_vec()).is_err());
    }

    #[tokio::test]
    async fn entries_escaping_the_cache_are_rejected() {
        let temp = tempdir().unwrap();
        let store = LocalFileStore::new(temp.path());
        let bytes = build_zip(&[("../escape.js", "evil")]);

        let err = Archive::open(bytes)
            .unwrap()
            .extract(&store, &temp.path().join("cache"), HOST, &TracingProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::CorruptArchive(_)));
        assert!(!temp.path().join("escape.js").exists());
    }
}
