//! Download-and-cache registry for pretrained weights.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::resnet::ResNetArch;
use crate::weights::WeightsError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Architecture → download URL table backed by a local on-disk cache.
///
/// Weights for an architecture live at `<cache_root>/<arch>/<url filename>`;
/// a file already present there short-circuits the download, so repeated
/// fetches are free.
#[derive(Debug, Clone)]
pub struct WeightRegistry {
    urls: HashMap<ResNetArch, String>,
    cache_root: PathBuf,
}

impl WeightRegistry {
    /// Registry preloaded with the torchvision download URLs for the
    /// whole ResNet family.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let urls = [
            (
                ResNetArch::ResNet18,
                "https://download.pytorch.org/models/resnet18-5c106cde.pth",
            ),
            (
                ResNetArch::ResNet34,
                "https://download.pytorch.org/models/resnet34-333f7ec4.pth",
            ),
            (
                ResNetArch::ResNet50,
                "https://download.pytorch.org/models/resnet50-19c8e357.pth",
            ),
            (
                ResNetArch::ResNet101,
                "https://download.pytorch.org/models/resnet101-5d3b4d8f.pth",
            ),
            (
                ResNetArch::ResNet152,
                "https://download.pytorch.org/models/resnet152-b121ed2d.pth",
            ),
        ]
        .into_iter()
        .map(|(arch, url)| (arch, url.to_string()))
        .collect();

        WeightRegistry {
            urls,
            cache_root: cache_root.into(),
        }
    }

    /// Registry with no URLs. Populate with [`with_url`](Self::with_url).
    pub fn empty(cache_root: impl Into<PathBuf>) -> Self {
        WeightRegistry {
            urls: HashMap::new(),
            cache_root: cache_root.into(),
        }
    }

    /// Loads an architecture → URL table from a JSON file shaped like
    /// `{"resnet50": "https://example.com/weights.pth"}`.
    pub fn from_json_file(
        path: &Path,
        cache_root: impl Into<PathBuf>,
    ) -> Result<Self, WeightsError> {
        let text = fs::read_to_string(path)?;
        let urls: HashMap<ResNetArch, String> =
            serde_json::from_str(&text).map_err(|e| WeightsError::RegistryTable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(WeightRegistry {
            urls,
            cache_root: cache_root.into(),
        })
    }

    /// Adds or replaces the URL for one architecture.
    pub fn with_url(mut self, arch: ResNetArch, url: impl Into<String>) -> Self {
        self.urls.insert(arch, url.into());
        self
    }

    /// Download URL for `arch`, if registered.
    pub fn url(&self, arch: ResNetArch) -> Option<&str> {
        self.urls.get(&arch).map(String::as_str)
    }

    /// Cache directory for one architecture.
    pub fn cache_dir(&self, arch: ResNetArch) -> PathBuf {
        self.cache_root.join(arch.name())
    }

    /// Returns the local path of `arch`'s weights, downloading into the
    /// cache on first use.
    pub fn fetch(&self, arch: ResNetArch) -> Result<PathBuf, WeightsError> {
        let url_str = self
            .url(arch)
            .ok_or(WeightsError::UnregisteredArch(arch))?;
        let url =
            Url::parse(url_str).map_err(|_| WeightsError::InvalidUrl(url_str.to_string()))?;
        let filename = url
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| WeightsError::InvalidUrl(url_str.to_string()))?
            .to_string();

        let dir = self.cache_dir(arch);
        let target = dir.join(&filename);
        if target.is_file() {
            tracing::debug!(path = %target.display(), "using cached weights");
            return Ok(target);
        }

        fs::create_dir_all(&dir)?;
        tracing::info!(%arch, url = url_str, "downloading pretrained weights");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()
            .map_err(|e| network_error(url_str, e))?;
        let response = client.get(url).send().map_err(|e| network_error(url_str, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WeightsError::Http {
                url: url_str.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().map_err(|e| network_error(url_str, e))?;

        // Stage next to the target so a cut download never leaves a
        // truncated cache entry behind.
        let partial = dir.join(format!("{filename}.partial"));
        fs::write(&partial, &bytes)?;
        fs::rename(&partial, &target)?;

        tracing::info!(bytes = bytes.len(), path = %target.display(), "cached pretrained weights");
        Ok(target)
    }
}

impl Default for WeightRegistry {
    /// Torchvision URL table with the cache rooted in the current
    /// directory, one subdirectory per architecture.
    fn default() -> Self {
        WeightRegistry::new(".")
    }
}

fn network_error(url: &str, source: reqwest::Error) -> WeightsError {
    WeightsError::Network {
        url: url.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_table_covers_all_archs() {
        let registry = WeightRegistry::new("/tmp/weights");

        for arch in ResNetArch::ALL {
            let url = registry
                .url(arch)
                .unwrap_or_else(|| panic!("no url for {arch}"));
            assert!(
                url.starts_with("https://download.pytorch.org/models/"),
                "unexpected host for {arch}: {url}"
            );
            assert!(url.ends_with(".pth"), "unexpected format for {arch}: {url}");
        }

        assert_eq!(
            registry.url(ResNetArch::ResNet50),
            Some("https://download.pytorch.org/models/resnet50-19c8e357.pth")
        );
    }

    #[test]
    fn test_default_caches_in_current_dir() {
        let registry = WeightRegistry::default();

        assert_eq!(
            registry.cache_dir(ResNetArch::ResNet18),
            PathBuf::from("./resnet18")
        );
        assert!(registry.url(ResNetArch::ResNet18).is_some());
    }

    #[test]
    fn test_cache_dir_per_arch() {
        let registry = WeightRegistry::new("/var/cache/weights");

        assert_eq!(
            registry.cache_dir(ResNetArch::ResNet34),
            PathBuf::from("/var/cache/weights/resnet34")
        );
    }

    #[test]
    fn test_fetch_prefers_cache() {
        let dir = TempDir::new().unwrap();
        // The host does not resolve; a pre-seeded cache entry must win
        // before any network use.
        let registry = WeightRegistry::empty(dir.path()).with_url(
            ResNetArch::ResNet18,
            "https://weights.invalid/files/resnet18.safetensors",
        );
        let cached = dir.path().join("resnet18");
        fs::create_dir_all(&cached).unwrap();
        fs::write(cached.join("resnet18.safetensors"), b"seed").unwrap();

        let path = registry.fetch(ResNetArch::ResNet18).unwrap();

        assert_eq!(path, cached.join("resnet18.safetensors"));
    }

    #[test]
    fn test_fetch_unregistered_arch() {
        let dir = TempDir::new().unwrap();
        let registry = WeightRegistry::empty(dir.path());

        let err = registry.fetch(ResNetArch::ResNet50).unwrap_err();

        assert!(matches!(
            err,
            WeightsError::UnregisteredArch(ResNetArch::ResNet50)
        ));
    }

    #[test]
    fn test_fetch_rejects_url_without_filename() {
        let dir = TempDir::new().unwrap();
        let registry = WeightRegistry::empty(dir.path())
            .with_url(ResNetArch::ResNet18, "https://weights.invalid/");

        let err = registry.fetch(ResNetArch::ResNet18).unwrap_err();

        assert!(matches!(err, WeightsError::InvalidUrl(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("urls.json");
        fs::write(
            &table,
            r#"{"resnet18": "https://example.com/a.pth", "resnet152": "https://example.com/b.pth"}"#,
        )
        .unwrap();

        let registry = WeightRegistry::from_json_file(&table, dir.path()).unwrap();

        assert_eq!(
            registry.url(ResNetArch::ResNet18),
            Some("https://example.com/a.pth")
        );
        assert_eq!(
            registry.url(ResNetArch::ResNet152),
            Some("https://example.com/b.pth")
        );
        assert_eq!(registry.url(ResNetArch::ResNet50), None);
    }
}
