//! Remote version discovery with a short-lived cache.
//!
//! Discovery never fails hard: authentication problems go through the optional
//! credential callback once, and anything still failing degrades to the last
//! cached result or a single synthetic `latest` candidate.

use crate::document::{DiscoverySpec, ImageVersion, ReleaseVersion, DEFAULT_TAG};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

pub mod filter;
pub mod github;
mod install;

pub use github::{classify_platform, GithubClient, GithubError};
pub use install::install_bytes;

/// How long a discovery result is reused.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Platform label of the running host, in the same vocabulary as
/// [`classify_platform`]: `linux-x64`, `osx-arm64`, `windows-x64`, ...
pub fn host_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

/// A selectable version, either an image tag or a downloadable release asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VersionCandidate {
    Image(ImageVersion),
    Release(ReleaseVersion),
}

impl VersionCandidate {
    pub fn label(&self) -> String {
        match self {
            Self::Image(image) => image.reference(),
            Self::Release(release) => match &release.platform {
                Some(platform) => format!("{} ({platform})", release.version),
                None => release.version.clone(),
            },
        }
    }
}

/// Supplies a bearer credential when a remote source asks for authentication.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` means the operator declined or no credential is available.
    async fn acquire(&self, source: &str) -> Option<String>;
}

struct CachedVersions {
    candidates: Vec<VersionCandidate>,
    fetched_at: Instant,
}

type CacheKey = (String, String);

pub struct VersionDiscovery {
    github: GithubClient,
    cache: Mutex<HashMap<CacheKey, CachedVersions>>,
    token: RwLock<Option<String>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    ttl: Duration,
}

impl VersionDiscovery {
    pub fn new(github: GithubClient) -> Self {
        Self {
            github,
            cache: Mutex::new(HashMap::new()),
            token: RwLock::new(None),
            credentials: None,
            ttl: CACHE_TTL,
        }
    }

    pub fn with_token(self, token: Option<String>) -> Self {
        if let Ok(mut slot) = self.token.write() {
            *slot = token.filter(|t| !t.is_empty());
        }
        self
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    /// Drop every cached result.
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    async fn cached(&self, key: &CacheKey, allow_stale: bool) -> Option<Vec<VersionCandidate>> {
        let cache = self.cache.lock().await;
        let entry = cache.get(key)?;
        if allow_stale || entry.fetched_at.elapsed() < self.ttl {
            Some(entry.candidates.clone())
        } else {
            None
        }
    }

    async fn store(&self, key: CacheKey, candidates: &[VersionCandidate]) {
        self.cache.lock().await.insert(
            key,
            CachedVersions {
                candidates: candidates.to_vec(),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Asks the credential provider for a token and remembers it.
    async fn reauthenticate(&self, source: &str) -> bool {
        let Some(provider) = &self.credentials else {
            return false;
        };
        match provider.acquire(source).await.filter(|t| !t.is_empty()) {
            Some(token) => {
                if let Ok(mut slot) = self.token.write() {
                    *slot = Some(token);
                }
                true
            }
            None => false,
        }
    }

    /// Tags of a registry package, filtered.
    #[instrument(skip(self, spec), fields(url = %spec.url))]
    pub async fn discover_images(&self, spec: &DiscoverySpec) -> Vec<ImageVersion> {
        let key = (format!("image:{}", spec.url), spec.filter().to_string());
        if let Some(hit) = self.cached(&key, false).await {
            return unwrap_images(hit);
        }

        let Some(package) = github::parse_package(&spec.url) else {
            warn!(url = %spec.url, "unrecognised package url");
            return self.fallback_images(&key, spec).await;
        };
        let regex = match filter::compile(spec.filter()) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(error = %e, "discovery filter rejected");
                return Vec::new();
            }
        };

        let mut result = self.github.package_tags(&package, self.token().as_deref()).await;
        if matches!(result, Err(GithubError::Unauthorized)) && self.reauthenticate(&spec.url).await {
            result = self.github.package_tags(&package, self.token().as_deref()).await;
        }
        let tags = match result {
            Ok(tags) => tags,
            Err(e) => {
                warn!(url = %spec.url, error = %e, "package version listing failed");
                return self.fallback_images(&key, spec).await;
            }
        };

        let images: Vec<ImageVersion> = filter::select_bounded(&regex, tags)
            .await
            .into_iter()
            .map(|tag| ImageVersion {
                repository: Some(package.repository()),
                image: package.package.clone(),
                tag,
            })
            .collect();
        info!(url = %spec.url, count = images.len(), "image tags discovered");
        let candidates: Vec<VersionCandidate> = images.iter().cloned().map(VersionCandidate::Image).collect();
        self.store(key, &candidates).await;
        images
    }

    /// Assets of the newest (or named) release, filtered and platform-classified.
    #[instrument(skip(self, spec), fields(url = %spec.url))]
    pub async fn discover_releases(&self, spec: &DiscoverySpec) -> Vec<ReleaseVersion> {
        let key = (format!("release:{}", spec.url), spec.filter().to_string());
        if let Some(hit) = self.cached(&key, false).await {
            return unwrap_releases(hit);
        }

        let Some(repo) = github::parse_repo(&spec.url) else {
            warn!(url = %spec.url, "unrecognised repository url");
            return self.stale_releases(&key).await;
        };
        let regex = match filter::compile(spec.filter()) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(error = %e, "discovery filter rejected");
                return Vec::new();
            }
        };

        let tag = spec.release.as_deref();
        let mut result = self.github.release(&repo, tag, self.token().as_deref()).await;
        if matches!(result, Err(GithubError::Unauthorized)) && self.reauthenticate(&spec.url).await {
            result = self.github.release(&repo, tag, self.token().as_deref()).await;
        }
        let release = match result {
            Ok(release) => release,
            Err(e) => {
                warn!(url = %spec.url, error = %e, "release listing failed");
                return self.stale_releases(&key).await;
            }
        };

        let names: Vec<String> = release
            .assets
            .iter()
            .map(|a| a.name.clone())
            .filter(|name| spec.assets.is_empty() || spec.assets.iter().any(|w| name.contains(w.as_str())))
            .collect();
        let selected = filter::select_bounded(&regex, names).await;
        let releases: Vec<ReleaseVersion> = release
            .assets
            .iter()
            .filter(|a| selected.contains(&a.name))
            .map(|a| ReleaseVersion {
                url: a.browser_download_url.clone(),
                version: release.tag_name.clone(),
                platform: classify_platform(&a.name),
            })
            .collect();
        info!(url = %spec.url, count = releases.len(), "release assets discovered");
        let candidates: Vec<VersionCandidate> = releases.iter().cloned().map(VersionCandidate::Release).collect();
        self.store(key, &candidates).await;
        releases
    }

    /// Stale cache first, else a lone `latest` tag if the filter admits it.
    async fn fallback_images(&self, key: &CacheKey, spec: &DiscoverySpec) -> Vec<ImageVersion> {
        if let Some(stale) = self.cached(key, true).await {
            return unwrap_images(stale);
        }
        latest_fallback(spec)
    }

    async fn stale_releases(&self, key: &CacheKey) -> Vec<ReleaseVersion> {
        self.cached(key, true).await.map(unwrap_releases).unwrap_or_default()
    }

    /// Download a release into `service_dir` as `binary`.
    pub async fn install(&self, release: &ReleaseVersion, service_dir: &Path, binary: &str) -> Result<PathBuf> {
        install::install_release(self.github.http(), release, service_dir, binary).await
    }
}

/// Synthetic `latest` candidate, only when the filter matches `latest`.
pub fn latest_fallback(spec: &DiscoverySpec) -> Vec<ImageVersion> {
    let admits_latest = filter::compile(spec.filter())
        .map(|re| re.is_match(DEFAULT_TAG))
        .unwrap_or(false);
    if !admits_latest {
        return Vec::new();
    }
    let (repository, image) = match github::parse_package(&spec.url) {
        Some(pkg) => (Some(pkg.repository()), pkg.package),
        None => split_image_reference(&spec.url),
    };
    vec![ImageVersion {
        repository,
        image,
        tag: DEFAULT_TAG.to_string(),
    }]
}

/// `registry/owner/image[:tag]` → (`registry/owner`, `image`)
fn split_image_reference(reference: &str) -> (Option<String>, String) {
    let reference = reference
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let without_tag = match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => reference,
    };
    match without_tag.rsplit_once('/') {
        Some((repo, image)) => (Some(repo.to_string()), image.to_string()),
        None => (None, without_tag.to_string()),
    }
}

fn unwrap_images(candidates: Vec<VersionCandidate>) -> Vec<ImageVersion> {
    candidates
        .into_iter()
        .filter_map(|c| match c {
            VersionCandidate::Image(image) => Some(image),
            VersionCandidate::Release(_) => None,
        })
        .collect()
}

fn unwrap_releases(candidates: Vec<VersionCandidate>) -> Vec<ReleaseVersion> {
    candidates
        .into_iter()
        .filter_map(|c| match c {
            VersionCandidate::Release(release) => Some(release),
            VersionCandidate::Image(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(url: &str, filter: Option<&str>) -> DiscoverySpec {
        DiscoverySpec {
            url: url.into(),
            filter: filter.map(str::to_string),
            ..Default::default()
        }
    }

    /// Points at a port nothing listens on so every request fails fast.
    fn offline() -> VersionDiscovery {
        let github = GithubClient::new().unwrap().with_api_base("http://127.0.0.1:9");
        VersionDiscovery::new(github)
    }

    struct CountingProvider(AtomicUsize);

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn acquire(&self, _source: &str) -> Option<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn host_platform_shape() {
        let platform = host_platform();
        assert!(platform.contains('-'));
        assert!(!platform.starts_with("macos"));
    }

    #[test]
    fn latest_fallback_respects_filter() {
        let images = latest_fallback(&spec("ghcr.io/acme/node", None));
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].reference(), "ghcr.io/acme/node:latest");

        assert!(latest_fallback(&spec("ghcr.io/acme/node", Some(r"^v\d+"))).is_empty());
    }

    #[test]
    fn image_reference_split() {
        assert_eq!(
            split_image_reference("docker.io/library/redis:7"),
            (Some("docker.io/library".to_string()), "redis".to_string())
        );
        assert_eq!(split_image_reference("redis"), (None, "redis".to_string()));
    }

    #[tokio::test]
    async fn unreachable_registry_degrades_to_latest() {
        let discovery = offline();
        let images = discovery.discover_images(&spec("ghcr.io/acme/node", Some("latest|^v"))).await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].tag, "latest");

        let none = discovery.discover_images(&spec("ghcr.io/acme/node", Some(r"^v\d"))).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn cached_result_is_reused() {
        let discovery = offline();
        let s = spec("ghcr.io/acme/node", Some(r"^v"));
        let key = (format!("image:{}", s.url), s.filter().to_string());
        let cached = VersionCandidate::Image(ImageVersion {
            repository: Some("ghcr.io/acme".into()),
            image: "node".into(),
            tag: "v1.0.0".into(),
        });
        discovery.store(key, &[cached]).await;

        let images = discovery.discover_images(&s).await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].tag, "v1.0.0");
    }

    #[tokio::test]
    async fn stale_cache_beats_latest_fallback() {
        let discovery = offline().with_ttl(Duration::ZERO);
        let s = spec("ghcr.io/acme/node", None);
        let key = (format!("image:{}", s.url), s.filter().to_string());
        let cached = VersionCandidate::Image(ImageVersion {
            repository: Some("ghcr.io/acme".into()),
            image: "node".into(),
            tag: "v0.9.0".into(),
        });
        discovery.store(key, &[cached]).await;

        let images = discovery.discover_images(&s).await;
        assert_eq!(images[0].tag, "v0.9.0");
    }

    #[tokio::test]
    async fn release_failure_is_empty_not_error() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let discovery = offline().with_credentials(provider.clone());
        let releases = discovery
            .discover_releases(&spec("https://github.com/acme/node", None))
            .await;
        assert!(releases.is_empty());
        // connection failures are not auth failures
        assert_eq!(provider.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn candidate_labels() {
        let release = VersionCandidate::Release(ReleaseVersion {
            url: "https://x/a.tgz".into(),
            version: "v1.2.3".into(),
            platform: Some("linux-x64".into()),
        });
        assert_eq!(release.label(), "v1.2.3 (linux-x64)");
    }
}
