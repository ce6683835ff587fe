//! GitHub API client: release assets and container package versions.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const CONTAINER_REGISTRY: &str = "ghcr.io";
const USER_AGENT: &str = concat!("stevedore/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("authentication required")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for GithubError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// `owner/repo` of a release source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

/// A container package hosted on the GitHub registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub owner: String,
    /// May contain `/` for nested packages.
    pub package: String,
}

impl PackageRef {
    /// Repository prefix used in image references, e.g. `ghcr.io/owner`.
    pub fn repository(&self) -> String {
        format!("{CONTAINER_REGISTRY}/{}", self.owner)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct PackageVersion {
    #[serde(default)]
    metadata: Option<PackageMetadata>,
}

#[derive(Debug, Deserialize)]
struct PackageMetadata {
    #[serde(default)]
    container: Option<ContainerMetadata>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Accepts `https://github.com/owner/repo[/...]`, `github.com/owner/repo` or `owner/repo`.
pub fn parse_repo(url: &str) -> Option<RepoRef> {
    let rest = strip_scheme(url);
    let rest = rest.strip_prefix("github.com/").unwrap_or(rest);
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");
    // GitHub owners never contain dots; a dotted first segment is another host
    if owner.contains('.') {
        return None;
    }
    Some(RepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// Accepts `ghcr.io/owner/pkg[:tag]` and the package pages
/// `github.com/{orgs,users}/owner/packages/container/[package/]pkg`.
pub fn parse_package(url: &str) -> Option<PackageRef> {
    let rest = strip_scheme(url);
    if let Some(path) = rest.strip_prefix("ghcr.io/") {
        let path = path.split(['@', '?']).next()?;
        let (owner, package) = path.split_once('/')?;
        let package = match package.rsplit_once(':') {
            Some((name, _tag)) => name,
            None => package,
        };
        if owner.is_empty() || package.is_empty() {
            return None;
        }
        return Some(PackageRef {
            owner: owner.to_string(),
            package: package.trim_end_matches('/').to_string(),
        });
    }

    let path = rest.strip_prefix("github.com/")?;
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        ["orgs" | "users", owner, "packages", "container", "package", package, ..]
        | ["orgs" | "users", owner, "packages", "container", package, ..] => Some(PackageRef {
            owner: owner.to_string(),
            package: url::form_urlencoded::parse(package.as_bytes())
                .map(|(k, _)| k.into_owned())
                .collect::<String>(),
        }),
        _ => None,
    }
}

/// Platform label from an asset file name: `<os>-<arch>`, or `<os>` when no
/// architecture keyword is present.
pub fn classify_platform(file_name: &str) -> Option<String> {
    let name = file_name.to_ascii_lowercase();
    let os = if name.contains("linux") {
        "linux"
    } else if ["windows", "win64", "win32"].iter().any(|k| name.contains(k)) || name.ends_with(".exe") {
        "windows"
    } else if ["darwin", "macos", "osx", "apple"].iter().any(|k| name.contains(k)) {
        "osx"
    } else {
        return None;
    };
    let arch = if ["x86_64", "amd64", "x64", "win64"].iter().any(|k| name.contains(k)) {
        Some("x64")
    } else if name.contains("aarch64") || name.contains("arm64") {
        Some("arm64")
    } else {
        None
    };
    Some(match arch {
        Some(arch) => format!("{os}-{arch}"),
        None => os.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
}

impl GithubClient {
    pub fn new() -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API host (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<T, GithubError> {
        debug!(url = %url, authenticated = token.is_some(), "github request");
        let mut req = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GithubError::Unauthorized);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GithubError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(GithubError::Request(format!("HTTP {status} from {url}")));
        }
        Ok(resp.json::<T>().await?)
    }

    /// Newest release, or the one tagged `tag`.
    pub async fn release(
        &self,
        repo: &RepoRef,
        tag: Option<&str>,
        token: Option<&str>,
    ) -> Result<Release, GithubError> {
        let url = match tag.filter(|t| !t.is_empty()) {
            Some(tag) => format!(
                "{}/repos/{}/{}/releases/tags/{}",
                self.api_base, repo.owner, repo.repo, tag
            ),
            None => format!(
                "{}/repos/{}/{}/releases/latest",
                self.api_base, repo.owner, repo.repo
            ),
        };
        self.get_json(&url, token).await
    }

    /// All tags of a container package. Tries the organisation endpoint first,
    /// then the user endpoint.
    pub async fn package_tags(
        &self,
        package: &PackageRef,
        token: Option<&str>,
    ) -> Result<Vec<String>, GithubError> {
        let encoded: String = url::form_urlencoded::byte_serialize(package.package.as_bytes()).collect();
        let mut last_err = None;
        for scope in ["orgs", "users"] {
            let url = format!(
                "{}/{scope}/{}/packages/container/{encoded}/versions?per_page=100",
                self.api_base, package.owner
            );
            match self.get_json::<Vec<PackageVersion>>(&url, token).await {
                Ok(versions) => {
                    return Ok(versions
                        .into_iter()
                        .filter_map(|v| v.metadata?.container)
                        .flat_map(|c| c.tags)
                        .collect());
                }
                Err(GithubError::NotFound(url)) => last_err = Some(GithubError::NotFound(url)),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| GithubError::NotFound(package.package.clone())))
    }
}
