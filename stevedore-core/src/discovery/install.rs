//! 发布包安装：下载到服务目录，`.tar.gz`/`.tgz` 解包，裸二进制直接落盘为 `<binary>`。

use crate::document::ReleaseVersion;
use crate::error::{Result, ServiceError};
use futures::{Stream, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 下载大小上限（1GB）
const MAX_DOWNLOAD_SIZE: u64 = 1024 * 1024 * 1024;

fn is_gzip(url: &str, bytes: &[u8]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    path.ends_with(".tar.gz") || path.ends_with(".tgz") || bytes.starts_with(&[0x1f, 0x8b])
}

fn is_unsupported_archive(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    [".zip", ".7z", ".tar.xz", ".tar.bz2"].iter().any(|ext| path.ends_with(ext))
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

/// 下载并安装到 `service_dir`，返回可执行文件路径。
pub async fn install_release(
    http: &reqwest::Client,
    release: &ReleaseVersion,
    service_dir: &Path,
    binary: &str,
) -> Result<PathBuf> {
    if is_unsupported_archive(&release.url) {
        return Err(ServiceError::Discovery(format!(
            "unsupported archive format: {}",
            release.url
        )));
    }

    debug!(url = %release.url, version = %release.version, "downloading release");
    let resp = http.get(&release.url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ServiceError::Discovery(format!(
            "HTTP {status} from {}",
            release.url
        )));
    }
    if let Some(len) = resp.content_length() {
        if len > MAX_DOWNLOAD_SIZE {
            return Err(ServiceError::Discovery(format!(
                "download too large ({len} bytes)"
            )));
        }
    }
    let bytes = collect_capped(resp.bytes_stream(), MAX_DOWNLOAD_SIZE).await?;

    let url = release.url.clone();
    let dir = service_dir.to_path_buf();
    let binary = binary.to_string();
    let path = tokio::task::spawn_blocking(move || install_bytes(&url, &bytes, &dir, &binary))
        .await
        .map_err(|e| ServiceError::Other(e.to_string()))??;

    info!(version = %release.version, path = %path.display(), "release installed");
    Ok(path)
}

/// 逐块读取响应体，累计超过 `limit` 立即中止（分块传输没有 Content-Length）。
async fn collect_capped<S, B, E>(stream: S, limit: u64) -> Result<Vec<u8>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    ServiceError: From<E>,
{
    futures::pin_mut!(stream);
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        if buf.len() as u64 + chunk.len() as u64 > limit {
            return Err(ServiceError::Discovery(format!(
                "download exceeds {limit} bytes"
            )));
        }
        buf.extend_from_slice(chunk);
    }
    Ok(buf)
}

/// 把已下载的内容写入服务目录。压缩包整体解包到服务目录，
/// 与 `binary` 同名的条目无论位于哪一层都放到服务目录根部。
pub fn install_bytes(url: &str, bytes: &[u8], service_dir: &Path, binary: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(service_dir)?;
    let file_name = binary_file_name(binary);
    let target = service_dir.join(&file_name);

    if is_gzip(url, bytes) {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
        archive.set_preserve_permissions(false);
        #[cfg(unix)]
        archive.set_unpack_xattrs(false);

        let mut found = false;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.to_path_buf();
            let is_binary = entry.header().entry_type().is_file()
                && entry_path.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str());
            if is_binary {
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                std::fs::write(&target, &data)?;
                found = true;
            } else {
                // unpack_in 拒绝越出目标目录的路径
                entry.unpack_in(service_dir)?;
            }
        }
        if !found {
            return Err(ServiceError::Discovery(format!(
                "archive does not contain {file_name}"
            )));
        }
    } else {
        std::fs::write(&target, bytes)?;
    }

    set_executable(&target)?;
    Ok(target)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
