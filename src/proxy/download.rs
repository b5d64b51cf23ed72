//! Engine binary and routing data acquisition.
//!
//! # Binary
//! ```text
//! install_binary()
//!   → binary present? done
//!   → discover (version, asset) from each source in order
//!       PlainText:     body is the version tag, asset name is computed
//!       GithubRelease: tag_name plus the matching .zip asset
//!   → nothing answered? fall back to FALLBACK_VERSION
//!   → GET <download_base>/<version>/<asset> from each source in order
//!   → extract `xray` from the archive into <binary>.tmp, chmod, rename
//! ```
//!
//! # Data files
//! `geoip.dat` and `geosite.dat` are placed next to the binary. They only
//! affect routing quality, so failures degrade to warnings.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::atomic::{temp_path, write_atomic};
use super::error::{ProxyError, Result};

/// Version used when no source answers the discovery request.
pub const FALLBACK_VERSION: &str = "v1.8.4";

const PLAIN_VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const RELEASE_API_TIMEOUT: Duration = Duration::from_secs(30);
const BINARY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DATA_FILE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

const USER_AGENT: &str = concat!("xray-pilot/", env!("CARGO_PKG_VERSION"));

/// Shape of a source's version endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionFormat {
    /// Body is the version tag, e.g. `v1.8.24`.
    PlainText,
    /// GitHub "latest release" JSON.
    GithubRelease,
}

/// One place the engine can be downloaded from.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub name: String,
    pub version_url: String,
    /// Release archives live at `<download_base>/<version>/<asset>`.
    pub download_base: String,
    pub format: VersionFormat,
}

impl DownloadSource {
    pub fn new(
        name: impl Into<String>,
        version_url: impl Into<String>,
        download_base: impl Into<String>,
        format: VersionFormat,
    ) -> Self {
        Self {
            name: name.into(),
            version_url: version_url.into(),
            download_base: download_base.into(),
            format,
        }
    }

    fn archive_url(&self, version: &str, asset: &str) -> String {
        format!(
            "{}/{}/{}",
            self.download_base.trim_end_matches('/'),
            version,
            asset
        )
    }
}

/// A routing data file with mirrors tried in order.
#[derive(Debug, Clone)]
pub struct DataFile {
    pub name: String,
    pub urls: Vec<String>,
}

impl DataFile {
    pub fn new(name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            urls,
        }
    }
}

/// Regional CDN mirror first, upstream GitHub releases second.
pub fn default_sources() -> Vec<DownloadSource> {
    vec![
        DownloadSource::new(
            "Cloudflare CDN (crosh mirror)",
            "https://crosh.boomyao.com/xray/VERSION",
            "https://crosh.boomyao.com/xray",
            VersionFormat::PlainText,
        ),
        DownloadSource::new(
            "GitHub",
            "https://api.github.com/repos/XTLS/Xray-core/releases/latest",
            "https://github.com/XTLS/Xray-core/releases/download",
            VersionFormat::GithubRelease,
        ),
    ]
}

pub fn default_data_files() -> Vec<DataFile> {
    ["geoip.dat", "geosite.dat"]
        .into_iter()
        .map(|name| {
            DataFile::new(
                name,
                vec![
                    format!("https://crosh.boomyao.com/xray/{name}"),
                    format!(
                        "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/{name}"
                    ),
                ],
            )
        })
        .collect()
}

/// Map a Rust target os/arch pair onto Xray-core release naming.
pub fn platform_names(os: &str, arch: &str) -> (String, String) {
    let os = match os {
        "macos" | "darwin" => "macos",
        other => other,
    };
    let arch = match arch {
        "x86_64" | "amd64" => "64",
        "x86" | "386" => "32",
        "aarch64" | "arm64" => "arm64-v8a",
        "arm" => "arm32-v7a",
        a if a.starts_with("mips64") => "mips64",
        a if a.starts_with("mips") => "mips32",
        other => other,
    };
    (os.to_string(), arch.to_string())
}

/// Release archive name, e.g. `Xray-linux-64.zip`.
pub fn asset_name(os: &str, arch: &str) -> String {
    let (os, arch) = platform_names(os, arch);
    format!("Xray-{os}-{arch}.zip")
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
}

/// Downloads the engine binary and its data files.
pub struct EngineInstaller {
    client: reqwest::Client,
    binary_path: PathBuf,
    sources: Vec<DownloadSource>,
    data_files: Vec<DataFile>,
    os: String,
    arch: String,
}

impl EngineInstaller {
    /// # Errors
    /// `Download` when the HTTP client cannot be built.
    pub fn new(
        binary_path: impl Into<PathBuf>,
        sources: Vec<DownloadSource>,
        data_files: Vec<DataFile>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .no_proxy()
            .build()
            .map_err(|e| {
                ProxyError::Download(format!("failed to build download HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            binary_path: binary_path.into(),
            sources,
            data_files,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }

    /// Installer using the public mirrors.
    pub fn with_defaults(binary_path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(binary_path, default_sources(), default_data_files())
    }

    /// Override the target platform used for asset naming.
    pub fn platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.os = os.into();
        self.arch = arch.into();
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Directory data files are written to.
    pub fn data_dir(&self) -> &Path {
        self.binary_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Binary plus data files. Only binary failures are errors.
    pub async fn install(&self) -> Result<()> {
        self.install_binary().await?;
        let failed = self.install_data_files().await;
        if !failed.is_empty() {
            tracing::warn!(
                "routing rules may not work without {}",
                failed.join(", ")
            );
        }
        Ok(())
    }

    /// Make sure the engine binary exists at `binary_path`.
    ///
    /// # Errors
    /// Every source failed; the message carries each source's reason.
    /// `Archive` when the last source answered with an unusable archive,
    /// `Download` otherwise.
    pub async fn install_binary(&self) -> Result<()> {
        if self.binary_path.exists() {
            tracing::debug!("xray-core already present at {}", self.binary_path.display());
            return Ok(());
        }

        if let Some(parent) = self.binary_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::io(parent, e))?;
        }

        let (version, asset) = match self.discover_release().await {
            Some(found) => found,
            None => {
                tracing::warn!("no source reported a version, falling back to {FALLBACK_VERSION}");
                (FALLBACK_VERSION.to_string(), self.asset_name())
            }
        };
        tracing::info!("downloading xray-core {version} ({asset})");

        let mut failures = Vec::new();
        let mut last_was_archive = false;
        for (i, source) in self.sources.iter().enumerate() {
            let url = source.archive_url(&version, &asset);
            tracing::info!(
                "trying source {}/{}: {}",
                i + 1,
                self.sources.len(),
                source.name
            );
            let archive = match self.get_bytes(&url, BINARY_TIMEOUT).await {
                Ok(bytes) => bytes,
                Err(reason) => {
                    tracing::warn!("{} failed: {reason}", source.name);
                    failures.push(format!("{}: {reason}", source.name));
                    last_was_archive = false;
                    continue;
                }
            };
            match extract_engine_blocking(archive, self.binary_path.clone()).await {
                Ok(()) => {
                    tracing::info!("installed xray-core at {}", self.binary_path.display());
                    return Ok(());
                }
                Err(e @ ProxyError::Archive(_)) => {
                    tracing::warn!("{} served an unusable archive: {e}", source.name);
                    failures.push(format!("{}: {e}", source.name));
                    last_was_archive = true;
                }
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            return Err(ProxyError::Download(
                "no download sources configured".to_string(),
            ));
        }
        let message = failures.join("; ");
        Err(if last_was_archive {
            ProxyError::Archive(message)
        } else {
            ProxyError::Download(message)
        })
    }

    /// Fetch missing data files. Returns the names that could not be fetched.
    pub async fn install_data_files(&self) -> Vec<String> {
        let dir = self.data_dir();
        let mut failed = Vec::new();

        for file in &self.data_files {
            let target = dir.join(&file.name);
            if target.exists() {
                tracing::debug!("{} already present", file.name);
                continue;
            }

            let mut installed = false;
            for (i, url) in file.urls.iter().enumerate() {
                tracing::debug!("fetching {} from mirror {}/{}", file.name, i + 1, file.urls.len());
                match self.get_bytes(url, DATA_FILE_TIMEOUT).await {
                    Ok(bytes) => match write_atomic(&target, &bytes).await {
                        Ok(()) => {
                            tracing::info!("downloaded {}", file.name);
                            installed = true;
                            break;
                        }
                        Err(e) => tracing::warn!("failed to save {}: {e}", file.name),
                    },
                    Err(reason) => tracing::warn!("{} from {url}: {reason}", file.name),
                }
            }

            if !installed {
                tracing::warn!("could not download {}", file.name);
                failed.push(file.name.clone());
            }
        }
        failed
    }

    fn asset_name(&self) -> String {
        asset_name(&self.os, &self.arch)
    }

    /// First source that reports a version wins.
    async fn discover_release(&self) -> Option<(String, String)> {
        for source in &self.sources {
            let found = match source.format {
                VersionFormat::PlainText => self.plain_version(source).await,
                VersionFormat::GithubRelease => self.release_version(source).await,
            };
            match found {
                Ok(found) => return Some(found),
                Err(reason) => {
                    tracing::debug!("version lookup via {} failed: {reason}", source.name)
                }
            }
        }
        None
    }

    async fn plain_version(
        &self,
        source: &DownloadSource,
    ) -> std::result::Result<(String, String), String> {
        let body = self.get_bytes(&source.version_url, PLAIN_VERSION_TIMEOUT).await?;
        let version = String::from_utf8_lossy(&body).trim().to_string();
        if version.is_empty() {
            return Err("empty version".to_string());
        }
        Ok((version, self.asset_name()))
    }

    async fn release_version(
        &self,
        source: &DownloadSource,
    ) -> std::result::Result<(String, String), String> {
        let body = self.get_bytes(&source.version_url, RELEASE_API_TIMEOUT).await?;
        let release: Release =
            serde_json::from_slice(&body).map_err(|e| format!("bad release JSON: {e}"))?;
        let (os, arch) = platform_names(&self.os, &self.arch);
        let asset = pick_release_asset(&release, &format!("Xray-{os}-{arch}"))
            .ok_or_else(|| format!("no asset for {os}-{arch} in {}", release.tag_name))?;
        Ok((release.tag_name, asset))
    }

    async fn get_bytes(&self, url: &str, timeout: Duration) -> std::result::Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| format!("failed to read body: {e}"))
    }
}

fn pick_release_asset(release: &Release, prefix: &str) -> Option<String> {
    release
        .assets
        .iter()
        .find(|a| a.name.contains(prefix) && a.name.ends_with(".zip"))
        .map(|a| a.name.clone())
}

fn is_engine_entry(name: &str) -> bool {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if cfg!(windows) {
        matches!(base, "xray.exe" | "xray-core.exe")
    } else {
        matches!(base, "xray" | "xray-core")
    }
}

/// Run `extract_engine` off the async workers; the copy is several MB of
/// blocking file IO.
async fn extract_engine_blocking(archive: Vec<u8>, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || extract_engine(&archive, &dest))
        .await
        .map_err(|e| ProxyError::Archive(format!("extraction task failed: {e}")))?
}

/// Extract the engine executable from a release zip into `dest`.
pub(crate) fn extract_engine(archive: &[u8], dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| ProxyError::Archive(format!("unreadable zip: {e}")))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ProxyError::Archive(format!("bad entry #{i}: {e}")))?;
        if entry.is_dir() || !is_engine_entry(entry.name()) {
            continue;
        }

        let tmp = temp_path(dest);
        let written = std::fs::File::create(&tmp)
            .and_then(|mut out| std::io::copy(&mut entry, &mut out).map(|_| ()))
            .and_then(|()| make_executable(&tmp))
            .and_then(|()| std::fs::rename(&tmp, dest));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(ProxyError::io(dest, e));
        }
        return Ok(());
    }

    Err(ProxyError::Archive("xray binary not found in archive".to_string()))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
