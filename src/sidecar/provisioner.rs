//! Ensure the sidecar executable exists locally, fetching it if absent.
//!
//! The final path is only ever produced by an atomic rename from a temp file
//! in the same directory, so concurrent provisioners never observe a partial
//! executable and a failed download leaves nothing behind.

use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::sidecar::config::{SupervisorConfig, platform_tag};
use crate::sidecar::error::ProvisionError;

/// Cap on downloaded and decompressed sizes.
const MAX_ARTIFACT_SIZE: u64 = 256 * 1024 * 1024;

/// How a [`BinaryArtifact`] came to be on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Present before this call; no network access happened.
    Cached,
    /// Fetched by this call.
    Downloaded,
}

/// A located executable.
#[derive(Debug, Clone)]
pub struct BinaryArtifact {
    /// Path of the executable.
    pub path: PathBuf,
    /// Release tag it was (or would have been) fetched from.
    pub version: String,
    /// SHA-256 of the downloaded bytes. `None` for cached artifacts, which are
    /// trusted by presence.
    pub sha256: Option<String>,
    /// Whether this call downloaded it.
    pub provenance: Provenance,
}

/// Fetches and caches the sidecar executable.
pub struct BinaryProvisioner {
    binary_dir: PathBuf,
    binary_name: String,
    version: String,
    url_template: String,
    expected_sha256: Option<String>,
    http_client: reqwest::Client,
}

impl BinaryProvisioner {
    /// Create a provisioner for the configured storage location.
    pub fn new(config: &SupervisorConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            binary_dir: config.binary_dir.clone(),
            binary_name: config.binary_name.clone(),
            version: config.version.clone(),
            url_template: config.download_url_template.clone(),
            expected_sha256: config.expected_sha256.clone(),
            http_client,
        }
    }

    /// Final path of the executable.
    pub fn binary_path(&self) -> PathBuf {
        self.binary_dir.join(&self.binary_name)
    }

    /// Download URL for this host.
    pub fn download_url(&self) -> Result<String, ProvisionError> {
        let platform = platform_tag().ok_or_else(|| ProvisionError::UnsupportedPlatform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })?;
        let url = render_download_url(&self.url_template, &self.version, platform);
        validate_download_url(&url)?;
        Ok(url)
    }

    /// Return the executable, downloading it first if it is missing.
    pub async fn ensure_binary(&self) -> Result<BinaryArtifact, ProvisionError> {
        let target = self.binary_path();

        if tokio::fs::metadata(&target)
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            tracing::debug!(path = %target.display(), "Sidecar binary already present");
            return Ok(BinaryArtifact {
                path: target,
                version: self.version.clone(),
                sha256: None,
                provenance: Provenance::Cached,
            });
        }

        let url = self.download_url()?;

        tokio::fs::create_dir_all(&self.binary_dir)
            .await
            .map_err(|source| ProvisionError::Filesystem {
                path: self.binary_dir.clone(),
                source,
            })?;

        tracing::info!(url = %url, path = %target.display(), "Downloading sidecar binary");
        let bytes = self.download(&url).await?;
        let actual = sha256_hex(&bytes);

        if let Some(ref expected) = self.expected_sha256 {
            verify_sha256(&actual, expected, &url)?;
        }

        let dir = self.binary_dir.clone();
        let name = self.binary_name.clone();
        let final_path = target.clone();
        let source_url = url.clone();
        tokio::task::spawn_blocking(move || {
            install_artifact(&bytes, &dir, &name, &final_path, &source_url)
        })
        .await
        .map_err(|e| ProvisionError::Filesystem {
            path: target.clone(),
            source: std::io::Error::other(e.to_string()),
        })??;

        tracing::info!(
            path = %target.display(),
            sha256 = %actual,
            "Sidecar binary installed"
        );

        Ok(BinaryArtifact {
            path: target,
            version: self.version.clone(),
            sha256: Some(actual),
            provenance: Provenance::Downloaded,
        })
    }

    /// Stream the artifact into memory, enforcing the size cap.
    async fn download(&self, url: &str) -> Result<bytes::Bytes, ProvisionError> {
        let response =
            self.http_client
                .get(url)
                .send()
                .await
                .map_err(|e| ProvisionError::Download {
                    url: url.to_string(),
                    reason: download_failure_reason(&e),
                })?;

        let response = response
            .error_for_status()
            .map_err(|e| ProvisionError::Download {
                url: url.to_string(),
                reason: format!(
                    "http status {}",
                    e.status()
                        .map_or("unknown".to_string(), |status| status.as_u16().to_string())
                ),
            })?;

        if let Some(len) = response.content_length()
            && len > MAX_ARTIFACT_SIZE
        {
            return Err(ProvisionError::Download {
                url: url.to_string(),
                reason: format!("artifact too large ({len} bytes, max {MAX_ARTIFACT_SIZE})"),
            });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProvisionError::Download {
                url: url.to_string(),
                reason: format!("failed to read response body: {}", e),
            })?;
            if body.len() as u64 + chunk.len() as u64 > MAX_ARTIFACT_SIZE {
                return Err(ProvisionError::Download {
                    url: url.to_string(),
                    reason: format!("artifact exceeds {MAX_ARTIFACT_SIZE} bytes"),
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(ProvisionError::Download {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        Ok(bytes::Bytes::from(body))
    }
}

fn download_failure_reason(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else if error.is_request() {
        "request failed".to_string()
    } else {
        "network error".to_string()
    }
}

pub(crate) fn render_download_url(template: &str, version: &str, platform: &str) -> String {
    template
        .replace("{version}", version)
        .replace("{platform}", platform)
}

/// Require https, except for loopback mirrors.
pub(crate) fn validate_download_url(url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDownloadUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = url::Url::parse(url).map_err(|e| invalid(format!("invalid URL: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("URL host is missing".to_string()))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(host) => Ok(()),
        "http" => Err(invalid(
            "plain http is only allowed for loopback hosts".to_string(),
        )),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn verify_sha256(actual: &str, expected: &str, url: &str) -> Result<(), ProvisionError> {
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ProvisionError::Checksum {
            url: url.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Check if bytes start with gzip magic number (0x1f 0x8b).
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Write the executable into a temp file beside `final_path`, then rename.
///
/// The temp file is removed on every error path when it is dropped.
fn install_artifact(
    bytes: &[u8],
    dir: &Path,
    binary_name: &str,
    final_path: &Path,
    url: &str,
) -> Result<(), ProvisionError> {
    let fs_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ProvisionError::Filesystem { path, source }
    };

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}-", binary_name))
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(fs_err(dir))?;

    if is_gzip(bytes) {
        extract_binary_from_tar_gz(bytes, binary_name, temp.as_file_mut(), url)?;
    } else {
        temp.write_all(bytes).map_err(fs_err(temp.path()))?;
    }

    temp.as_file().sync_all().map_err(fs_err(temp.path()))?;
    set_executable(temp.path()).map_err(fs_err(temp.path()))?;

    temp.persist(final_path)
        .map_err(|e| ProvisionError::Filesystem {
            path: final_path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

/// Copy the entry named `binary_name` out of a tar.gz bundle.
fn extract_binary_from_tar_gz(
    bytes: &[u8],
    binary_name: &str,
    out: &mut std::fs::File,
    url: &str,
) -> Result<(), ProvisionError> {
    use flate2::read::GzDecoder;
    use std::io::Read as _;
    use tar::Archive;

    let bundle_err = |reason: String| ProvisionError::Download {
        url: url.to_string(),
        reason,
    };

    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(false);
    #[cfg(unix)]
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| bundle_err(format!("failed to read tar.gz entries: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| bundle_err(format!("failed to read tar.gz entry: {}", e)))?;

        if entry.size() > MAX_ARTIFACT_SIZE {
            return Err(bundle_err(format!(
                "archive entry too large ({} bytes, max {} bytes)",
                entry.size(),
                MAX_ARTIFACT_SIZE
            )));
        }

        let entry_path = entry
            .path()
            .map_err(|e| bundle_err(format!("invalid path in tar.gz: {}", e)))?
            .to_path_buf();

        // Match by filename, ignoring any directory prefix in the archive
        let filename = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");

        if filename == binary_name && entry.header().entry_type().is_file() {
            let mut limited = entry.by_ref().take(MAX_ARTIFACT_SIZE);
            std::io::copy(&mut limited, out).map_err(|e| {
                bundle_err(format!("failed to read {} from archive: {}", binary_name, e))
            })?;
            return Ok(());
        }
    }

    Err(bundle_err(format!(
        "tar.gz archive does not contain '{}'",
        binary_name
    )))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
