//! Launcher self-update.
//!
//! A JSON manifest `{ "version", "url", "sha256" }` names the newest launcher build. A
//! newer build is downloaded, verified and staged in the data directory while the
//! launcher runs; the next start that is past setup swaps it in and relaunches.

use core::{cmp::Ordering, time::Duration};
use std::{
    env,
    fs::Permissions,
    io::{self, ErrorKind},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error as ThisError;
use tokio::fs;
use tracing::{debug, info};

use crate::config::UpdateConfig;

pub(crate) const STAGED_BINARY: &str = "launcher.new";
/// Written last; its presence marks a complete staged update.
pub(crate) const STAGED_VERSION: &str = "launcher.version";

/// Describes the newest published launcher build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub version: String,
    pub url: String,
    /// Hex encoded SHA-256 of the binary behind `url`.
    pub sha256: String,
}

#[derive(Debug, ThisError)]
pub enum UpdateError {
    #[error("update request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("update server answered {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("malformed update manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("downloaded launcher has checksum {actual}, manifest says {expected}")]
    Checksum { expected: String, actual: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> UpdateError + '_ {
    move |source| UpdateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Numeric components of a `1.2.3`, `v1.2.3` or `1.2.3-rc1` style version.
fn version_parts(version: &str) -> Vec<u64> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next().unwrap_or_default();
    core.split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Whether `candidate` is a strictly higher version than `current`.
#[must_use]
pub fn is_newer(candidate: &str, current: &str) -> bool {
    let (mut a, mut b) = (version_parts(candidate), version_parts(current));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b) == Ordering::Greater
}

/// Stages and applies launcher updates for one executable.
#[derive(Debug, Clone)]
pub struct SelfUpdater {
    staging_dir: PathBuf,
    exe: PathBuf,
    current_version: String,
}

impl SelfUpdater {
    #[must_use]
    pub fn new(staging_dir: PathBuf, exe: PathBuf, current_version: &str) -> Self {
        Self {
            staging_dir,
            exe,
            current_version: current_version.to_owned(),
        }
    }

    /// Updater for the running executable, staging below `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the running executable cannot be located.
    pub fn for_current_exe(data_dir: &Path) -> io::Result<Self> {
        Ok(Self::new(
            data_dir.join("update"),
            env::current_exe()?,
            env!("CARGO_PKG_VERSION"),
        ))
    }

    /// The executable updates are applied to. Captured up front: once a build is swapped
    /// in, the running process can no longer resolve its own path.
    #[must_use]
    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn staged_binary(&self) -> PathBuf {
        self.staging_dir.join(STAGED_BINARY)
    }

    fn staged_version(&self) -> PathBuf {
        self.staging_dir.join(STAGED_VERSION)
    }

    async fn read_staged_version(&self) -> Result<Option<String>, UpdateError> {
        let path = self.staged_version();
        match fs::read_to_string(&path).await {
            Ok(version) => Ok(Some(version.trim().to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn get(
        client: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, UpdateError> {
        let response = client.get(url).timeout(timeout).send().await?;
        if response.status() != StatusCode::OK {
            return Err(UpdateError::Status {
                status: response.status(),
                url: url.to_owned(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Downloads and stages the build named by the manifest if it is newer than this
    /// launcher. Returns the staged version, or `None` when there is nothing new to stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or binary cannot be fetched, the checksum does
    /// not match, or staging fails. Nothing is staged in that case.
    pub async fn fetch_if_newer(
        &self,
        client: &reqwest::Client,
        config: &UpdateConfig,
    ) -> Result<Option<String>, UpdateError> {
        let Some(ref manifest_url) = config.manifest_url else {
            return Ok(None);
        };
        let timeout = Duration::from_secs(config.timeout_secs);
        let manifest: UpdateManifest =
            serde_json::from_slice(&Self::get(client, manifest_url, timeout).await?)?;

        if !is_newer(&manifest.version, &self.current_version) {
            debug!(
                available = %manifest.version,
                current = %self.current_version,
                "Launcher is up to date"
            );
            return Ok(None);
        }
        if self.read_staged_version().await?.as_deref() == Some(manifest.version.as_str()) {
            debug!(version = %manifest.version, "Launcher update already staged");
            return Ok(None);
        }

        info!(version = %manifest.version, url = %manifest.url, "Downloading launcher update");
        let binary = Self::get(client, &manifest.url, timeout).await?;
        let actual = hex::encode(Sha256::digest(&binary));
        if !actual.eq_ignore_ascii_case(manifest.sha256.trim()) {
            return Err(UpdateError::Checksum {
                expected: manifest.sha256,
                actual,
            });
        }

        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(io_error(&self.staging_dir))?;
        // an older staged version must not pair with the new binary
        drop(fs::remove_file(self.staged_version()).await);
        let staged_binary = self.staged_binary();
        fs::write(&staged_binary, &binary)
            .await
            .map_err(io_error(&staged_binary))?;
        let staged_version = self.staged_version();
        fs::write(&staged_version, &manifest.version)
            .await
            .map_err(io_error(&staged_version))?;

        info!(version = %manifest.version, "Launcher update staged for the next start");
        Ok(Some(manifest.version))
    }

    /// Replaces the executable with a staged newer build. Returns the version now
    /// installed, or `None` when nothing applicable was staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be replaced. The old executable stays
    /// in place in that case.
    pub async fn apply_staged(&self) -> Result<Option<String>, UpdateError> {
        let Some(version) = self.read_staged_version().await? else {
            return Ok(None);
        };
        if !is_newer(&version, &self.current_version) {
            debug!(%version, "Discarding staged launcher update that is not newer");
            self.discard_staged().await;
            return Ok(None);
        }

        let file_name = self
            .exe
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        // same directory so the final rename cannot cross filesystems
        let incoming = self.exe.with_file_name(format!(".{file_name}.incoming"));
        let staged_binary = self.staged_binary();
        fs::copy(&staged_binary, &incoming)
            .await
            .map_err(io_error(&staged_binary))?;
        fs::set_permissions(&incoming, Permissions::from_mode(0o755))
            .await
            .map_err(io_error(&incoming))?;
        if let Err(e) = fs::rename(&incoming, &self.exe).await {
            drop(fs::remove_file(&incoming).await);
            return Err(io_error(&self.exe)(e));
        }

        self.discard_staged().await;
        info!(%version, exe = ?self.exe, "Applied launcher update");
        Ok(Some(version))
    }

    async fn discard_staged(&self) {
        if let Err(e) = fs::remove_dir_all(&self.staging_dir).await
            && e.kind() != ErrorKind::NotFound
        {
            debug!("Failed to clean up {}: {e}", self.staging_dir.display());
        }
    }
}
