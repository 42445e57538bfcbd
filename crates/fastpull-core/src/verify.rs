//! Archive listing checks for downloaded files.

use std::{
    ffi::OsString,
    path::Path,
    process::Stdio,
};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::{FileIntegrityError, Result},
    pipeline::Transform,
    request::DownloadResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
pub enum ArchiveKind {
    #[strum(serialize = "tar.gz")]
    #[serde(rename = "tar.gz")]
    TarGz,
    #[strum(serialize = "tar.bz2")]
    #[serde(rename = "tar.bz2")]
    TarBz2,
    #[strum(serialize = "tar.xz")]
    #[serde(rename = "tar.xz")]
    TarXz,
    #[strum(serialize = "tar.zst")]
    #[serde(rename = "tar.zst")]
    TarZst,
    #[strum(serialize = "tar")]
    #[serde(rename = "tar")]
    Tar,
    #[strum(serialize = "gz")]
    #[serde(rename = "gz")]
    Gz,
    #[strum(serialize = "bz2")]
    #[serde(rename = "bz2")]
    Bz2,
    #[strum(serialize = "xz")]
    #[serde(rename = "xz")]
    Xz,
}

// Longest suffixes first so `.tar.gz` wins over `.gz`.
const SUFFIXES: &[(&str, ArchiveKind)] = &[
    (".tar.bz2", ArchiveKind::TarBz2),
    (".tar.zst", ArchiveKind::TarZst),
    (".tar.gz", ArchiveKind::TarGz),
    (".tar.xz", ArchiveKind::TarXz),
    (".tar", ArchiveKind::Tar),
    (".bz2", ArchiveKind::Bz2),
    (".gz", ArchiveKind::Gz),
    (".xz", ArchiveKind::Xz),
];

impl ArchiveKind {
    /// Classify a filename by extension (case-insensitive). `None` means the
    /// file is not checked.
    #[must_use]
    pub fn detect(filename: &str) -> Option<Self> {
        let lowered = filename.to_ascii_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| lowered.ends_with(suffix))
            .map(|(_, kind)| *kind)
    }

    /// Program and arguments that list or decompress `path`; exit 0 means the
    /// archive is readable.
    #[must_use]
    pub fn command(self, path: &Path) -> (&'static str, Vec<OsString>) {
        let flags: &[&str] = match self {
            Self::TarGz => &["tzf"],
            Self::TarBz2 => &["tjf"],
            Self::TarXz => &["tJf"],
            Self::TarZst => &["-t", "--zstd", "-f"],
            Self::Tar => &["-t", "-f"],
            Self::Gz | Self::Bz2 | Self::Xz => &["-dc"],
        };
        let program = match self {
            Self::TarGz | Self::TarBz2 | Self::TarXz | Self::TarZst | Self::Tar => "tar",
            Self::Gz => "gzip",
            Self::Bz2 => "bzip2",
            Self::Xz => "xz",
        };
        let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();
        args.push(path.as_os_str().to_os_string());
        (program, args)
    }
}

/// Pipeline stage rejecting downloads whose archive listing fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verifier;

impl Verifier {
    /// Check `path` as the archive type implied by `filename`.
    ///
    /// Returns the detected kind, or `None` when the extension is not one we
    /// know how to check.
    ///
    /// # Errors
    ///
    /// Returns [`FileIntegrityError`] when the listing command exits non-zero
    /// or cannot be started.
    pub async fn check_file(
        &self,
        path: &Path,
        filename: &str,
        url: &str,
    ) -> Result<Option<ArchiveKind>, FileIntegrityError> {
        let Some(kind) = ArchiveKind::detect(filename) else {
            debug!(%url, filename, "no integrity check for extension");
            return Ok(None);
        };
        let (program, args) = kind.command(path);
        let failure = |detail: String| FileIntegrityError {
            temp_path: path.to_path_buf(),
            url: url.to_string(),
            archive: kind,
            detail,
        };
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| failure(format!("failed to run {program}: {err}")))?;
        if output.status.success() {
            debug!(%url, archive = %kind, "archive verified");
            return Ok(Some(kind));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr
        };
        warn!(%url, archive = %kind, %detail, "archive failed integrity check");
        Err(failure(detail))
    }
}

impl Transform for Verifier {
    async fn apply(&self, download: DownloadResult) -> Result<DownloadResult> {
        let filename = download.request.filename();
        self.check_file(download.path(), &filename, &download.request.url)
            .await?;
        Ok(download)
    }
}
