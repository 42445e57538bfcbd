use std::path::{Path, PathBuf};

use fastpull_blos::StoreError;

use crate::verify::ArchiveKind;

/// Failure reported by a [`crate::Downloader`] while transferring a URL.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("[FP820] failed to fetch {url}: {message}")]
pub struct FetchError {
    pub url: String,
    pub message: String,
    /// Whether another attempt could plausibly succeed.
    pub retry: bool,
}

impl FetchError {
    pub fn new(url: impl Into<String>, message: impl Into<String>, retry: bool) -> Self {
        Self {
            url: url.into(),
            message: message.into(),
            retry,
        }
    }
}

/// A downloaded archive that failed its listing check.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("[FP821] {archive} integrity check failed for {url} ({}): {detail}", temp_path.display())]
pub struct FileIntegrityError {
    pub temp_path: PathBuf,
    pub url: String,
    pub archive: ArchiveKind,
    pub detail: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Integrity(#[from] FileIntegrityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("[FP830] record store {}: {message}", path.display())]
    Records { path: PathBuf, message: String },
    #[error("[FP831] invalid scope id '{0}'")]
    InvalidScope(String),
    #[error("[FP822] http client setup failed: {0}")]
    Client(String),
    #[error("[FP840] {action} {}: {message}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        message: String,
    },
    #[error("[FP850] background task failed: {0}")]
    Task(String),
}

impl Error {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FP820",
            Self::Integrity(_) => "FP821",
            Self::Client(_) => "FP822",
            Self::Store(err) => err.code(),
            Self::Records { .. } => "FP830",
            Self::InvalidScope(_) => "FP831",
            Self::Io { .. } => "FP840",
            Self::Task(_) => "FP850",
        }
    }

    pub(crate) fn io(action: &'static str, path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn records(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Records {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Run synchronous store work off the async executor.
pub(crate) async fn blocking<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| Error::Task(err.to_string()))?
}
