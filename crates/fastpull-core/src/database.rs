//! Process-wide root owning the blob store, downloader and scope registry.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use fastpull_blos::{Blob, BlobStore};
use tracing::{debug, info};

use crate::{
    config::FastpullConfig,
    error::{blocking, Error, Result},
    pipeline::Sink,
    request::DownloadResult,
    scope::IntegrityScope,
    spider::Downloader,
    verify::Verifier,
};

/// State every scope of one database shares.
#[derive(Debug)]
pub(crate) struct Shared<D> {
    pub(crate) blos: BlobStore,
    pub(crate) downloader: D,
    pub(crate) verifier: Verifier,
}

impl<D: Downloader> Shared<D> {
    /// Insert a finished download into the blob store, then let the
    /// downloader drop its temp file whatever the outcome.
    pub(crate) async fn complete(&self, download: DownloadResult) -> Result<Blob> {
        let blos = self.blos.clone();
        let (download, inserted) = blocking(move || {
            let inserted = blos.insert_hashed(download.path(), &download.hashes);
            Ok((download, inserted))
        })
        .await?;
        self.downloader.discard(download);
        let blob = inserted?;
        debug!(sha512 = %blob.sha512(), size = blob.size, "download stored");
        Ok(blob)
    }
}

/// Final pipeline stage: moves the download into the shared blob store.
#[derive(Debug)]
pub struct ContentStoreSink<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for ContentStoreSink<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Downloader> ContentStoreSink<D> {
    pub(crate) fn new(shared: Arc<Shared<D>>) -> Self {
        Self { shared }
    }
}

impl<D: Downloader> Sink for ContentStoreSink<D> {
    type Output = Blob;

    async fn finish(&self, download: DownloadResult) -> Result<Blob> {
        self.shared.complete(download).await
    }
}

pub struct IntegrityDatabase<D> {
    base_path: PathBuf,
    records_path: PathBuf,
    shared: Arc<Shared<D>>,
    scopes: Mutex<HashMap<String, Arc<IntegrityScope<D>>>>,
}

impl<D: Downloader> IntegrityDatabase<D> {
    /// Open the blob store described by `config` and wrap `downloader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob store cannot be opened.
    pub fn open(config: &FastpullConfig, downloader: D) -> Result<Self> {
        let blos = BlobStore::open(config.blos_path(), &config.hashes)?;
        info!(
            base = %config.base_path.display(),
            hashes = ?config.hashes,
            "integrity database opened"
        );
        Ok(Self {
            base_path: config.base_path.clone(),
            records_path: config.records_path(),
            shared: Arc::new(Shared {
                blos,
                downloader,
                verifier: Verifier,
            }),
            scopes: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub fn blos(&self) -> &BlobStore {
        &self.shared.blos
    }

    #[must_use]
    pub fn downloader(&self) -> &D {
        &self.shared.downloader
    }

    /// The scope named `scope_id`, created on first use and shared afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error for ids that are not a single safe path component, or
    /// if the scope's record stores cannot be opened.
    pub fn get_scope(&self, scope_id: &str) -> Result<Arc<IntegrityScope<D>>> {
        validate_scope_id(scope_id)?;
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scope) = scopes.get(scope_id) {
            return Ok(Arc::clone(scope));
        }
        let scope = Arc::new(IntegrityScope::open(
            scope_id,
            &self.records_path.join(scope_id),
            Arc::clone(&self.shared),
        )?);
        debug!(scope = scope_id, "integrity scope created");
        scopes.insert(scope_id.to_string(), Arc::clone(&scope));
        Ok(scope)
    }

    /// Store a finished download and release its temp file.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob store insert fails.
    pub async fn fetch_completion_callback(&self, download: DownloadResult) -> Result<Blob> {
        self.shared.complete(download).await
    }

    /// The completion stage every scope ends its download pipeline with.
    #[must_use]
    pub fn completion_sink(&self) -> ContentStoreSink<D> {
        ContentStoreSink::new(Arc::clone(&self.shared))
    }
}

fn validate_scope_id(scope_id: &str) -> Result<()> {
    let valid = !scope_id.is_empty()
        && scope_id != "."
        && scope_id != ".."
        && scope_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidScope(scope_id.to_string()))
    }
}
