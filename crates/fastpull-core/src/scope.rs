//! Named partitions mapping URLs and dynamic keys onto blobs.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use fastpull_blos::{Blob, BlobQuery, BlobStore, StoreError};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    database::{ContentStoreSink, Shared},
    error::{blocking, Error, Result},
    pipeline::Pipeline,
    records::{DynamicIntegrityRecord, DynamicKey, Metadata, RecordStore, UrlIntegrityRecord},
    request::FetchRequest,
    spider::Downloader,
};

const FINAL_NAME_FIELD: &str = "final_name";
const CREATED_ON_FIELD: &str = "created_on";

/// Result of resolving a record against the blob store.
#[derive(Debug)]
enum Lookup<R> {
    Hit(Blob, R),
    /// Record present but its blob is gone.
    Stale(R),
    Miss,
}

pub struct IntegrityScope<D> {
    id: String,
    shared: Arc<Shared<D>>,
    url_records: Arc<RecordStore<UrlIntegrityRecord>>,
    dynamic_records: Arc<RecordStore<DynamicIntegrityRecord>>,
    // One async mutex per URL currently being resolved.
    url_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<D> std::fmt::Debug for IntegrityScope<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityScope")
            .field("id", &self.id)
            .field("url_records", &self.url_records.path())
            .field("dynamic_records", &self.dynamic_records.path())
            .finish_non_exhaustive()
    }
}

impl<D: Downloader> IntegrityScope<D> {
    pub(crate) fn open(id: &str, dir: &Path, shared: Arc<Shared<D>>) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            shared,
            url_records: Arc::new(RecordStore::open(dir)?),
            dynamic_records: Arc::new(RecordStore::open(dir)?),
            url_locks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve `request.url` to a blob, downloading only when this scope has
    /// no live mapping for it.
    ///
    /// Concurrent calls for the same URL run one at a time, so only the first
    /// downloads and the rest see its record.
    ///
    /// # Errors
    ///
    /// Download and integrity failures propagate unchanged; nothing is
    /// recorded for the URL in that case.
    pub async fn get_file_by_url(&self, request: &FetchRequest) -> Result<Blob> {
        let lock = self.url_lock(&request.url).await;
        let result = {
            let _held = lock.lock().await;
            self.resolve_url(request).await
        };
        self.release_url_lock(&request.url, lock).await;
        result
    }

    async fn resolve_url(&self, request: &FetchRequest) -> Result<Blob> {
        let url = &request.url;
        match self.lookup_url(url).await? {
            Lookup::Hit(blob, _) => {
                debug!(scope = %self.id, %url, sha512 = %blob.sha512(), "integrity hit");
                return Ok(blob);
            }
            Lookup::Stale(record) => {
                warn!(
                    scope = %self.id,
                    %url,
                    sha512 = %record.sha512,
                    "recorded blob is missing; fetching again"
                );
            }
            Lookup::Miss => debug!(scope = %self.id, %url, "integrity miss"),
        }

        let pipeline = Pipeline::new(
            self.shared.verifier,
            ContentStoreSink::new(Arc::clone(&self.shared)),
        );
        let blob = self.shared.downloader.download(request, &pipeline).await?;

        let record = UrlIntegrityRecord::new(url.clone(), blob.sha512());
        let records = Arc::clone(&self.url_records);
        blocking(move || records.write(&record)).await?;
        debug!(scope = %self.id, %url, sha512 = %blob.sha512(), "url record updated");
        Ok(blob)
    }

    /// The stored mapping for `url`, if any. Does not check the blob store.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read.
    pub async fn url_record(&self, url: &str) -> Result<Option<UrlIntegrityRecord>> {
        let records = Arc::clone(&self.url_records);
        let url = url.to_string();
        blocking(move || records.read(&url)).await
    }

    /// Blob and metadata recorded for `key`, or `(None, None)` when the key was
    /// never stored or its blob has since disappeared.
    ///
    /// # Errors
    ///
    /// Returns an error only when a store cannot be read.
    pub async fn get_file_dynamic(&self, key: &DynamicKey) -> Result<(Option<Blob>, Option<Metadata>)> {
        match self.lookup_dynamic(key).await? {
            Lookup::Hit(blob, record) => {
                debug!(scope = %self.id, key = %key.canonical_json(), "dynamic hit");
                Ok((Some(blob), Some(record.metadata)))
            }
            Lookup::Stale(_) => {
                warn!(scope = %self.id, key = %key.canonical_json(), "dynamic record points at a missing blob");
                Ok((None, None))
            }
            Lookup::Miss => Ok((None, None)),
        }
    }

    /// Insert `path` into the blob store and map `key` to it, replacing any
    /// previous mapping. `metadata.created_on` is set to the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stored or the record written.
    pub async fn store_file_dynamic(
        &self,
        key: &DynamicKey,
        path: &Path,
        mut metadata: Metadata,
    ) -> Result<Blob> {
        let now = OffsetDateTime::now_utc();
        let stamp = now
            .format(&Rfc3339)
            .map_err(|err| Error::records(self.dynamic_records.path(), err))?;
        metadata.insert(CREATED_ON_FIELD.to_string(), Value::String(stamp));

        let blos = self.shared.blos.clone();
        let source: PathBuf = path.to_path_buf();
        let blob = blocking(move || Ok(blos.insert_blob(&source)?)).await?;

        let record = DynamicIntegrityRecord {
            key: key.clone(),
            hashes: blob.hashes.clone(),
            metadata,
            updated_on: now,
        };
        let records = Arc::clone(&self.dynamic_records);
        blocking(move || records.write(&record)).await?;
        debug!(
            scope = %self.id,
            key = %key.canonical_json(),
            sha512 = %blob.sha512(),
            "dynamic record stored"
        );
        Ok(blob)
    }

    /// [`Self::get_file_dynamic`] with `final_name` folded into the key.
    ///
    /// # Errors
    ///
    /// See [`Self::get_file_dynamic`].
    pub async fn find_dynamic_by_name(
        &self,
        final_name: &str,
        key: &DynamicKey,
    ) -> Result<(Option<Blob>, Option<Metadata>)> {
        self.get_file_dynamic(&named_key(final_name, key)).await
    }

    /// [`Self::store_file_dynamic`] with `final_name` folded into the key.
    ///
    /// # Errors
    ///
    /// See [`Self::store_file_dynamic`].
    pub async fn store_file_dynamic_by_name(
        &self,
        final_name: &str,
        key: &DynamicKey,
        path: &Path,
        metadata: Metadata,
    ) -> Result<Blob> {
        self.store_file_dynamic(&named_key(final_name, key), path, metadata)
            .await
    }

    async fn lookup_url(&self, url: &str) -> Result<Lookup<UrlIntegrityRecord>> {
        let records = Arc::clone(&self.url_records);
        let blos = self.shared.blos.clone();
        let url = url.to_string();
        blocking(move || {
            let Some(record) = records.read(&url)? else {
                return Ok(Lookup::Miss);
            };
            let blob = resolve_blob(&blos, &record.sha512)?;
            Ok(match blob {
                Some(blob) => Lookup::Hit(blob, record),
                None => Lookup::Stale(record),
            })
        })
        .await
    }

    async fn lookup_dynamic(&self, key: &DynamicKey) -> Result<Lookup<DynamicIntegrityRecord>> {
        let records = Arc::clone(&self.dynamic_records);
        let blos = self.shared.blos.clone();
        let derived = key.digest();
        blocking(move || {
            let Some(record) = records.read(&derived)? else {
                return Ok(Lookup::Miss);
            };
            let Some(sha512) = record.sha512() else {
                return Ok(Lookup::Stale(record));
            };
            Ok(match resolve_blob(&blos, sha512)? {
                Some(blob) => Lookup::Hit(blob, record),
                None => Lookup::Stale(record),
            })
        })
        .await
    }

    async fn url_lock(&self, url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.url_locks.lock().await;
        Arc::clone(
            locks
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn release_url_lock(&self, url: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.url_locks.lock().await;
        // The map and `lock` are the only holders once nobody else waits.
        let idle = Arc::strong_count(&lock) == 2;
        drop(lock);
        if idle {
            locks.remove(url);
        }
    }
}

/// Blob named by a recorded digest; malformed digests count as missing.
fn resolve_blob(blos: &BlobStore, sha512: &str) -> Result<Option<Blob>> {
    match blos.read(&BlobQuery::sha512(sha512)) {
        Ok(blob) => Ok(blob),
        Err(StoreError::InvalidDigest { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn named_key(final_name: &str, key: &DynamicKey) -> DynamicKey {
    key.clone().with(FINAL_NAME_FIELD, final_name)
}
