//! Base layer object store: immutable blobs addressed by their sha512 digest.
//!
//! Objects live under `objects/<aa>/<bb>/<sha512>`; a SQLite index next to
//! them records every configured digest so callers can look blobs up by any
//! supported algorithm. Writes go through `tmp/` and a per-object file lock,
//! which makes inserting the same bytes twice a no-op.

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use fs4::FileExt;
use serde::Serialize;
use tracing::{debug, warn};

mod hashes;
mod index;

pub use hashes::{hash_file, normalize_algorithms, HashAlgorithm, Hashes, MultiHasher};

const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const INDEX_FILENAME: &str = "index.sqlite";
const BLOS_FORMAT_VERSION: u32 = 1;
const META_KEY_FORMAT_VERSION: &str = "blos_format_version";
const META_KEY_CREATED_BY: &str = "created_by_version";
const FASTPULL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors surfaced by the blob store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[FP800] blob {sha512} is missing")]
    MissingBlob { sha512: String },
    #[error("[FP800] blob {sha512} digest mismatch (found {actual})")]
    DigestMismatch { sha512: String, actual: String },
    #[error("[FP801] '{digest}' is not a valid {algorithm} digest")]
    InvalidDigest {
        algorithm: HashAlgorithm,
        digest: String,
    },
    #[error("[FP810] blob store write failed: {0}")]
    WriteFailure(String),
    #[error("[FP811] blob index error: {0}")]
    Index(String),
    #[error("[FP812] blob store format incompatible: expected {expected}, found {found}")]
    IncompatibleFormat { expected: String, found: String },
    #[error("[FP813] {action} {}: {message}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        message: String,
    },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingBlob { .. } | Self::DigestMismatch { .. } => "FP800",
            Self::InvalidDigest { .. } => "FP801",
            Self::WriteFailure(_) => "FP810",
            Self::Index(_) => "FP811",
            Self::IncompatibleFormat { .. } => "FP812",
            Self::Io { .. } => "FP813",
        }
    }

    fn io(action: &'static str, path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Index(err.to_string())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Structured lookup key for [`BlobStore::read`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobQuery {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl BlobQuery {
    #[must_use]
    pub fn sha512(digest: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha512,
            digest: digest.into(),
        }
    }

    #[must_use]
    pub fn sha256(digest: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            digest: digest.into(),
        }
    }
}

/// Handle to a blob persisted in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Blob {
    pub hashes: Hashes,
    pub size: u64,
    pub path: PathBuf,
    pub created_at: u64,
}

impl Blob {
    /// The digest naming this blob on disk.
    #[must_use]
    pub fn sha512(&self) -> &str {
        self.digest(HashAlgorithm::Sha512).unwrap_or_default()
    }

    #[must_use]
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.hashes.get(&algorithm).map(String::as_str)
    }

    /// Read the full blob contents into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the object file can no longer be read.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|err| StoreError::io("failed to read blob", &self.path, &err))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreUsage {
    pub blobs: u64,
    pub total_bytes: u64,
}

/// Content-addressed blob store rooted at a directory.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
    algorithms: Vec<HashAlgorithm>,
}

impl BlobStore {
    /// Open (creating when needed) a store at `root` that records digests for
    /// `algorithms`. sha512 is always part of the set.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout cannot be created or the index belongs to
    /// an incompatible format version.
    pub fn open(root: impl Into<PathBuf>, algorithms: &[HashAlgorithm]) -> Result<Self> {
        let store = Self {
            root: root.into(),
            algorithms: normalize_algorithms(algorithms),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn algorithms(&self) -> &[HashAlgorithm] {
        &self.algorithms
    }

    /// Look a blob up by digest. Index rows whose object file disappeared are
    /// pruned and reported as absent.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed digests or index failures.
    pub fn read(&self, query: &BlobQuery) -> Result<Option<Blob>> {
        if !query.algorithm.is_valid_digest(&query.digest) {
            return Err(StoreError::InvalidDigest {
                algorithm: query.algorithm,
                digest: query.digest.clone(),
            });
        }
        let conn = self.connection()?;
        let Some(row) = self.find_row(&conn, query)? else {
            return Ok(None);
        };
        let path = self.object_path(&row.sha512);
        if !path.is_file() {
            warn!(sha512 = %row.sha512, "blob index entry has no object on disk; pruning");
            self.delete_row(&conn, &row.sha512)?;
            return Ok(None);
        }
        Ok(Some(row.into_blob(path)))
    }

    /// Hash `path` with every configured algorithm and copy it into the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the object cannot be
    /// persisted.
    pub fn insert_blob(&self, path: &Path) -> Result<Blob> {
        let (hashes, _) = hash_file(path, &self.algorithms)
            .map_err(|err| StoreError::io("failed to hash", path, &err))?;
        self.insert_hashed(path, &hashes)
    }

    /// Copy `path` into the store using digests the caller already computed
    /// (for example while streaming a download). Missing algorithms are
    /// computed from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the digests are malformed or the object cannot be
    /// persisted.
    pub fn insert_hashed(&self, path: &Path, hashes: &Hashes) -> Result<Blob> {
        let mut hashes: Hashes = hashes
            .iter()
            .filter(|(algorithm, _)| self.algorithms.contains(algorithm))
            .map(|(algorithm, digest)| (*algorithm, digest.to_ascii_lowercase()))
            .collect();
        if self.algorithms.iter().any(|a| !hashes.contains_key(a)) {
            let (computed, _) = hash_file(path, &self.algorithms)
                .map_err(|err| StoreError::io("failed to hash", path, &err))?;
            for (algorithm, digest) in computed {
                hashes.entry(algorithm).or_insert(digest);
            }
        }
        for (algorithm, digest) in &hashes {
            if !algorithm.is_valid_digest(digest) {
                return Err(StoreError::InvalidDigest {
                    algorithm: *algorithm,
                    digest: digest.clone(),
                });
            }
        }
        let sha512 = hashes
            .get(&HashAlgorithm::Sha512)
            .cloned()
            .unwrap_or_default();

        let size = fs::metadata(path)
            .map_err(|err| StoreError::io("failed to stat", path, &err))?
            .len();
        let _lock = self.acquire_lock(&sha512)?;
        let object_path = self.object_path(&sha512);
        let existing_size = match fs::metadata(&object_path) {
            Ok(meta) => Some(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(StoreError::io("failed to stat", &object_path, &err)),
        };
        if existing_size == Some(size) {
            debug!(%sha512, "blos hit");
        } else {
            if existing_size.is_some() {
                warn!(%sha512, "replacing blob whose size does not match its digest");
            }
            self.write_new_object(&sha512, path, &object_path)
                .map_err(|err| StoreError::WriteFailure(err.to_string()))?;
            debug!(%sha512, size, "blos store");
        }

        let mut conn = self.connection()?;
        let created_at = self.ensure_row(&mut conn, &hashes, size, timestamp_secs())?;
        Ok(Blob {
            hashes,
            size,
            path: object_path,
            created_at,
        })
    }

    /// Remove a blob and its index row. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed digests or if the object cannot be
    /// unlinked.
    pub fn delete(&self, sha512: &str) -> Result<bool> {
        self.require_sha512(sha512)?;
        let _lock = self.acquire_lock(sha512)?;
        let path = self.object_path(sha512);
        let removed_file = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(StoreError::io("failed to remove", &path, &err)),
        };
        let conn = self.connection()?;
        let removed_row = self.delete_row(&conn, sha512)?;
        if removed_file || removed_row {
            debug!(%sha512, "blos delete");
        }
        Ok(removed_file || removed_row)
    }

    /// Re-hash a stored blob and confirm it still matches its name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingBlob`] or [`StoreError::DigestMismatch`]
    /// when the object is absent or corrupt.
    pub fn verify(&self, sha512: &str) -> Result<Blob> {
        let blob = self
            .read(&BlobQuery::sha512(sha512))?
            .ok_or_else(|| StoreError::MissingBlob {
                sha512: sha512.to_string(),
            })?;
        let mut file = File::open(&blob.path)
            .map_err(|err| StoreError::io("failed to open", &blob.path, &err))?;
        let mut hasher = MultiHasher::new(&[HashAlgorithm::Sha512]);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file
                .read(&mut buf)
                .map_err(|err| StoreError::io("failed to read", &blob.path, &err))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let (hashes, _) = hasher.finalize();
        let actual = hashes
            .get(&HashAlgorithm::Sha512)
            .cloned()
            .unwrap_or_default();
        if actual != sha512 {
            return Err(StoreError::DigestMismatch {
                sha512: sha512.to_string(),
                actual,
            });
        }
        Ok(blob)
    }

    /// List every indexed sha512, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be queried.
    pub fn list(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        self.list_rows(&conn)
    }

    /// Count indexed blobs and their total size.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be queried.
    pub fn usage(&self) -> Result<StoreUsage> {
        let conn = self.connection()?;
        self.usage_rows(&conn)
    }

    fn require_sha512(&self, sha512: &str) -> Result<()> {
        if HashAlgorithm::Sha512.is_valid_digest(sha512) {
            Ok(())
        } else {
            Err(StoreError::InvalidDigest {
                algorithm: HashAlgorithm::Sha512,
                digest: sha512.to_string(),
            })
        }
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|err| StoreError::io("failed to create", &path, &err))?;
        }
        let mut conn = self.connection()?;
        self.init_schema(&conn)?;
        self.ensure_meta(&mut conn)?;
        Ok(())
    }

    fn write_new_object(&self, sha512: &str, source: &Path, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path(sha512);
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
        fs::copy(source, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, dest)?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    fn acquire_lock(&self, sha512: &str) -> Result<File> {
        let path = self.lock_path(sha512);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| StoreError::io("failed to open lock", &path, &err))?;
        file.lock_exclusive()
            .map_err(|err| StoreError::io("failed to lock", &path, &err))?;
        Ok(file)
    }

    fn object_path(&self, sha512: &str) -> PathBuf {
        let first = sha512.get(0..2).unwrap_or("xx");
        let second = sha512.get(2..4).unwrap_or("xx");
        self.root
            .join(OBJECTS_DIR)
            .join(first)
            .join(second)
            .join(sha512)
    }

    fn lock_path(&self, sha512: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{sha512}.lock"))
    }

    fn tmp_path(&self, sha512: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{sha512}.partial"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
