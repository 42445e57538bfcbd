//! Per-scope record stores mapping URLs and structured keys to blob digests.

use std::{
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Duration,
};

use fastpull_blos::{HashAlgorithm, Hashes};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha512};
use time::OffsetDateTime;

use crate::error::{Error, Result};

const RECORD_FORMAT_VERSION: &str = "1";

/// Free-form metadata stored alongside dynamic records.
pub type Metadata = Map<String, Value>;

/// A row type persisted by a [`RecordStore`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Backing file stem inside the scope directory.
    const KIND: &'static str;

    /// Primary key for this record.
    fn derived_key(&self) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlIntegrityRecord {
    pub url: String,
    pub sha512: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_on: OffsetDateTime,
}

impl UrlIntegrityRecord {
    pub fn new(url: impl Into<String>, sha512: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha512: sha512.into(),
            updated_on: OffsetDateTime::now_utc(),
        }
    }
}

impl Record for UrlIntegrityRecord {
    const KIND: &'static str = "url";

    fn derived_key(&self) -> String {
        self.url.clone()
    }
}

/// Caller-chosen identity for content that is not named by a single URL.
///
/// Keys are JSON objects; two keys are equal when their canonical encoding
/// (sorted object keys, no whitespace) is equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicKey(Map<String, Value>);

impl DynamicKey {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn canonical_json(&self) -> String {
        // serde_json::Map is ordered by key, nested objects included.
        Value::Object(self.0.clone()).to_string()
    }

    /// Hex sha512 of the canonical encoding; the dynamic store's primary key.
    #[must_use]
    pub fn digest(&self) -> String {
        hex::encode(Sha512::digest(self.canonical_json().as_bytes()))
    }
}

impl From<Map<String, Value>> for DynamicKey {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for DynamicKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicIntegrityRecord {
    pub key: DynamicKey,
    pub hashes: Hashes,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_on: OffsetDateTime,
}

impl DynamicIntegrityRecord {
    #[must_use]
    pub fn sha512(&self) -> Option<&str> {
        self.hashes.get(&HashAlgorithm::Sha512).map(String::as_str)
    }
}

impl Record for DynamicIntegrityRecord {
    const KIND: &'static str = "dynamic";

    fn derived_key(&self) -> String {
        self.key.digest()
    }
}

/// SQLite-backed map from derived key to a JSON-encoded record.
///
/// Every call opens its own connection, so a store can be shared across
/// blocking tasks without a lock.
#[derive(Debug)]
pub struct RecordStore<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RecordStore<R> {
    /// Open `<dir>/<KIND>.sqlite`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created, or the
    /// file was written by an incompatible version.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| Error::io("failed to create", dir, &err))?;
        let store = Self {
            path: dir.join(format!("{}.sqlite", R::KIND)),
            _record: PhantomData,
        };
        let conn = store.connection()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_on TEXT NOT NULL
            );
            ",
        )
        .map_err(|err| store.err(err))?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES ('record_format_version', ?1)",
            params![RECORD_FORMAT_VERSION],
        )
        .map_err(|err| store.err(err))?;
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'record_format_version'",
                [],
                |row| row.get(0),
            )
            .map_err(|err| store.err(err))?;
        if version != RECORD_FORMAT_VERSION {
            return Err(store.err(format!(
                "incompatible record format {version} (expected {RECORD_FORMAT_VERSION})"
            )));
        }
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Returns an error if the database cannot be read or the stored row no
    /// longer decodes.
    pub fn read(&self, key: &str) -> Result<Option<R>> {
        let conn = self.connection()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.err(err))?;
        body.map(|raw| serde_json::from_str(&raw).map_err(|err| self.err(err)))
            .transpose()
    }

    /// Upsert `record` under its derived key; the last writer wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub fn write(&self, record: &R) -> Result<()> {
        let body = serde_json::to_string(record).map_err(|err| self.err(err))?;
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| self.err(err))?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO records(key, body, updated_on) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_on = excluded.updated_on",
            params![record.derived_key(), body, now],
        )
        .map_err(|err| self.err(err))?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the database cannot be written.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.connection()?;
        let removed = conn
            .execute("DELETE FROM records WHERE key = ?1", params![key])
            .map_err(|err| self.err(err))?;
        Ok(removed > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn len(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|err| self.err(err))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|err| self.err(err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| self.err(err))?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|err| self.err(err))?;
        Ok(conn)
    }

    fn err(&self, err: impl std::fmt::Display) -> Error {
        Error::records(&self.path, err)
    }
}
