use std::{path::PathBuf, time::Duration};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{
    Blob, BlobQuery, BlobStore, HashAlgorithm, Hashes, Result, StoreError, StoreUsage,
    BLOS_FORMAT_VERSION, FASTPULL_VERSION, META_KEY_CREATED_BY, META_KEY_FORMAT_VERSION,
};

pub(super) struct IndexRow {
    pub(super) sha512: String,
    hashes: Hashes,
    size: u64,
    created_at: u64,
}

impl IndexRow {
    pub(super) fn into_blob(self, path: PathBuf) -> Blob {
        Blob {
            hashes: self.hashes,
            size: self.size,
            path,
            created_at: self.created_at,
        }
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode_hashes(sha512: &str, raw: &str) -> Hashes {
    let mut hashes: Hashes = serde_json::from_str(raw).unwrap_or_default();
    hashes
        .entry(HashAlgorithm::Sha512)
        .or_insert_with(|| sha512.to_string());
    hashes
}

impl BlobStore {
    pub(super) fn connection(&self) -> Result<Connection> {
        let path = self.index_path();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    pub(super) fn init_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS blobs (
                sha512 TEXT PRIMARY KEY,
                sha256 TEXT,
                hashes TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS blobs_sha256 ON blobs(sha256);
            ",
        )?;
        Ok(())
    }

    pub(super) fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_FORMAT_VERSION, BLOS_FORMAT_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CREATED_BY, FASTPULL_VERSION],
        )?;
        tx.commit()?;

        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_KEY_FORMAT_VERSION],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(value) if value == BLOS_FORMAT_VERSION.to_string() => Ok(()),
            other => Err(StoreError::IncompatibleFormat {
                expected: BLOS_FORMAT_VERSION.to_string(),
                found: other.unwrap_or_else(|| "<missing>".to_string()),
            }),
        }
    }

    pub(super) fn find_row(&self, conn: &Connection, query: &BlobQuery) -> Result<Option<IndexRow>> {
        let sql = match query.algorithm {
            HashAlgorithm::Sha512 => {
                "SELECT sha512, hashes, size, created_at FROM blobs WHERE sha512 = ?1"
            }
            HashAlgorithm::Sha256 => {
                "SELECT sha512, hashes, size, created_at FROM blobs WHERE sha256 = ?1 \
                 ORDER BY created_at LIMIT 1"
            }
        };
        let row = conn
            .query_row(sql, params![query.digest], |row| {
                let sha512: String = row.get(0)?;
                let raw: String = row.get(1)?;
                Ok(IndexRow {
                    hashes: decode_hashes(&sha512, &raw),
                    sha512,
                    size: from_sql_int(row.get(2)?),
                    created_at: from_sql_int(row.get(3)?),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Upsert the row for a freshly stored object, merging digests with any
    /// existing entry. Returns the original creation time.
    pub(super) fn ensure_row(
        &self,
        conn: &mut Connection,
        hashes: &Hashes,
        size: u64,
        now: u64,
    ) -> Result<u64> {
        let sha512 = hashes
            .get(&HashAlgorithm::Sha512)
            .cloned()
            .unwrap_or_default();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT hashes, created_at FROM blobs WHERE sha512 = ?1",
                params![sha512],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (mut merged, created_at) = match existing {
            Some((raw, created_at)) => (decode_hashes(&sha512, &raw), from_sql_int(created_at)),
            None => (Hashes::new(), now),
        };
        merged.extend(hashes.iter().map(|(k, v)| (*k, v.clone())));
        let encoded = serde_json::to_string(&merged)
            .map_err(|err| StoreError::Index(err.to_string()))?;
        tx.execute(
            "INSERT INTO blobs(sha512, sha256, hashes, size, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(sha512) DO UPDATE SET \
               sha256 = excluded.sha256, hashes = excluded.hashes, size = excluded.size",
            params![
                sha512,
                merged.get(&HashAlgorithm::Sha256),
                encoded,
                to_sql_int(size),
                to_sql_int(created_at),
            ],
        )?;
        tx.commit()?;
        Ok(created_at)
    }

    pub(super) fn delete_row(&self, conn: &Connection, sha512: &str) -> Result<bool> {
        let removed = conn.execute("DELETE FROM blobs WHERE sha512 = ?1", params![sha512])?;
        Ok(removed > 0)
    }

    pub(super) fn list_rows(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT sha512 FROM blobs ORDER BY sha512")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub(super) fn usage_rows(&self, conn: &Connection) -> Result<StoreUsage> {
        let (blobs, total): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreUsage {
            blobs: from_sql_int(blobs),
            total_bytes: from_sql_int(total),
        })
    }
}
