//! Content-addressed fetch and integrity cache.
//!
//! An [`IntegrityDatabase`] owns one blob store and one [`Downloader`];
//! [`IntegrityScope`]s partition the URL and dynamic-key indexes on top of
//! it. Fetching a URL twice in a scope touches the network once.

pub mod config;
pub mod database;
pub mod error;
pub mod pipeline;
pub mod records;
pub mod request;
pub mod scope;
pub mod spider;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FastpullConfig;
pub use database::{ContentStoreSink, IntegrityDatabase};
pub use error::{Error, FetchError, FileIntegrityError, Result};
pub use fastpull_blos::{Blob, BlobQuery, BlobStore, HashAlgorithm, Hashes, StoreError, StoreUsage};
pub use pipeline::{Pipeline, Sink, Transform};
pub use records::{
    DynamicIntegrityRecord, DynamicKey, Metadata, Record, RecordStore, UrlIntegrityRecord,
};
pub use request::{DownloadResult, FetchRequest};
pub use scope::IntegrityScope;
pub use spider::{Downloader, SpiderOptions, WebSpider};
pub use verify::{ArchiveKind, Verifier};
