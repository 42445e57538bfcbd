use std::path::Path;

use fastpull_blos::{HashAlgorithm, Hashes};
use tempfile::TempPath;

const FALLBACK_FILENAME: &str = "download";

/// What to fetch. The URL is the cache key; everything else tunes the transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub final_name: Option<String>,
    pub retry: bool,
    pub extra_headers: Vec<(String, String)>,
    pub mirror_urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub expected_hashes: Hashes,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            final_name: None,
            retry: true,
            extra_headers: Vec::new(),
            mirror_urls: Vec::new(),
            username: None,
            password: None,
            expected_hashes: Hashes::new(),
        }
    }

    #[must_use]
    pub fn with_final_name(mut self, name: impl Into<String>) -> Self {
        self.final_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_mirror(mut self, url: impl Into<String>) -> Self {
        self.mirror_urls.push(url.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_expected_hash(mut self, algorithm: HashAlgorithm, digest: impl Into<String>) -> Self {
        self.expected_hashes
            .insert(algorithm, digest.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Local filename for the download: `final_name`, else the last URL path
    /// segment.
    #[must_use]
    pub fn filename(&self) -> String {
        if let Some(name) = self.final_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
    }

    #[must_use]
    pub fn hostname(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string))
    }
}

/// A finished transfer sitting in a scoped temporary file. Dropping it
/// removes the file.
#[derive(Debug)]
pub struct DownloadResult {
    pub request: FetchRequest,
    pub temp: TempPath,
    pub hashes: Hashes,
    pub size: u64,
}

impl DownloadResult {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.temp
    }

    #[must_use]
    pub fn sha512(&self) -> Option<&str> {
        self.hashes.get(&HashAlgorithm::Sha512).map(String::as_str)
    }
}
