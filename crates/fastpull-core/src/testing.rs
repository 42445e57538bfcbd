//! Test doubles shared by the unit tests.

use std::{
    collections::HashMap,
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use fastpull_blos::{HashAlgorithm, MultiHasher};
use tempfile::TempDir;

use crate::{
    config::FastpullConfig,
    database::IntegrityDatabase,
    error::{FetchError, Result},
    pipeline::{Pipeline, Sink, Transform},
    request::{DownloadResult, FetchRequest},
    spider::Downloader,
};

pub(crate) struct TestEnv {
    _temp: TempDir,
    pub(crate) config: FastpullConfig,
}

impl TestEnv {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let temp = tempfile::tempdir()?;
        let config =
            FastpullConfig::new(temp.path().join("fastpull")).with_hashes(&[HashAlgorithm::Sha256]);
        Ok(Self {
            _temp: temp,
            config,
        })
    }

    pub(crate) fn database<D: Downloader>(&self, downloader: D) -> Result<IntegrityDatabase<D>> {
        IntegrityDatabase::open(&self.config, downloader)
    }
}

enum Response {
    Body(Vec<u8>),
    Fail(FetchError),
}

struct Inner {
    temp: TempDir,
    responses: Mutex<HashMap<String, Response>>,
    calls: Mutex<HashMap<String, usize>>,
    discarded: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

/// In-memory downloader that counts every call.
#[derive(Clone)]
pub(crate) struct RecordingDownloader {
    inner: Arc<Inner>,
}

impl RecordingDownloader {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                temp: tempfile::tempdir().expect("downloader temp dir"),
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                discarded: AtomicUsize::new(0),
                delay: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn serve(&self, url: &str, body: &[u8]) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Response::Body(body.to_vec()));
    }

    pub(crate) fn fail(&self, url: &str, error: FetchError) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Response::Fail(error));
    }

    /// Hold every download for `delay` before running the pipeline.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self, url: &str) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.inner.calls.lock().unwrap().values().sum()
    }

    pub(crate) fn discarded(&self) -> usize {
        self.inner.discarded.load(Ordering::SeqCst)
    }

    /// Write `body` to a fresh temp file as if it had just been downloaded.
    pub(crate) fn prepare(&self, url: &str, body: &[u8]) -> anyhow::Result<DownloadResult> {
        let mut file = tempfile::NamedTempFile::new_in(self.inner.temp.path())?;
        file.write_all(body)?;
        file.flush()?;
        let mut hasher = MultiHasher::new(&[HashAlgorithm::Sha256, HashAlgorithm::Sha512]);
        hasher.update(body);
        let (hashes, size) = hasher.finalize();
        Ok(DownloadResult {
            request: FetchRequest::new(url),
            temp: file.into_temp_path(),
            hashes,
            size,
        })
    }
}

impl Downloader for RecordingDownloader {
    async fn download<T, S>(&self, request: &FetchRequest, pipeline: &Pipeline<T, S>) -> Result<S::Output>
    where
        T: Transform,
        S: Sink,
    {
        *self
            .inner
            .calls
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_default() += 1;
        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let body = match self.inner.responses.lock().unwrap().get(&request.url) {
            Some(Response::Body(body)) => body.clone(),
            Some(Response::Fail(err)) => return Err(err.clone().into()),
            None => return Err(FetchError::new(&request.url, "HTTP 404 Not Found", false).into()),
        };
        let mut download = self
            .prepare(&request.url, &body)
            .map_err(|err| FetchError::new(&request.url, err.to_string(), false))?;
        download.request = request.clone();
        pipeline.run(download).await
    }

    fn discard(&self, download: DownloadResult) {
        self.inner.discarded.fetch_add(1, Ordering::SeqCst);
        download.temp.close().expect("remove temp file");
    }
}
