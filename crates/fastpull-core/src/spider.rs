//! Streaming HTTP downloader.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap},
    future::Future,
    io::SeekFrom,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use fastpull_blos::{HashAlgorithm, MultiHasher};
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{watch, Semaphore},
};
use tracing::{debug, info, warn};

use crate::{
    config::FastpullConfig,
    error::{Error, FetchError, Result},
    pipeline::{Pipeline, Sink, Transform},
    request::{DownloadResult, FetchRequest},
};

const USER_AGENT: &str = concat!("fastpull/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_DOWNLOAD_SLOTS: usize = 20;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Something that can turn a [`FetchRequest`] into a temp file and run a
/// completion pipeline over it.
pub trait Downloader: Send + Sync + 'static {
    /// Fetch `request` and feed the finished download through `pipeline`.
    fn download<T, S>(
        &self,
        request: &FetchRequest,
        pipeline: &Pipeline<T, S>,
    ) -> impl Future<Output = Result<S::Output>> + Send
    where
        T: Transform,
        S: Sink;

    /// Release a download's temp file once its bytes have been consumed.
    fn discard(&self, download: DownloadResult) {
        let path = download.path().to_path_buf();
        if let Err(err) = download.temp.close() {
            debug!(path = %path.display(), error = %err, "failed to remove download temp file");
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpiderOptions {
    pub temp_dir: PathBuf,
    pub algorithms: Vec<HashAlgorithm>,
    pub slots: usize,
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl SpiderOptions {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            algorithms: vec![HashAlgorithm::Sha512],
            slots: DEFAULT_DOWNLOAD_SLOTS,
            timeout: DEFAULT_HTTP_TIMEOUT,
            attempts: DOWNLOAD_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn from_config(config: &FastpullConfig) -> Self {
        Self {
            algorithms: config.hashes.clone(),
            slots: config.download_slots,
            timeout: config.http_timeout,
            ..Self::new(config.temp_path())
        }
    }
}

type Outcome<O> = Option<Result<O>>;

/// reqwest-backed [`Downloader`] with bounded concurrency and in-flight
/// coalescing per URL.
pub struct WebSpider {
    client: reqwest::Client,
    options: SpiderOptions,
    slots: Semaphore,
    // url -> watch::Receiver<Outcome<O>> for whichever output type the leader
    // produces.
    inflight: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for WebSpider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSpider")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

enum Role<O> {
    /// `registered` is false when another output type already owns the URL;
    /// such a download runs on its own without publishing.
    Leader {
        tx: watch::Sender<Outcome<O>>,
        registered: bool,
    },
    Follower(watch::Receiver<Outcome<O>>),
}

struct InflightGuard<'a> {
    map: &'a Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    key: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl WebSpider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the temp
    /// directory cannot be created.
    pub fn new(options: SpiderOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.temp_dir)
            .map_err(|err| Error::io("failed to create", &options.temp_dir, &err))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.timeout)
            .build()
            .map_err(|err| Error::Client(err.to_string()))?;
        Ok(Self {
            client,
            slots: Semaphore::new(options.slots.max(1)),
            options,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn options(&self) -> &SpiderOptions {
        &self.options
    }

    fn join<O: Clone + Send + Sync + 'static>(&self, url: &str) -> Role<O> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = watch::channel(None);
        match inflight.get(url) {
            Some(entry) => match entry.downcast_ref::<watch::Receiver<Outcome<O>>>() {
                Some(existing) => Role::Follower(existing.clone()),
                None => Role::Leader {
                    tx,
                    registered: false,
                },
            },
            None => {
                inflight.insert(url.to_string(), Box::new(rx));
                Role::Leader {
                    tx,
                    registered: true,
                }
            }
        }
    }

    async fn follow<O: Clone>(url: &str, mut rx: watch::Receiver<Outcome<O>>) -> Result<O> {
        debug!(%url, "joining in-flight download");
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or_else(|| {
                    Err(FetchError::new(url, "in-flight download was abandoned", true).into())
                });
            }
        }
    }

    async fn fetch_to_temp(&self, request: &FetchRequest) -> Result<DownloadResult> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|err| FetchError::new(&request.url, err.to_string(), false))?;
        let mut last_err = None;
        for url in std::iter::once(&request.url).chain(&request.mirror_urls) {
            match self.fetch_url(request, url).await {
                Ok(download) => return Ok(download),
                Err(err) => {
                    if !request.mirror_urls.is_empty() {
                        warn!(%url, error = %err, "download source failed");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| FetchError::new(&request.url, "no download sources", false))
            .into())
    }

    async fn fetch_url(
        &self,
        request: &FetchRequest,
        url: &str,
    ) -> Result<DownloadResult, FetchError> {
        let algorithms: Vec<HashAlgorithm> = self
            .options
            .algorithms
            .iter()
            .chain(request.expected_hashes.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let local = |err: std::io::Error| FetchError::new(url, err.to_string(), false);
        let (file, temp) = tempfile::Builder::new()
            .prefix(".fastpull-")
            .suffix(".partial")
            .tempfile_in(&self.options.temp_dir)
            .map_err(local)?
            .into_parts();
        let mut file = File::from_std(file);
        let mut progress = Progress {
            hasher: MultiHasher::new(&algorithms),
            algorithms,
            expected_total: None,
        };

        let attempts = if request.retry {
            self.options.attempts.max(1)
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.transfer(request, url, &mut file, &mut progress).await {
                Ok(()) => break,
                Err(err) if !err.retry || attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(%url, attempt, error = %err.message, "download failed; retrying");
                    tokio::time::sleep(self.options.retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
        file.flush().await.map_err(local)?;
        file.sync_all().await.map_err(local)?;
        drop(file);

        let (hashes, size) = progress.hasher.finalize();
        for (algorithm, expected) in &request.expected_hashes {
            let actual = hashes.get(algorithm).map(String::as_str).unwrap_or_default();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::new(
                    url,
                    format!("{algorithm} mismatch (expected {expected}, got {actual})"),
                    false,
                ));
            }
        }
        info!(%url, size, "downloaded");
        Ok(DownloadResult {
            request: request.clone(),
            temp,
            hashes,
            size,
        })
    }

    /// One HTTP exchange, appending to whatever earlier attempts wrote.
    async fn transfer(
        &self,
        request: &FetchRequest,
        url: &str,
        file: &mut File,
        progress: &mut Progress,
    ) -> Result<(), FetchError> {
        let resume_from = progress.hasher.size();
        let mut builder = self.client.get(url);
        for (name, value) in &request.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(username) = &request.username {
            builder = builder.basic_auth(username, request.password.as_ref());
        }
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={resume_from}-"));
        }
        let mut response = builder
            .send()
            .await
            .map_err(|err| FetchError::new(url, err.to_string(), true))?;
        let status = response.status();
        if resume_from > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            restart(url, file, progress).await?;
            return Err(FetchError::new(
                url,
                "server rejected resume range; restarting",
                true,
            ));
        }
        if !status.is_success() {
            // 400, 404 and 410 will not change on retry.
            let retry = !matches!(status.as_u16(), 400 | 404 | 410);
            return Err(FetchError::new(url, format!("HTTP {status}"), retry));
        }
        if resume_from == 0 {
            progress.expected_total = response.content_length();
        } else if status == StatusCode::PARTIAL_CONTENT {
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range);
            match range {
                Some((start, _)) if start != resume_from => {
                    restart(url, file, progress).await?;
                    return Err(FetchError::new(
                        url,
                        format!("resume answered from byte {start}, wanted {resume_from}"),
                        true,
                    ));
                }
                Some((_, total))
                    if progress
                        .expected_total
                        .is_some_and(|expected| Some(expected) != total) =>
                {
                    let expected = progress.expected_total.unwrap_or_default();
                    let total = total.map_or_else(|| "*".to_string(), |t| t.to_string());
                    return Err(FetchError::new(
                        url,
                        format!("bad total on resume (expected {expected}, got {total})"),
                        false,
                    ));
                }
                Some(_) => debug!(%url, resume_from, "resuming download"),
                None => {
                    restart(url, file, progress).await?;
                    return Err(FetchError::new(
                        url,
                        "partial reply without a usable Content-Range; restarting",
                        true,
                    ));
                }
            }
        } else {
            debug!(%url, "server ignored range request; restarting");
            restart(url, file, progress).await?;
            progress.expected_total = response.content_length();
        }
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::new(url, err.to_string(), true))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| FetchError::new(url, err.to_string(), false))?;
            progress.hasher.update(&chunk);
        }
        Ok(())
    }
}

struct Progress {
    hasher: MultiHasher,
    algorithms: Vec<HashAlgorithm>,
    /// Body length announced by the response that started the file.
    expected_total: Option<u64>,
}

impl Progress {
    fn reset(&mut self) {
        self.hasher = MultiHasher::new(&self.algorithms);
        self.expected_total = None;
    }
}

/// Drop everything written so far so the next exchange starts at byte 0.
async fn restart(url: &str, file: &mut File, progress: &mut Progress) -> Result<(), FetchError> {
    progress.reset();
    file.set_len(0)
        .await
        .map_err(|err| FetchError::new(url, err.to_string(), false))?;
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(|err| FetchError::new(url, err.to_string(), false))?;
    Ok(())
}

/// `bytes <start>-<end>/<total>` as `(start, total)`; an unknown total
/// (`*`) is `None`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    if end.trim().parse::<u64>().ok()? < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse::<u64>().ok()?),
    };
    Some((start, total))
}

impl Downloader for WebSpider {
    async fn download<T, S>(&self, request: &FetchRequest, pipeline: &Pipeline<T, S>) -> Result<S::Output>
    where
        T: Transform,
        S: Sink,
    {
        let (tx, registered) = match self.join::<S::Output>(&request.url) {
            Role::Follower(rx) => return Self::follow(&request.url, rx).await,
            Role::Leader { tx, registered } => (tx, registered),
        };
        let _guard = registered.then(|| InflightGuard {
            map: &self.inflight,
            key: request.url.clone(),
        });
        let outcome = match self.fetch_to_temp(request).await {
            Ok(download) => pipeline.run(download).await,
            Err(err) => Err(err),
        };
        tx.send_replace(Some(outcome.clone()));
        outcome
    }
}
