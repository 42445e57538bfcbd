//! Completion pipeline run on every finished download.
//!
//! A pipeline is a chain of [`Transform`]s applied in order, followed by one
//! [`Sink`] that consumes the download and produces the caller's result.
//! Chains are plain tuples: `(A, (B, C))` runs `A`, then `B`, then `C`.

use std::future::Future;

use crate::{error::Result, request::DownloadResult};

/// One pass-through stage. May inspect or replace the download, or reject it.
pub trait Transform: Send + Sync {
    fn apply(&self, download: DownloadResult) -> impl Future<Output = Result<DownloadResult>> + Send;
}

/// The final stage; takes ownership of the temp file.
pub trait Sink: Send + Sync {
    type Output: Clone + Send + Sync + 'static;

    fn finish(&self, download: DownloadResult) -> impl Future<Output = Result<Self::Output>> + Send;
}

impl Transform for () {
    async fn apply(&self, download: DownloadResult) -> Result<DownloadResult> {
        Ok(download)
    }
}

impl<A: Transform, B: Transform> Transform for (A, B) {
    async fn apply(&self, download: DownloadResult) -> Result<DownloadResult> {
        let download = self.0.apply(download).await?;
        self.1.apply(download).await
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline<T, S> {
    transform: T,
    sink: S,
}

impl<T: Transform, S: Sink> Pipeline<T, S> {
    pub fn new(transform: T, sink: S) -> Self {
        Self { transform, sink }
    }

    /// Run every transform in order, then hand the result to the sink.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any stage; later stages do not run.
    pub async fn run(&self, download: DownloadResult) -> Result<S::Output> {
        let download = self.transform.apply(download).await?;
        self.sink.finish(download).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use fastpull_blos::Hashes;

    use super::*;
    use crate::{error::Error, request::FetchRequest, FetchError};

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Transform for Tag {
        async fn apply(&self, download: DownloadResult) -> Result<DownloadResult> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(FetchError::new(&download.request.url, self.name, false).into());
            }
            Ok(download)
        }
    }

    struct SizeSink;

    impl Sink for SizeSink {
        type Output = u64;

        async fn finish(&self, download: DownloadResult) -> Result<u64> {
            Ok(download.size)
        }
    }

    fn download() -> DownloadResult {
        let file = tempfile::NamedTempFile::new().unwrap();
        DownloadResult {
            request: FetchRequest::new("https://example.org/x"),
            temp: file.into_temp_path(),
            hashes: Hashes::new(),
            size: 7,
        }
    }

    fn tag(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Tag {
        Tag {
            name,
            log: Arc::clone(log),
            fail,
        }
    }

    #[tokio::test]
    async fn transforms_run_in_order_before_sink() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            (tag("a", &log, false), (tag("b", &log, false), tag("c", &log, false))),
            SizeSink,
        );
        assert_eq!(pipeline.run(download()).await.unwrap(), 7);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failing_stage_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new((tag("a", &log, true), tag("b", &log, false)), SizeSink);
        let err = pipeline.run(download()).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn unit_transform_is_identity() {
        let pipeline = Pipeline::new((), SizeSink);
        assert_eq!(pipeline.run(download()).await.unwrap(), 7);
    }
}
