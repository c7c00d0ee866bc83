//! Bounded download queue.
//!
//! Every download in the process goes through one shared semaphore, so no
//! more than `max_downloads` jobs ever run at once. A multi-range download
//! holds a single token for the whole operation: its per-range requests run
//! in parallel but count as one job against the bandwidth budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context};
use md5::{Digest, Md5};
use reqwest::header::RANGE;
use tempfile::NamedTempFile;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task;
use tracing::trace;

/// Queue of HTTP downloads gated by a shared token pool.
#[derive(Clone)]
pub struct DownloadQueue {
    tokens: Arc<Semaphore>,
    client: reqwest::Client,
}

impl DownloadQueue {
    pub fn new(max_downloads: usize) -> Self {
        DownloadQueue {
            tokens: Arc::new(Semaphore::new(max_downloads)),
            client: reqwest::Client::new(),
        }
    }

    /// The HTTP client shared by all queue jobs.
    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Downloads `url` in a single stream into a new temp file and returns
    /// the file path. The caller owns the file.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn add_single(&self, url: &str) -> crate::Result<PathBuf> {
        let _token = self.tokens.acquire().await?;
        fetch(&self.client, url, None).await
    }

    /// Downloads `url` in `limit` parallel ranges, joins the parts in order
    /// and, for a non-empty `md5sum`, verifies the joined file against it.
    ///
    /// A zero `size` falls back to the single-stream mode; the ranged path
    /// has to know the full length up front.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn add_multi(
        &self,
        url: &str,
        md5sum: &str,
        limit: u64,
        size: u64,
    ) -> crate::Result<PathBuf> {
        let path = if size == 0 {
            self.add_single(url)
                .await
                .context("unable to download the file")?
        } else {
            self.multi(url, size, limit)
                .await
                .context("unable to download the file")?
        };

        if !md5sum.is_empty() {
            let sum = file_md5(&path)
                .await
                .context("unable to check MD5 checksum")?;
            ensure!(sum == md5sum, "checksum mismatch");
        }

        Ok(path)
    }

    async fn multi(&self, url: &str, size: u64, limit: u64) -> crate::Result<PathBuf> {
        ensure!(size > 0, "file size must be more than 0");

        // One token covers the whole ranged operation.
        let _token = Arc::clone(&self.tokens).acquire_owned().await?;

        let mut jobs = Vec::new();
        for (min, max) in ranges(size, limit) {
            let client = self.client.clone();
            let url = url.to_owned();
            jobs.push(task::spawn(async move {
                fetch(&client, &url, Some((min, max))).await
            }));
        }

        // Await every range before deciding the outcome: bailing on the
        // first failure would strand the temp files of ranges that are
        // still in flight.
        let mut parts = Vec::with_capacity(jobs.len());
        let mut failure = None;
        for (i, job) in jobs.into_iter().enumerate() {
            let result = match job.await {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(part) => parts.push(part),
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err.context(format!("range {i} failed")));
                    }
                }
            }
        }
        if let Some(err) = failure {
            for part in parts {
                let _ = tokio::fs::remove_file(&part).await;
            }
            return Err(err);
        }

        join_files(parts).await.context("unable to create result file")
    }
}

/// Splits `[0, size)` into `limit` contiguous ranges; the final range absorbs
/// the division remainder. `limit` is clamped to the byte count so tiny files
/// cannot produce empty ranges.
fn ranges(size: u64, limit: u64) -> Vec<(u64, u64)> {
    let limit = limit.clamp(1, size);
    let step = size / limit;
    let rest = size % limit;

    (0..limit)
        .map(|i| {
            let min = step * i;
            let mut max = step * (i + 1);
            if i == limit - 1 {
                max += rest;
            }
            (min, max)
        })
        .collect()
}

/// Performs one GET (optionally ranged) and streams the body into a fresh
/// temp file, returning its path.
async fn fetch(
    client: &reqwest::Client,
    url: &str,
    range: Option<(u64, u64)>,
) -> crate::Result<PathBuf> {
    let mut req = client.get(url);
    if let Some((min, max)) = range {
        // HTTP ranges are inclusive on both ends.
        req = req.header(RANGE, format!("bytes={min}-{}", max - 1));
        trace!(url, min, max, "requesting range");
    }

    let mut res = req.send().await.context("unable to make GET request")?;
    ensure!(
        res.status().is_success(),
        "unable to make GET request: {}",
        res.status()
    );

    let (file, path) = NamedTempFile::new()?.keep()?;
    let mut file = File::from_std(file);
    while let Some(chunk) = res.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(path)
}

/// Concatenates the parts onto the first file in order, unlinking the rest,
/// and returns the first file's path.
async fn join_files(parts: Vec<PathBuf>) -> crate::Result<PathBuf> {
    let mut parts = parts.into_iter();
    let dest_path = parts.next().context("nothing to merge")?;

    let mut dest = OpenOptions::new().append(true).open(&dest_path).await?;
    for part in parts {
        let mut src = File::open(&part).await?;
        io::copy(&mut src, &mut dest).await?;
        tokio::fs::remove_file(&part).await?;
    }
    dest.flush().await?;

    Ok(dest_path)
}

/// MD5 of the file contents as lowercase hex.
async fn file_md5(path: &Path) -> crate::Result<String> {
    let content = tokio::fs::read(path).await?;
    Ok(hex::encode(Md5::digest(&content)))
}
