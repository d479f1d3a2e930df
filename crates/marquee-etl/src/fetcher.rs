//! Source retrieval
//!
//! Resolves a [`Dataset`] to a local, verified `.tsv.gz` file. The source is
//! either a remote base URL (downloaded into the data directory and cached)
//! or a local directory holding pre-staged dumps.

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::models::Dataset;
use crate::parser::RecordParser;
use anyhow::Context;
use flate2::read::GzDecoder;
use futures::StreamExt;
use marquee_common::checksum;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Url};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("marquee-etl/", env!("CARGO_PKG_VERSION"));

/// Where the dumps come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Base URL; the dataset file name is appended
    Remote(Url),
    /// Directory containing the dumps, used in place
    Local(PathBuf),
}

impl SourceLocation {
    /// Accepts `http(s)://` base URLs, `file://` URLs and plain paths
    pub fn parse(source: &str) -> EtlResult<Self> {
        let source = source.trim();

        if let Some(path) = source.strip_prefix("file://") {
            return Ok(SourceLocation::Local(PathBuf::from(path)));
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            // Url::join drops the last segment unless the base ends with '/'
            let base = if source.ends_with('/') {
                source.to_string()
            } else {
                format!("{}/", source)
            };
            let url = Url::parse(&base)
                .map_err(|e| EtlError::config(format!("invalid source URL '{}': {}", source, e)))?;
            return Ok(SourceLocation::Remote(url));
        }

        Ok(SourceLocation::Local(PathBuf::from(source)))
    }
}

/// How a fetched file was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOrigin {
    /// Read in place from a local source directory
    Local,
    /// Previously downloaded copy reused
    Cached,
    Downloaded,
}

/// A verified local dump
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub dataset: Dataset,
    pub path: PathBuf,
    pub origin: FetchOrigin,
    pub size_bytes: u64,
}

pub struct SourceFetcher {
    client: Client,
    source: SourceLocation,
    data_dir: PathBuf,
    max_retries: u32,
    retry_backoff: Duration,
    request_timeout: Duration,
}

impl SourceFetcher {
    pub fn new(config: &EtlConfig) -> EtlResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| EtlError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            source: SourceLocation::parse(&config.source_url)?,
            data_dir: config.data_dir.clone(),
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    /// Retrieve and verify the dump for `dataset`.
    ///
    /// Cancelling `cancel` aborts an in-flight download with
    /// [`EtlError::Cancelled`]; a partial download never replaces the cached
    /// file.
    pub async fn fetch(&self, dataset: Dataset, cancel: &CancellationToken) -> EtlResult<FetchedFile> {
        let (path, origin) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EtlError::Cancelled),
            result = self.retrieve(dataset) => result?,
        };

        let verify_path = path.clone();
        let full_pass = origin == FetchOrigin::Downloaded;
        let verified = tokio::task::spawn_blocking(move || -> EtlResult<u64> {
            let size = verify_dump(dataset, &verify_path)?;
            if full_pass {
                verify_gzip_stream(dataset, &verify_path)?;
            }
            Ok(size)
        })
        .await?;

        let size_bytes = match verified {
            Ok(size) => size,
            Err(e) => {
                if full_pass {
                    discard_download(&path).await;
                }
                return Err(e);
            },
        };

        info!(
            dataset = %dataset,
            path = %path.display(),
            size_bytes,
            origin = ?origin,
            "Source file ready"
        );

        Ok(FetchedFile {
            dataset,
            path,
            origin,
            size_bytes,
        })
    }

    async fn retrieve(&self, dataset: Dataset) -> EtlResult<(PathBuf, FetchOrigin)> {
        match &self.source {
            SourceLocation::Local(dir) => {
                let path = dir.join(dataset.file_name());
                if !path.is_file() {
                    return Err(EtlError::SourceUnavailable {
                        dataset,
                        attempts: 1,
                        reason: format!("{} does not exist", path.display()),
                    });
                }
                Ok((path, FetchOrigin::Local))
            },
            SourceLocation::Remote(base) => self.download_with_retry(base, dataset).await,
        }
    }

    /// Download with linear backoff: attempt `n` is followed by `n * backoff`
    async fn download_with_retry(&self, base: &Url, dataset: Dataset) -> EtlResult<(PathBuf, FetchOrigin)> {
        let url = base.join(dataset.file_name()).map_err(|e| {
            EtlError::config(format!("cannot build URL for {}: {}", dataset.file_name(), e))
        })?;

        tokio::fs::create_dir_all(&self.data_dir).await?;
        let target = self.data_dir.join(dataset.file_name());
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            debug!("Download attempt {}/{} for: {}", attempt, self.max_retries, url);

            match self.download_once(&url, &target).await {
                Ok(origin) => return Ok((target, origin)),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt < self.max_retries {
                        let delay = self.retry_backoff * attempt;
                        warn!(
                            "Download attempt {}/{} failed: {}. Retrying in {:?}...",
                            attempt, self.max_retries, last_error, delay
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            "Download attempt {}/{} failed: {}",
                            attempt, self.max_retries, last_error
                        );
                    }
                },
            }
        }

        Err(EtlError::SourceUnavailable {
            dataset,
            attempts: self.max_retries,
            reason: last_error,
        })
    }

    async fn download_once(&self, url: &Url, target: &Path) -> anyhow::Result<FetchOrigin> {
        let remote_len = self.remote_length(url).await;

        if let Some(expected) = remote_len {
            if cache_is_fresh(target, expected).await? {
                info!(url = %url, "Cached copy matches remote size and checksum, skipping download");
                return Ok(FetchOrigin::Cached);
            }
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned an error status", url))?;

        let part = part_path(target);
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("cannot create {}", part.display()))?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("download interrupted")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = remote_len {
            if written != expected {
                let _ = tokio::fs::remove_file(&part).await;
                anyhow::bail!("truncated download: got {} of {} bytes", written, expected);
            }
        }

        tokio::fs::rename(&part, target)
            .await
            .with_context(|| format!("cannot move download into {}", target.display()))?;

        let sidecar_target = target.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || checksum::write_sidecar(&sidecar_target)).await??;
        info!(url = %url, bytes = written, sha256 = %digest, "Download complete");

        Ok(FetchOrigin::Downloaded)
    }

    /// `Content-Length` from a HEAD request; `None` when the server will not say
    async fn remote_length(&self, url: &Url) -> Option<u64> {
        let response = match self
            .client
            .head(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "HEAD not supported, cache check skipped");
                return None;
            },
            Err(e) => {
                debug!(url = %url, error = %e, "HEAD failed, cache check skipped");
                return None;
            },
        };

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// True when `path` has the remote size and still matches its sidecar digest
pub async fn cache_is_fresh(path: &Path, remote_len: u64) -> anyhow::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() == remote_len => {},
        _ => return Ok(false),
    }

    let path = path.to_path_buf();
    let fresh = tokio::task::spawn_blocking(move || checksum::sidecar_matches(&path)).await??;
    Ok(fresh)
}

/// Check that `path` is non-empty, decompresses, has the right header and at
/// least one parseable row. Returns the compressed size.
///
/// Only the start of the stream is decoded. Damage further in surfaces during
/// the load, after earlier batches are committed; fresh downloads are
/// additionally checked end to end with [`verify_gzip_stream`].
pub fn verify_dump(dataset: Dataset, path: &Path) -> EtlResult<u64> {
    let size = std::fs::metadata(path)
        .map_err(|e| EtlError::corrupt(dataset, format!("cannot stat {}: {}", path.display(), e)))?
        .len();
    if size == 0 {
        return Err(EtlError::corrupt(dataset, "file is empty"));
    }

    let mut parser = RecordParser::open(path, dataset)?;
    match parser.next() {
        Some(Ok(_)) => Ok(size),
        Some(Err(e)) => Err(e),
        None => Err(EtlError::corrupt(dataset, "no parseable data rows")),
    }
}

/// Decompress the whole of `path`, failing on a truncated or damaged stream
pub fn verify_gzip_stream(dataset: Dataset, path: &Path) -> EtlResult<u64> {
    let file = std::fs::File::open(path)
        .map_err(|e| EtlError::corrupt(dataset, format!("cannot open {}: {}", path.display(), e)))?;
    let mut decoder = GzDecoder::new(std::io::BufReader::new(file));
    std::io::copy(&mut decoder, &mut std::io::sink())
        .map_err(|e| EtlError::corrupt(dataset, format!("gzip stream is damaged: {}", e)))
}

/// Remove a rejected download and its checksum so the next fetch starts over
async fn discard_download(path: &Path) {
    for stale in [path.to_path_buf(), checksum::sidecar_path(path)] {
        if let Err(e) = tokio::fs::remove_file(&stale).await {
            debug!(path = %stale.display(), error = %e, "Could not remove rejected download");
        }
    }
}
