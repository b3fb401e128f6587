//! Install media downloads.
//!
//! [`FileFetcher`] resolves an `http`, `https` or `file` URI to a file in a local directory. The
//! file is named after the last segment of the URI and is only ever created by an atomic rename,
//! so a file with the final name is always complete.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use futures::StreamExt;
use reqwest::{Client, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{
    utils::{self, KeyedLocks},
    VboxcoreError, VboxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MAX_RETRIES: u32 = 3;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Downloads files, skipping the transfer when a verified copy is already present.
#[derive(Debug)]
pub struct FileFetcher {
    client: ClientWithMiddleware,
    locks: KeyedLocks<PathBuf>,
    transfers: AtomicUsize,
}

/// Feeds bytes to the temporary file and the digest at once.
struct Sink {
    file: File,
    hasher: Sha256,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileFetcher {
    /// Creates a fetcher whose HTTP client retries transient failures with exponential backoff.
    pub fn new() -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            locks: KeyedLocks::new(),
            transfers: AtomicUsize::new(0),
        }
    }

    /// The number of transfers this fetcher has completed.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Makes the resource at `uri` available as `<target_dir>/<basename>`.
    ///
    /// An existing file is reused without any transfer when no digest is expected or when it
    /// matches `expected_sha256`. Otherwise the resource is streamed to a temporary file in
    /// `target_dir`, verified and renamed into place. Concurrent calls for the same file wait for
    /// each other.
    pub async fn fetch(
        &self,
        uri: &str,
        target_dir: &Path,
        expected_sha256: Option<&str>,
    ) -> VboxcoreResult<PathBuf> {
        let url = Url::parse(uri).map_err(|e| network(uri, e))?;
        let basename = basename(&url).ok_or_else(|| network(uri, "the URI names no file"))?;

        fs::create_dir_all(target_dir).await?;
        let target = target_dir.join(&basename);

        let _guard = self.locks.lock(&target).await;

        if fs::try_exists(&target).await? {
            match expected_sha256 {
                None => {
                    tracing::debug!(path = %target.display(), "reusing downloaded file");
                    return Ok(target);
                }
                Some(expected) => {
                    let actual = utils::sha256_file(&target).await?;
                    if utils::digest_matches(expected, &actual) {
                        tracing::debug!(path = %target.display(), "reusing verified file");
                        return Ok(target);
                    }

                    tracing::warn!(
                        path = %target.display(),
                        expected,
                        actual,
                        "cached file does not match its digest, fetching again"
                    );
                }
            }
        }

        tracing::info!(uri, path = %target.display(), "fetching");

        let (file, temp_path) = tempfile::NamedTempFile::new_in(target_dir)?.into_parts();
        let mut sink = Sink {
            file: File::from_std(file),
            hasher: Sha256::new(),
        };

        match url.scheme() {
            "http" | "https" => self.download(uri, url.clone(), &mut sink).await?,
            "file" => copy_local(uri, &url, &mut sink).await?,
            scheme => return Err(network(uri, format!("unsupported scheme {scheme:?}"))),
        }

        let actual = sink.finish().await?;
        if let Some(expected) = expected_sha256 {
            if !utils::digest_matches(expected, &actual) {
                return Err(VboxcoreError::Integrity {
                    path: target.display().to_string(),
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        temp_path.persist(&target).map_err(|e| e.error)?;
        self.transfers.fetch_add(1, Ordering::SeqCst);

        tracing::info!(path = %target.display(), sha256 = %actual, "fetched");
        Ok(target)
    }

    async fn download(&self, uri: &str, url: Url, sink: &mut Sink) -> VboxcoreResult<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network(uri, e))?
            .error_for_status()
            .map_err(|e| network(uri, e))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| network(uri, e))?;
            sink.write(&bytes).await?;
        }

        Ok(())
    }
}

impl Sink {
    async fn write(&mut self, bytes: &[u8]) -> VboxcoreResult<()> {
        self.hasher.update(bytes);
        self.file.write_all(bytes).await?;
        Ok(())
    }

    /// Flushes the file to disk and returns the hex digest of everything written.
    async fn finish(mut self) -> VboxcoreResult<String> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(hex::encode(self.hasher.finalize()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn network(uri: &str, message: impl ToString) -> VboxcoreError {
    VboxcoreError::Network {
        uri: uri.to_string(),
        message: message.to_string(),
    }
}

fn basename(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

async fn copy_local(uri: &str, url: &Url, sink: &mut Sink) -> VboxcoreResult<()> {
    let path = url
        .to_file_path()
        .map_err(|_| network(uri, "not a local path"))?;
    let mut source = File::open(&path)
        .await
        .map_err(|e| network(uri, e))?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let read = source.read(&mut buffer).await?;
        if read == 0 {
            break;
        }

        sink.write(&buffer[..read]).await?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for FileFetcher {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    const ISO_BYTES: &[u8] = b"not really an iso";

    async fn serve_iso() -> anyhow::Result<(String, Arc<AtomicUsize>)> {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/isos/ubuntu.iso",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ISO_BYTES
                }),
            )
            .with_state(Arc::clone(&hits));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok((format!("http://{addr}/isos/ubuntu.iso"), hits))
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_is_idempotent() -> anyhow::Result<()> {
        let (uri, hits) = serve_iso().await?;
        let dir = tempfile::tempdir()?;
        let fetcher = FileFetcher::new();

        let first = fetcher.fetch(&uri, dir.path(), None).await?;
        let second = fetcher.fetch(&uri, dir.path(), None).await?;

        assert_eq!(first, dir.path().join("ubuntu.iso"));
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.transfers(), 1);
        assert_eq!(fs::read(&first).await?, ISO_BYTES);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_fetches_transfer_once() -> anyhow::Result<()> {
        let (uri, hits) = serve_iso().await?;
        let dir = tempfile::tempdir()?;
        let fetcher = FileFetcher::new();

        let (a, b) = tokio::join!(
            fetcher.fetch(&uri, dir.path(), None),
            fetcher.fetch(&uri, dir.path(), None)
        );

        assert_eq!(a?, b?);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_rejects_digest_mismatch() -> anyhow::Result<()> {
        let (uri, _) = serve_iso().await?;
        let dir = tempfile::tempdir()?;
        let fetcher = FileFetcher::new();

        let error = fetcher
            .fetch(&uri, dir.path(), Some(&"0".repeat(64)))
            .await
            .unwrap_err();

        assert!(matches!(error, VboxcoreError::Integrity { .. }));
        assert!(!dir.path().join("ubuntu.iso").exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_replaces_corrupt_cached_file() -> anyhow::Result<()> {
        let source_dir = tempfile::tempdir()?;
        let source = source_dir.path().join("ubuntu.iso");
        fs::write(&source, ISO_BYTES).await?;
        let expected = utils::sha256_file(&source).await?;

        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("ubuntu.iso"), b"truncated").await?;

        let uri = Url::from_file_path(&source)
            .map_err(|_| anyhow::anyhow!("bad path"))?
            .to_string();
        let fetcher = FileFetcher::new();
        let path = fetcher.fetch(&uri, dir.path(), Some(&expected)).await?;

        assert_eq!(fs::read(&path).await?, ISO_BYTES);
        assert_eq!(fetcher.transfers(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_reports_network_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = FileFetcher::new();

        let error = fetcher
            .fetch("ftp://mirror.local/ubuntu.iso", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, VboxcoreError::Network { .. }));

        let error = fetcher
            .fetch("https://mirror.local/", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, VboxcoreError::Network { .. }));

        Ok(())
    }
}
