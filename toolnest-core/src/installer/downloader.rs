//! Async file downloader with progress reporting and retry.
//!
//! Downloads stream through a [`Transport`] so the retry and cleanup rules
//! can be exercised without a network. The production transport is
//! [`HttpTransport`], backed by reqwest.
//!
//! Bytes are written to `<dest>.part` and renamed into place once the body
//! is complete, so a file at `dest` is always a complete archive.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{InstallError, InstallResult};
use super::paths::format_size;
use super::types::Completion;

// ============================================================================
// Transport
// ============================================================================

/// Failure reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established or was dropped.
    Connect(String),
    /// The request timed out.
    Timeout(String),
    /// The server answered with a non-success status.
    Status { code: u16, reason: String },
    /// Any other failure.
    Other(String),
}

impl TransportError {
    /// Connection and timeout failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connection error: {}", msg),
            Self::Timeout(msg) => write!(f, "timed out: {}", msg),
            Self::Status { code, reason } => write!(f, "HTTP {} {}", code, reason),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// An open response body.
pub struct TransferBody {
    /// Length declared by the server, if any.
    pub content_length: Option<u64>,
    /// The body, chunk by chunk.
    pub chunks: BoxStream<'static, Result<Bytes, TransportError>>,
}

/// Opens streaming downloads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts a request for `url`. Non-success statuses are errors.
    async fn open(&self, url: &str) -> Result<TransferBody, TransportError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> InstallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("toolnest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallError::Setup(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<TransferBody, TransportError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let content_length = response.content_length();
        debug!("Content-Length: {:?}", content_length);

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();

        Ok(TransferBody {
            content_length,
            chunks,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_body() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Status {
            code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
        }
    } else {
        TransportError::Other(err.to_string())
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Wait before the first retry; doubles for each later retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

// ============================================================================
// Downloader
// ============================================================================

enum AttemptError {
    Retryable(String),
    Fatal(String),
}

/// Streams archives to disk with retry, progress and cancellation.
#[derive(Clone)]
pub struct Downloader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Downloads `url` to `dest`.
    ///
    /// `on_progress` receives the downloaded fraction after every chunk.
    /// Returns the number of bytes written, or `Cancelled` if `cancel` fired.
    /// No partial file remains after a cancel or an error.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Transfer`] when the server reports no content
    /// length, answers with an HTTP error status, keeps failing after all
    /// attempts, or the file cannot be written.
    pub async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> InstallResult<Completion<u64>>
    where
        F: Fn(f64) + Send + Sync,
    {
        info!("Downloading {} to {}", url, dest.display());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                InstallError::transfer(
                    url,
                    format!("Failed to create directory {}: {}", parent.display(), e),
                )
            })?;
        }

        let part = partial_path(dest);
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Ok(Completion::Cancelled);
            }

            let outcome = self.attempt(url, &part, &on_progress, cancel).await;
            match outcome {
                Ok(Completion::Finished(bytes)) => {
                    tokio::fs::rename(&part, dest).await.map_err(|e| {
                        InstallError::transfer(
                            url,
                            format!("Failed to move download into {}: {}", dest.display(), e),
                        )
                    })?;
                    info!(
                        "Download complete: {} written to {}",
                        format_size(bytes),
                        dest.display()
                    );
                    return Ok(Completion::Finished(bytes));
                }
                Ok(Completion::Cancelled) => {
                    remove_partial(&part).await;
                    info!("Download of {} cancelled", url);
                    return Ok(Completion::Cancelled);
                }
                Err(AttemptError::Retryable(msg)) if attempt < max_attempts => {
                    remove_partial(&part).await;
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "Download of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        url, attempt, max_attempts, msg, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Ok(Completion::Cancelled),
                    }
                }
                Err(AttemptError::Retryable(msg)) => {
                    remove_partial(&part).await;
                    return Err(InstallError::transfer(
                        url,
                        format!("{} (after {} attempts)", msg, max_attempts),
                    ));
                }
                Err(AttemptError::Fatal(msg)) => {
                    remove_partial(&part).await;
                    return Err(InstallError::transfer(url, msg));
                }
            }
        }

        Err(InstallError::transfer(url, "No download attempt was made"))
    }

    async fn attempt<F>(
        &self,
        url: &str,
        part: &Path,
        on_progress: &F,
        cancel: &CancellationToken,
    ) -> Result<Completion<u64>, AttemptError>
    where
        F: Fn(f64) + Send + Sync,
    {
        let body = self.transport.open(url).await.map_err(into_attempt_error)?;

        let total = match body.content_length {
            Some(len) if len > 0 => len,
            _ => {
                return Err(AttemptError::Fatal(
                    "Server did not report a content length".to_string(),
                ))
            }
        };

        let mut file = File::create(part).await.map_err(|e| {
            AttemptError::Fatal(format!("Failed to create file {}: {}", part.display(), e))
        })?;

        let mut chunks = body.chunks;
        let mut written: u64 = 0;
        on_progress(0.0);

        loop {
            // A stalled server must not hold up a cancel.
            let next = tokio::select! {
                next = chunks.next() => next,
                _ = cancel.cancelled() => {
                    drop(file);
                    return Ok(Completion::Cancelled);
                }
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(into_attempt_error)?;

            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Fatal(format!("Failed to write chunk to file: {}", e)))?;

            written += chunk.len() as u64;
            on_progress((written as f64 / total as f64).min(1.0));

            if cancel.is_cancelled() {
                drop(file);
                return Ok(Completion::Cancelled);
            }
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::Fatal(format!("Failed to flush file: {}", e)))?;
        drop(file);

        if written < total {
            return Err(AttemptError::Retryable(format!(
                "Connection closed after {} of {} bytes",
                written, total
            )));
        }
        if written > total {
            return Err(AttemptError::Fatal(format!(
                "Received {} bytes but server declared {}",
                written, total
            )));
        }

        Ok(Completion::Finished(written))
    }
}

fn into_attempt_error(err: TransportError) -> AttemptError {
    if err.is_retryable() {
        AttemptError::Retryable(err.to_string())
    } else {
        AttemptError::Fatal(err.to_string())
    }
}

/// Returns the temporary path a download is streamed to.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!("Removed partial download {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {}: {}", part.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum Reply {
        Fail(TransportError),
        Body {
            content_length: Option<u64>,
            chunks: Vec<Result<Vec<u8>, TransportError>>,
        },
        /// Sends `first`, then never yields another chunk.
        Stalled { content_length: u64, first: Vec<u8> },
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _url: &str) -> Result<TransferBody, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected request");
            match reply {
                Reply::Fail(err) => Err(err),
                Reply::Body {
                    content_length,
                    chunks,
                } => Ok(TransferBody {
                    content_length,
                    chunks: futures::stream::iter(
                        chunks.into_iter().map(|c| c.map(Bytes::from)),
                    )
                    .boxed(),
                }),
                Reply::Stalled {
                    content_length,
                    first,
                } => Ok(TransferBody {
                    content_length: Some(content_length),
                    chunks: futures::stream::iter([Ok(Bytes::from(first))])
                        .chain(futures::stream::pending())
                        .boxed(),
                }),
            }
        }
    }

    fn ok_body(data: &[u8], chunk_size: usize) -> Reply {
        Reply::Body {
            content_length: Some(data.len() as u64),
            chunks: data.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect(),
        }
    }

    fn timeout() -> Reply {
        Reply::Fail(TransportError::Timeout("read timed out".to_string()))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::Timeout("slow".into()).is_retryable());
        assert!(!TransportError::Status {
            code: 404,
            reason: "Not Found".into()
        }
        .is_retryable());
        assert!(!TransportError::Other("tls".into()).is_retryable());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/a/tool.zip")),
            PathBuf::from("/tmp/a/tool.zip.part")
        );
    }

    #[tokio::test]
    async fn test_fetch_reports_progress_and_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("nested").join("tool.zip");
        let data = vec![7u8; 1000];
        let transport = ScriptedTransport::new(vec![ok_body(&data, 256)]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let seen = Mutex::new(Vec::new());
        let outcome = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |f| seen.lock().unwrap().push(f),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Completion::Finished(1000));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!partial_path(&dest).exists());

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_fetch_succeeds_after_two_timeouts() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let data = vec![1u8; 4096];
        let transport = ScriptedTransport::new(vec![timeout(), timeout(), ok_body(&data, 1000)]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let outcome = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Completion::Finished(4096));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_three_timeouts() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let transport = ScriptedTransport::new(vec![timeout(), timeout(), timeout()]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let err = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TransferError");
        assert_eq!(transport.calls(), 3);
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_http_errors() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let transport = ScriptedTransport::new(vec![Reply::Fail(TransportError::Status {
            code: 404,
            reason: "Not Found".to_string(),
        })]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let err = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_requires_content_length() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let transport = ScriptedTransport::new(vec![Reply::Body {
            content_length: None,
            chunks: vec![Ok(vec![0u8; 10])],
        }]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let err = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("content length"));
        assert_eq!(transport.calls(), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_retries_mid_stream_drop() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let data = vec![9u8; 300];
        let transport = ScriptedTransport::new(vec![
            Reply::Body {
                content_length: Some(300),
                chunks: vec![
                    Ok(vec![9u8; 100]),
                    Err(TransportError::Connect("reset by peer".to_string())),
                ],
            },
            ok_body(&data, 100),
        ]);
        let downloader = Downloader::new(transport.clone(), fast_retry());

        let outcome = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Completion::Finished(300));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_fetch_cancel_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let data = vec![3u8; 1000];
        let transport = ScriptedTransport::new(vec![ok_body(&data, 100)]);
        let downloader = Downloader::new(transport.clone(), fast_retry());
        let cancel = CancellationToken::new();

        let outcome = downloader
            .fetch(
                "https://example.com/tool.zip",
                &dest,
                |f| {
                    if f >= 0.3 {
                        cancel.cancel();
                    }
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_cancel_interrupts_retry_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let transport = ScriptedTransport::new(vec![timeout()]);
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
        };
        let downloader = Downloader::new(transport.clone(), retry);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            downloader.fetch("https://example.com/tool.zip", &dest, |_| {}, &cancel),
        )
        .await
        .expect("cancel did not interrupt the backoff")
        .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(transport.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_cancel_interrupts_stalled_body() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("tool.zip");
        let transport = ScriptedTransport::new(vec![Reply::Stalled {
            content_length: 1000,
            first: vec![5u8; 100],
        }]);
        let downloader = Downloader::new(transport, fast_retry());
        let cancel = CancellationToken::new();
        let (first_chunk_tx, first_chunk_rx) = tokio::sync::oneshot::channel();
        let first_chunk_tx = Mutex::new(Some(first_chunk_tx));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            let _ = first_chunk_rx.await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            downloader.fetch(
                "https://example.com/tool.zip",
                &dest,
                |f| {
                    if f > 0.0 {
                        if let Some(tx) = first_chunk_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                    }
                },
                &cancel,
            ),
        )
        .await
        .expect("cancel did not interrupt the stalled read")
        .unwrap();

        assert!(outcome.is_cancelled());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
