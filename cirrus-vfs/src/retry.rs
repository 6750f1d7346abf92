//! Retry envelope and the retrying filesystem decorator.
//!
//! [`RetryingFileSystem`] wraps any [`ObjectFileSystem`] so that every
//! operation, including operations on the file handles it returns, runs
//! under [`call_with_retries`]: exponential backoff with jitter for error
//! kinds in the configured retriable set. Deletes run under
//! [`delete_with_retries`], which treats `NotFound` on a retried attempt
//! as success, since a delete that already happened cannot be told apart
//! from one observed through a stale listing.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::fs::{
    FileStatistics, ObjectFileSystem, RandomAccessFile, ReadOnlyMemoryRegion, WritableFile,
};

/// Every retriable call is attempted at most this many extra times.
pub const MAX_RETRIES: u32 = 10;
/// Maximum backoff delay, not counting jitter.
pub const MAX_BACKOFF_MICROS: u64 = 32_000_000;
/// Default initial backoff delay.
pub const DEFAULT_INITIAL_DELAY_MICROS: u64 = 1_000_000;

/// Parameters of the retry envelope.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before the first retry; doubles on each attempt.
    /// A value of 0 disables sleeping entirely.
    pub initial_delay_micros: u64,
    /// Error kinds eligible for automatic retry.
    pub retriable_errors: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_micros: DEFAULT_INITIAL_DELAY_MICROS,
            retriable_errors: [
                ErrorKind::Unavailable,
                ErrorKind::DeadlineExceeded,
                ErrorKind::Unknown,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn with_initial_delay_micros(mut self, micros: u64) -> Self {
        self.initial_delay_micros = micros;
        self
    }

    pub fn with_retriable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retriable_errors.extend(kinds);
        self
    }

    pub fn is_retriable(&self, err: &Error) -> bool {
        self.retriable_errors.contains(&err.kind())
    }
}

/// Delay before retry `retries` (0-indexed): the base delay shifted left
/// once per prior attempt, clamped at [`MAX_BACKOFF_MICROS`], plus jitter.
/// Zero when backoff is disabled.
fn compute_backoff_micros(initial_delay_micros: u64, retries: u32, jitter_micros: u64) -> u64 {
    if initial_delay_micros == 0 {
        return 0;
    }
    let base = initial_delay_micros
        .checked_shl(retries)
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_MICROS);
    base + jitter_micros
}

fn jitter_micros() -> u64 {
    rand::random::<u64>() % 1_000_000
}

/// Sleep before the next attempt, or give up with `Aborted` once
/// [`MAX_RETRIES`] attempts have failed.
async fn backoff_or_abort(config: &RetryConfig, retries: &mut u32, err: &Error) -> Result<()> {
    if *retries >= MAX_RETRIES {
        return Err(Error::Aborted(format!(
            "All {MAX_RETRIES} retry attempts failed. The last failure: {err}"
        )));
    }
    let delay = compute_backoff_micros(config.initial_delay_micros, *retries, jitter_micros());
    info!(
        delay_secs = delay as f64 / 1e6,
        attempt = *retries + 1,
        max_attempts = MAX_RETRIES,
        error = %err,
        "operation failed, will be retried after backoff"
    );
    if delay > 0 {
        tokio::time::sleep(Duration::from_micros(delay)).await;
    }
    *retries += 1;
    Ok(())
}

/// Run `f` until it returns a non-retriable outcome, backing off between
/// attempts. After [`MAX_RETRIES`] retriable failures the envelope returns
/// `Aborted` embedding the final failure, so callers higher up do not
/// retry again.
pub async fn call_with_retries<T, F, Fut>(config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries: u32 = 0;
    loop {
        match f().await {
            Err(err) if config.is_retriable(&err) => {
                backoff_or_abort(config, &mut retries, &err).await?;
            }
            other => return other,
        }
    }
}

/// [`call_with_retries`] for delete operations: a `NotFound` on any attempt
/// after the first is rewritten to success.
pub async fn delete_with_retries<F, Fut>(config: &RetryConfig, mut f: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut is_retried = false;
    let mut retries: u32 = 0;
    loop {
        let status = match f().await {
            Err(Error::NotFound(_)) if is_retried => Ok(()),
            other => other,
        };
        is_retried = true;
        match status {
            Err(err) if config.is_retriable(&err) => {
                backoff_or_abort(config, &mut retries, &err).await?;
            }
            other => return other,
        }
    }
}

async fn close_with_retries(file: &mut dyn WritableFile, config: &RetryConfig) -> Result<()> {
    let mut retries: u32 = 0;
    loop {
        match file.close().await {
            Err(err) if config.is_retriable(&err) => {
                backoff_or_abort(config, &mut retries, &err).await?;
            }
            other => return other,
        }
    }
}

/// A wrapper adding retry logic to another filesystem.
pub struct RetryingFileSystem<T> {
    inner: T,
    config: RetryConfig,
}

impl<T: ObjectFileSystem> RetryingFileSystem<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: ObjectFileSystem> ObjectFileSystem for RetryingFileSystem<T> {
    async fn new_random_access_file(&self, path: &str) -> Result<Box<dyn RandomAccessFile>> {
        let file =
            call_with_retries(&self.config, || self.inner.new_random_access_file(path)).await?;
        Ok(Box::new(RetryingRandomAccessFile {
            inner: file,
            config: self.config.clone(),
        }))
    }

    async fn new_writable_file(&self, path: &str) -> Result<Box<dyn WritableFile>> {
        let file = call_with_retries(&self.config, || self.inner.new_writable_file(path)).await?;
        Ok(Box::new(RetryingWritableFile {
            inner: Some(file),
            config: self.config.clone(),
        }))
    }

    async fn new_appendable_file(&self, path: &str) -> Result<Box<dyn WritableFile>> {
        let file = call_with_retries(&self.config, || self.inner.new_appendable_file(path)).await?;
        Ok(Box::new(RetryingWritableFile {
            inner: Some(file),
            config: self.config.clone(),
        }))
    }

    async fn new_read_only_memory_region(
        &self,
        path: &str,
    ) -> Result<Box<dyn ReadOnlyMemoryRegion>> {
        call_with_retries(&self.config, || {
            self.inner.new_read_only_memory_region(path)
        })
        .await
    }

    async fn file_exists(&self, path: &str) -> Result<()> {
        call_with_retries(&self.config, || self.inner.file_exists(path)).await
    }

    async fn get_children(&self, dir: &str) -> Result<Vec<String>> {
        call_with_retries(&self.config, || self.inner.get_children(dir)).await
    }

    async fn stat(&self, path: &str) -> Result<FileStatistics> {
        call_with_retries(&self.config, || self.inner.stat(path)).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        delete_with_retries(&self.config, || self.inner.delete_file(path)).await
    }

    async fn create_dir(&self, dirname: &str) -> Result<()> {
        call_with_retries(&self.config, || self.inner.create_dir(dirname)).await
    }

    async fn delete_dir(&self, dirname: &str) -> Result<()> {
        delete_with_retries(&self.config, || self.inner.delete_dir(dirname)).await
    }

    async fn get_file_size(&self, path: &str) -> Result<u64> {
        call_with_retries(&self.config, || self.inner.get_file_size(path)).await
    }

    async fn rename_file(&self, src: &str, target: &str) -> Result<()> {
        call_with_retries(&self.config, || self.inner.rename_file(src, target)).await
    }

    async fn is_directory(&self, path: &str) -> Result<()> {
        call_with_retries(&self.config, || self.inner.is_directory(path)).await
    }
}

struct RetryingRandomAccessFile {
    inner: Box<dyn RandomAccessFile>,
    config: RetryConfig,
}

#[async_trait]
impl RandomAccessFile for RetryingRandomAccessFile {
    async fn read(&self, offset: u64, n: usize) -> Result<Bytes> {
        call_with_retries(&self.config, || self.inner.read(offset, n)).await
    }
}

struct RetryingWritableFile {
    inner: Option<Box<dyn WritableFile>>,
    config: RetryConfig,
}

impl RetryingWritableFile {
    fn inner_mut(&mut self) -> Result<&mut Box<dyn WritableFile>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("The file has been dropped.".to_string()))
    }
}

#[async_trait]
impl WritableFile for RetryingWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let config = self.config.clone();
        let inner = self.inner_mut()?;
        let mut retries: u32 = 0;
        loop {
            match inner.append(data).await {
                Err(err) if config.is_retriable(&err) => {
                    backoff_or_abort(&config, &mut retries, &err).await?;
                }
                other => return other,
            }
        }
    }

    async fn sync(&mut self) -> Result<()> {
        let config = self.config.clone();
        let inner = self.inner_mut()?;
        let mut retries: u32 = 0;
        loop {
            match inner.sync().await {
                Err(err) if config.is_retriable(&err) => {
                    backoff_or_abort(&config, &mut retries, &err).await?;
                }
                other => return other,
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let config = self.config.clone();
        let inner = self.inner_mut()?;
        let mut retries: u32 = 0;
        loop {
            match inner.flush().await {
                Err(err) if config.is_retriable(&err) => {
                    backoff_or_abort(&config, &mut retries, &err).await?;
                }
                other => return other,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let config = self.config.clone();
        let inner = self.inner_mut()?;
        close_with_retries(&mut **inner, &config).await
    }
}

impl Drop for RetryingWritableFile {
    // Close() flushes buffered data, so a dropped handle must still run it.
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        let config = self.config.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = close_with_retries(&mut *inner, &config).await {
                        warn!(error = %err, "closing a dropped writable file failed");
                    }
                });
            }
            Err(_) => {
                warn!("writable file dropped outside a runtime; appended data may not be synced");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast_config() -> RetryConfig {
        RetryConfig::default().with_initial_delay_micros(0)
    }

    #[test]
    fn test_backoff_doubles_and_clamps() {
        // attempt k sleeps in [initial << k, initial << k + 1e6)
        assert_eq!(compute_backoff_micros(1_000_000, 0, 0), 1_000_000);
        assert_eq!(compute_backoff_micros(1_000_000, 0, 999_999), 1_999_999);
        assert_eq!(compute_backoff_micros(1_000_000, 3, 0), 8_000_000);
        assert_eq!(compute_backoff_micros(1_000_000, 5, 7), 32_000_007);
        // Clamped at 32s past the fifth doubling.
        assert_eq!(compute_backoff_micros(1_000_000, 9, 0), 32_000_000);
        assert_eq!(compute_backoff_micros(100_000, 2, 0), 400_000);
    }

    #[test]
    fn test_backoff_disabled_when_no_initial_delay() {
        assert_eq!(compute_backoff_micros(0, 4, 999_999), 0);
    }

    #[tokio::test]
    async fn test_immediate_success_makes_one_call() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retries(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_first_non_retriable_outcome() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retries(&fast_config(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::Unavailable("503".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = call_with_retries(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("no such key".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_with_aborted_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = call_with_retries(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::DeadlineExceeded("request timed out".into())) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(err.to_string().contains("All 10 retry attempts failed"));
        assert!(err.to_string().contains("request timed out"));
        // Initial call plus MAX_RETRIES attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_delete_absorbs_not_found_after_retry() {
        // Unavailable twice, then NotFound: the delete went through on the
        // server even though the responses were lost.
        let outcomes = Mutex::new(vec![
            Err(Error::Unavailable("503".into())),
            Err(Error::Unavailable("503".into())),
            Err(Error::NotFound("gone".into())),
        ]);
        let result = delete_with_retries(&fast_config(), || {
            let next = outcomes.lock().unwrap().remove(0);
            async move { next }
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_delete_reports_not_found_on_first_attempt() {
        let result = delete_with_retries(&fast_config(), || async {
            Err(Error::NotFound("never existed".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    // ── Decorator-level tests over a scripted backend ────────────────────────

    #[derive(Default)]
    struct ScriptedFs {
        delete_outcomes: Mutex<Vec<Result<()>>>,
        stat_outcomes: Mutex<Vec<Result<FileStatistics>>>,
    }

    #[async_trait]
    impl ObjectFileSystem for ScriptedFs {
        async fn new_random_access_file(
            &self,
            _path: &str,
        ) -> Result<Box<dyn RandomAccessFile>> {
            unimplemented!()
        }

        async fn new_writable_file(&self, _path: &str) -> Result<Box<dyn WritableFile>> {
            unimplemented!()
        }

        async fn new_appendable_file(&self, _path: &str) -> Result<Box<dyn WritableFile>> {
            unimplemented!()
        }

        async fn new_read_only_memory_region(
            &self,
            _path: &str,
        ) -> Result<Box<dyn ReadOnlyMemoryRegion>> {
            unimplemented!()
        }

        async fn file_exists(&self, _path: &str) -> Result<()> {
            unimplemented!()
        }

        async fn get_children(&self, _dir: &str) -> Result<Vec<String>> {
            unimplemented!()
        }

        async fn stat(&self, _path: &str) -> Result<FileStatistics> {
            self.stat_outcomes.lock().unwrap().remove(0)
        }

        async fn delete_file(&self, _path: &str) -> Result<()> {
            self.delete_outcomes.lock().unwrap().remove(0)
        }

        async fn create_dir(&self, _dirname: &str) -> Result<()> {
            unimplemented!()
        }

        async fn delete_dir(&self, _dirname: &str) -> Result<()> {
            unimplemented!()
        }

        async fn get_file_size(&self, _path: &str) -> Result<u64> {
            unimplemented!()
        }

        async fn rename_file(&self, _src: &str, _target: &str) -> Result<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_retrying_fs_delete_is_idempotent_under_retry() {
        let fs = ScriptedFs {
            delete_outcomes: Mutex::new(vec![
                Err(Error::Unavailable("503".into())),
                Err(Error::NotFound("gone".into())),
            ]),
            ..Default::default()
        };
        let retrying = RetryingFileSystem::new(fs, fast_config());
        assert!(retrying.delete_file("s3://bucket/key").await.is_ok());
    }

    #[tokio::test]
    async fn test_retrying_fs_stat_returns_first_success() {
        let fs = ScriptedFs {
            stat_outcomes: Mutex::new(vec![
                Err(Error::Unknown("internal error".into())),
                Ok(FileStatistics {
                    length: 11,
                    is_directory: false,
                    mtime_nsec: 1,
                }),
            ]),
            ..Default::default()
        };
        let retrying = RetryingFileSystem::new(fs, fast_config());
        let stats = retrying.stat("s3://bucket/key").await.unwrap();
        assert_eq!(stats.length, 11);
    }

    // ── Writable-handle wrapper tests ────────────────────────────────────────

    struct FlakyWritableFile {
        append_failures_left: usize,
        appended: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WritableFile for FlakyWritableFile {
        async fn append(&mut self, data: &[u8]) -> Result<()> {
            if self.append_failures_left > 0 {
                self.append_failures_left -= 1;
                return Err(Error::Unavailable("503".into()));
            }
            self.appended.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn sync(&mut self) -> Result<()> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writable_wrapper_retries_append() {
        let appended = Arc::new(Mutex::new(Vec::new()));
        let mut file = RetryingWritableFile {
            inner: Some(Box::new(FlakyWritableFile {
                append_failures_left: 2,
                appended: appended.clone(),
                closed: Arc::new(AtomicBool::new(false)),
            })),
            config: fast_config(),
        };
        file.append(b"abc").await.unwrap();
        assert_eq!(appended.lock().unwrap().as_slice(), b"abc");
    }

    #[tokio::test]
    async fn test_writable_wrapper_closes_on_drop() {
        let closed = Arc::new(AtomicBool::new(false));
        let file = RetryingWritableFile {
            inner: Some(Box::new(FlakyWritableFile {
                append_failures_left: 0,
                appended: Arc::new(Mutex::new(Vec::new())),
                closed: closed.clone(),
            })),
            config: fast_config(),
        };
        drop(file);
        // Close runs on a spawned task; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(closed.load(Ordering::SeqCst));
    }
}
