//! File handles returned by the S3 filesystem.
//!
//! Readers are stateless ranged GETs. Writers buffer into a local spill
//! file and upload the whole file on sync, so the object store always holds
//! a complete object; the spill file is the source of truth until close.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info};

use cirrus_vfs::{Error, RandomAccessFile, ReadOnlyMemoryRegion, Result, WritableFile};

use crate::client::S3Client;
use crate::transfer::{TransferManager, TransferStatus};

/// A failed upload is re-driven this many times before sync gives up; only
/// the failed parts are re-sent.
const UPLOAD_RETRIES: u32 = 5;

static TMP_FILE_INDEX: Mutex<u32> = Mutex::new(0);

/// Disambiguator appended to the spill-file template. The OS unique-file
/// mechanism provides the randomness; the rolling counter keeps names
/// distinguishable in listings of the temp directory.
fn tmp_file_suffix() -> String {
    const MAX_TMP_FILE_INDEX: u32 = 1000;
    let mut index = TMP_FILE_INDEX.lock().unwrap();
    let current = *index;
    *index = (*index + 1) % MAX_TMP_FILE_INDEX;
    format!("{current}_")
}

pub struct S3RandomAccessFile {
    bucket: String,
    object: String,
    client: Arc<S3Client>,
}

impl S3RandomAccessFile {
    pub(crate) fn new(bucket: String, object: String, client: Arc<S3Client>) -> Self {
        Self {
            bucket,
            object,
            client,
        }
    }
}

#[async_trait]
impl RandomAccessFile for S3RandomAccessFile {
    async fn read(&self, offset: u64, n: usize) -> Result<Bytes> {
        debug!(
            bucket = %self.bucket,
            object = %self.object,
            offset,
            n,
            "reading object range"
        );
        if n == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + n as u64 - 1;
        match self
            .client
            .get_object_range(&self.bucket, &self.object, offset, end)
            .await
        {
            Ok(bytes) => Ok(bytes),
            // A range past the end of the object is the end-of-file signal.
            Err(err @ Error::OutOfRange(_)) => Err(err),
            Err(err) => Err(Error::Unknown(err.to_string())),
        }
    }
}

struct SpillFile {
    file: tokio::fs::File,
    // Deletes the file when the handle is released.
    path: tempfile::TempPath,
}

pub struct S3WritableFile {
    bucket: String,
    object: String,
    transfer: Arc<TransferManager>,
    spill: Option<SpillFile>,
    sync_needed: bool,
}

impl S3WritableFile {
    pub(crate) fn new(
        bucket: String,
        object: String,
        transfer: Arc<TransferManager>,
    ) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix("s3_filesystem_")
            .suffix(&tmp_file_suffix())
            .tempfile()
            .map_err(|e| Error::Internal(format!("failed to create spill file: {e}")))?;
        let (file, path) = tmp.into_parts();
        Ok(Self {
            bucket,
            object,
            transfer,
            spill: Some(SpillFile {
                file: tokio::fs::File::from_std(file),
                path,
            }),
            // A brand-new file syncs even with no appends, so that
            // open-write followed by close materializes an empty object.
            sync_needed: true,
        })
    }

    fn spill_mut(&mut self) -> Result<&mut SpillFile> {
        self.spill.as_mut().ok_or_else(|| {
            Error::FailedPrecondition("The internal temporary file is not writable.".to_string())
        })
    }
}

#[async_trait]
impl WritableFile for S3WritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let spill = self.spill.as_mut().ok_or_else(|| {
            Error::FailedPrecondition("The internal temporary file is not writable.".to_string())
        })?;
        self.sync_needed = true;
        spill.file.write_all(data).await.map_err(|e| {
            Error::Internal(format!("Could not append to the internal temporary file: {e}"))
        })?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        if self.spill.is_none() {
            return Err(Error::FailedPrecondition(
                "The internal temporary file is not writable.".to_string(),
            ));
        }
        if !self.sync_needed {
            return Ok(());
        }
        let bucket = self.bucket.clone();
        let object = self.object.clone();
        let transfer = self.transfer.clone();
        let spill = self.spill_mut()?;

        // The upload reads the spill file from the start; keep our own
        // cursor so later appends continue where they left off.
        let offset = spill
            .file
            .stream_position()
            .await
            .map_err(|e| Error::Internal(format!("failed to query spill file cursor: {e}")))?;
        spill
            .file
            .flush()
            .await
            .map_err(|e| Error::Internal(format!("failed to flush spill file: {e}")))?;

        debug!(bucket = %bucket, object = %object, "writing file to object store");
        let mut handle = transfer
            .upload_file(&spill.path, &bucket, &object, "application/octet-stream")
            .await;
        let mut retries = 0;
        while handle.status() == TransferStatus::Failed && retries < UPLOAD_RETRIES {
            retries += 1;
            info!(
                bucket = %bucket,
                object = %object,
                attempt = retries,
                "retrying upload after failure"
            );
            transfer.retry_upload(&mut handle).await;
        }
        if handle.status() != TransferStatus::Completed {
            let failed_parts = handle.failed_parts_count();
            let last_error = handle
                .last_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            transfer.abort(&mut handle).await;
            return Err(Error::Unknown(format!(
                "upload of s3://{bucket}/{object} failed: {failed_parts} failed parts. {last_error}"
            )));
        }

        spill
            .file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::Internal(format!("failed to restore spill file cursor: {e}")))?;
        self.sync_needed = false;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.sync().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.spill.is_some() {
            self.sync().await?;
            self.spill = None;
        }
        Ok(())
    }
}

pub struct S3ReadOnlyMemoryRegion {
    data: Bytes,
}

impl S3ReadOnlyMemoryRegion {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl ReadOnlyMemoryRegion for S3ReadOnlyMemoryRegion {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn test_transfer_manager() -> Arc<TransferManager> {
        let client = Arc::new(S3Client::new(ClientConfig::default()).unwrap());
        Arc::new(TransferManager::new(client))
    }

    #[tokio::test]
    async fn test_spill_files_are_unique_and_cleaned_up() {
        let transfer = test_transfer_manager();
        let a = S3WritableFile::new("b".into(), "k1".into(), transfer.clone()).unwrap();
        let b = S3WritableFile::new("b".into(), "k2".into(), transfer).unwrap();

        let path_a = a.spill.as_ref().unwrap().path.to_path_buf();
        let path_b = b.spill.as_ref().unwrap().path.to_path_buf();
        assert_ne!(path_a, path_b);
        assert!(path_a.exists());
        let name = path_a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("s3_filesystem_"));
        assert!(name.ends_with('_'));

        drop(a);
        drop(b);
        assert!(!path_a.exists());
        assert!(!path_b.exists());
    }

    #[tokio::test]
    async fn test_append_writes_through_to_spill_file() {
        let transfer = test_transfer_manager();
        let mut file = S3WritableFile::new("b".into(), "k".into(), transfer).unwrap();
        file.append(b"hello ").await.unwrap();
        file.append(b"world").await.unwrap();
        assert!(file.sync_needed);

        let path = file.spill.as_ref().unwrap().path.to_path_buf();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn test_append_after_release_is_a_precondition_failure() {
        let transfer = test_transfer_manager();
        let mut file = S3WritableFile::new("b".into(), "k".into(), transfer).unwrap();
        file.spill = None;
        let err = file.append(b"data").await.unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        let err = file.sync().await.unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_sync_is_a_no_op_when_nothing_changed() {
        let transfer = test_transfer_manager();
        let mut file = S3WritableFile::new("b".into(), "k".into(), transfer).unwrap();
        // Pretend a sync already happened; no wire traffic must occur.
        file.sync_needed = false;
        file.sync().await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_after_sync_is_idempotent() {
        let transfer = test_transfer_manager();
        let mut file = S3WritableFile::new("b".into(), "k".into(), transfer).unwrap();
        file.sync_needed = false;
        file.close().await.unwrap();
        assert!(file.spill.is_none());
        file.close().await.unwrap();
    }

    #[test]
    fn test_tmp_file_suffix_rolls() {
        let first = tmp_file_suffix();
        let second = tmp_file_suffix();
        assert!(first.ends_with('_'));
        assert!(second.ends_with('_'));
        assert_ne!(first, second);
    }
}
