//! Upload transfer manager.
//!
//! Uploads a local file to an object: a single `PutObject` for small files,
//! a multipart upload with bounded concurrency for large ones. The returned
//! handle records per-part outcomes so that a retry re-sends only the parts
//! that failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use cirrus_vfs::{Error, Result};

use crate::client::S3Client;

/// Multipart part size, matching the transfer manager defaults of the AWS
/// SDKs.
pub const PART_SIZE: u64 = 5 * 1024 * 1024;
/// Maximum concurrently in-flight part uploads.
pub const TRANSFER_CONCURRENCY: usize = 5;

/// `(start, length)` of each part covering `len` bytes. The final part
/// truncates; a zero-length input yields no parts.
pub(crate) fn part_ranges(len: u64, part_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let part_len = part_size.min(len - start);
        ranges.push((start, part_len));
        start += part_len;
    }
    ranges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Failed,
}

struct PartSlot {
    part_number: u32,
    start: u64,
    len: u64,
    etag: Option<String>,
}

/// State of one upload, reusable across retries.
pub struct TransferHandle {
    bucket: String,
    key: String,
    content_type: String,
    file_path: PathBuf,
    file_len: u64,
    upload_id: Option<String>,
    parts: Vec<PartSlot>,
    status: TransferStatus,
    last_error: Option<Error>,
}

impl TransferHandle {
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Parts still lacking an ETag after the last attempt.
    pub fn failed_parts_count(&self) -> usize {
        self.parts.iter().filter(|p| p.etag.is_none()).count()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

pub struct TransferManager {
    client: Arc<S3Client>,
    part_permits: Arc<Semaphore>,
}

impl TransferManager {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self {
            client,
            part_permits: Arc::new(Semaphore::new(TRANSFER_CONCURRENCY)),
        }
    }

    /// Upload the whole of `path` to `(bucket, key)`. Inspect the returned
    /// handle's status; a failed handle can be re-driven with
    /// [`TransferManager::retry_upload`].
    pub async fn upload_file(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> TransferHandle {
        let file_len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                return TransferHandle {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    content_type: content_type.to_string(),
                    file_path: path.to_path_buf(),
                    file_len: 0,
                    upload_id: None,
                    parts: Vec::new(),
                    status: TransferStatus::Failed,
                    last_error: Some(Error::Internal(format!(
                        "failed to stat upload source {}: {err}",
                        path.display()
                    ))),
                };
            }
        };
        let parts = part_ranges(file_len, PART_SIZE)
            .into_iter()
            .enumerate()
            .map(|(i, (start, len))| PartSlot {
                part_number: (i + 1) as u32,
                start,
                len,
                etag: None,
            })
            .collect();
        let mut handle = TransferHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            file_path: path.to_path_buf(),
            file_len,
            upload_id: None,
            parts,
            status: TransferStatus::Failed,
            last_error: None,
        };
        self.drive(&mut handle).await;
        handle
    }

    /// Re-send only the failed pieces of `handle` and re-attempt completion.
    pub async fn retry_upload(&self, handle: &mut TransferHandle) {
        self.drive(handle).await;
    }

    /// Abort the multipart upload behind a failed handle, releasing any
    /// parts the store is holding. Best effort.
    pub async fn abort(&self, handle: &mut TransferHandle) {
        let Some(upload_id) = handle.upload_id.take() else {
            return;
        };
        if let Err(err) = self
            .client
            .abort_multipart_upload(&handle.bucket, &handle.key, &upload_id)
            .await
        {
            warn!(
                bucket = %handle.bucket,
                key = %handle.key,
                error = %err,
                "failed to abort multipart upload; parts may be stranded"
            );
        }
    }

    async fn drive(&self, handle: &mut TransferHandle) {
        if handle.file_len <= PART_SIZE {
            return self.drive_single(handle).await;
        }
        self.drive_multipart(handle).await;
    }

    async fn drive_single(&self, handle: &mut TransferHandle) {
        let body = match tokio::fs::read(&handle.file_path).await {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                handle.status = TransferStatus::Failed;
                handle.last_error = Some(Error::Internal(format!(
                    "failed to read upload source {}: {err}",
                    handle.file_path.display()
                )));
                return;
            }
        };
        match self
            .client
            .put_object(&handle.bucket, &handle.key, &handle.content_type, body)
            .await
        {
            Ok(()) => {
                handle.status = TransferStatus::Completed;
                handle.last_error = None;
            }
            Err(err) => {
                handle.status = TransferStatus::Failed;
                handle.last_error = Some(err);
            }
        }
    }

    async fn drive_multipart(&self, handle: &mut TransferHandle) {
        let upload_id = match &handle.upload_id {
            Some(id) => id.clone(),
            None => {
                match self
                    .client
                    .create_multipart_upload(&handle.bucket, &handle.key, &handle.content_type)
                    .await
                {
                    Ok(id) => {
                        handle.upload_id = Some(id.clone());
                        id
                    }
                    Err(err) => {
                        handle.status = TransferStatus::Failed;
                        handle.last_error = Some(err);
                        return;
                    }
                }
            }
        };

        let pending: Vec<(u32, u64, u64)> = handle
            .parts
            .iter()
            .filter(|p| p.etag.is_none())
            .map(|p| (p.part_number, p.start, p.len))
            .collect();
        debug!(
            bucket = %handle.bucket,
            key = %handle.key,
            parts = pending.len(),
            total = handle.parts.len(),
            "uploading parts"
        );

        let mut tasks = Vec::with_capacity(pending.len());
        for (part_number, start, len) in pending {
            let client = self.client.clone();
            let permits = self.part_permits.clone();
            let bucket = handle.bucket.clone();
            let key = handle.key.clone();
            let path = handle.file_path.clone();
            let upload_id = upload_id.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("transfer executor shut down".to_string()))?;
                let body = read_file_range(&path, start, len).await?;
                let etag = client
                    .upload_part(&bucket, &key, &upload_id, part_number, body)
                    .await?;
                Ok::<(u32, String), Error>((part_number, etag))
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Ok((part_number, etag))) => {
                    if let Some(slot) = handle
                        .parts
                        .iter_mut()
                        .find(|p| p.part_number == part_number)
                    {
                        slot.etag = Some(etag);
                    }
                }
                Ok(Err(err)) => handle.last_error = Some(err),
                Err(err) => {
                    handle.last_error =
                        Some(Error::Internal(format!("part upload task failed: {err}")))
                }
            }
        }

        if handle.parts.iter().any(|p| p.etag.is_none()) {
            handle.status = TransferStatus::Failed;
            return;
        }

        let completed: Vec<crate::xml::CompletedPart> = handle
            .parts
            .iter()
            .map(|p| crate::xml::CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone().unwrap_or_default(),
            })
            .collect();
        match self
            .client
            .complete_multipart_upload(&handle.bucket, &handle.key, &upload_id, &completed)
            .await
        {
            Ok(()) => {
                handle.status = TransferStatus::Completed;
                handle.last_error = None;
                handle.upload_id = None;
            }
            Err(err) => {
                handle.status = TransferStatus::Failed;
                handle.last_error = Some(err);
            }
        }
    }
}

async fn read_file_range(path: &Path, start: u64, len: u64) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Internal(format!("failed to open {}: {e}", path.display())))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| Error::Internal(format!("failed to seek {}: {e}", path.display())))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::Internal(format!("failed to read {}: {e}", path.display())))?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_part_ranges_splits_with_truncated_tail() {
        // 11 MiB at 5 MiB parts: 5, 5, 1.
        let ranges = part_ranges(11 * MIB, 5 * MIB);
        assert_eq!(
            ranges,
            vec![
                (0, 5 * MIB),
                (5 * MIB, 5 * MIB),
                (10 * MIB, 1 * MIB),
            ]
        );
    }

    #[test]
    fn test_part_ranges_exact_multiple() {
        let ranges = part_ranges(10 * MIB, 5 * MIB);
        assert_eq!(ranges, vec![(0, 5 * MIB), (5 * MIB, 5 * MIB)]);
    }

    #[test]
    fn test_part_ranges_small_and_empty() {
        assert_eq!(part_ranges(1, 5 * MIB), vec![(0, 1)]);
        assert!(part_ranges(0, 5 * MIB).is_empty());
    }

    #[test]
    fn test_part_numbers_start_at_one() {
        let parts: Vec<u32> = part_ranges(11 * MIB, 5 * MIB)
            .into_iter()
            .enumerate()
            .map(|(i, _)| (i + 1) as u32)
            .collect();
        assert_eq!(parts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_file_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let chunk = read_file_range(&path, 10, 5).await.unwrap();
        assert_eq!(chunk.as_ref(), &data[10..15]);

        // Reading past EOF is a local error, not a wire error.
        assert!(read_file_range(&path, 250, 10).await.is_err());
    }
}
