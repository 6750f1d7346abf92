//! The S3 filesystem façade.
//!
//! Implements [`ObjectFileSystem`] over a flat bucket/key namespace.
//! Directories are a convention: a prefix is a directory when a delimited
//! listing shows anything under it, and `create_dir` materializes empty
//! directories as zero-byte objects whose key ends in `/`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use cirrus_vfs::{
    Error, FileStatistics, ObjectFileSystem, RandomAccessFile, ReadOnlyMemoryRegion, Result,
    WritableFile,
};

use crate::client::S3Client;
use crate::config::ClientConfig;
use crate::file::{S3RandomAccessFile, S3ReadOnlyMemoryRegion, S3WritableFile};
use crate::path::parse_s3_path;
use crate::transfer::{part_ranges, TransferManager, PART_SIZE};
use crate::xml::{CompletedPart, ListBucketResult};

/// Chunk size used to seed an appendable file from the existing object.
const READ_APPEND_BUFFER_SIZE: usize = 1024 * 1024;
/// Page size for listings.
const LIST_MAX_KEYS: u32 = 100;
/// Attempts per part during a multipart copy. No backoff between attempts;
/// the retry envelope around the whole rename provides that.
const COPY_PART_ATTEMPTS: u32 = 3;

#[derive(Clone)]
struct Handles {
    client: Arc<S3Client>,
    transfer: Arc<TransferManager>,
}

/// Lazily constructs and memoizes the shared client and transfer manager.
/// The environment is consulted exactly once, on first use.
#[derive(Default)]
struct ClientProvider {
    state: Mutex<Option<Handles>>,
}

impl ClientProvider {
    fn get(&self) -> Result<Handles> {
        let mut state = self.state.lock().unwrap();
        if let Some(handles) = state.as_ref() {
            return Ok(handles.clone());
        }
        let client = Arc::new(S3Client::new(ClientConfig::from_env())?);
        let transfer = Arc::new(TransferManager::new(client.clone()));
        let handles = Handles { client, transfer };
        *state = Some(handles.clone());
        Ok(handles)
    }
}

#[derive(Default)]
pub struct S3FileSystem {
    provider: ClientProvider,
}

impl S3FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Arc<S3Client>> {
        Ok(self.provider.get()?.client)
    }

    fn transfer_manager(&self) -> Result<Arc<TransferManager>> {
        Ok(self.provider.get()?.transfer)
    }

    fn writable(&self, path: &str) -> Result<S3WritableFile> {
        let (bucket, object) = parse_s3_path(path, false)?;
        S3WritableFile::new(bucket, object, self.transfer_manager()?)
    }

    /// Copy one object server-side, part by part, then complete.
    async fn multipart_copy(
        &self,
        client: &S3Client,
        copy_source: &str,
        source_len: u64,
        target_bucket: &str,
        target_key: &str,
    ) -> Result<()> {
        debug!(
            copy_source,
            target_bucket, target_key, source_len, "copying object"
        );
        // S3 rejects a completion with zero parts, so empty objects (the
        // directory markers in particular) copy in a single request.
        if source_len == 0 {
            return client.copy_object(copy_source, target_bucket, target_key).await;
        }

        let upload_id = client
            .create_multipart_upload(target_bucket, target_key, "application/octet-stream")
            .await?;

        let ranges = part_ranges(source_len, PART_SIZE);
        let mut parts = Vec::with_capacity(ranges.len());
        for (index, (start, len)) in ranges.iter().enumerate() {
            let part_number = (index + 1) as u32;
            let end = start + len - 1;
            let range = format!("bytes={start}-{end}");
            let mut attempt = 0;
            let etag = loop {
                attempt += 1;
                match client
                    .upload_part_copy(
                        copy_source,
                        &range,
                        target_bucket,
                        target_key,
                        &upload_id,
                        part_number,
                    )
                    .await
                {
                    Ok(etag) => break etag,
                    Err(err) if attempt < COPY_PART_ATTEMPTS => {
                        info!(
                            part = part_number,
                            attempt,
                            error = %err,
                            "retrying failed part copy"
                        );
                    }
                    Err(err) => {
                        abort_copy(client, target_bucket, target_key, &upload_id).await;
                        return Err(err);
                    }
                }
            };
            parts.push(CompletedPart { part_number, etag });
        }

        if let Err(err) = client
            .complete_multipart_upload(target_bucket, target_key, &upload_id, &parts)
            .await
        {
            abort_copy(client, target_bucket, target_key, &upload_id).await;
            return Err(err);
        }
        Ok(())
    }
}

/// Best-effort release of a failed multipart copy's stored parts.
async fn abort_copy(client: &S3Client, bucket: &str, key: &str, upload_id: &str) {
    if let Err(err) = client.abort_multipart_upload(bucket, key, upload_id).await {
        warn!(
            bucket,
            key,
            error = %err,
            "failed to abort multipart copy; parts may be stranded"
        );
    }
}

#[async_trait]
impl ObjectFileSystem for S3FileSystem {
    async fn new_random_access_file(&self, path: &str) -> Result<Box<dyn RandomAccessFile>> {
        let (bucket, object) = parse_s3_path(path, false)?;
        Ok(Box::new(S3RandomAccessFile::new(
            bucket,
            object,
            self.client()?,
        )))
    }

    async fn new_writable_file(&self, path: &str) -> Result<Box<dyn WritableFile>> {
        Ok(Box::new(self.writable(path)?))
    }

    async fn new_appendable_file(&self, path: &str) -> Result<Box<dyn WritableFile>> {
        let reader = self.new_random_access_file(path).await?;
        let mut writer = self.writable(path)?;

        // Seed the writer with the existing object; OutOfRange is the
        // end-of-file signal, anything else discards the writer.
        let mut offset: u64 = 0;
        loop {
            match reader.read(offset, READ_APPEND_BUFFER_SIZE).await {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        break;
                    }
                    offset += chunk.len() as u64;
                    writer.append(&chunk).await?;
                }
                Err(Error::OutOfRange(_)) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Box::new(writer))
    }

    async fn new_read_only_memory_region(
        &self,
        path: &str,
    ) -> Result<Box<dyn ReadOnlyMemoryRegion>> {
        let size = self.get_file_size(path).await?;
        if size == 0 {
            return Ok(Box::new(S3ReadOnlyMemoryRegion::new(Bytes::new())));
        }
        let file = self.new_random_access_file(path).await?;
        let data = file.read(0, size as usize).await?;
        Ok(Box::new(S3ReadOnlyMemoryRegion::new(data)))
    }

    async fn file_exists(&self, path: &str) -> Result<()> {
        self.stat(path).await?;
        Ok(())
    }

    async fn get_children(&self, dir: &str) -> Result<Vec<String>> {
        debug!(dir, "listing children");
        let (bucket, mut prefix) = parse_s3_path(dir, false)?;
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let client = self.client()?;

        let mut children = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let page = client
                .list_objects(
                    &bucket,
                    &prefix,
                    Some("/"),
                    LIST_MAX_KEYS,
                    continuation_token.as_deref(),
                )
                .await?;
            collect_child_entries(&prefix, &page, &mut children);
            if !page.is_truncated {
                break;
            }
            continuation_token = page.next_continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(children)
    }

    async fn stat(&self, path: &str) -> Result<FileStatistics> {
        let (bucket, object) = parse_s3_path(path, true)?;
        debug!(path, "stat");
        let client = self.client()?;

        if object.is_empty() {
            return match client.head_bucket(&bucket).await {
                Ok(()) => Ok(FileStatistics {
                    length: 0,
                    is_directory: true,
                    mtime_nsec: 0,
                }),
                Err(err) => Err(Error::Unknown(format!("failed to stat bucket {bucket}: {err}"))),
            };
        }

        let mut found = match client.head_object(&bucket, &object).await {
            Ok(head) => Some(FileStatistics {
                length: head.content_length,
                is_directory: false,
                mtime_nsec: head.last_modified_millis * 1_000_000,
            }),
            Err(_) => None,
        };

        // A directory marker or any key under `object/` makes this a
        // directory, overriding a file of the same name.
        let mut prefix = object.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        if let Ok(page) = client.list_objects(&bucket, &prefix, None, 1, None).await {
            if let Some(first) = page.contents.first() {
                found = Some(FileStatistics {
                    length: 0,
                    is_directory: true,
                    mtime_nsec: first.last_modified_millis * 1_000_000,
                });
            }
        }

        found.ok_or_else(|| Error::NotFound(format!("Object {path} does not exist")))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        debug!(path, "deleting file");
        let (bucket, object) = parse_s3_path(path, false)?;
        self.client()?.delete_object(&bucket, &object).await
    }

    async fn create_dir(&self, dirname: &str) -> Result<()> {
        debug!(dirname, "creating directory");
        let (bucket, object) = parse_s3_path(dirname, true)?;
        if object.is_empty() {
            return match self.client()?.head_bucket(&bucket).await {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::NotFound(format!("The bucket {bucket} was not found."))),
            };
        }
        let dir_path = ensure_trailing_slash(dirname);
        if self.file_exists(&dir_path).await.is_err() {
            let mut marker = self.new_writable_file(&dir_path).await?;
            marker.close().await?;
        }
        Ok(())
    }

    async fn delete_dir(&self, dirname: &str) -> Result<()> {
        debug!(dirname, "deleting directory");
        let (bucket, object) = parse_s3_path(dirname, false)?;
        let mut prefix = object;
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let page = self
            .client()?
            .list_objects(&bucket, &prefix, None, 2, None)
            .await?;
        let contents = &page.contents;
        if contents.len() > 1 || (contents.len() == 1 && contents[0].key != prefix) {
            // Stale listings may still show deleted objects; the retry
            // envelope polls until the listing drains or truly non-empty
            // directories exhaust it.
            return Err(Error::Internal(
                "Cannot delete a non-empty directory.".to_string(),
            ));
        }
        if contents.len() == 1 && contents[0].key == prefix {
            return self.delete_file(&ensure_trailing_slash(dirname)).await;
        }
        Ok(())
    }

    async fn get_file_size(&self, path: &str) -> Result<u64> {
        Ok(self.stat(path).await?.length)
    }

    async fn rename_file(&self, src: &str, target: &str) -> Result<()> {
        info!(src, target, "renaming");
        let (src_bucket, src_object) = parse_s3_path(src, false)?;
        let (target_bucket, mut target_object) = parse_s3_path(target, false)?;

        // src and target must agree in directory-ness.
        if src_object.ends_with('/') {
            if !target_object.ends_with('/') {
                target_object.push('/');
            }
        } else if target_object.ends_with('/') {
            target_object.pop();
        }

        let client = self.client()?;
        let mut continuation_token: Option<String> = None;
        loop {
            let page = client
                .list_objects(
                    &src_bucket,
                    &src_object,
                    None,
                    LIST_MAX_KEYS,
                    continuation_token.as_deref(),
                )
                .await?;
            for object in &page.contents {
                let target_key = substitute_prefix(&object.key, &src_object, &target_object);
                let copy_source =
                    format!("{}/{}", src_bucket, urlencoding::encode(&object.key));
                self.multipart_copy(
                    &client,
                    &copy_source,
                    object.size,
                    &target_bucket,
                    &target_key,
                )
                .await?;
                client.delete_object(&src_bucket, &object.key).await?;
            }
            if !page.is_truncated {
                break;
            }
            continuation_token = page.next_continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(())
    }
}

fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Replace the listed key's leading `src_prefix` with `target_prefix`.
fn substitute_prefix(key: &str, src_prefix: &str, target_prefix: &str) -> String {
    match key.strip_prefix(src_prefix) {
        Some(rest) => format!("{target_prefix}{rest}"),
        None => key.to_string(),
    }
}

/// Entries of one listing page, relative to `prefix`: common prefixes lose
/// their trailing `/`, content keys keep theirs, empties are dropped.
fn collect_child_entries(prefix: &str, page: &ListBucketResult, out: &mut Vec<String>) {
    for common_prefix in &page.common_prefixes {
        let trimmed = common_prefix.strip_suffix('/').unwrap_or(common_prefix);
        if let Some(entry) = trimmed.strip_prefix(prefix) {
            if !entry.is_empty() {
                out.push(entry.to_string());
            }
        }
    }
    for object in &page.contents {
        if let Some(entry) = object.key.strip_prefix(prefix) {
            if !entry.is_empty() {
                out.push(entry.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::ObjectSummary;

    #[test]
    fn test_ensure_trailing_slash() {
        assert_eq!(ensure_trailing_slash("s3://b/dir"), "s3://b/dir/");
        assert_eq!(ensure_trailing_slash("s3://b/dir/"), "s3://b/dir/");
    }

    #[test]
    fn test_substitute_prefix() {
        assert_eq!(
            substitute_prefix("old/sub/file.bin", "old/", "new/"),
            "new/sub/file.bin"
        );
        assert_eq!(substitute_prefix("old", "old", "new"), "new");
        // A key not under the prefix passes through untouched.
        assert_eq!(substitute_prefix("other/x", "old/", "new/"), "other/x");
    }

    #[test]
    fn test_collect_child_entries_strips_and_skips() {
        let page = ListBucketResult {
            contents: vec![
                ObjectSummary {
                    key: "data/a.bin".to_string(),
                    ..Default::default()
                },
                // The directory marker itself strips to nothing and is
                // omitted.
                ObjectSummary {
                    key: "data/".to_string(),
                    ..Default::default()
                },
            ],
            common_prefixes: vec!["data/sub/".to_string(), "data/other/".to_string()],
            is_truncated: false,
            next_continuation_token: None,
        };
        let mut out = Vec::new();
        collect_child_entries("data/", &page, &mut out);
        assert_eq!(out, vec!["sub", "other", "a.bin"]);
    }

    #[test]
    fn test_collect_child_entries_empty_page() {
        let mut out = Vec::new();
        collect_child_entries("data/", &ListBucketResult::default(), &mut out);
        assert!(out.is_empty());
    }
}
