//! S3-backed filesystem adapter.
//!
//! Exposes a POSIX-like file abstraction over Amazon S3 or any
//! S3-compatible endpoint: random reads via ranged GETs, writes buffered in
//! a local spill file and shipped by multipart upload, prefix listings as
//! directories, and rename as list + server-side copy + delete.
//!
//! Hosts normally construct the adapter through
//! [`new_retrying_s3_filesystem`], which wraps every operation in the retry
//! envelope tuned for S3's eventual consistency.

pub mod client;
pub mod config;
pub mod file;
pub mod fs;
pub mod path;
pub mod transfer;
pub mod xml;

use cirrus_vfs::{ErrorKind, RetryConfig, RetryingFileSystem};

pub use config::ClientConfig;
pub use fs::S3FileSystem;
pub use path::parse_s3_path;

/// URI scheme this adapter serves.
pub const S3_SCHEME: &str = "s3";

/// Initial backoff delay of the wrapping retry envelope.
const S3_RETRY_INITIAL_DELAY_MICROS: u64 = 100_000;

/// An [`S3FileSystem`] wrapped in the retry envelope.
///
/// Beyond the transport failures retried by default, the S3 adapter also
/// retries `FailedPrecondition` and `Internal`: directory-not-empty and
/// similar signals that clear as eventually-consistent listings converge.
pub fn new_retrying_s3_filesystem() -> RetryingFileSystem<S3FileSystem> {
    let config = RetryConfig::default()
        .with_initial_delay_micros(S3_RETRY_INITIAL_DELAY_MICROS)
        .with_retriable([ErrorKind::FailedPrecondition, ErrorKind::Internal]);
    RetryingFileSystem::new(S3FileSystem::new(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_vfs::ObjectFileSystem;

    #[tokio::test]
    async fn test_retrying_filesystem_rejects_bad_paths_without_retrying() {
        let fs = new_retrying_s3_filesystem();
        // Parse failures are InvalidArgument and must surface immediately.
        let err = fs.stat("gs://bucket/key").await.unwrap_err();
        assert_eq!(err.kind(), cirrus_vfs::ErrorKind::InvalidArgument);
        let err = fs.delete_file("s3:///key").await.unwrap_err();
        assert_eq!(err.kind(), cirrus_vfs::ErrorKind::InvalidArgument);
    }
}
