//! Virtual filesystem abstraction for object-store backends.
//!
//! All file access goes through the [`ObjectFileSystem`] trait and the file
//! handles it returns. Backends live in sibling crates; this crate holds the
//! capability traits, the typed error model, and the retry decorator that
//! wraps any backend in an exponential-backoff envelope.

pub mod error;
pub mod fs;
pub mod retry;

pub use error::{Error, ErrorKind, Result};
pub use fs::{
    FileStatistics, ObjectFileSystem, RandomAccessFile, ReadOnlyMemoryRegion, WritableFile,
};
pub use retry::{call_with_retries, delete_with_retries, RetryConfig, RetryingFileSystem};
