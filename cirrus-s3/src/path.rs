//! `s3://bucket/key` path parsing.

use cirrus_vfs::{Error, Result};

/// Split an `s3://bucket/key` URI into bucket and key.
///
/// The slash separating bucket and key is consumed. Some operations address
/// the bucket itself, so an empty key is accepted when `empty_key_ok` is set.
pub fn parse_s3_path(path: &str, empty_key_ok: bool) -> Result<(String, String)> {
    let rest = path.strip_prefix("s3://").ok_or_else(|| {
        Error::InvalidArgument(format!("S3 path doesn't start with 's3://': {path}"))
    })?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() || bucket == "." {
        return Err(Error::InvalidArgument(format!(
            "S3 path doesn't contain a bucket name: {path}"
        )));
    }
    if !empty_key_ok && key.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "S3 path doesn't contain an object name: {path}"
        )));
    }
    Ok((bucket.to_string(), key.to_string()))
}
