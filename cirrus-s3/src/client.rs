//! S3 wire client.
//!
//! Talks to AWS S3 or any S3-compatible service over reqwest with manual
//! AWS Signature V4 signing, so no SDK dependency is needed. Requests use
//! path-style addressing and unsigned payloads for streaming bodies.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::debug;

use cirrus_vfs::{Error, Result};

use crate::config::ClientConfig;
use crate::xml::{
    self, parse_copy_etag, parse_error_response, parse_initiate_multipart_upload,
    parse_list_bucket_result, CompletedPart, ListBucketResult,
};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
// SHA-256 of the empty string, for bodyless requests.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// `HeadObject` metadata.
#[derive(Debug, Clone, Copy)]
pub struct HeadObjectResult {
    pub content_length: u64,
    pub last_modified_millis: i64,
}

pub struct S3Client {
    config: ClientConfig,
    client: reqwest::Client,
}

impl S3Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        for cert in load_trust_anchors(&config)? {
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    // ── Object operations ────────────────────────────────────────────────────

    /// Ranged GET of `bytes=start-end` (inclusive).
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes> {
        let headers = vec![("range".to_string(), format!("bytes={start}-{end}"))];
        let resp = self
            .request(Method::GET, bucket, key, &BTreeMap::new(), headers, None)
            .await?;
        let resp = check(resp, "GetObject").await?;
        resp.bytes()
            .await
            .map_err(|e| Error::Unknown(format!("GetObject: failed to read body: {e}")))
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadObjectResult> {
        let resp = self
            .request(Method::HEAD, bucket, key, &BTreeMap::new(), Vec::new(), None)
            .await?;
        let resp = check(resp, "HeadObject").await?;
        let content_length = header_value(&resp, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_modified_millis = header_value(&resp, "last-modified")
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(&v).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        Ok(HeadObjectResult {
            content_length,
            last_modified_millis,
        })
    }

    pub async fn head_bucket(&self, bucket: &str) -> Result<()> {
        let resp = self
            .request(Method::HEAD, bucket, "", &BTreeMap::new(), Vec::new(), None)
            .await?;
        check(resp, "HeadBucket").await?;
        Ok(())
    }

    /// One page of a V2 listing.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: u32,
        continuation_token: Option<&str>,
    ) -> Result<ListBucketResult> {
        let mut query = BTreeMap::new();
        query.insert("list-type".to_string(), "2".to_string());
        query.insert("prefix".to_string(), prefix.to_string());
        query.insert("max-keys".to_string(), max_keys.to_string());
        if let Some(delimiter) = delimiter {
            query.insert("delimiter".to_string(), delimiter.to_string());
        }
        if let Some(token) = continuation_token {
            query.insert("continuation-token".to_string(), token.to_string());
        }
        let resp = self
            .request(Method::GET, bucket, "", &query, Vec::new(), None)
            .await?;
        let resp = check(resp, "ListObjects").await?;
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Unknown(format!("ListObjects: failed to read body: {e}")))?;
        parse_list_bucket_result(&body)
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<()> {
        let headers = vec![("content-type".to_string(), content_type.to_string())];
        let resp = self
            .request(Method::PUT, bucket, key, &BTreeMap::new(), headers, Some(body))
            .await?;
        check(resp, "PutObject").await?;
        debug!(bucket, key, "PutObject complete");
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, bucket, key, &BTreeMap::new(), Vec::new(), None)
            .await?;
        check(resp, "DeleteObject").await?;
        debug!(bucket, key, "DeleteObject complete");
        Ok(())
    }

    /// Single-request server-side copy. `copy_source` is
    /// `source-bucket/url-encoded-source-key`.
    pub async fn copy_object(&self, copy_source: &str, bucket: &str, key: &str) -> Result<()> {
        let headers = vec![("x-amz-copy-source".to_string(), copy_source.to_string())];
        let resp = self
            .request(Method::PUT, bucket, key, &BTreeMap::new(), headers, None)
            .await?;
        let resp = check(resp, "CopyObject").await?;
        // A copy can fail after the 200 status line; the error arrives in
        // the body instead.
        let body = resp.text().await.unwrap_or_default();
        if let Some(err) = parse_error_response(&body) {
            return Err(Error::Unknown(format!(
                "CopyObject: {}: {}",
                err.code, err.message
            )));
        }
        Ok(())
    }

    // ── Multipart upload operations ──────────────────────────────────────────

    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<String> {
        let mut query = BTreeMap::new();
        query.insert("uploads".to_string(), String::new());
        let headers = vec![("content-type".to_string(), content_type.to_string())];
        let resp = self
            .request(Method::POST, bucket, key, &query, headers, None)
            .await?;
        let resp = check(resp, "CreateMultipartUpload").await?;
        let body = resp.text().await.map_err(|e| {
            Error::Unknown(format!("CreateMultipartUpload: failed to read body: {e}"))
        })?;
        parse_initiate_multipart_upload(&body)
    }

    /// Upload one part; returns its ETag.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let mut query = BTreeMap::new();
        query.insert("partNumber".to_string(), part_number.to_string());
        query.insert("uploadId".to_string(), upload_id.to_string());
        let resp = self
            .request(Method::PUT, bucket, key, &query, Vec::new(), Some(body))
            .await?;
        let resp = check(resp, "UploadPart").await?;
        header_value(&resp, "etag")
            .ok_or_else(|| Error::Unknown("UploadPart: response carried no ETag".to_string()))
    }

    /// Server-side copy of a source byte range into one part; returns its ETag.
    pub async fn upload_part_copy(
        &self,
        copy_source: &str,
        copy_source_range: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String> {
        let mut query = BTreeMap::new();
        query.insert("partNumber".to_string(), part_number.to_string());
        query.insert("uploadId".to_string(), upload_id.to_string());
        let headers = vec![
            ("x-amz-copy-source".to_string(), copy_source.to_string()),
            (
                "x-amz-copy-source-range".to_string(),
                copy_source_range.to_string(),
            ),
        ];
        let resp = self
            .request(Method::PUT, bucket, key, &query, headers, None)
            .await?;
        let resp = check(resp, "UploadPartCopy").await?;
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Unknown(format!("UploadPartCopy: failed to read body: {e}")))?;
        if let Some(err) = parse_error_response(&body) {
            return Err(Error::Unknown(format!(
                "UploadPartCopy: {}: {}",
                err.code, err.message
            )));
        }
        parse_copy_etag(&body)
    }

    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), upload_id.to_string());
        let body = Bytes::from(xml::completed_multipart_upload_xml(parts));
        let resp = self
            .request(Method::POST, bucket, key, &query, Vec::new(), Some(body))
            .await?;
        let resp = check(resp, "CompleteMultipartUpload").await?;
        // S3 may return 200 with an error document when assembly fails.
        let body = resp.text().await.unwrap_or_default();
        if let Some(err) = parse_error_response(&body) {
            return Err(Error::Unknown(format!(
                "CompleteMultipartUpload: {}: {}",
                err.code, err.message
            )));
        }
        Ok(())
    }

    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), upload_id.to_string());
        let resp = self
            .request(Method::DELETE, bucket, key, &query, Vec::new(), None)
            .await?;
        check(resp, "AbortMultipartUpload").await?;
        Ok(())
    }

    // ── Request assembly and signing ─────────────────────────────────────────

    async fn request(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &BTreeMap<String, String>,
        extra_headers: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let base = self.config.base_url();
        let host = url_host(&base);
        let canonical_uri = canonical_uri(bucket, key);
        let canonical_query = canonical_query_string(query);
        let payload_hash = if body.is_some() {
            UNSIGNED_PAYLOAD
        } else {
            EMPTY_SHA256
        };

        // Every header in this map is both signed and sent.
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        if let Some(creds) = &self.config.credentials {
            if let Some(token) = &creds.session_token {
                headers.insert("x-amz-security-token".to_string(), token.clone());
            }
        }
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value);
        }

        let url = if canonical_query.is_empty() {
            format!("{base}{canonical_uri}")
        } else {
            format!("{base}{canonical_uri}?{canonical_query}")
        };
        debug!(method = %method, url = %url, "S3 request");

        let mut req = self.client.request(method.clone(), &url);
        for (name, value) in &headers {
            // reqwest derives Host from the URL.
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if let Some(creds) = &self.config.credentials {
            let auth = sign_request(
                &creds.access_key_id,
                &creds.secret_access_key,
                &self.config.region,
                method.as_str(),
                &canonical_uri,
                &canonical_query,
                &headers,
                payload_hash,
                &date_time,
                &date,
            );
            req = req.header("authorization", auth);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        req.send().await.map_err(map_transport_error)
    }
}

/// Map reqwest transport failures onto status kinds. HTTP-level errors are
/// handled by [`check`] instead.
fn map_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::DeadlineExceeded(format!("request timed out: {err}"))
    } else if err.is_connect() {
        Error::Unavailable(format!("connection failed: {err}"))
    } else {
        Error::Unknown(format!("transport error: {err}"))
    }
}

/// Turn a non-2xx response into an error, preserving the S3 error code and
/// message when the body carries them.
async fn check(resp: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = match parse_error_response(&body) {
        Some(err) => format!("{}: {}", err.code, err.message),
        None => format!("HTTP {}", status.as_u16()),
    };
    Err(match status.as_u16() {
        404 => Error::NotFound(format!("{operation}: {detail}")),
        416 => Error::OutOfRange(format!("{operation}: {detail}")),
        502 | 503 | 504 => Error::Unavailable(format!("{operation}: {detail}")),
        408 => Error::DeadlineExceeded(format!("{operation}: {detail}")),
        _ => Error::Unknown(format!("{operation}: {detail}")),
    })
}

fn header_value(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Path-style canonical URI: `/bucket/key`, each key segment
/// percent-encoded, slashes preserved.
fn canonical_uri(bucket: &str, key: &str) -> String {
    if key.is_empty() {
        return format!("/{bucket}");
    }
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/{bucket}/{}", encoded.join("/"))
}

/// Canonical query string: keys sorted (the map is ordered), both halves
/// percent-encoded, `=` kept for empty values.
fn canonical_query_string(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Extract the host part of a URL for use in signing.
fn url_host(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Compute the AWS Signature V4 `Authorization` header value.
#[allow(clippy::too_many_arguments)]
fn sign_request(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    date_time: &str,
    date: &str,
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let credential_scope = format!("{}/{}/s3/aws4_request", date, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time, credential_scope, cr_hash
    );

    let signing_key = derive_signing_key(secret_access_key, date, region);
    let mut mac = HmacSha256::new_from_slice(&signing_key).expect("HMAC key length ok");
    mac.update(string_to_sign.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        access_key_id, credential_scope, signed_headers, signature
    )
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn load_trust_anchors(config: &ClientConfig) -> Result<Vec<reqwest::Certificate>> {
    let mut certs = Vec::new();
    let mut load_file = |path: &std::path::Path| -> Result<()> {
        let pem = std::fs::read(path).map_err(|e| {
            Error::Internal(format!("failed to read CA file {}: {e}", path.display()))
        })?;
        let parsed = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
            Error::Internal(format!("failed to parse CA file {}: {e}", path.display()))
        })?;
        certs.extend(parsed);
        Ok(())
    };
    if let Some(path) = &config.ca_file {
        load_file(path)?;
    }
    if let Some(dir) = &config.ca_path {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Internal(format!("failed to read CA path {}: {e}", dir.display()))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "pem" || ext == "crt") {
                load_file(&path)?;
            }
        }
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_uri_encodes_segments() {
        assert_eq!(canonical_uri("bucket", ""), "/bucket");
        assert_eq!(canonical_uri("bucket", "a/b/c"), "/bucket/a/b/c");
        assert_eq!(
            canonical_uri("bucket", "dir with space/file~1.txt"),
            "/bucket/dir%20with%20space/file~1.txt"
        );
        // Directory markers keep their trailing slash.
        assert_eq!(canonical_uri("b", "dir/"), "/b/dir/");
    }

    #[test]
    fn test_canonical_query_string() {
        let mut query = BTreeMap::new();
        query.insert("uploads".to_string(), String::new());
        assert_eq!(canonical_query_string(&query), "uploads=");

        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), "id 1".to_string());
        query.insert("partNumber".to_string(), "3".to_string());
        assert_eq!(
            canonical_query_string(&query),
            "partNumber=3&uploadId=id%201"
        );
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://s3.us-east-1.amazonaws.com"),
            "s3.us-east-1.amazonaws.com"
        );
        assert_eq!(url_host("http://localhost:9000"), "localhost:9000");
        assert_eq!(url_host("https://minio.example.com/extra"), "minio.example.com");
    }

    #[test]
    fn test_sign_request_shape() {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "s3.us-east-1.amazonaws.com".to_string());
        headers.insert(
            "x-amz-content-sha256".to_string(),
            UNSIGNED_PAYLOAD.to_string(),
        );
        headers.insert("x-amz-date".to_string(), "20260101T000000Z".to_string());
        let auth = sign_request(
            "AKIDEXAMPLE",
            "secret",
            "us-east-1",
            "PUT",
            "/bucket/key",
            "",
            &headers,
            UNSIGNED_PAYLOAD,
            "20260101T000000Z",
            "20260101",
        );
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260101/us-east-1/s3/aws4_request,"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date,"));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let a = derive_signing_key("secret", "20260101", "us-east-1");
        let b = derive_signing_key("secret", "20260101", "us-east-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let c = derive_signing_key("secret", "20260102", "us-east-1");
        assert_ne!(a, c);
    }
}
