//! S3 RestXml wire documents.
//!
//! Parses the response bodies the adapter consumes (`ListBucketResult`,
//! `InitiateMultipartUploadResult`, `CopyPartResult`, `Error`) and produces
//! the `CompleteMultipartUpload` request body.

use chrono::DateTime;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use cirrus_vfs::{Error, Result};

/// One `<Contents>` entry of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified_millis: i64,
    pub size: u64,
}

/// A `ListObjectsV2` page.
#[derive(Debug, Clone, Default)]
pub struct ListBucketResult {
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// `<Error>` body of a failed request.
#[derive(Debug, Clone)]
pub struct S3ErrorResponse {
    pub code: String,
    pub message: String,
}

/// A finished part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

fn malformed(what: &str, err: impl std::fmt::Display) -> Error {
    Error::Unknown(format!("malformed {what} response: {err}"))
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

pub fn parse_list_bucket_result(xml: &str) -> Result<ListBucketResult> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut result = ListBucketResult::default();
    let mut current = ObjectSummary::default();
    let mut path: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"Contents" {
                    result.contents.push(std::mem::take(&mut current));
                }
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| malformed("listing", e))?
                    .into_owned();
                if path_ends_with(&path, &["Contents", "Key"]) {
                    current.key = text;
                } else if path_ends_with(&path, &["Contents", "LastModified"]) {
                    current.last_modified_millis = DateTime::parse_from_rfc3339(&text)
                        .map(|t| t.timestamp_millis())
                        .unwrap_or(0);
                } else if path_ends_with(&path, &["Contents", "Size"]) {
                    current.size = text.parse().unwrap_or(0);
                } else if path_ends_with(&path, &["CommonPrefixes", "Prefix"]) {
                    result.common_prefixes.push(text);
                } else if path_ends_with(&path, &["ListBucketResult", "IsTruncated"]) {
                    result.is_truncated = text == "true";
                } else if path_ends_with(&path, &["ListBucketResult", "NextContinuationToken"]) {
                    result.next_continuation_token = Some(text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed("listing", e)),
            Ok(_) => {}
        }
    }
    Ok(result)
}

/// Text content of the first `<tag>` element, searching the whole document.
fn first_tag_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => inside = e.name().as_ref() == tag.as_bytes(),
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Text(t)) if inside => return t.unescape().ok().map(|s| s.into_owned()),
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Upload id from an `InitiateMultipartUploadResult` document.
pub fn parse_initiate_multipart_upload(xml: &str) -> Result<String> {
    first_tag_text(xml, "UploadId")
        .ok_or_else(|| malformed("CreateMultipartUpload", "missing UploadId"))
}

/// ETag from a `CopyPartResult` (or `CopyObjectResult`) document.
pub fn parse_copy_etag(xml: &str) -> Result<String> {
    first_tag_text(xml, "ETag").ok_or_else(|| malformed("copy", "missing ETag"))
}

/// Parse an `<Error>` body. None when the body is empty or not an error
/// document (e.g. a HEAD response).
pub fn parse_error_response(xml: &str) -> Option<S3ErrorResponse> {
    let code = first_tag_text(xml, "Code")?;
    Some(S3ErrorResponse {
        code,
        message: first_tag_text(xml, "Message").unwrap_or_default(),
    })
}

/// `CompleteMultipartUpload` request body. Parts must be listed in
/// ascending part-number order.
pub fn completed_multipart_upload_xml(parts: &[CompletedPart]) -> String {
    let mut parts: Vec<&CompletedPart> = parts.iter().collect();
    parts.sort_by_key(|p| p.part_number);

    let mut writer = Writer::new(Vec::new());
    let root = "CompleteMultipartUpload";
    let _ = writer.write_event(Event::Start(BytesStart::new(root)));
    for part in parts {
        let _ = writer.write_event(Event::Start(BytesStart::new("Part")));
        let _ = writer.write_event(Event::Start(BytesStart::new("PartNumber")));
        let _ = writer.write_event(Event::Text(BytesText::new(&part.part_number.to_string())));
        let _ = writer.write_event(Event::End(BytesEnd::new("PartNumber")));
        let _ = writer.write_event(Event::Start(BytesStart::new("ETag")));
        let _ = writer.write_event(Event::Text(BytesText::new(&part.etag)));
        let _ = writer.write_event(Event::End(BytesEnd::new("ETag")));
        let _ = writer.write_event(Event::End(BytesEnd::new("Part")));
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(root)));
    String::from_utf8_lossy(&writer.into_inner()).into_owned()
}
