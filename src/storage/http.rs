//! Blocking HTTP plumbing shared by the object-store backends

use super::StorageError;
use crate::config::StorageProvider;
use crate::utils::cancel::{copy_cancellable, CancelToken, CancellableReader};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::StatusCode;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Build a client with the provider's request timeout
pub fn build_client(provider: StorageProvider, timeout: Duration) -> Result<Client, StorageError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("backup-engine/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| StorageError::Unavailable {
            provider,
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// Send a request, bounded by the time left on `cancel`
pub fn send(
    provider: StorageProvider,
    request: RequestBuilder,
    default_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Response, StorageError> {
    cancel.check()?;
    let response = request
        .timeout(cancel.clamp(default_timeout))
        .send()
        .map_err(|e| transport_error(provider, e, cancel))?;
    debug!("{} responded {}", provider, response.status());
    Ok(response)
}

/// A transport failure, or the cancellation that caused it
pub fn transport_error(provider: StorageProvider, err: reqwest::Error, cancel: &CancelToken) -> StorageError {
    if let Err(reason) = cancel.check() {
        return StorageError::Cancelled(reason);
    }
    StorageError::Unavailable {
        provider,
        message: err.to_string(),
    }
}

/// Classify a non-success response.
///
/// Throttling, timeouts and server errors are transient. 404 means the
/// artifact is missing. Any other client error is a permanent rejection.
pub fn classify_status(provider: StorageProvider, status: StatusCode, body: &str, uri: &str) -> StorageError {
    let message = truncate(body.trim());
    match status.as_u16() {
        404 => StorageError::NotFound(uri.to_string()),
        408 | 429 => StorageError::Unavailable {
            provider,
            message: format!("{}: {}", status, message),
        },
        code if status.is_server_error() => StorageError::Unavailable {
            provider,
            message: format!("{} ({}): {}", status, code, message),
        },
        code => StorageError::Rejected {
            provider,
            status: code,
            message,
        },
    }
}

/// Turn a response into an error unless it succeeded
pub fn check_response(provider: StorageProvider, response: Response, uri: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(classify_status(provider, status, &body, uri))
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Request body streaming a file, failing once `cancel` fires
pub fn file_body(path: &Path, cancel: &CancelToken) -> Result<(Body, u64), StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| StorageError::io(path, e))?
        .len();
    Ok((Body::sized(CancellableReader::new(file, cancel.clone()), len), len))
}

/// Size of a local artifact
pub fn file_len(path: &Path) -> Result<u64, StorageError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|e| StorageError::io(path, e))
}

/// One slice of a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based, as the providers number them
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Split `total` bytes into parts of `part_size`, growing the part size when
/// `max_parts` would otherwise be exceeded
pub fn plan_parts(total: u64, part_size: u64, max_parts: u32) -> Vec<Part> {
    let part_size = part_size.max(1).max(total.div_ceil(u64::from(max_parts.max(1))));
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < total {
        let len = part_size.min(total - offset);
        parts.push(Part {
            number: parts.len() as u32 + 1,
            offset,
            len,
        });
        offset += len;
    }
    parts
}

/// Reader over exactly the bytes of `part`
pub fn open_part(path: &Path, part: Part) -> Result<Take<File>, StorageError> {
    let mut file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    file.seek(SeekFrom::Start(part.offset))
        .map_err(|e| StorageError::io(path, e))?;
    Ok(file.take(part.len))
}

/// Request body streaming one part of a file, failing once `cancel` fires
pub fn file_part_body(path: &Path, part: Part, cancel: &CancelToken) -> Result<Body, StorageError> {
    let reader = open_part(path, part)?;
    Ok(Body::sized(CancellableReader::new(reader, cancel.clone()), part.len))
}

/// Escape text for an XML element body
pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Stream a response body into `dest` through a `.partial` sibling
pub fn download(response: Response, dest: &Path, cancel: &CancelToken) -> Result<u64, StorageError> {
    let partial = partial_path(dest);

    let result = (|| {
        let mut response = response;
        let file = File::create(&partial).map_err(|e| StorageError::io(&partial, e))?;
        let mut writer = BufWriter::new(file);
        let copied = copy_cancellable(&mut response, &mut writer, cancel)
            .map_err(|e| StorageError::stream(&partial, e))?;
        writer.flush().map_err(|e| StorageError::io(&partial, e))?;
        drop(writer);
        fs::rename(&partial, dest).map_err(|e| StorageError::io(dest, e))?;
        Ok(copied)
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(&partial) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial download {:?}: {}", partial, e);
            }
        }
    }
    result
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Everything except RFC 3986 unreserved characters
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// As `UNRESERVED`, but keeps `/` for object paths
const OBJECT_PATH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Percent-encode per RFC 3986, leaving unreserved characters alone.
/// `/` is kept when `keep_slash` is set, for object paths.
pub fn percent_encode(input: &str, keep_slash: bool) -> String {
    let set = if keep_slash { OBJECT_PATH } else { UNRESERVED };
    utf8_percent_encode(input, set).to_string()
}

/// Text content of every `<tag>...</tag>` element, in document order
pub fn xml_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }

    values
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
