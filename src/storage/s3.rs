//! S3-compatible object storage signed with AWS Signature Version 4

use super::http::{
    self, check_response, file_body, file_part_body, plan_parts, percent_encode, xml_escape, xml_values, Part,
};
use super::{parse_object_uri, prefixed_key, validate_key, StorageBackend, StorageError};
use crate::config::{S3Config, StorageProvider};
use crate::utils::cancel::CancelToken;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const PROVIDER: StorageProvider = StorageProvider::S3;
const SCHEME: &str = "s3";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const MAX_PARTS: u32 = 10_000;
const MIB: u64 = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Credentials and scope for request signing
#[derive(Clone)]
pub struct SigV4Signer {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl SigV4Signer {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            region: region.into(),
        }
    }

    /// `Authorization` header value for a request.
    ///
    /// `headers` must include `host`, `x-amz-date` and `x-amz-content-sha256`;
    /// every header passed is signed. `query` holds decoded pairs.
    pub fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = timestamp.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);

        let mut sorted_query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (percent_encode(k, false), percent_encode(v, false)))
            .collect();
        sorted_query.sort();
        let canonical_query = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
            .collect();
        let signed_headers = headers
            .keys()
            .map(|k| k.to_lowercase())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut signing_key = format!("AWS4{}", self.secret_access_key).into_bytes();
        for part in [date.as_str(), self.region.as_str(), SERVICE, "aws4_request"] {
            signing_key = hmac_sha256(&signing_key, part.as_bytes())?;
        }
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key_id, scope, signed_headers, signature
        ))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| StorageError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Body of a CompleteMultipartUpload request
fn complete_upload_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number,
            xml_escape(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// A 200 response to CompleteMultipartUpload can still carry an error
fn completion_error(body: &str) -> Option<String> {
    if !body.contains("<Error>") {
        return None;
    }
    let code = xml_values(body, "Code").into_iter().next().unwrap_or_default();
    let message = xml_values(body, "Message").into_iter().next().unwrap_or_default();
    Some(format!("{}: {}", code, message))
}

/// S3 or an S3-compatible service (MinIO, Ceph RGW, ...)
pub struct S3Backend {
    config: S3Config,
    endpoint: Url,
    signer: SigV4Signer,
    client: Client,
    timeout: Duration,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let endpoint_str = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let endpoint = Url::parse(&endpoint_str)
            .map_err(|_| StorageError::InvalidUri(endpoint_str.clone()))?;
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let signer = SigV4Signer::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
            config.region.clone(),
        );

        Ok(Self {
            client: http::build_client(PROVIDER, timeout)?,
            endpoint,
            signer,
            timeout,
            config,
        })
    }

    /// URL and canonical path of an object (or of the bucket when `key` is empty)
    fn object_url(&self, key: &str) -> Result<(Url, String), StorageError> {
        let encoded_key = percent_encode(key, true);
        let mut url = self.endpoint.clone();

        let path = if self.config.path_style {
            format!("/{}/{}", self.config.bucket, encoded_key)
        } else {
            let host = self
                .endpoint
                .host_str()
                .ok_or_else(|| StorageError::InvalidUri(self.endpoint.to_string()))?;
            url.set_host(Some(&format!("{}.{}", self.config.bucket, host)))
                .map_err(|_| StorageError::InvalidUri(self.endpoint.to_string()))?;
            format!("/{}", encoded_key)
        };

        url.set_path(&path);
        Ok((url, path))
    }

    fn host_header(url: &Url) -> String {
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("{}://{}/{}", SCHEME, self.config.bucket, key)
    }

    fn key_from_uri<'a>(&self, uri: &'a str) -> Result<&'a str, StorageError> {
        let (bucket, key) = parse_object_uri(uri, SCHEME)?;
        if bucket != self.config.bucket {
            return Err(StorageError::InvalidUri(uri.to_string()));
        }
        Ok(key)
    }

    fn put_single(&self, object_key: &str, uri: &str, local_path: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let (body, _) = file_body(local_path, cancel)?;
        let request = self
            .request(
                Method::PUT,
                object_key,
                &[],
                &[("if-none-match", "*".to_string())],
                UNSIGNED_PAYLOAD,
            )?
            .body(body);

        let response = http::send(PROVIDER, request, self.timeout, cancel)?;
        if matches!(response.status().as_u16(), 409 | 412) {
            return Err(StorageError::Conflict(uri.to_string()));
        }
        check_response(PROVIDER, response, uri)?;
        Ok(())
    }

    /// Upload in parts. The object only becomes visible when the upload is
    /// completed; on any failure the upload is aborted.
    fn put_multipart(
        &self,
        object_key: &str,
        uri: &str,
        local_path: &Path,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<(), StorageError> {
        let parts = plan_parts(len, self.config.part_size_mib * MIB, MAX_PARTS);
        let upload_id = self.create_multipart_upload(object_key, uri, cancel)?;
        debug!("Started multipart upload {} for {} ({} parts)", upload_id, uri, parts.len());

        let result = parts
            .iter()
            .map(|part| self.upload_part(object_key, uri, &upload_id, local_path, *part, cancel))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|etags| self.complete_multipart_upload(object_key, uri, &upload_id, &etags, cancel));

        if result.is_err() {
            // A cancelled run still aborts, on a token of its own
            if let Err(e) = self.abort_multipart_upload(object_key, uri, &upload_id, &CancelToken::new()) {
                warn!("Failed to abort multipart upload {} for {}: {}", upload_id, uri, e);
            }
        }
        result
    }

    fn create_multipart_upload(&self, object_key: &str, uri: &str, cancel: &CancelToken) -> Result<String, StorageError> {
        let query = [("uploads".to_string(), String::new())];
        let request = self.request(Method::POST, object_key, &query, &[], EMPTY_SHA256)?;
        let response = check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        let body = response
            .text()
            .map_err(|e| http::transport_error(PROVIDER, e, cancel))?;

        xml_values(&body, "UploadId")
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StorageError::Unavailable {
                provider: PROVIDER,
                message: format!("no UploadId in response for {}", uri),
            })
    }

    fn upload_part(
        &self,
        object_key: &str,
        uri: &str,
        upload_id: &str,
        local_path: &Path,
        part: Part,
        cancel: &CancelToken,
    ) -> Result<(u32, String), StorageError> {
        let query = [
            ("partNumber".to_string(), part.number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        let request = self
            .request(Method::PUT, object_key, &query, &[], UNSIGNED_PAYLOAD)?
            .body(file_part_body(local_path, part, cancel)?);
        let response = check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| StorageError::Unavailable {
                provider: PROVIDER,
                message: format!("no ETag for part {} of {}", part.number, uri),
            })?;
        Ok((part.number, etag.to_string()))
    }

    fn complete_multipart_upload(
        &self,
        object_key: &str,
        uri: &str,
        upload_id: &str,
        parts: &[(u32, String)],
        cancel: &CancelToken,
    ) -> Result<(), StorageError> {
        let body = complete_upload_body(parts);
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));
        let query = [("uploadId".to_string(), upload_id.to_string())];
        let request = self
            .request(
                Method::POST,
                object_key,
                &query,
                &[("if-none-match", "*".to_string())],
                &payload_hash,
            )?
            .body(body);

        let response = http::send(PROVIDER, request, self.timeout, cancel)?;
        if matches!(response.status().as_u16(), 409 | 412) {
            return Err(StorageError::Conflict(uri.to_string()));
        }
        let text = check_response(PROVIDER, response, uri)?
            .text()
            .map_err(|e| http::transport_error(PROVIDER, e, cancel))?;
        match completion_error(&text) {
            Some(message) => Err(StorageError::Unavailable {
                provider: PROVIDER,
                message,
            }),
            None => Ok(()),
        }
    }

    fn abort_multipart_upload(
        &self,
        object_key: &str,
        uri: &str,
        upload_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), StorageError> {
        let query = [("uploadId".to_string(), upload_id.to_string())];
        let request = self.request(Method::DELETE, object_key, &query, &[], EMPTY_SHA256)?;
        check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        Ok(())
    }

    /// Build a signed request
    fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        extra_headers: &[(&str, String)],
        payload_hash: &str,
    ) -> Result<reqwest::blocking::RequestBuilder, StorageError> {
        let (mut url, canonical_path) = self.object_url(key)?;
        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encode(k, false), percent_encode(v, false)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&encoded));
        }

        let now = Utc::now();
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), Self::host_header(&url));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        if let Some(token) = &self.signer.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        for (name, value) in extra_headers {
            headers.insert(name.to_lowercase(), value.clone());
        }

        let authorization = self.signer.authorization(
            method.as_str(),
            &canonical_path,
            query,
            &headers,
            payload_hash,
            now,
        )?;

        let mut builder = self.client.request(method, url);
        for (name, value) in headers.iter().filter(|(k, _)| k.as_str() != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.header("authorization", authorization))
    }
}

impl StorageBackend for S3Backend {
    fn provider(&self) -> StorageProvider {
        PROVIDER
    }

    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError> {
        validate_key(key)?;
        let object_key = prefixed_key(&self.config.prefix, key);
        let uri = self.uri(&object_key);
        let len = http::file_len(local_path)?;

        if len > self.config.multipart_threshold_mib * MIB {
            self.put_multipart(&object_key, &uri, local_path, len, cancel)?;
        } else {
            self.put_single(&object_key, &uri, local_path, cancel)?;
        }

        info!("Uploaded {} bytes to {}", len, uri);
        Ok(uri)
    }

    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = self.request(Method::GET, key, &[], &[], EMPTY_SHA256)?;
        let response = check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        http::download(response, dest, cancel)?;
        Ok(())
    }

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = self.request(Method::DELETE, key, &[], &[], EMPTY_SHA256)?;
        check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        Ok(())
    }

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = self.request(Method::HEAD, key, &[], &[], EMPTY_SHA256)?;
        match check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError> {
        let full_prefix = prefixed_key(&self.config.prefix, prefix);
        let mut uris = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), full_prefix.clone()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let request = self.request(Method::GET, "", &query, &[], EMPTY_SHA256)?;
            let bucket_uri = format!("{}://{}", SCHEME, self.config.bucket);
            let response = check_response(
                PROVIDER,
                http::send(PROVIDER, request, self.timeout, cancel)?,
                &bucket_uri,
            )?;
            let body = response
                .text()
                .map_err(|e| http::transport_error(PROVIDER, e, cancel))?;

            uris.extend(xml_values(&body, "Key").iter().map(|k| self.uri(k)));

            let truncated = xml_values(&body, "IsTruncated").first().map(String::as_str) == Some("true");
            continuation = xml_values(&body, "NextContinuationToken").into_iter().next();
            if !truncated || continuation.is_none() {
                break;
            }
        }

        uris.sort();
        Ok(uris)
    }
}
