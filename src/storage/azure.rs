//! Azure Blob Storage through the REST API with a SAS token

use super::http::{
    self, check_response, file_body, file_part_body, plan_parts, percent_encode, xml_escape, xml_values, Part,
};
use super::{parse_object_uri, prefixed_key, validate_key, StorageBackend, StorageError};
use crate::config::{AzureConfig, StorageProvider};
use crate::utils::cancel::CancelToken;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::{Client, RequestBuilder};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const PROVIDER: StorageProvider = StorageProvider::Azure;
const SCHEME: &str = "azblob";
const API_VERSION: &str = "2021-08-06";
const MAX_BLOCKS: u32 = 50_000;
const MIB: u64 = 1024 * 1024;

/// Block ids must all have the same length within a blob
fn block_id(part: &Part) -> String {
    STANDARD.encode(format!("block-{:06}", part.number))
}

fn block_list_body(block_ids: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        body.push_str(&format!("<Latest>{}</Latest>", xml_escape(id)));
    }
    body.push_str("</BlockList>");
    body
}

pub struct AzureBackend {
    config: AzureConfig,
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl AzureBackend {
    pub fn new(config: AzureConfig) -> Result<Self, StorageError> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: http::build_client(PROVIDER, timeout)?,
            base_url,
            timeout,
            config,
        })
    }

    fn sas(&self) -> &str {
        self.config.sas_token.trim_start_matches('?')
    }

    fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}?{}",
            self.base_url,
            self.config.container,
            percent_encode(key, true),
            self.sas()
        )
    }

    /// Blob URL with an operation query ahead of the SAS
    fn blob_op_url(&self, key: &str, operation: &str) -> String {
        format!(
            "{}/{}/{}?{}&{}",
            self.base_url,
            self.config.container,
            percent_encode(key, true),
            operation,
            self.sas()
        )
    }

    fn list_url(&self, prefix: &str, marker: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}?restype=container&comp=list&prefix={}",
            self.base_url,
            self.config.container,
            percent_encode(prefix, false)
        );
        if let Some(marker) = marker {
            url.push_str("&marker=");
            url.push_str(&percent_encode(marker, false));
        }
        url.push('&');
        url.push_str(self.sas());
        url
    }

    fn uri(&self, key: &str) -> String {
        format!("{}://{}/{}", SCHEME, self.config.container, key)
    }

    fn key_from_uri<'a>(&self, uri: &'a str) -> Result<&'a str, StorageError> {
        let (container, key) = parse_object_uri(uri, SCHEME)?;
        if container != self.config.container {
            return Err(StorageError::InvalidUri(uri.to_string()));
        }
        Ok(key)
    }

    fn versioned(builder: RequestBuilder) -> RequestBuilder {
        builder.header("x-ms-version", API_VERSION)
    }

    fn put_single(&self, object_key: &str, uri: &str, local_path: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let (body, _) = file_body(local_path, cancel)?;
        let request = Self::versioned(self.client.put(self.blob_url(object_key)))
            .header("x-ms-blob-type", "BlockBlob")
            .header("if-none-match", "*")
            .header("content-type", "application/octet-stream")
            .body(body);
        self.send_create(request, uri, cancel)
    }

    /// Stage every block, then commit them in one Put Block List. Staged
    /// blocks stay invisible until the commit; uncommitted ones are
    /// garbage-collected by the service.
    fn put_blocks(
        &self,
        object_key: &str,
        uri: &str,
        local_path: &Path,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<(), StorageError> {
        let parts = plan_parts(len, self.config.part_size_mib * MIB, MAX_BLOCKS);
        debug!("Staging {} blocks for {}", parts.len(), uri);

        let mut block_ids = Vec::with_capacity(parts.len());
        for part in &parts {
            let id = block_id(part);
            let operation = format!("comp=block&blockid={}", percent_encode(&id, false));
            let request = Self::versioned(self.client.put(self.blob_op_url(object_key, &operation)))
                .body(file_part_body(local_path, *part, cancel)?);
            check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
            block_ids.push(id);
        }

        let request = Self::versioned(self.client.put(self.blob_op_url(object_key, "comp=blocklist")))
            .header("if-none-match", "*")
            .header("x-ms-blob-content-type", "application/octet-stream")
            .header("content-type", "application/xml")
            .body(block_list_body(&block_ids));
        self.send_create(request, uri, cancel)
    }

    /// Send a request that creates the blob, refusing to overwrite
    fn send_create(&self, request: RequestBuilder, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        let response = http::send(PROVIDER, request, self.timeout, cancel)?;
        if matches!(response.status().as_u16(), 409 | 412) {
            return Err(StorageError::Conflict(uri.to_string()));
        }
        check_response(PROVIDER, response, uri)?;
        Ok(())
    }
}

impl StorageBackend for AzureBackend {
    fn provider(&self) -> StorageProvider {
        PROVIDER
    }

    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError> {
        validate_key(key)?;
        let object_key = prefixed_key(&self.config.prefix, key);
        let uri = self.uri(&object_key);
        let len = http::file_len(local_path)?;

        if len > self.config.multipart_threshold_mib * MIB {
            self.put_blocks(&object_key, &uri, local_path, len, cancel)?;
        } else {
            self.put_single(&object_key, &uri, local_path, cancel)?;
        }

        info!("Uploaded {} bytes to {}", len, uri);
        Ok(uri)
    }

    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = Self::versioned(self.client.get(self.blob_url(key)));
        let response = check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        http::download(response, dest, cancel)?;
        Ok(())
    }

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = Self::versioned(self.client.delete(self.blob_url(key)));
        check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        Ok(())
    }

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = Self::versioned(self.client.head(self.blob_url(key)));
        match check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError> {
        let full_prefix = prefixed_key(&self.config.prefix, prefix);
        let container_uri = format!("{}://{}", SCHEME, self.config.container);
        let mut uris = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let request = Self::versioned(self.client.get(self.list_url(&full_prefix, marker.as_deref())));
            let response = check_response(
                PROVIDER,
                http::send(PROVIDER, request, self.timeout, cancel)?,
                &container_uri,
            )?;
            let body = response
                .text()
                .map_err(|e| http::transport_error(PROVIDER, e, cancel))?;

            // Blob names appear as <Name> inside each <Blob> element
            uris.extend(xml_values(&body, "Name").iter().map(|name| self.uri(name)));

            marker = xml_values(&body, "NextMarker")
                .into_iter()
                .next()
                .filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }

        uris.sort();
        Ok(uris)
    }
}
