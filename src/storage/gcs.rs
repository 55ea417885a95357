//! Google Cloud Storage through the JSON API with an OAuth2 bearer token

use super::http::{self, check_response, file_body, percent_encode};
use super::{parse_object_uri, prefixed_key, validate_key, StorageBackend, StorageError};
use crate::config::{GcsConfig, StorageProvider};
use crate::utils::cancel::CancelToken;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const PROVIDER: StorageProvider = StorageProvider::Gcs;
const SCHEME: &str = "gs";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

pub struct GcsBackend {
    config: GcsConfig,
    client: Client,
    timeout: Duration,
}

impl GcsBackend {
    pub fn new(config: GcsConfig) -> Result<Self, StorageError> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        Ok(Self {
            client: http::build_client(PROVIDER, timeout)?,
            timeout,
            config,
        })
    }

    /// Current access token; a token file is re-read on every request so an
    /// external refresher can rotate it
    fn token(&self) -> Result<String, StorageError> {
        if let Some(token) = &self.config.token {
            return Ok(token.clone());
        }
        match &self.config.token_file {
            Some(path) => fs::read_to_string(path)
                .map(|t| t.trim().to_string())
                .map_err(|e| StorageError::io(path, e)),
            None => Err(StorageError::Rejected {
                provider: PROVIDER,
                status: 401,
                message: "no access token configured".to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint(),
            percent_encode(&self.config.bucket, false),
            percent_encode(key, false)
        )
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}&ifGenerationMatch=0",
            self.endpoint(),
            percent_encode(&self.config.bucket, false),
            percent_encode(key, false)
        )
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

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, StorageError> {
        Ok(builder.bearer_auth(self.token()?))
    }
}

impl StorageBackend for GcsBackend {
    fn provider(&self) -> StorageProvider {
        PROVIDER
    }

    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError> {
        validate_key(key)?;
        let object_key = prefixed_key(&self.config.prefix, key);
        let uri = self.uri(&object_key);
        let (body, len) = file_body(local_path, cancel)?;

        let request = self
            .authorized(self.client.post(self.upload_url(&object_key)))?
            .header("content-type", "application/octet-stream")
            .body(body);

        // ifGenerationMatch=0 makes the upload fail if the object exists
        let response = http::send(PROVIDER, request, self.timeout, cancel)?;
        if response.status().as_u16() == 412 {
            return Err(StorageError::Conflict(uri));
        }
        check_response(PROVIDER, response, &uri)?;

        info!("Uploaded {} bytes to {}", len, uri);
        Ok(uri)
    }

    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let url = format!("{}?alt=media", self.object_url(key));
        let request = self.authorized(self.client.get(url))?;
        let response = check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        http::download(response, dest, cancel)?;
        Ok(())
    }

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = self.authorized(self.client.delete(self.object_url(key)))?;
        check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri)?;
        Ok(())
    }

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError> {
        let key = self.key_from_uri(uri)?;
        let request = self.authorized(self.client.get(self.object_url(key)))?;
        match check_response(PROVIDER, http::send(PROVIDER, request, self.timeout, cancel)?, uri) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError> {
        let full_prefix = prefixed_key(&self.config.prefix, prefix);
        let list_url = format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint(),
            percent_encode(&self.config.bucket, false)
        );
        let bucket_uri = format!("{}://{}", SCHEME, self.config.bucket);

        let mut uris = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", full_prefix.clone()), ("fields", "items(name),nextPageToken".to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let request = self.authorized(self.client.get(&list_url).query(&query))?;
            let response = check_response(
                PROVIDER,
                http::send(PROVIDER, request, self.timeout, cancel)?,
                &bucket_uri,
            )?;
            let page: ObjectList = response.json().map_err(|e| StorageError::Unavailable {
                provider: PROVIDER,
                message: format!("invalid list response: {}", e),
            })?;

            uris.extend(page.items.iter().map(|item| self.uri(&item.name)));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        uris.sort();
        Ok(uris)
    }
}
