// API client module: the storage capability surface used by the migration
// loop, plus a small blocking HTTP client that talks to the Drive v3 REST
// API. Everything here is synchronous; one request is in flight at a time.

use reqwest::blocking::{Body, Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::File;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_URL: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, quotaBytesUsed, parents)";

/// Errors raised by the storage service or the transport underneath it.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} failed: {status} - {body}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("unexpected {operation} response: {reason}")]
    Protocol {
        operation: &'static str,
        reason: String,
    },
}

/// A file as listed by the storage service. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(
        rename = "quotaBytesUsed",
        default,
        deserialize_with = "deserialize_size"
    )]
    pub size_in_use: u64,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Metadata for a file about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewFile {
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub parents: Vec<String>,
}

/// The four calls the migration loop needs from a file-storage service.
pub trait Storage {
    /// List files matching a service-side `query`, fetching at most
    /// `page_size` records per request.
    fn list(&self, query: &str, page_size: u32) -> Result<Vec<RemoteFile>, ApiError>;

    /// Download the full content of a file.
    fn get_content(&self, id: &str) -> Result<Vec<u8>, ApiError>;

    fn delete(&self, id: &str) -> Result<(), ApiError>;

    /// Create a file from `len` bytes read out of `content`. Returns the new id.
    fn create(&self, metadata: &NewFile, content: File, len: u64) -> Result<String, ApiError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

/// Drive reports `quotaBytesUsed` as an int64 encoded in a JSON string.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Blocking Drive client holding the access token for authenticated calls.
#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    api_url: String,
    upload_url: String,
    token: String,
}

impl DriveClient {
    /// Build a client for the public Drive endpoints. `timeout` of `None`
    /// leaves requests unbounded.
    pub fn new(token: &str, timeout: Option<Duration>) -> Result<Self, ApiError> {
        Self::with_urls(token, timeout, DEFAULT_API_URL, DEFAULT_UPLOAD_URL)
    }

    /// Build a client against explicit metadata and upload base URLs.
    pub fn with_urls(
        token: &str,
        timeout: Option<Duration>,
        api_url: &str,
        upload_url: &str,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ApiError::Transport {
                operation: "client setup",
                source,
            })?;
        Ok(DriveClient {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            upload_url: upload_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn list_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, ApiError> {
        let url = format!("{}/files", self.api_url);
        let page_size = page_size.to_string();
        let mut params = vec![
            ("q", query),
            ("pageSize", page_size.as_str()),
            ("fields", LIST_FIELDS),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .map_err(|source| ApiError::Transport {
                operation: "list",
                source,
            })?;
        let res = check_status("list", res)?;
        res.json().map_err(|e| ApiError::Protocol {
            operation: "list",
            reason: e.to_string(),
        })
    }

    /// Open a resumable upload session and return its session URI.
    fn start_upload(&self, metadata: &NewFile, len: u64) -> Result<String, ApiError> {
        let url = format!("{}/files?uploadType=resumable&fields=id", self.upload_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("X-Upload-Content-Type", &metadata.mime_type)
            .header("X-Upload-Content-Length", len)
            .json(metadata)
            .send()
            .map_err(|source| ApiError::Transport {
                operation: "create",
                source,
            })?;
        let res = check_status("create", res)?;
        let location = res
            .headers()
            .get(LOCATION)
            .ok_or_else(|| ApiError::Protocol {
                operation: "create",
                reason: "missing upload session location".into(),
            })?;
        location
            .to_str()
            .map(str::to_string)
            .map_err(|e| ApiError::Protocol {
                operation: "create",
                reason: format!("invalid upload session location: {e}"),
            })
    }
}

impl Storage for DriveClient {
    fn list(&self, query: &str, page_size: u32) -> Result<Vec<RemoteFile>, ApiError> {
        let mut files = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let page = self.list_page(query, page_size, next.as_deref())?;
            log::debug!("Listed {} file(s)", page.files.len());
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => next = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    fn get_content(&self, id: &str) -> Result<Vec<u8>, ApiError> {
        let url = format!("{}/files/{}", self.api_url, id);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .map_err(|source| ApiError::Transport {
                operation: "download",
                source,
            })?;
        let res = check_status("download", res)?;
        let bytes = res.bytes().map_err(|source| ApiError::Transport {
            operation: "download",
            source,
        })?;
        Ok(bytes.to_vec())
    }

    fn delete(&self, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/files/{}", self.api_url, id);
        let res = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .map_err(|source| ApiError::Transport {
                operation: "delete",
                source,
            })?;
        check_status("delete", res)?;
        Ok(())
    }

    fn create(&self, metadata: &NewFile, content: File, len: u64) -> Result<String, ApiError> {
        let session = self.start_upload(metadata, len)?;
        log::debug!("Opened upload session for {}", metadata.name);

        let res = self
            .client
            .put(&session)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, &metadata.mime_type)
            .header(CONTENT_LENGTH, len)
            .body(Body::sized(content, len))
            .send()
            .map_err(|source| ApiError::Transport {
                operation: "upload",
                source,
            })?;
        let res = check_status("upload", res)?;
        let created: CreatedFile = res.json().map_err(|e| ApiError::Protocol {
            operation: "upload",
            reason: e.to_string(),
        })?;
        Ok(created.id)
    }
}

/// Turn a non-success response into an `ApiError::Status` carrying the body.
fn check_status(operation: &'static str, res: Response) -> Result<Response, ApiError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().unwrap_or_else(|_| "".into());
    Err(ApiError::Status {
        operation,
        status,
        body,
    })
}
