//! Media input handling for image and document sends.
//!
//! Accepted inputs:
//! - `data:<mime>;base64,<payload>` with a payload that decodes as base64
//! - `http://` or `https://` URLs, downloaded with a size cap and timeout
//!
//! Anything else is rejected as an invalid media format.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use chrono::Utc;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;
use wahub_core::config::MediaConfig;
use wahub_core::models::MediaPayload;
use wahub_core::HubError;

const DATA_URI_PATTERN: &str = r"^data:([A-Za-z0-9.+/-]+);base64,(.+)$";
const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    Url(Url),
    Inline { mime_type: String, data: String },
}

/// File extension for a document MIME type. Unknown types map to `bin`.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/zip" | "application/x-zip-compressed" => "zip",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
}

#[derive(Debug, Clone)]
pub struct MediaFetcher {
    client: Client,
    max_bytes: u64,
    data_uri: Regex,
}

impl MediaFetcher {
    pub fn new(config: &MediaConfig) -> Result<Self, HubError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.download_timeout_ms))
            .build()
            .map_err(|e| HubError::Upstream(format!("failed to build media client: {}", e)))?;
        let data_uri = Regex::new(DATA_URI_PATTERN)
            .map_err(|e| HubError::Upstream(format!("invalid data URI pattern: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_file_size,
            data_uri,
        })
    }

    pub fn parse_source(&self, input: &str) -> Result<MediaSource, HubError> {
        let input = input.trim();

        if input.starts_with("data:") {
            let caps = self.data_uri.captures(input).ok_or_else(|| {
                HubError::InvalidMediaFormat("data URI must look like data:<mime>;base64,<data>".into())
            })?;
            let mime_type = caps[1].to_string();
            let data = caps[2].to_string();
            if STANDARD.decode(data.as_bytes()).is_err() {
                return Err(HubError::InvalidMediaFormat("payload is not valid base64".into()));
            }
            return Ok(MediaSource::Inline { mime_type, data });
        }

        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(MediaSource::Url(url)),
            _ => Err(HubError::InvalidMediaFormat(
                "Use an http(s) URL or a base64 data URI".into(),
            )),
        }
    }

    /// Download `url`, enforcing the size cap while streaming.
    pub async fn download(&self, url: &Url) -> Result<(String, Vec<u8>), HubError> {
        debug!(url = %url, "Downloading media");
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HubError::Upstream(format!("media download failed: {}", e)))?;

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(self.too_large());
            }
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        let mut buf = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| HubError::Upstream(format!("media download failed: {}", e)))?
        {
            if (buf.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large());
            }
            buf.extend_from_slice(&chunk);
        }

        info!(url = %url, bytes = buf.len(), mime_type = %mime_type, "Media downloaded");
        Ok((mime_type, buf.to_vec()))
    }

    fn too_large(&self) -> HubError {
        HubError::InvalidMediaFormat(format!("media exceeds the {} byte limit", self.max_bytes))
    }

    async fn resolve(&self, input: &str) -> Result<(String, String, Option<String>), HubError> {
        match self.parse_source(input)? {
            MediaSource::Inline { mime_type, data } => Ok((mime_type, data, None)),
            MediaSource::Url(url) => {
                let name = url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let (mime_type, bytes) = self.download(&url).await?;
                Ok((mime_type, STANDARD.encode(bytes), name))
            }
        }
    }

    pub async fn prepare_image(&self, input: &str) -> Result<MediaPayload, HubError> {
        let (mime_type, data, _) = self.resolve(input).await?;
        Ok(MediaPayload {
            mime_type,
            data,
            filename: format!("image-{}", Utc::now().timestamp_millis()),
        })
    }

    /// `filename` wins over a name taken from the URL, which wins over a
    /// generated `document-<millis>.<ext>`.
    pub async fn prepare_document(
        &self,
        input: &str,
        filename: Option<&str>,
    ) -> Result<MediaPayload, HubError> {
        let (mime_type, data, url_name) = self.resolve(input).await?;
        let filename = filename
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .or(url_name)
            .unwrap_or_else(|| {
                format!(
                    "document-{}.{}",
                    Utc::now().timestamp_millis(),
                    extension_for_mime(&mime_type)
                )
            });

        Ok(MediaPayload {
            mime_type,
            data,
            filename,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
