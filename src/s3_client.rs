use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::UploadConfig;
use crate::digest::DigestingReader;
use crate::error::UploadError;
use crate::xml;

/// Low-level HTTP operations against presigned URLs: no S3 credential is
/// ever held by this process (spec §1/§4.3). A connection pool sized to the
/// worker count avoids head-of-line blocking across concurrently uploading
/// files (spec §9).
pub struct S3HttpClient {
    client: Client,
    user_agent: String,
    consistency_check_enabled: bool,
}

impl S3HttpClient {
    pub fn new(client: Client, user_agent: impl Into<String>, consistency_check_enabled: bool) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            consistency_check_enabled,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Result<Self, UploadError> {
        let client = build_client(config)?;
        Ok(Self::new(client, &config.user_agent, config.consistency_check_enabled))
    }

    /// PUT the entire file; sets `Content-Type` by file suffix; compares the
    /// response ETag to the client-computed digest when consistency
    /// checking is enabled (spec §4.3).
    pub async fn put_object(&self, url: &str, path: &Path) -> Result<String, UploadError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::FileNotFound(path.to_path_buf())
            } else {
                UploadError::Io(e)
            }
        })?;
        self.put_range(url, path, 0, meta.len()).await
    }

    /// Same as `put_object` but for a `[offset, offset+length)` byte range
    /// (one multipart part).
    pub async fn put_part(&self, url: &str, path: &Path, offset: u64, length: u64) -> Result<String, UploadError> {
        self.put_range(url, path, offset, length).await
    }

    pub async fn head_object(&self, url: &str) -> Result<String, UploadError> {
        let response = self
            .client
            .head(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status, String::new()));
        }
        extract_etag(&response).ok_or_else(|| UploadError::S3Permanent("response missing ETag header".to_string()))
    }

    async fn put_range(&self, url: &str, path: &Path, offset: u64, length: u64) -> Result<String, UploadError> {
        let (reader, digest_handle) = DigestingReader::open_range(path, offset, length).await?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, text));
        }

        let etag = extract_etag(&response)
            .ok_or_else(|| UploadError::S3Permanent("response missing ETag header".to_string()))?;

        if self.consistency_check_enabled {
            if let Some(local_digest) = digest_handle.get() {
                if local_digest != etag {
                    return Err(UploadError::ConsistencyMismatch {
                        expected: local_digest,
                        actual: etag,
                    });
                }
                debug!(%etag, "consistency check passed");
            }
        }

        Ok(etag)
    }
}

fn extract_etag(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').to_string())
}

fn classify_http_status(status: StatusCode, body: String) -> UploadError {
    if xml::is_interrupted_body(&body) {
        return UploadError::Interrupted("S3 reported upload interrupted".to_string());
    }
    let retriable_status = status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error();
    if let Some((code, message)) = xml::parse_s3_error(&body) {
        if xml::is_recoverable_s3_code(&code) || retriable_status {
            return UploadError::S3Transport(format!("{code}: {message}"));
        }
        return UploadError::S3Permanent(format!("{code}: {message}"));
    }
    if retriable_status {
        UploadError::S3Transport(format!("HTTP {status}"))
    } else {
        UploadError::S3Permanent(format!("HTTP {status}: unparsable response body"))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> UploadError {
    // Connection reset, SSL handshake failure, read timeout => recoverable;
    // unknown host and other low-level failures => not (spec §4.3). reqwest
    // reports DNS resolution failures through the same `is_connect()` path
    // as a refused/reset TCP connection, so that flag alone can't tell a
    // transient connect failure apart from an unresolvable hostname; walk
    // the error's source chain for the resolver's own message instead.
    if is_dns_error(&e) {
        return UploadError::S3Permanent(e.to_string());
    }
    if e.is_timeout() || e.is_connect() || e.is_body() {
        UploadError::S3Transport(e.to_string())
    } else {
        UploadError::S3Permanent(e.to_string())
    }
}

fn is_dns_error(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("dns error")
            || message.contains("failed to lookup address")
            || message.contains("name resolution")
            || message.contains("nodename nor servname")
        {
            return true;
        }
        source = err.source();
    }
    false
}

pub fn build_client(config: &UploadConfig) -> Result<Client, UploadError> {
    Client::builder()
        .pool_max_idle_per_host(config.n_threads)
        .connect_timeout(Duration::from_millis(config.connection_timeout_ms))
        .user_agent(&config.user_agent)
        .build()
        .map_err(|e| UploadError::S3Permanent(format!("failed to build HTTP client: {e}")))
}
