use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use uuid::Uuid;

use crate::error::UploadError;
use crate::xml;

/// One part of a presigned descriptor: `{ partNumber>=1, url, expiresAt }`
/// (spec §3).
#[derive(Debug, Clone)]
pub struct PresignedPart {
    pub part_number: u32,
    pub url: String,
    pub expires_at: Option<Instant>,
}

/// `{ objectKey, uploadId?, parts, isMultipart }` (spec §3). A non-multipart
/// descriptor has exactly one part with `partNumber=1`; a multipart
/// descriptor has `>=1` ordered parts and a non-empty `uploadId`.
#[derive(Debug, Clone)]
pub struct PresignedUrl {
    pub object_key: String,
    pub upload_id: Option<String>,
    pub parts: Vec<PresignedPart>,
    pub is_multipart: bool,
}

impl PresignedUrl {
    /// Returns the single part URL for a regular (non-multipart) upload, or
    /// a non-recoverable `BrokerShape` error if the broker handed back
    /// something shaped like a multipart descriptor instead (spec §4.5
    /// "Query rules for regular URLs").
    pub fn regular_url(&self) -> Result<&str, UploadError> {
        if self.is_multipart || self.parts.len() != 1 || self.parts[0].part_number != 1 {
            return Err(UploadError::BrokerShape(format!(
                "expected a single-part, non-multipart descriptor for {}, got is_multipart={} parts={}",
                self.object_key,
                self.is_multipart,
                self.parts.len()
            )));
        }
        Ok(&self.parts[0].url)
    }
}

/// The only abstraction the core holds against the external URL broker
/// (spec §4.4). `HttpUrlBrokerClient` is the production implementation;
/// tests substitute a mock, the way `MultipartUploadExecutor` in the
/// teacher was parameterized over a single shared `S3Client` handle.
#[async_trait]
pub trait UrlBrokerClient: Send + Sync {
    async fn fetch_regular(
        &self,
        object_keys: &[(String, String)],
    ) -> Result<Vec<PresignedUrl>, UploadError>;

    async fn fetch_multipart(
        &self,
        object_key: &str,
        part_digests: &[String],
        upload_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<PresignedUrl, UploadError>;

    async fn complete(
        &self,
        object_key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), UploadError>;

    async fn abort(&self, object_key: &str, upload_id: &str) -> Result<(), UploadError>;

    /// Enters a terminal shutdown state; further calls fail with
    /// `BrokerShutdown` (spec §4.4).
    async fn close(&self);
}

/// HTTP POST + XML wire implementation of [`UrlBrokerClient`] (spec §6).
pub struct HttpUrlBrokerClient {
    client: Client,
    endpoint: String,
    correlation_id: String,
    artifact_keys_header_limit: usize,
    shutdown: AtomicBool,
}

impl HttpUrlBrokerClient {
    pub fn new(client: Client, endpoint: impl Into<String>, artifact_keys_header_limit: usize) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            correlation_id: Uuid::new_v4().to_string(),
            artifact_keys_header_limit,
            shutdown: AtomicBool::new(false),
        }
    }

    fn check_shutdown(&self) -> Result<(), UploadError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(UploadError::BrokerShutdown);
        }
        Ok(())
    }

    fn request(&self, keys_for_header: &[&str]) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/v2/urls", self.endpoint))
            .header("X-Correlation-Id", &self.correlation_id)
            .header("Content-Type", "application/xml");
        for key in keys_for_header.iter().take(self.artifact_keys_header_limit) {
            req = req.header("S3_ARTIFACT_KEYS_HEADER", *key);
        }
        req
    }

    async fn send(&self, body: String, keys_for_header: &[&str]) -> Result<String, UploadError> {
        self.check_shutdown()?;
        let response = self
            .request(keys_for_header)
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::BrokerFetchFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UploadError::BrokerFetchFailed(e.to_string()))?;

        if status.is_success() {
            return Ok(text);
        }
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(UploadError::BrokerFetchFailed(format!(
                "broker returned {status}: {text}"
            )));
        }
        if xml::is_interrupted_body(&text) {
            return Err(UploadError::Interrupted(
                "broker reported upload interrupted".to_string(),
            ));
        }
        Err(UploadError::BrokerShape(format!(
            "broker returned {status}: {text}"
        )))
    }
}

#[async_trait]
impl UrlBrokerClient for HttpUrlBrokerClient {
    async fn fetch_regular(
        &self,
        object_keys: &[(String, String)],
    ) -> Result<Vec<PresignedUrl>, UploadError> {
        let body = xml::build_fetch_regular_request(object_keys);
        let keys: Vec<&str> = object_keys.iter().map(|(k, _)| k.as_str()).collect();
        let text = self.send(body, &keys).await?;
        xml::parse_presigned_url_list_response(&text)
    }

    async fn fetch_multipart(
        &self,
        object_key: &str,
        part_digests: &[String],
        upload_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<PresignedUrl, UploadError> {
        let body = xml::build_fetch_multipart_request(object_key, part_digests, upload_id, ttl);
        let text = self.send(body, &[object_key]).await?;
        let mut urls = xml::parse_presigned_url_list_response(&text)?;
        urls.pop()
            .ok_or_else(|| UploadError::BrokerShape("empty multipart response".to_string()))
    }

    async fn complete(
        &self,
        object_key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), UploadError> {
        self.check_shutdown()?;
        debug!(object_key, upload_id, parts = etags.len(), "completing multipart upload");
        let form = build_finish_form(object_key, upload_id, true, etags);
        finish(self, object_key, form).await
    }

    async fn abort(&self, object_key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.check_shutdown()?;
        debug!(object_key, upload_id, "aborting multipart upload");
        let form = build_finish_form(object_key, upload_id, false, &[]);
        finish(self, object_key, form).await
    }

    async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

async fn finish(
    client: &HttpUrlBrokerClient,
    object_key: &str,
    form: Vec<(String, String)>,
) -> Result<(), UploadError> {
    client.check_shutdown()?;
    let response = client
        .client
        .post(format!("{}/v2/finish", client.endpoint))
        .header("X-Correlation-Id", &client.correlation_id)
        .form(&form)
        .send()
        .await
        .map_err(|e| UploadError::BrokerFetchFailed(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    if status.is_server_error() || status.as_u16() == 429 {
        return Err(UploadError::MultipartFinalizeFailed {
            object_key: object_key.to_string(),
            message: format!("{status}: {text}"),
        });
    }
    Err(UploadError::BrokerShape(format!("{status}: {text}")))
}

fn build_finish_form(
    object_key: &str,
    upload_id: &str,
    successful: bool,
    etags: &[String],
) -> Vec<(String, String)> {
    use base64::Engine;
    let mut form = vec![
        ("OBJECT_KEY".to_string(), object_key.to_string()),
        (
            "OBJECT_KEY_BASE64".to_string(),
            base64::engine::general_purpose::STANDARD.encode(object_key.as_bytes()),
        ),
        ("FINISH_UPLOAD".to_string(), upload_id.to_string()),
        ("UPLOAD_SUCCESSFUL".to_string(), successful.to_string()),
    ];
    for etag in etags {
        form.push(("ETAGS".to_string(), etag.clone()));
    }
    form
}
