use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cache::UrlCache;
use crate::config::UploadConfig;
use crate::digest;
use crate::error::UploadError;
use crate::interrupter::Interrupter;
use crate::keys;
use crate::progress::{percent_complete, FileUploadInfo, Progress};
use crate::retrier::Retrier;
use crate::s3_client::S3HttpClient;
use crate::splitter::FileSplitter;

/// `objectKey -> etags[]`, filled in by a task the moment every part of its
/// multipart upload has succeeded. The coordinator reads this during
/// finalization to call `complete` with the right ETag list; it cannot be
/// reconstructed from `FileUploadInfo` alone since that only carries the
/// composite digest (spec §4.8 step 5, §3 "Ownership").
pub type MultipartEtags = Arc<Mutex<HashMap<String, Vec<String>>>>;

/// Per-file state machine (spec §3/§4.7): `Created -> Planning ->
/// (Regular | Multipart) -> Finalizing -> (Done | Failed | Aborted)`.
/// `Finalizing` (the broker `complete`/`abort` call) is carried out by the
/// coordinator once every task has reported in, not by the task itself —
/// this keeps a single task's failure from racing the coordinator's
/// registry bookkeeping.
pub struct UploadTask {
    object_key: String,
    absolute_path: PathBuf,
    artifact_path: String,
    config: Arc<UploadConfig>,
    cache: Arc<UrlCache>,
    http: Arc<S3HttpClient>,
    progress: Arc<dyn Progress>,
    interrupter: Arc<dyn Interrupter>,
    multipart_etags: MultipartEtags,
    retrier: Retrier,
}

impl UploadTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_key: String,
        absolute_path: PathBuf,
        artifact_path: String,
        config: Arc<UploadConfig>,
        cache: Arc<UrlCache>,
        http: Arc<S3HttpClient>,
        progress: Arc<dyn Progress>,
        interrupter: Arc<dyn Interrupter>,
        multipart_etags: MultipartEtags,
    ) -> Self {
        let retrier = Retrier::new(config.max_attempts, config.base_delay_ms);
        Self {
            object_key,
            absolute_path,
            artifact_path,
            config,
            cache,
            http,
            progress,
            interrupter,
            multipart_etags,
            retrier,
        }
    }

    pub async fn run(&self) -> Result<FileUploadInfo, UploadError> {
        self.check_interrupted()?;

        let meta = tokio::fs::metadata(&self.absolute_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::FileNotFound(self.absolute_path.clone())
            } else {
                UploadError::Io(e)
            }
        })?;
        let size = meta.len();
        self.progress.on_file_started(&self.object_key, size);

        let multipart = self.config.multipart_enabled && size >= self.config.effective_multipart_threshold();
        let result = if multipart {
            self.run_multipart(size).await
        } else {
            self.run_regular(size).await
        };

        match &result {
            Ok(info) => self.progress.on_file_success(info),
            Err(e) => self.progress.on_file_failure(&self.object_key, e),
        }
        result
    }

    fn check_interrupted(&self) -> Result<(), UploadError> {
        if let Some(reason) = self.interrupter.reason() {
            return Err(UploadError::Interrupted(reason));
        }
        Ok(())
    }

    async fn run_regular(&self, size: u64) -> Result<FileUploadInfo, UploadError> {
        self.check_interrupted()?;
        let presigned = self.cache.get_regular(&self.object_key, self.interrupter.as_ref()).await?;
        let url = presigned.regular_url()?.to_string();

        let http = self.http.clone();
        let path = self.absolute_path.clone();
        let etag = self
            .retrier
            .run(self.interrupter.as_ref(), || {
                let http = http.clone();
                let url = url.clone();
                let path = path.clone();
                async move { http.put_object(&url, &path).await }
            })
            .await?;

        self.progress.on_progress(&self.object_key, percent_complete(0, size));
        Ok(FileUploadInfo {
            artifact_path: self.artifact_path.clone(),
            absolute_path: self.absolute_path.clone(),
            size,
            digest: etag,
        })
    }

    async fn run_multipart(&self, size: u64) -> Result<FileUploadInfo, UploadError> {
        let min_part_size = self.config.effective_min_part_size();
        let parts = FileSplitter::split(
            &self.absolute_path,
            size,
            min_part_size,
            self.config.consistency_check_enabled,
        )
        .await?;

        let part_digests: Vec<String> = parts.iter().map(|p| p.digest.clone().unwrap_or_default()).collect();
        let mp = self
            .cache
            .get_multipart(&self.object_key, &part_digests, self.interrupter.as_ref())
            .await?;

        if mp.parts.len() != parts.len() {
            return Err(UploadError::BrokerShape(format!(
                "broker returned {} part URLs for {} planned parts of {}",
                mp.parts.len(),
                parts.len(),
                self.object_key
            )));
        }

        let mut etags: Vec<String> = vec![String::new(); parts.len()];
        let mut remaining = size;

        for part in &parts {
            self.check_interrupted()?;

            let part_url = mp
                .parts
                .iter()
                .find(|p| p.part_number == part.part_number)
                .map(|p| p.url.clone())
                .ok_or_else(|| {
                    UploadError::BrokerShape(format!(
                        "missing presigned URL for part {} of {}",
                        part.part_number, self.object_key
                    ))
                })?;

            let http = self.http.clone();
            let path = self.absolute_path.clone();
            let offset = part.offset;
            let length = part.length;
            let etag = self
                .retrier
                .run(self.interrupter.as_ref(), || {
                    let http = http.clone();
                    let url = part_url.clone();
                    let path = path.clone();
                    async move { http.put_part(&url, &path, offset, length).await }
                })
                .await?;

            etags[part.index] = etag;
            self.progress
                .on_part_success(&self.object_key, part.part_number, keys::strip_query(&part_url));

            remaining -= part.length;
            self.progress.on_progress(&self.object_key, percent_complete(remaining, size));
        }

        self.multipart_etags
            .lock()
            .await
            .insert(self.object_key.clone(), etags.clone());

        let digest = digest::multipart_digest(&etags)?;
        Ok(FileUploadInfo {
            artifact_path: self.artifact_path.clone(),
            absolute_path: self.absolute_path.clone(),
            size,
            digest,
        })
    }
}
