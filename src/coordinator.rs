use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::UrlBrokerClient;
use crate::cache::UrlCache;
use crate::config::UploadConfig;
use crate::error::{FileUploadFailed, UploadError};
use crate::interrupter::Interrupter;
use crate::keys;
use crate::pool::{self, WorkerPool};
use crate::progress::{FileUploadInfo, Progress};
use crate::retrier::Retrier;
use crate::s3_client::S3HttpClient;
use crate::task::{MultipartEtags, UploadTask};

struct TaskOutcome {
    object_key: String,
    absolute_path: PathBuf,
    result: Result<FileUploadInfo, UploadError>,
}

/// Owns the worker pool, the `URLCache`, and the multipart registry for one
/// batch (spec §4.8). Construction takes the same collaborators the teacher
/// wires through `CreateExecutor`/`MultipartUploadExecutor`: a broker client,
/// an HTTP client, a logger (here, `tracing` plus an optional [`Progress`]),
/// and an interrupter.
pub struct UploadCoordinator {
    config: Arc<UploadConfig>,
    broker: Arc<dyn UrlBrokerClient>,
    http: Arc<S3HttpClient>,
    progress: Arc<dyn Progress>,
    interrupter: Arc<dyn Interrupter>,
}

impl UploadCoordinator {
    pub fn new(
        config: UploadConfig,
        broker: Arc<dyn UrlBrokerClient>,
        http: Arc<S3HttpClient>,
        progress: Arc<dyn Progress>,
        interrupter: Arc<dyn Interrupter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            http,
            progress,
            interrupter,
        }
    }

    /// Runs the full submission protocol of spec §4.8 over `files`
    /// (`absolute path -> logical artifact path`). Returns the successfully
    /// uploaded files' info, or the first non-interrupted failure; an
    /// interrupted batch returns an empty list rather than an error.
    pub async fn run(
        &self,
        files: impl IntoIterator<Item = (PathBuf, String)>,
    ) -> Result<Vec<FileUploadInfo>, FileUploadFailed> {
        let (entries, collisions) = keys::normalize(&self.config.path_prefix, files);
        for (object_key, discarded_path) in &collisions {
            warn!(object_key, discarded = %discarded_path.display(), "duplicate object key, keeping the last file");
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let object_keys: Vec<String> = entries.iter().map(|e| e.object_key.clone()).collect();
        let path_by_key: HashMap<String, PathBuf> = entries
            .iter()
            .map(|e| (e.object_key.clone(), e.absolute_path.clone()))
            .collect();

        let multipart_registry = Arc::new(Mutex::new(HashMap::new()));
        let cache = Arc::new(UrlCache::new(
            self.broker.clone(),
            Retrier::new(self.config.max_attempts, self.config.base_delay_ms),
            Duration::from_secs(self.config.url_ttl_seconds),
            self.config.presigned_url_max_chunk_size,
            object_keys,
            HashMap::new(),
            multipart_registry.clone(),
        ));
        let multipart_etags: MultipartEtags = Arc::new(Mutex::new(HashMap::new()));

        let pool: Arc<WorkerPool<TaskOutcome>> = Arc::new(WorkerPool::new(self.config.n_threads, entries.len().max(1)));
        let mut in_flight = FuturesUnordered::new();

        for entry in &entries {
            if pool.is_shutdown() {
                debug!(object_key = %entry.object_key, "pool is shutting down, skipping submission");
                continue;
            }

            let task = UploadTask::new(
                entry.object_key.clone(),
                entry.absolute_path.clone(),
                entry.artifact_path.clone(),
                self.config.clone(),
                cache.clone(),
                self.http.clone(),
                self.progress.clone(),
                self.interrupter.clone(),
                multipart_etags.clone(),
            );
            let object_key = entry.object_key.clone();
            let absolute_path = entry.absolute_path.clone();
            let pool_for_submit = pool.clone();

            in_flight.push(tokio::spawn(async move {
                let boxed: pool::Task<TaskOutcome> = Box::pin(async move {
                    let result = task.run().await;
                    TaskOutcome {
                        object_key,
                        absolute_path,
                        result,
                    }
                });
                pool_for_submit.submit(boxed).await
            }));
        }

        let mut successes = Vec::new();
        let mut success_keys: HashSet<String> = HashSet::new();
        let mut first_failure: Option<FileUploadFailed> = None;
        let mut interrupted = false;

        while let Some(joined) = in_flight.next().await {
            let Ok(submit_result) = joined else {
                continue; // a worker loop panicked; nothing sensible to surface per-task
            };
            let Ok(outcome) = submit_result else {
                continue; // SubmitRejected: pool was shutting down, skip silently
            };

            match outcome.result {
                Ok(info) => {
                    success_keys.insert(outcome.object_key);
                    successes.push(info);
                }
                Err(e) => {
                    warn!(
                        object_key = %outcome.object_key,
                        absolute_path = %outcome.absolute_path.display(),
                        error = %e,
                        "upload task failed"
                    );
                    if e.is_interrupted() {
                        interrupted = true;
                        pool.shutdown();
                    } else if first_failure.is_none() {
                        first_failure = Some(FileUploadFailed::new(outcome.absolute_path, outcome.object_key, e));
                    }
                }
            }
        }

        let finalize_failure = self
            .finalize_multipart_uploads(&multipart_registry, &multipart_etags, &success_keys, &path_by_key, interrupted)
            .await;

        self.broker.close().await;

        if interrupted {
            return Ok(Vec::new());
        }
        match first_failure.or(finalize_failure) {
            Some(failure) => Err(failure),
            None => Ok(successes),
        }
    }

    /// Completes or aborts every multipart upload still tracked in the
    /// registry (spec §4.8 step 5). A task that reported success gets
    /// `complete` with its collected ETags; anything else gets `abort`.
    async fn finalize_multipart_uploads(
        &self,
        multipart_registry: &Mutex<HashMap<String, String>>,
        multipart_etags: &MultipartEtags,
        success_keys: &HashSet<String>,
        path_by_key: &HashMap<String, PathBuf>,
        interrupted: bool,
    ) -> Option<FileUploadFailed> {
        let registry_snapshot: Vec<(String, String)> = multipart_registry.lock().await.drain().collect();
        let retrier = Retrier::new(self.config.max_attempts, self.config.base_delay_ms);
        let mut finalize_failure = None;

        for (object_key, upload_id) in registry_snapshot {
            let succeeded = success_keys.contains(&object_key);
            let etags = if succeeded {
                multipart_etags.lock().await.remove(&object_key)
            } else {
                None
            };

            let broker = self.broker.clone();
            let result = retrier
                .run(self.interrupter.as_ref(), || {
                    let broker = broker.clone();
                    let object_key = object_key.clone();
                    let upload_id = upload_id.clone();
                    let etags = etags.clone();
                    async move {
                        match etags {
                            Some(etags) => broker.complete(&object_key, &upload_id, &etags).await,
                            None => broker.abort(&object_key, &upload_id).await,
                        }
                    }
                })
                .await;

            if let Err(e) = result {
                warn!(object_key = %object_key, upload_id, error = %e, "multipart finalize failed");
                if finalize_failure.is_none() && !interrupted {
                    let path = path_by_key.get(&object_key).cloned().unwrap_or_default();
                    finalize_failure = Some(FileUploadFailed::new(
                        path,
                        object_key.clone(),
                        UploadError::MultipartFinalizeFailed {
                            object_key,
                            message: e.to_string(),
                        },
                    ));
                }
            }
        }

        finalize_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PresignedPart, PresignedUrl};
    use crate::interrupter::FlagInterrupter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct MockBroker {
        server_uri: String,
        fetch_regular_calls: AtomicUsize,
        fail_fetch_regular_times: StdMutex<usize>,
        completed: StdMutex<Vec<(String, String, Vec<String>)>>,
        aborted: StdMutex<Vec<(String, String)>>,
    }

    impl MockBroker {
        fn new(server_uri: String) -> Self {
            Self {
                server_uri,
                fetch_regular_calls: AtomicUsize::new(0),
                fail_fetch_regular_times: StdMutex::new(0),
                completed: StdMutex::new(Vec::new()),
                aborted: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UrlBrokerClient for MockBroker {
        async fn fetch_regular(&self, object_keys: &[(String, String)]) -> Result<Vec<PresignedUrl>, UploadError> {
            self.fetch_regular_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut fail = self.fail_fetch_regular_times.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(UploadError::BrokerFetchFailed("simulated 503".to_string()));
                }
            }
            Ok(object_keys
                .iter()
                .map(|(k, _)| PresignedUrl {
                    object_key: k.clone(),
                    upload_id: None,
                    parts: vec![PresignedPart {
                        part_number: 1,
                        url: format!("{}/{}", self.server_uri, k),
                        expires_at: None,
                    }],
                    is_multipart: false,
                })
                .collect())
        }

        async fn fetch_multipart(
            &self,
            object_key: &str,
            part_digests: &[String],
            upload_id: Option<&str>,
            _ttl: Option<Duration>,
        ) -> Result<PresignedUrl, UploadError> {
            let parts = (1..=part_digests.len() as u32)
                .map(|n| PresignedPart {
                    part_number: n,
                    url: format!("{}/{}-{}", self.server_uri, object_key, n),
                    expires_at: None,
                })
                .collect();
            Ok(PresignedUrl {
                object_key: object_key.to_string(),
                upload_id: Some(upload_id.unwrap_or("up-1").to_string()),
                parts,
                is_multipart: true,
            })
        }

        async fn complete(&self, object_key: &str, upload_id: &str, etags: &[String]) -> Result<(), UploadError> {
            self.completed
                .lock()
                .unwrap()
                .push((object_key.to_string(), upload_id.to_string(), etags.to_vec()));
            Ok(())
        }

        async fn abort(&self, object_key: &str, upload_id: &str) -> Result<(), UploadError> {
            self.aborted.lock().unwrap().push((object_key.to_string(), upload_id.to_string()));
            Ok(())
        }

        async fn close(&self) {}
    }

    async fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let file_path = dir.path().join(name);
        tokio::fs::File::create(&file_path)
            .await
            .unwrap()
            .write_all(contents)
            .await
            .unwrap();
        file_path
    }

    fn coordinator_with(
        broker: Arc<MockBroker>,
        config: UploadConfig,
        interrupter: Arc<dyn Interrupter>,
    ) -> UploadCoordinator {
        let http = Arc::new(S3HttpClient::new(reqwest::Client::new(), "test-agent/1.0", config.consistency_check_enabled));
        UploadCoordinator::new(config, broker, http, Arc::new(crate::progress::NoopProgress), interrupter)
    }

    #[tokio::test]
    async fn single_small_file_uploads_and_returns_info() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"6f5902ac237024bdd0c176cb93063dc4\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "foo.txt", b"hello world\n").await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        let config = UploadConfig::builder().path_prefix("build-42/").build();
        let coordinator = coordinator_with(broker, config, Arc::new(crate::interrupter::NeverInterrupted));

        let result = coordinator.run(vec![(path, "dir/foo.txt".to_string())]).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].artifact_path, "dir/foo.txt");
        assert_eq!(result[0].digest, "6f5902ac237024bdd0c176cb93063dc4");
    }

    #[tokio::test]
    async fn multipart_upload_completes_with_ordered_etags() {
        let server = MockServer::start().await;
        for n in 1..=3u32 {
            Mock::given(method("PUT"))
                .and(path_regex(format!(r".*-{n}$")))
                .respond_with(ResponseTemplate::new(200).insert_header("ETag", format!("\"etag{n}\"").as_str()))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let size = 11 * 1024 * 1024;
        let path = write_file(&dir, "zeros.dat", &vec![0u8; size]).await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        let config = UploadConfig::builder()
            .path_prefix("build-42/")
            .multipart_threshold(8 * 1024 * 1024)
            .min_part_size(5 * 1024 * 1024)
            .consistency_check_enabled(false)
            .build();
        let coordinator = coordinator_with(broker.clone(), config, Arc::new(crate::interrupter::NeverInterrupted));

        let result = coordinator.run(vec![(path, "bin/zeros.dat".to_string())]).await.unwrap();
        assert_eq!(result.len(), 1);

        let completed = broker.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].2, vec!["etag1".to_string(), "etag2".to_string(), "etag3".to_string()]);
        assert!(broker.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_transient_failure_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"deadbeef\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "foo.txt", b"hi").await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        *broker.fail_fetch_regular_times.lock().unwrap() = 2;
        let config = UploadConfig::builder()
            .path_prefix("build-42/")
            .max_attempts(3)
            .base_delay_ms(1)
            .consistency_check_enabled(false)
            .build();
        let coordinator = coordinator_with(broker.clone(), config, Arc::new(crate::interrupter::NeverInterrupted));

        let result = coordinator.run(vec![(path, "foo.txt".to_string())]).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn consistency_mismatch_fails_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"not-the-real-digest\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "foo.txt", b"hello world\n").await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        let config = UploadConfig::builder()
            .path_prefix("build-42/")
            .max_attempts(3)
            .base_delay_ms(1)
            .build();
        let coordinator = coordinator_with(broker, config, Arc::new(crate::interrupter::NeverInterrupted));

        let err = coordinator.run(vec![(path, "foo.txt".to_string())]).await.unwrap_err();
        assert!(matches!(err.source, UploadError::ConsistencyMismatch { .. }));
        assert!(err.fatal);
    }

    #[tokio::test]
    async fn path_collision_uploads_only_the_last_file() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"deadbeef\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path_a = write_file(&dir, "a.txt", b"first").await;
        let path_b = write_file(&dir, "b.txt", b"second").await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        let config = UploadConfig::builder().path_prefix("build-42/").consistency_check_enabled(false).build();
        let coordinator = coordinator_with(broker, config, Arc::new(crate::interrupter::NeverInterrupted));

        let result = coordinator
            .run(vec![
                (path_a, "same/path.txt".to_string()),
                (path_b.clone(), "same/path.txt".to_string()),
            ])
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn pre_fired_interrupter_returns_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"deadbeef\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "foo.txt", b"hi").await;

        let broker = Arc::new(MockBroker::new(server.uri()));
        let interrupter = FlagInterrupter::new();
        interrupter.fire("user requested stop");
        let config = UploadConfig::builder().path_prefix("build-42/").build();
        let coordinator = coordinator_with(broker, config, Arc::new(interrupter));

        let result = coordinator.run(vec![(path, "foo.txt".to_string())]).await.unwrap();
        assert!(result.is_empty());
    }
}
