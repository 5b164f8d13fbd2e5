use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::broker::{PresignedUrl, UrlBrokerClient};
use crate::error::UploadError;
use crate::interrupter::Interrupter;
use crate::retrier::Retrier;

/// `objectKey -> uploadId`, owned by the coordinator (spec §3 "Ownership");
/// `UrlCache::get_multipart` writes into it on acquisition, the coordinator
/// reads it for finalization and deletes entries on terminal transition.
pub type MultipartRegistry = Arc<Mutex<HashMap<String, String>>>;

struct Snapshot {
    fetched_at: Instant,
    entries: HashMap<String, PresignedUrl>,
}

/// TTL-bounded, single-flight cache of `objectKey -> PresignedUrl` (spec
/// §3/§4.5). A `tokio::sync::Mutex` around the refresh path plus a
/// `RwLock`-guarded snapshot reference gives: lock-free reads of the current
/// snapshot, and exactly one refresh in flight at a time — the "mutex +
/// snapshot reference + in-flight flag" recipe spec §9 calls for.
pub struct UrlCache {
    broker: Arc<dyn UrlBrokerClient>,
    retrier: Retrier,
    ttl: Duration,
    max_chunk_size: usize,
    object_keys: Vec<String>,
    digests: HashMap<String, String>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh_lock: Mutex<()>,
    multipart_registry: MultipartRegistry,
}

impl UrlCache {
    pub fn new(
        broker: Arc<dyn UrlBrokerClient>,
        retrier: Retrier,
        ttl: Duration,
        max_chunk_size: usize,
        object_keys: Vec<String>,
        digests: HashMap<String, String>,
        multipart_registry: MultipartRegistry,
    ) -> Self {
        Self {
            broker,
            retrier,
            ttl,
            max_chunk_size: max_chunk_size.max(1),
            object_keys,
            digests,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            multipart_registry,
        }
    }

    /// Returns the cached entry for `object_key`, triggering a refresh on
    /// miss or expiry (spec §4.5).
    pub async fn get_regular(
        &self,
        object_key: &str,
        interrupter: &dyn Interrupter,
    ) -> Result<PresignedUrl, UploadError> {
        loop {
            if let Some(snapshot) = self.fresh_snapshot().await {
                return snapshot
                    .entries
                    .get(object_key)
                    .cloned()
                    .ok_or_else(|| UploadError::BrokerShape(format!("no presigned URL for {object_key}")));
            }
            self.refresh(interrupter).await?;
        }
    }

    async fn fresh_snapshot(&self) -> Option<Arc<Snapshot>> {
        let snapshot = self.snapshot.read().await.clone()?;
        if snapshot.fetched_at.elapsed() < self.ttl {
            Some(snapshot)
        } else {
            None
        }
    }

    /// Single-flight refresh: the first caller through `refresh_lock`
    /// partitions `object_keys` into `max_chunk_size` chunks and issues one
    /// `fetchRegular` per chunk under the Retrier; everyone else blocks on
    /// the same lock and, once it releases, observes either the fresh
    /// snapshot or the propagated error (spec §4.5, §8 invariant 5).
    async fn refresh(&self, interrupter: &dyn Interrupter) -> Result<(), UploadError> {
        let _guard = self.refresh_lock.lock().await;

        // Someone else may have refreshed while we waited for the lock.
        if self.fresh_snapshot().await.is_some() {
            return Ok(());
        }

        debug!(keys = self.object_keys.len(), chunk_size = self.max_chunk_size, "refreshing presigned URL cache");

        let mut entries = HashMap::new();
        for chunk in self.object_keys.chunks(self.max_chunk_size) {
            if let Some(reason) = interrupter.reason() {
                *self.snapshot.write().await = None;
                return Err(UploadError::Interrupted(reason));
            }

            let keys_with_digest: Vec<(String, String)> = chunk
                .iter()
                .map(|k| (k.clone(), self.digests.get(k).cloned().unwrap_or_default()))
                .collect();

            let broker = self.broker.clone();
            let result = self
                .retrier
                .run(interrupter, || {
                    let broker = broker.clone();
                    let keys_with_digest = keys_with_digest.clone();
                    async move { broker.fetch_regular(&keys_with_digest).await }
                })
                .await;

            match result {
                Ok(urls) => {
                    for url in urls {
                        entries.insert(url.object_key.clone(), url);
                    }
                }
                Err(e) => {
                    // partial chunk failure discards the old snapshot entirely
                    *self.snapshot.write().await = None;
                    return Err(e);
                }
            }
        }

        *self.snapshot.write().await = Some(Arc::new(Snapshot {
            fetched_at: Instant::now(),
            entries,
        }));
        Ok(())
    }

    /// Always bypasses the cache (the uploadId is stateful): delegates
    /// directly to the broker under the Retrier and records the returned
    /// uploadId into the coordinator's multipart registry (spec §4.5).
    pub async fn get_multipart(
        &self,
        object_key: &str,
        part_digests: &[String],
        interrupter: &dyn Interrupter,
    ) -> Result<PresignedUrl, UploadError> {
        let existing_upload_id = self.multipart_registry.lock().await.get(object_key).cloned();
        let broker = self.broker.clone();
        let ttl = Some(self.ttl);
        let digests = part_digests.to_vec();
        let key = object_key.to_string();

        let url = self
            .retrier
            .run(interrupter, || {
                let broker = broker.clone();
                let digests = digests.clone();
                let key = key.clone();
                let uid = existing_upload_id.clone();
                async move { broker.fetch_multipart(&key, &digests, uid.as_deref(), ttl).await }
            })
            .await?;

        if !url.is_multipart || url.upload_id.is_none() {
            return Err(UploadError::BrokerShape(format!(
                "expected a multipart descriptor for {object_key}"
            )));
        }

        let upload_id = url.upload_id.clone().unwrap();
        self.multipart_registry
            .lock()
            .await
            .insert(object_key.to_string(), upload_id);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PresignedPart;
    use crate::interrupter::NeverInterrupted;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingBroker {
        fetch_regular_calls: AtomicUsize,
        fail_next: StdMutex<usize>,
    }

    impl CountingBroker {
        fn new() -> Self {
            Self {
                fetch_regular_calls: AtomicUsize::new(0),
                fail_next: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl UrlBrokerClient for CountingBroker {
        async fn fetch_regular(&self, object_keys: &[(String, String)]) -> Result<Vec<PresignedUrl>, UploadError> {
            self.fetch_regular_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut fail_next = self.fail_next.lock().unwrap();
                if *fail_next > 0 {
                    *fail_next -= 1;
                    return Err(UploadError::BrokerFetchFailed("simulated".to_string()));
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(object_keys
                .iter()
                .map(|(k, _)| PresignedUrl {
                    object_key: k.clone(),
                    upload_id: None,
                    parts: vec![PresignedPart {
                        part_number: 1,
                        url: format!("https://s3/{k}"),
                        expires_at: None,
                    }],
                    is_multipart: false,
                })
                .collect())
        }

        async fn fetch_multipart(
            &self,
            object_key: &str,
            _part_digests: &[String],
            upload_id: Option<&str>,
            _ttl: Option<Duration>,
        ) -> Result<PresignedUrl, UploadError> {
            Ok(PresignedUrl {
                object_key: object_key.to_string(),
                upload_id: Some(upload_id.unwrap_or("new-upload-id").to_string()),
                parts: vec![PresignedPart {
                    part_number: 1,
                    url: "https://s3/part1".to_string(),
                    expires_at: None,
                }],
                is_multipart: true,
            })
        }

        async fn complete(&self, _object_key: &str, _upload_id: &str, _etags: &[String]) -> Result<(), UploadError> {
            Ok(())
        }

        async fn abort(&self, _object_key: &str, _upload_id: &str) -> Result<(), UploadError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn make_cache(broker: Arc<CountingBroker>, keys: Vec<String>, chunk_size: usize, ttl: Duration) -> UrlCache {
        UrlCache::new(
            broker,
            Retrier::new(3, 10),
            ttl,
            chunk_size,
            keys,
            HashMap::new(),
            Arc::new(Mutex::new(HashMap::new())),
        )
    }

    #[tokio::test]
    async fn caches_until_ttl_expires() {
        let broker = Arc::new(CountingBroker::new());
        let cache = make_cache(broker.clone(), vec!["a".to_string()], 10, Duration::from_millis(50));

        cache.get_regular("a", &NeverInterrupted).await.unwrap();
        cache.get_regular("a", &NeverInterrupted).await.unwrap();
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get_regular("a", &NeverInterrupted).await.unwrap();
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chunks_by_max_chunk_size() {
        let broker = Arc::new(CountingBroker::new());
        let keys: Vec<String> = (0..25).map(|i| format!("k{i}")).collect();
        let cache = make_cache(broker.clone(), keys, 10, Duration::from_secs(60));

        cache.get_regular("k0", &NeverInterrupted).await.unwrap();
        // 25 keys at chunk size 10 => 3 chunks => 3 fetchRegular calls
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_misses_trigger_single_flight_refresh() {
        let broker = Arc::new(CountingBroker::new());
        let cache = Arc::new(make_cache(
            broker.clone(),
            vec!["a".to_string()],
            10,
            Duration::from_secs(60),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_regular("a", &NeverInterrupted).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_propagates_to_all_waiters_and_discards_snapshot() {
        let broker = Arc::new(CountingBroker::new());
        *broker.fail_next.lock().unwrap() = 1;
        let cache = make_cache(broker.clone(), vec!["a".to_string()], 10, Duration::from_secs(60));

        let err = cache.get_regular("a", &NeverInterrupted).await.unwrap_err();
        assert!(matches!(err, UploadError::BrokerFetchFailed(_)));

        // next call retries the refresh from scratch (snapshot was discarded)
        cache.get_regular("a", &NeverInterrupted).await.unwrap();
        assert_eq!(broker.fetch_regular_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn multipart_always_bypasses_cache_and_records_upload_id() {
        let broker = Arc::new(CountingBroker::new());
        let registry: MultipartRegistry = Arc::new(Mutex::new(HashMap::new()));
        let cache = UrlCache::new(
            broker,
            Retrier::new(3, 10),
            Duration::from_secs(60),
            10,
            vec!["obj".to_string()],
            HashMap::new(),
            registry.clone(),
        );

        let url = cache
            .get_multipart("obj", &["d1".to_string()], &NeverInterrupted)
            .await
            .unwrap();
        assert!(url.is_multipart);
        assert_eq!(registry.lock().await.get("obj").cloned(), url.upload_id);
    }
}
