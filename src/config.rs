/// Every tunable named in the broker/S3 wire protocol and the retry/cache
/// policy. Constructed directly or via [`UploadConfigBuilder`]; the CLI in
/// `main.rs` builds one from flags the same way the teacher's
/// `build_archive_create` turned `ArgMatches` into an `ArchiveCreate`.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub presigned_url_max_chunk_size: usize,
    pub min_part_size: u64,
    pub multipart_threshold: u64,
    pub multipart_enabled: bool,
    pub connection_timeout_ms: u64,
    pub n_threads: usize,
    pub url_ttl_seconds: u64,
    pub consistency_check_enabled: bool,
    pub path_prefix: String,
    pub artifact_keys_header_limit: usize,
    pub user_agent: String,
}

pub const MIN_PART_SIZE_FLOOR: u64 = 5 * 1024 * 1024;

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            presigned_url_max_chunk_size: 100,
            min_part_size: MIN_PART_SIZE_FLOOR,
            multipart_threshold: 16 * 1024 * 1024,
            multipart_enabled: true,
            connection_timeout_ms: 10_000,
            n_threads: num_cpus::get().clamp(1, 8),
            url_ttl_seconds: 3600,
            consistency_check_enabled: true,
            path_prefix: String::new(),
            artifact_keys_header_limit: 10,
            user_agent: concat!("artifact-uploader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl UploadConfig {
    pub fn builder() -> UploadConfigBuilder {
        UploadConfigBuilder::default()
    }

    /// `ceil(fileSize / minPartSize)` clamped to the effective part size,
    /// i.e. `min_part_size` respecting the 5 MB floor (spec §4.2/§6).
    pub fn effective_min_part_size(&self) -> u64 {
        self.min_part_size.max(MIN_PART_SIZE_FLOOR)
    }

    pub fn effective_multipart_threshold(&self) -> u64 {
        self.multipart_threshold.max(self.effective_min_part_size())
    }
}

#[derive(Debug, Default, Clone)]
pub struct UploadConfigBuilder {
    inner: Option<UploadConfig>,
}

impl UploadConfigBuilder {
    fn base(&mut self) -> &mut UploadConfig {
        self.inner.get_or_insert_with(UploadConfig::default)
    }

    pub fn max_attempts(mut self, v: u32) -> Self {
        self.base().max_attempts = v;
        self
    }

    pub fn base_delay_ms(mut self, v: u64) -> Self {
        self.base().base_delay_ms = v;
        self
    }

    pub fn presigned_url_max_chunk_size(mut self, v: usize) -> Self {
        self.base().presigned_url_max_chunk_size = v;
        self
    }

    pub fn min_part_size(mut self, v: u64) -> Self {
        self.base().min_part_size = v;
        self
    }

    pub fn multipart_threshold(mut self, v: u64) -> Self {
        self.base().multipart_threshold = v;
        self
    }

    pub fn multipart_enabled(mut self, v: bool) -> Self {
        self.base().multipart_enabled = v;
        self
    }

    pub fn connection_timeout_ms(mut self, v: u64) -> Self {
        self.base().connection_timeout_ms = v;
        self
    }

    pub fn n_threads(mut self, v: usize) -> Self {
        self.base().n_threads = v;
        self
    }

    pub fn url_ttl_seconds(mut self, v: u64) -> Self {
        self.base().url_ttl_seconds = v;
        self
    }

    pub fn consistency_check_enabled(mut self, v: bool) -> Self {
        self.base().consistency_check_enabled = v;
        self
    }

    pub fn path_prefix(mut self, v: impl Into<String>) -> Self {
        self.base().path_prefix = v.into();
        self
    }

    pub fn build(mut self) -> UploadConfig {
        self.inner.take().unwrap_or_default()
    }
}
