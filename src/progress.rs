use std::path::PathBuf;

use crate::error::UploadError;

/// One successfully uploaded file, as returned in the batch result list
/// (spec §6 "Return value").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadInfo {
    pub artifact_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub digest: String,
}

/// Observable events a caller can hook into. All methods are optional;
/// structured logging of the same events happens independently via
/// `tracing` regardless of what a caller implements here (spec §7
/// "User-visible behavior").
pub trait Progress: Send + Sync {
    fn on_file_started(&self, _object_key: &str, _size: u64) {}

    fn on_part_success(&self, _object_key: &str, _part_number: u32, _url_without_query: &str) {}

    fn on_file_success(&self, _info: &FileUploadInfo) {}

    fn on_file_failure(&self, _object_key: &str, _error: &UploadError) {}

    /// `percent = 100 - round(remainingBytes * 100 / totalBytes)` (spec §4.7).
    fn on_progress(&self, _object_key: &str, _percent: u8) {}
}

#[derive(Debug, Default)]
pub struct NoopProgress;

impl Progress for NoopProgress {}

pub fn percent_complete(remaining_bytes: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let remaining_pct = (remaining_bytes as f64 * 100.0 / total_bytes as f64).round();
    (100.0 - remaining_pct).clamp(0.0, 100.0) as u8
}
