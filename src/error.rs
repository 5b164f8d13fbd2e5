use std::path::PathBuf;

/// Coarse classification used by the retrier and the coordinator to decide
/// whether to retry, abort immediately, or treat a failure as interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Interrupted,
    FileNotFound,
    BrokerFetchFailed,
    BrokerShape,
    BrokerShutdown,
    S3Transport,
    S3Permanent,
    ConsistencyMismatch,
    MultipartFinalizeFailed,
    InvalidPartCount,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload interrupted: {0}")]
    Interrupted(String),

    #[error("source file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("part count {0} is out of bounds (must be 1..=10000)")]
    InvalidPartCount(usize),

    #[error("failed to fetch presigned URLs from broker: {0}")]
    BrokerFetchFailed(String),

    #[error("broker response was malformed: {0}")]
    BrokerShape(String),

    #[error("broker client used after shutdown")]
    BrokerShutdown,

    #[error("S3 transport error: {0}")]
    S3Transport(String),

    #[error("S3 permanent error: {0}")]
    S3Permanent(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    ConsistencyMismatch { expected: String, actual: String },

    #[error("failed to finalize multipart upload for {object_key}: {message}")]
    MultipartFinalizeFailed { object_key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Interrupted(_) => ErrorKind::Interrupted,
            Self::FileNotFound(_) => ErrorKind::FileNotFound,
            Self::InvalidPartCount(_) => ErrorKind::InvalidPartCount,
            Self::BrokerFetchFailed(_) => ErrorKind::BrokerFetchFailed,
            Self::BrokerShape(_) => ErrorKind::BrokerShape,
            Self::BrokerShutdown => ErrorKind::BrokerShutdown,
            Self::S3Transport(_) => ErrorKind::S3Transport,
            Self::S3Permanent(_) => ErrorKind::S3Permanent,
            Self::ConsistencyMismatch { .. } => ErrorKind::ConsistencyMismatch,
            Self::MultipartFinalizeFailed { .. } => ErrorKind::MultipartFinalizeFailed,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.kind(), ErrorKind::Interrupted)
    }

    /// Whether the Retrier should try again after this error, given enough
    /// attempts remain. BrokerFetchFailed, S3Transport, ConsistencyMismatch
    /// and MultipartFinalizeFailed are retriable; everything else is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BrokerFetchFailed
                | ErrorKind::S3Transport
                | ErrorKind::ConsistencyMismatch
                | ErrorKind::MultipartFinalizeFailed
        )
    }
}

/// Batch-level error returned by the coordinator once a (non-interrupted)
/// task failure is the first to surface. Earlier successes are discarded:
/// all-or-fail semantics at the batch boundary.
#[derive(Debug, thiserror::Error)]
#[error("upload failed for {absolute_path:?} => {object_key}: {source}")]
pub struct FileUploadFailed {
    pub absolute_path: PathBuf,
    pub object_key: String,
    #[source]
    pub source: UploadError,
    pub fatal: bool,
}

impl FileUploadFailed {
    /// `fatal` is always true here: a `FileUploadFailed` is only ever
    /// constructed once a failure has become terminal at the batch boundary
    /// — either the underlying error was non-recoverable to begin with, or
    /// the Retrier already exhausted its attempt budget on a recoverable one
    /// (spec §7). `source.is_recoverable()` describes per-attempt retry
    /// eligibility, not whether the batch can still succeed, so it must not
    /// be used to compute this flag.
    pub fn new(absolute_path: PathBuf, object_key: String, source: UploadError) -> Self {
        Self {
            absolute_path,
            object_key,
            source,
            fatal: true,
        }
    }
}
