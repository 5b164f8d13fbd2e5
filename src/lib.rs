//! Publishes a batch of local files to an S3-compatible object store using
//! short-lived presigned URLs minted by an external URL broker. The process
//! never holds a long-term S3 credential: every byte is streamed directly to
//! S3 over a presigned HTTP PUT, and multipart completion/abort is reported
//! back to the broker (see `README.md`).

pub mod broker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod interrupter;
pub mod keys;
pub mod pool;
pub mod progress;
pub mod retrier;
pub mod s3_client;
pub mod splitter;
pub mod task;
pub mod xml;

pub use broker::{HttpUrlBrokerClient, PresignedPart, PresignedUrl, UrlBrokerClient};
pub use config::UploadConfig;
pub use coordinator::UploadCoordinator;
pub use error::{ErrorKind, FileUploadFailed, UploadError};
pub use interrupter::{FlagInterrupter, Interrupter, NeverInterrupted};
pub use progress::{FileUploadInfo, NoopProgress, Progress};
pub use s3_client::S3HttpClient;
