use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};

use crate::error::UploadError;

/// Handle a caller holds onto after the `DigestingReader` it came from has
/// been consumed (e.g. by `reqwest::Body::wrap_stream`), to read back the
/// digest once the stream has been fully drained.
#[derive(Debug, Clone)]
pub struct DigestHandle(Arc<Mutex<Option<String>>>);

impl DigestHandle {
    /// `None` until the reader has been read to completion; a partial read
    /// (the request aborted mid-body) never publishes a digest, matching the
    /// "on partial read ... digest is undefined" contract (spec §4.1).
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

pin_project! {
    /// Lazily streams bytes from a file (or a `[offset, offset+length)`
    /// slice of one) while simultaneously computing an MD5 digest, so a
    /// single pass over the bytes both feeds the HTTP body and produces the
    /// content hash used for consistency checking (spec §4.1). Each
    /// instance is restartable only in the sense that the Retrier is
    /// expected to construct a fresh one (reopening the file) per attempt;
    /// a used instance carries no "restart" state of its own.
    pub struct DigestingReader {
        #[pin]
        file: tokio::fs::File,
        remaining: u64,
        hasher: Md5,
        digest: Arc<Mutex<Option<String>>>,
        finalized: bool,
    }
}

impl DigestingReader {
    pub async fn open_range(
        path: impl AsRef<Path>,
        offset: u64,
        length: u64,
    ) -> Result<(Self, DigestHandle), UploadError> {
        let mut file = tokio::fs::File::open(path.as_ref()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::FileNotFound(path.as_ref().to_path_buf())
            } else {
                UploadError::Io(e)
            }
        })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let digest = Arc::new(Mutex::new(None));
        let reader = Self {
            file,
            remaining: length,
            hasher: Md5::new(),
            digest: digest.clone(),
            finalized: false,
        };
        Ok((reader, DigestHandle(digest)))
    }

    pub async fn open_file(path: impl AsRef<Path>) -> Result<(Self, DigestHandle), UploadError> {
        let meta = tokio::fs::metadata(path.as_ref()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::FileNotFound(path.as_ref().to_path_buf())
            } else {
                UploadError::Io(e)
            }
        })?;
        Self::open_range(path, 0, meta.len()).await
    }
}

impl AsyncRead for DigestingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();

        if *this.remaining == 0 {
            if !*this.finalized {
                *this.finalized = true;
                let digest = std::mem::take(this.hasher);
                *this.digest.lock().unwrap() = Some(hex_lower(&digest.finalize()));
            }
            return Poll::Ready(Ok(()));
        }

        let cap = buf.remaining().min(*this.remaining as usize);
        let unfilled = buf.initialize_unfilled_to(cap);
        let mut sub = ReadBuf::new(unfilled);
        match this.file.poll_read(cx, &mut sub) {
            Poll::Ready(Ok(())) => {
                let n = sub.filled().len();
                this.hasher.update(sub.filled());
                buf.advance(n);
                *this.remaining -= n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes the digest of a byte range without needing an HTTP body to
/// stream into; used by `FileSplitter` to precompute per-part digests.
pub async fn digest_range(path: impl AsRef<Path>, offset: u64, length: u64) -> Result<String, UploadError> {
    let (mut reader, handle) = DigestingReader::open_range(path, offset, length).await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(handle.get().expect("digest available after full drain"))
}

pub async fn digest_file(path: impl AsRef<Path>) -> Result<String, UploadError> {
    let meta = tokio::fs::metadata(path.as_ref()).await?;
    digest_range(path, 0, meta.len()).await
}

/// `multipartDigest(etags) = md5(concat(decodeHex(etag_i))) + "-" + N`
/// (spec §8 R2, GLOSSARY "ETag").
pub fn multipart_digest(etags: &[String]) -> Result<String, UploadError> {
    let mut hasher = Md5::new();
    for etag in etags {
        let bytes = decode_hex(etag.trim_matches('"')).map_err(|_| {
            UploadError::BrokerShape(format!("ETag is not valid hex: {etag}"))
        })?;
        hasher.update(&bytes);
    }
    Ok(format!("{}-{}", hex_lower(&hasher.finalize()), etags.len()))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}
