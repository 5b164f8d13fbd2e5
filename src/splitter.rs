use std::path::Path;

use crate::digest;
use crate::error::UploadError;

pub const S3_MAX_PARTS: usize = 10_000;

/// `{ index: 0-based, offset, length, digest }` (spec §3). Part lengths sum
/// to the file length; every part except possibly the last has length
/// `>= min_part_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub index: usize,
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
    pub digest: Option<String>,
}

pub struct FileSplitter;

impl FileSplitter {
    /// `partCount = ceil(fileSize / minPartSize)`, rejecting counts outside
    /// `1..=10000` (the S3 limit, spec §4.2).
    pub fn part_count(file_size: u64, min_part_size: u64) -> Result<usize, UploadError> {
        let min_part_size = min_part_size.max(1);
        let count = file_size.div_ceil(min_part_size).max(1) as usize;
        if count == 0 || count > S3_MAX_PARTS {
            return Err(UploadError::InvalidPartCount(count));
        }
        Ok(count)
    }

    /// Splits `path` (known to be `file_size` bytes) into ordered parts.
    /// Each part gets offset stride `min_part_size` except the last, which
    /// carries the remainder. When `want_digests` is set, each part's digest
    /// is computed with a single streamed pass through its byte range.
    pub async fn split(
        path: &Path,
        file_size: u64,
        min_part_size: u64,
        want_digests: bool,
    ) -> Result<Vec<FilePart>, UploadError> {
        let count = Self::part_count(file_size, min_part_size)?;
        let mut parts = Vec::with_capacity(count);
        let mut offset = 0u64;
        for index in 0..count {
            let length = if index + 1 == count {
                file_size - offset
            } else {
                min_part_size
            };
            let part_digest = if want_digests {
                Some(digest::digest_range(path, offset, length).await?)
            } else {
                None
            };
            parts.push(FilePart {
                index,
                part_number: index as u32 + 1,
                offset,
                length,
                digest: part_digest,
            });
            offset += length;
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn part_count_is_ceiling_division() {
        assert_eq!(FileSplitter::part_count(11 * 1024 * 1024, 5 * 1024 * 1024).unwrap(), 3);
        assert_eq!(FileSplitter::part_count(10 * 1024 * 1024, 5 * 1024 * 1024).unwrap(), 2);
        assert_eq!(FileSplitter::part_count(0, 5 * 1024 * 1024).unwrap(), 1);
    }

    #[test]
    fn part_count_rejects_too_many_parts() {
        let err = FileSplitter::part_count(u64::MAX / 2, 1).unwrap_err();
        assert!(matches!(err, UploadError::InvalidPartCount(_)));
    }

    #[tokio::test]
    async fn splits_into_parts_summing_to_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeros.dat");
        let size = 11 * 1024 * 1024;
        {
            let mut f = tokio::fs::File::create(&path).await.unwrap();
            f.write_all(&vec![0u8; size]).await.unwrap();
        }
        let parts = FileSplitter::split(&path, size as u64, 5 * 1024 * 1024, false)
            .await
            .unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].length, 5 * 1024 * 1024);
        assert_eq!(parts[1].length, 5 * 1024 * 1024);
        assert_eq!(parts[2].length, 1024 * 1024);
        let total: u64 = parts.iter().map(|p| p.length).sum();
        assert_eq!(total, size as u64);
        assert_eq!(parts.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn computes_digests_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.dat");
        tokio::fs::File::create(&path)
            .await
            .unwrap()
            .write_all(b"hello world\n")
            .await
            .unwrap();
        let parts = FileSplitter::split(&path, 12, 5, true).await.unwrap();
        assert!(parts.iter().all(|p| p.digest.is_some()));
    }
}
