use std::path::{Path, PathBuf};

/// `pathPrefix + normalizedArtifactPath` (spec §3). Normalization strips
/// leading `/` and collapses `\` to `/` so Windows-style logical paths still
/// produce a clean S3 key.
pub fn object_key(path_prefix: &str, artifact_path: &str) -> String {
    let normalized = artifact_path.replace('\\', "/");
    let normalized = normalized.trim_start_matches('/');
    format!("{path_prefix}{normalized}")
}

/// One normalized submission: the object key it resolves to, the source
/// file, and the logical path the caller supplied for it.
#[derive(Debug, Clone)]
pub struct NormalizedEntry {
    pub object_key: String,
    pub absolute_path: PathBuf,
    pub artifact_path: String,
}

/// Resolves a `{file -> logicalPath}` map to `{objectKey -> entry}`,
/// resolving collisions last-write-wins and returning the discarded
/// `(object_key, absolute_path)` pairs so the caller can log a warning for
/// each one (spec §4.8 step 1).
pub fn normalize(
    path_prefix: &str,
    files: impl IntoIterator<Item = (PathBuf, String)>,
) -> (Vec<NormalizedEntry>, Vec<(String, PathBuf)>) {
    let mut by_key: Vec<NormalizedEntry> = Vec::new();
    let mut collisions = Vec::new();

    for (absolute_path, artifact_path) in files {
        let key = object_key(path_prefix, &artifact_path);
        if let Some(existing) = by_key.iter_mut().find(|e| e.object_key == key) {
            collisions.push((key.clone(), existing.absolute_path.clone()));
            existing.absolute_path = absolute_path;
            existing.artifact_path = artifact_path;
        } else {
            by_key.push(NormalizedEntry {
                object_key: key,
                absolute_path,
                artifact_path,
            });
        }
    }

    (by_key, collisions)
}

pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
