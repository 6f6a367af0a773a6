//! Temp-file naming and the JSON resume sidecar.
//!
//! A transfer writes to `<final>.temp`; the sidecar `<final>.temp.json`
//! records which remote content those bytes belong to so that a later
//! process only resumes when the server still reports the same validator.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::DownloadError;
use super::constants::{SIDECAR_SUFFIX, TEMP_SUFFIX};
use super::job::ValidatorToken;
use super::segment::Segment;

/// Path of the in-progress temp file for `destination`.
#[must_use]
pub fn temp_path(destination: &Path) -> PathBuf {
    with_suffix(destination, TEMP_SUFFIX)
}

/// Path of the resume sidecar for `destination`.
#[must_use]
pub fn sidecar_path(destination: &Path) -> PathBuf {
    with_suffix(&temp_path(destination), SIDECAR_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// What the temp file holds, persisted next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Source URL the bytes came from.
    pub url: String,
    /// Validator observed when the bytes were written.
    pub validator: Option<ValidatorToken>,
    /// Expected total size.
    pub total_size: Option<u64>,
    /// Segment plan with per-segment progress; empty for single-stream transfers.
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl ResumeRecord {
    /// Whether this record may seed a resume of `url` against `validator`.
    ///
    /// Requires the same URL and an identical, present validator.
    #[must_use]
    pub fn matches(&self, url: &str, validator: Option<&ValidatorToken>) -> bool {
        self.url == url && self.validator.is_some() && self.validator.as_ref() == validator
    }

    /// Loads the sidecar for `destination`.
    ///
    /// A missing or unreadable sidecar yields `None`; a corrupt one is
    /// logged and ignored.
    pub async fn load(destination: &Path) -> Option<Self> {
        let path = sidecar_path(destination);
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt resume sidecar");
                None
            }
        }
    }

    /// Writes the sidecar for `destination`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the file cannot be written.
    pub async fn store(&self, destination: &Path) -> Result<(), DownloadError> {
        let path = sidecar_path(destination);
        let staged = with_suffix(&path, ".tmp");
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| DownloadError::io(&path, std::io::Error::other(e)))?;
        tokio::fs::write(&staged, json)
            .await
            .map_err(|e| DownloadError::io(&staged, e))?;
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        debug!(path = %path.display(), "resume sidecar checkpointed");
        Ok(())
    }
}

/// Removes the sidecar for `destination`, ignoring a missing file.
pub async fn remove_sidecar(destination: &Path) {
    let path = sidecar_path(destination);
    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove resume sidecar");
    }
}

/// Removes the temp file and sidecar for `destination`.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when the temp file exists but cannot be removed.
pub async fn discard_partial(destination: &Path) -> Result<(), DownloadError> {
    let temp = temp_path(destination);
    match tokio::fs::remove_file(&temp).await {
        Ok(()) => debug!(path = %temp.display(), "discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(DownloadError::io(temp, e)),
    }
    remove_sidecar(destination).await;
    Ok(())
}

/// Current length of the temp file for `destination`, `None` when absent.
pub async fn temp_len(destination: &Path) -> Option<u64> {
    tokio::fs::metadata(temp_path(destination))
        .await
        .ok()
        .map(|m| m.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn token(tag: &str) -> ValidatorToken {
        ValidatorToken::from_etag(tag).unwrap()
    }

    #[test]
    fn test_temp_and_sidecar_paths() {
        let dest = Path::new("/out/abc_file.bin");
        assert_eq!(temp_path(dest), PathBuf::from("/out/abc_file.bin.temp"));
        assert_eq!(
            sidecar_path(dest),
            PathBuf::from("/out/abc_file.bin.temp.json")
        );
    }

    #[test]
    fn test_matches_requires_present_identical_validator() {
        let record = ResumeRecord {
            url: "https://example.com/a".to_string(),
            validator: Some(token("\"v1\"")),
            total_size: Some(10),
            segments: Vec::new(),
        };
        assert!(record.matches("https://example.com/a", Some(&token("\"v1\""))));
        assert!(!record.matches("https://example.com/a", Some(&token("\"v2\""))));
        assert!(!record.matches("https://example.com/b", Some(&token("\"v1\""))));
        assert!(!record.matches("https://example.com/a", None));

        let unvalidated = ResumeRecord {
            validator: None,
            ..record
        };
        assert!(!unvalidated.matches("https://example.com/a", None));
    }

    #[tokio::test]
    async fn test_store_load_and_discard() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        let record = ResumeRecord {
            url: "https://example.com/file.bin".to_string(),
            validator: Some(token("\"etag\"")),
            total_size: Some(100),
            segments: vec![Segment {
                start: 0,
                end: 100,
                written: 40,
            }],
        };

        record.store(&dest).await.unwrap();
        tokio::fs::write(temp_path(&dest), b"partial").await.unwrap();
        assert_eq!(ResumeRecord::load(&dest).await, Some(record));
        assert_eq!(temp_len(&dest).await, Some(7));

        discard_partial(&dest).await.unwrap();
        assert_eq!(ResumeRecord::load(&dest).await, None);
        assert_eq!(temp_len(&dest).await, None);
        // discarding twice is fine
        discard_partial(&dest).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_is_ignored() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        tokio::fs::write(sidecar_path(&dest), b"{not json").await.unwrap();
        assert_eq!(ResumeRecord::load(&dest).await, None);
    }
}
