//! Local-filesystem audio publishing.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::boundary::AudioUploader;
use crate::error::{io_err, RemoteError};

/// Writes audio under `local_path` and serves it from `public_url`.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    local_path: PathBuf,
    public_url: String,
}

impl LocalUploader {
    pub fn new(local_path: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AudioUploader for LocalUploader {
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError> {
        tokio::fs::create_dir_all(&self.local_path)
            .await
            .map_err(|e| io_err(&self.local_path, e))?;
        let path = self.local_path.join(filename);
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(&path, e))?;

        let public_url = format!("{}/{}", self.public_url, filename);
        tracing::info!(filename, size = bytes.len(), path = %path.display(), "audio stored locally");
        Ok(public_url)
    }
}

/// `<artifact id with ':' and '/' replaced>_<YYYYmmdd_HHMMSS>.mp3`
pub fn episode_filename(artifact_ref: &str, at: DateTime<Utc>) -> String {
    let safe_id = artifact_ref.replace([':', '/'], "_");
    format!("{safe_id}_{}.mp3", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn filename_sanitises_artifact_id() {
        let at = Utc.with_ymd_and_hms(2026, 3, 8, 23, 4, 5).unwrap();
        assert_eq!(
            episode_filename("episode:abc/1", at),
            "episode_abc_1_20260308_230405.mp3"
        );
    }

    #[tokio::test]
    async fn upload_writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = LocalUploader::new(dir.path().join("audio"), "http://localhost/audio/");
        let url = uploader.upload(b"ID3", "ep_1.mp3").await.unwrap();
        assert_eq!(url, "http://localhost/audio/ep_1.mp3");
        let written = std::fs::read(dir.path().join("audio").join("ep_1.mp3")).unwrap();
        assert_eq!(written, b"ID3");
        assert!(!dir.path().join("audio").join("ep_1.part").exists());
    }
}
