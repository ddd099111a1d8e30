//! Uploads-root file layout for attachment audio
//!
//! Translated audio lands under `<uploads-root>/attachments/translated/`
//! and is served back as `/api/v1/attachments/file/translated/<filename>`.
//! Source audio is addressed by the URL stored on the attachment row,
//! URL-decoded and resolved against the uploads root.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// URL prefix the HTTP layer serves attachment files from.
pub const FILE_URL_PREFIX: &str = "/api/v1/attachments/file/";

/// Subdirectory translated audio is written to.
const TRANSLATED_SUBDIR: &str = "attachments/translated";

/// File layout rooted at the uploads directory.
#[derive(Debug, Clone)]
pub struct AudioStorage {
    uploads_root: PathBuf,
}

impl AudioStorage {
    pub fn new(uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: uploads_root.into(),
        }
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    fn translated_dir(&self) -> PathBuf {
        self.uploads_root.join(TRANSLATED_SUBDIR)
    }

    /// File name for a translated audio: `<attachmentId>_<lang>.<ext>`.
    pub fn translated_file_name(attachment_id: &str, language: &str, format: &str) -> String {
        let ext: String = format
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        format!("{}_{}.{}", attachment_id, language, ext)
    }

    /// Write translated audio to disk and return `(absolute path, url)`.
    pub async fn write_translated_audio(
        &self,
        attachment_id: &str,
        language: &str,
        format: &str,
        bytes: &[u8],
    ) -> Result<(PathBuf, String)> {
        let dir = self.translated_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let file_name = Self::translated_file_name(attachment_id, language, format);
        let path = dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing translated audio to {}", path.display()))?;

        debug!(
            attachment_id,
            language,
            bytes = bytes.len(),
            path = %path.display(),
            "Wrote translated audio"
        );
        Ok((path, Self::translated_url(&file_name)))
    }

    /// Public URL for a translated audio file name.
    pub fn translated_url(file_name: &str) -> String {
        format!("{}translated/{}", FILE_URL_PREFIX, file_name)
    }

    /// Resolve an attachment's stored (URL-encoded) file URL to an absolute
    /// path under the uploads root.
    pub fn resolve_source_path(&self, file_url: &str) -> Result<PathBuf> {
        let decoded = urlencoding::decode(file_url)
            .with_context(|| format!("decoding file url {}", file_url))?;
        let relative = decoded
            .strip_prefix(FILE_URL_PREFIX)
            .unwrap_or_else(|| decoded.trim_start_matches('/'));
        Ok(self.uploads_root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_translated_audio_layout() {
        let dir = tempdir().unwrap();
        let storage = AudioStorage::new(dir.path());

        let (path, url) = storage
            .write_translated_audio("att42", "fr", "mp3", b"fake-mp3")
            .await
            .unwrap();

        assert!(path.ends_with("attachments/translated/att42_fr.mp3"));
        assert_eq!(url, "/api/v1/attachments/file/translated/att42_fr.mp3");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"fake-mp3");
    }

    #[test]
    fn test_translated_file_name_sanitizes_format() {
        assert_eq!(
            AudioStorage::translated_file_name("a1", "de", "../mp3"),
            "a1_de.mp3"
        );
        assert_eq!(AudioStorage::translated_file_name("a1", "de", ""), "a1_de.bin");
    }

    #[test]
    fn test_resolve_source_path_decodes_and_strips_prefix() {
        let storage = AudioStorage::new("/data/uploads");
        let path = storage
            .resolve_source_path("/api/v1/attachments/file/voice/msg%201.ogg")
            .unwrap();
        assert_eq!(path, PathBuf::from("/data/uploads/voice/msg 1.ogg"));
    }

    #[test]
    fn test_resolve_source_path_plain_relative() {
        let storage = AudioStorage::new("/data/uploads");
        let path = storage.resolve_source_path("/voice/clip.wav").unwrap();
        assert_eq!(path, PathBuf::from("/data/uploads/voice/clip.wav"));
    }
}
