//! Orchestration error taxonomy
//!
//! Most code paths use `anyhow::Result`; this enum exists for the failures
//! callers branch on (validation vs consent vs transport vs decryption).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Referenced message does not exist.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// Referenced attachment does not exist.
    #[error("attachment not found: {0}")]
    AttachmentNotFound(String),

    /// Attachment is not audio and cannot enter the voice pipeline.
    #[error("attachment {attachment_id} is not audio (mime type {mime_type})")]
    NotAudio {
        attachment_id: String,
        mime_type: String,
    },

    /// Sender has not granted the capability required for the operation.
    #[error("consent denied for user {user_id}: {capability}")]
    ConsentDenied {
        user_id: String,
        capability: &'static str,
    },

    /// Authenticated decryption failed (key mismatch or tampered data).
    #[error("decryption failed: {0}")]
    Decryption(String),
}
