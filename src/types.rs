//! Shared domain types used across modules
//!
//! This module contains the message, translation, and voice-profile types
//! that are used by multiple modules to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a message's content is protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Plaintext storage.
    #[default]
    None,
    /// End-to-end encrypted; content is opaque to the server.
    E2ee,
    /// Server-side encryption with a conversation key the server holds.
    Server,
    /// E2EE payload preserved alongside a server-decryptable payload.
    Hybrid,
}

impl EncryptionMode {
    /// True when the server holds a key and stored translations must be
    /// encrypted at rest.
    pub fn requires_server_encryption(&self) -> bool {
        matches!(self, EncryptionMode::Server | EncryptionMode::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::E2ee => "e2ee",
            EncryptionMode::Server => "server",
            EncryptionMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(EncryptionMode::None),
            "e2ee" => Some(EncryptionMode::E2ee),
            "server" => Some(EncryptionMode::Server),
            "hybrid" => Some(EncryptionMode::Hybrid),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A conversation row as the orchestrator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Human-readable identifier, e.g. `mshy_team-chat-20250514120000`.
    pub identifier: String,
    pub title: Option<String>,
    pub kind: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A persisted chat message.
///
/// Exactly one of `sender_id` or `anonymous_sender_id` is set; the store
/// rejects rows violating that. Messages are never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_sender_id: Option<String>,
    pub content: String,
    pub original_language: String,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub encryption_mode: EncryptionMode,
    /// Preferred worker model for this message, if the author chose one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// The author the per-user translation counter is attributed to.
    pub fn author_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }
}

/// Incoming message descriptor for ingest.
///
/// When `id` is set the call is a retranslation of an existing message and
/// no new row is inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_sender_id: Option<String>,
    pub content: String,
    pub original_language: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub encryption_mode: EncryptionMode,
    /// Restrict the fanout to a single target language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    /// Caller override for the worker model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    /// Title used when the conversation has to be created on the fly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl Default for NewMessage {
    fn default() -> Self {
        Self {
            id: None,
            conversation_id: String::new(),
            sender_id: None,
            anonymous_sender_id: None,
            content: String::new(),
            original_language: String::new(),
            message_type: default_message_type(),
            reply_to_id: None,
            encryption_mode: EncryptionMode::None,
            target_language: None,
            model_type: None,
            conversation_title: None,
        }
    }
}

/// Outcome of the synchronous half of message ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    E2eeSkipped,
    MessageSaved,
    RetranslationQueued,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::E2eeSkipped => "e2ee_skipped",
            IngestStatus::MessageSaved => "message_saved",
            IngestStatus::RetranslationQueued => "retranslation_queued",
        }
    }
}

/// Response returned to the caller of `handle_new_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub message_id: String,
    pub status: IngestStatus,
    pub translation_queued: bool,
}

/// A completed translation as delivered by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    pub target_language: String,
    pub translated_text: String,
    pub translator_model: String,
    pub confidence_score: f32,
    pub processing_time_ms: u64,
}

/// A stored translation row.
///
/// `(message_id, target_language)` is unique. When `is_encrypted` is set,
/// `key_id`, `iv`, and `auth_tag` are all present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub id: String,
    pub message_id: String,
    pub target_language: String,
    pub translated_content: String,
    pub translation_model: String,
    pub confidence_score: f32,
    pub is_encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where an audio transcription came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionSource {
    Mobile,
    Whisper,
    VoiceApi,
}

/// Transcription of an audio attachment. Set exactly once per attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRecord {
    pub text: String,
    pub language: String,
    pub confidence: f32,
    pub source: TranscriptionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_speaker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_voice_identified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_speaker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_analysis: Option<serde_json::Value>,
    pub duration_ms: u64,
}

/// A per-language translated audio entry on an attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedAudioRecord {
    pub target_language: String,
    pub translated_text: String,
    /// Absolute path of the synthesized audio on disk; empty when the
    /// worker delivered text only.
    pub storage_path: String,
    /// Public URL the file is served from; empty when no audio was written.
    pub url: String,
    pub duration_ms: u64,
    pub format: String,
    pub voice_cloned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_quality: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audio attachment metadata with its processing results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub file_name: String,
    /// Stored URL the source audio is addressed by (URL-encoded).
    pub file_url: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionRecord>,
    /// Per-language translated audio, keyed by target language.
    #[serde(default)]
    pub translations: BTreeMap<String, TranslatedAudioRecord>,
}

impl Attachment {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Symmetric conversation key used for server-mode encryption at rest.
#[derive(Debug, Clone)]
pub struct ConversationKey {
    pub key_id: String,
    pub conversation_id: String,
    /// 32-byte AES-256 key.
    pub key: Vec<u8>,
}

/// A user's voice profile used for voice cloning.
///
/// One profile per user; `version` increases monotonically across
/// replacements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub user_id: String,
    pub profile_id: String,
    pub embedding: Vec<u8>,
    pub quality_score: f32,
    pub audio_count: u32,
    pub total_duration_ms: u64,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_characteristics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chatterbox_conditionals: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_url: Option<String>,
}

/// Worker model tier for short content.
pub const MODEL_MEDIUM: &str = "medium";
/// Worker model tier for long content.
pub const MODEL_PREMIUM: &str = "premium";
/// Model tag on results produced without a worker (timeout/error path).
pub const MODEL_FALLBACK: &str = "fallback";

/// Content length at which model selection switches to the premium tier.
pub const PREMIUM_CONTENT_THRESHOLD: usize = 80;

/// Pick the worker model: caller override, then the message's own
/// preference, then by content length.
pub fn select_model_type(
    caller: Option<&str>,
    message_preference: Option<&str>,
    content: &str,
) -> String {
    if let Some(m) = caller {
        return m.to_string();
    }
    if let Some(m) = message_preference {
        return m.to_string();
    }
    if content.chars().count() < PREMIUM_CONTENT_THRESHOLD {
        MODEL_MEDIUM.to_string()
    } else {
        MODEL_PREMIUM.to_string()
    }
}

/// Synthesize a human-readable conversation identifier from a title.
///
/// Shape: `mshy_<slug>-<YYYYMMDDHHMMSS>`. The slug is the lowercased title
/// with everything but alphanumerics and dashes stripped and runs of dashes
/// collapsed.
pub fn conversation_identifier(title: Option<&str>, at: DateTime<Utc>) -> String {
    let slug = slugify(title.unwrap_or("conversation"));
    let slug = if slug.is_empty() { "conversation".to_string() } else { slug };
    format!("mshy_{}-{}", slug, at.format("%Y%m%d%H%M%S"))
}

fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if c == '-' {
            if !last_dash && !slug.is_empty() {
                slug.push('-');
                last_dash = true;
            }
        }
        // everything else is stripped
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encryption_mode_roundtrip() {
        for mode in [
            EncryptionMode::None,
            EncryptionMode::E2ee,
            EncryptionMode::Server,
            EncryptionMode::Hybrid,
        ] {
            assert_eq!(EncryptionMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(EncryptionMode::parse("garbage"), None);
    }

    #[test]
    fn test_server_encryption_requirement() {
        assert!(!EncryptionMode::None.requires_server_encryption());
        assert!(!EncryptionMode::E2ee.requires_server_encryption());
        assert!(EncryptionMode::Server.requires_server_encryption());
        assert!(EncryptionMode::Hybrid.requires_server_encryption());
    }

    #[test]
    fn test_model_selection_priority() {
        assert_eq!(select_model_type(Some("premium"), Some("medium"), "hi"), "premium");
        assert_eq!(select_model_type(None, Some("medium"), &"x".repeat(200)), "medium");
        assert_eq!(select_model_type(None, None, "short"), MODEL_MEDIUM);
        assert_eq!(select_model_type(None, None, &"x".repeat(80)), MODEL_PREMIUM);
        assert_eq!(select_model_type(None, None, &"x".repeat(79)), MODEL_MEDIUM);
    }

    #[test]
    fn test_conversation_identifier_shape() {
        let at = Utc.with_ymd_and_hms(2025, 5, 14, 12, 0, 0).unwrap();
        let id = conversation_identifier(Some("Team-Chat! (FR/EN)"), at);
        assert_eq!(id, "mshy_team-chatfren-20250514120000");
    }

    #[test]
    fn test_conversation_identifier_collapses_dashes() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let id = conversation_identifier(Some("a--b---c"), at);
        assert_eq!(id, "mshy_a-b-c-20250102030405");
    }

    #[test]
    fn test_conversation_identifier_empty_title() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let id = conversation_identifier(Some("!!!"), at);
        assert!(id.starts_with("mshy_conversation-"));
        let id = conversation_identifier(None, at);
        assert!(id.starts_with("mshy_conversation-"));
    }

    #[test]
    fn test_ingest_status_strings() {
        assert_eq!(IngestStatus::E2eeSkipped.as_str(), "e2ee_skipped");
        assert_eq!(IngestStatus::MessageSaved.as_str(), "message_saved");
        assert_eq!(IngestStatus::RetranslationQueued.as_str(), "retranslation_queued");
    }
}
