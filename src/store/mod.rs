//! Durable persistence contract
//!
//! The orchestrator talks to persistence through the [`Store`] trait; the
//! bundled [`sqlite::SqliteStore`] is the implementation used in tests and
//! single-node deployments. Production deployments can back the same trait
//! with a different engine without touching the orchestrator.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::types::{
    Attachment, ChatMessage, Conversation, ConversationKey, TranscriptionRecord,
    TranslatedAudioRecord, TranslationRecord, VoiceProfile,
};

pub use sqlite::SqliteStore;

/// Persistence operations the orchestrator consumes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the conversation, creating a group conversation with a
    /// synthesized identifier when it does not exist yet.
    async fn create_conversation_if_absent(
        &self,
        conversation_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation>;

    /// Insert a message row. Rejects rows that do not have exactly one of
    /// `sender_id` / `anonymous_sender_id` set.
    async fn insert_message(&self, message: &ChatMessage) -> Result<()>;

    async fn update_conversation_last_message_at(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>>;

    async fn find_attachment(&self, attachment_id: &str) -> Result<Option<Attachment>>;

    /// Set the attachment's transcription. Set once per attachment; a
    /// second write replaces the record wholesale.
    async fn update_attachment_transcription(
        &self,
        attachment_id: &str,
        transcription: &TranscriptionRecord,
    ) -> Result<()>;

    /// Set or replace the attachment's translated-audio entry for one
    /// language.
    async fn update_attachment_translations(
        &self,
        attachment_id: &str,
        language: &str,
        record: &TranslatedAudioRecord,
    ) -> Result<()>;

    /// Delete translation rows for the given targets; returns rows removed.
    async fn delete_translations(&self, message_id: &str, languages: &[String]) -> Result<usize>;

    /// Insert or replace the translation for `(message_id, target_language)`.
    /// Returns the id of the surviving row.
    async fn upsert_translation(&self, record: &TranslationRecord) -> Result<String>;

    async fn find_translation(
        &self,
        message_id: &str,
        target_language: &str,
    ) -> Result<Option<TranslationRecord>>;

    async fn translations_for_message(&self, message_id: &str) -> Result<Vec<TranslationRecord>>;

    /// Bump the per-user translation counter; returns the new value.
    async fn increment_user_translations_used(&self, user_id: &str) -> Result<u64>;

    async fn load_voice_profile(&self, user_id: &str) -> Result<Option<VoiceProfile>>;

    /// Insert or replace the user's voice profile. The stored version is
    /// monotonic: at least one more than any existing version. Returns the
    /// version actually stored.
    async fn upsert_voice_profile(&self, profile: &VoiceProfile) -> Result<u32>;

    async fn load_conversation_encryption_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationKey>>;

    /// Union of the languages spoken by the conversation's active members
    /// (system, regional, and custom destination languages) and active
    /// anonymous participants.
    async fn conversation_languages(&self, conversation_id: &str) -> Result<HashSet<String>>;
}
