//! Domain events emitted to the real-time fanout layer
//!
//! The WebSocket layer subscribes to the orchestrator's broadcast channel
//! and forwards these to connected clients. Every variant is self-contained
//! so consumers never have to re-read the store to render it.

use serde::{Deserialize, Serialize};

use crate::types::{TranscriptionRecord, TranslatedAudioRecord, TranslationResult};

/// Pipeline phase tag carried on transcription events.
pub const PHASE_TRANSCRIPTION: &str = "transcription";

/// Events the orchestrator emits as work completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DomainEvent {
    /// A text translation finished and was persisted.
    #[serde(rename_all = "camelCase")]
    TranslationReady {
        task_id: String,
        result: TranslationResult,
        target_language: String,
        translation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    /// Phase 1 of the audio pipeline: the transcription is available while
    /// translation and synthesis are still in progress.
    #[serde(rename_all = "camelCase")]
    TranscriptionReady {
        task_id: String,
        message_id: String,
        attachment_id: String,
        transcription: TranscriptionRecord,
        processing_time_ms: u64,
        /// Always [`PHASE_TRANSCRIPTION`].
        phase: String,
    },

    /// Terminal audio-translation event. Single-target tasks and the legacy
    /// bundled completion both land here, carrying every saved entry.
    #[serde(rename_all = "camelCase")]
    AudioTranslationReady {
        task_id: String,
        message_id: String,
        attachment_id: String,
        translations: Vec<TranslatedAudioRecord>,
    },

    /// Non-final per-language completion of a multi-target audio task.
    #[serde(rename_all = "camelCase")]
    AudioTranslationsProgressive {
        task_id: String,
        message_id: String,
        attachment_id: String,
        language: String,
        translation: TranslatedAudioRecord,
    },

    /// Final per-language completion of a multi-target audio task.
    #[serde(rename_all = "camelCase")]
    AudioTranslationsCompleted {
        task_id: String,
        message_id: String,
        attachment_id: String,
        language: String,
        translation: TranslatedAudioRecord,
    },

    /// The audio pipeline failed for an attachment.
    #[serde(rename_all = "camelCase")]
    AudioTranslationError {
        task_id: String,
        message_id: String,
        attachment_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },

    /// A transcription-only job failed.
    #[serde(rename_all = "camelCase")]
    TranscriptionError {
        task_id: String,
        attachment_id: String,
        error: String,
    },

    /// A standalone voice job (no attachment association) completed.
    #[serde(rename_all = "camelCase")]
    VoiceTranslationJobCompleted {
        job_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcription: Option<TranscriptionRecord>,
        translations: Vec<TranslatedAudioRecord>,
    },

    /// A standalone voice job failed.
    #[serde(rename_all = "camelCase")]
    VoiceTranslationJobFailed {
        job_id: String,
        user_id: String,
        error: String,
    },
}

impl DomainEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TranslationReady { .. } => "translationReady",
            DomainEvent::TranscriptionReady { .. } => "transcriptionReady",
            DomainEvent::AudioTranslationReady { .. } => "audioTranslationReady",
            DomainEvent::AudioTranslationsProgressive { .. } => "audioTranslationsProgressive",
            DomainEvent::AudioTranslationsCompleted { .. } => "audioTranslationsCompleted",
            DomainEvent::AudioTranslationError { .. } => "audioTranslationError",
            DomainEvent::TranscriptionError { .. } => "transcriptionError",
            DomainEvent::VoiceTranslationJobCompleted { .. } => "voiceTranslationJobCompleted",
            DomainEvent::VoiceTranslationJobFailed { .. } => "voiceTranslationJobFailed",
        }
    }
}
