//! Translation worker transport
//!
//! Two interaction shapes with the worker pool:
//! - Request/reply: a request goes out, the bus assigns a task id, and
//!   completion events arrive later on the subscribe side.
//! - Multipart binary: audio jobs carry the raw audio bytes next to the
//!   metadata envelope; completion events may carry binary audio back.
//!
//! The concrete transport (AMQP, Redis streams, ...) lives outside this
//! crate. It implements [`BusClient`] and feeds [`BusEvent`] values into the
//! channel handed to the orchestrator.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::types::{TranscriptionRecord, VoiceProfile};

/// Binary payload on a bus frame.
///
/// Binary frames are preferred; base64 is a compatibility fallback and is
/// accepted on ingest.
#[derive(Debug, Clone)]
pub enum AudioPayload {
    Binary(Vec<u8>),
    Base64(String),
}

impl AudioPayload {
    /// Decode to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self {
            AudioPayload::Binary(bytes) => Ok(bytes.clone()),
            AudioPayload::Base64(text) => general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| anyhow!("invalid base64 audio payload: {}", e)),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, AudioPayload::Binary(_))
    }

    /// Decoded length without keeping the bytes around.
    pub fn len_hint(&self) -> usize {
        match self {
            AudioPayload::Binary(bytes) => bytes.len(),
            AudioPayload::Base64(text) => text.len() / 4 * 3,
        }
    }
}

/// Fanout translation request for a persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub message_id: String,
    pub text: String,
    pub source_language: String,
    pub target_languages: Vec<String>,
    pub conversation_id: String,
    pub model_type: String,
}

/// Voice profile material shipped with an audio job so the worker can clone
/// the sender's voice. Binary fields travel base64-encoded in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfileUpload {
    pub profile_id: String,
    pub embedding_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chatterbox_conditionals_b64: Option<String>,
    pub quality_score: f32,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_url: Option<String>,
}

impl VoiceProfileUpload {
    pub fn from_profile(profile: &VoiceProfile) -> Self {
        Self {
            profile_id: profile.profile_id.clone(),
            embedding_b64: general_purpose::STANDARD.encode(&profile.embedding),
            chatterbox_conditionals_b64: profile
                .chatterbox_conditionals
                .as_ref()
                .map(|c| general_purpose::STANDARD.encode(c)),
            quality_score: profile.quality_score,
            version: profile.version,
            reference_audio_id: profile.reference_audio_id.clone(),
            reference_audio_url: profile.reference_audio_url.clone(),
        }
    }
}

/// Combined transcribe + translate + synthesize job for an audio attachment.
///
/// The raw audio bytes ride alongside this envelope as a binary part; URLs
/// are never sent to workers.
#[derive(Debug, Clone)]
pub struct AudioJobRequest {
    pub message_id: String,
    pub attachment_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub audio: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub duration_ms: u64,
    pub target_languages: Vec<String>,
    pub mobile_transcription: Option<TranscriptionRecord>,
    pub generate_voice_clone: bool,
    pub model_type: Option<String>,
    pub user_language: Option<String>,
    pub voice_profile: Option<VoiceProfileUpload>,
}

/// Transcription-only job (no translation or synthesis).
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub message_id: Option<String>,
    pub attachment_id: String,
    pub conversation_id: String,
    pub audio: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub language_hint: Option<String>,
}

/// Client half of the worker transport. Each request returns the task id
/// the bus assigned; completion arrives asynchronously as a [`BusEvent`].
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn request_translation(&self, request: TranslationRequest) -> Result<String>;

    async fn request_audio_job(&self, request: AudioJobRequest) -> Result<String>;

    async fn request_transcription(&self, request: TranscriptionRequest) -> Result<String>;
}

/// Per-language translated audio as delivered by a worker.
#[derive(Debug, Clone)]
pub struct TranslatedAudioEvent {
    pub target_language: String,
    pub translated_text: String,
    /// Synthesized audio; absent when the worker produced text only.
    pub payload: Option<AudioPayload>,
    /// Container format, doubles as the file extension ("mp3", "wav", ...).
    pub format: String,
    pub duration_ms: u64,
    pub voice_cloned: bool,
    pub voice_quality: Option<f32>,
    pub segments: Option<serde_json::Value>,
    pub tts_model: Option<String>,
}

/// A freshly built voice profile bundled on a legacy completion.
#[derive(Debug, Clone)]
pub struct NewVoiceProfileEvent {
    pub profile_id: String,
    pub embedding: AudioPayload,
    pub quality_score: f32,
    pub audio_count: u32,
    pub total_duration_ms: u64,
    pub version: u32,
    pub fingerprint: Option<String>,
    pub voice_characteristics: Option<serde_json::Value>,
    pub chatterbox_conditionals: Option<AudioPayload>,
    pub reference_audio_id: Option<String>,
    pub reference_audio_url: Option<String>,
}

/// Result block of a standalone voice job.
#[derive(Debug, Clone, Default)]
pub struct VoiceJobResult {
    pub transcription: Option<TranscriptionRecord>,
    pub translations: Vec<TranslatedAudioEvent>,
}

/// Events delivered on the subscribe side of the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TranslationCompleted {
        task_id: String,
        result: crate::types::TranslationResult,
        metadata: Option<serde_json::Value>,
    },
    TranslationError {
        task_id: String,
        message_id: String,
        conversation_id: String,
        error: String,
    },
    TranscriptionReady {
        task_id: String,
        message_id: String,
        attachment_id: String,
        transcription: TranscriptionRecord,
        processing_time_ms: u64,
    },
    /// Single-target terminal audio translation.
    AudioTranslationReady {
        task_id: String,
        message_id: String,
        attachment_id: String,
        language: String,
        translated_audio: TranslatedAudioEvent,
    },
    /// Multi-target, non-final per-language result.
    AudioTranslationsProgressive {
        task_id: String,
        message_id: String,
        attachment_id: String,
        language: String,
        translated_audio: TranslatedAudioEvent,
    },
    /// Multi-target, final per-language result.
    AudioTranslationsCompleted {
        task_id: String,
        message_id: String,
        attachment_id: String,
        language: String,
        translated_audio: TranslatedAudioEvent,
    },
    /// Legacy one-shot completion bundling every phase.
    AudioProcessCompleted {
        task_id: String,
        message_id: String,
        attachment_id: String,
        transcription: Option<TranscriptionRecord>,
        translations: Vec<TranslatedAudioEvent>,
        voice_profile: Option<NewVoiceProfileEvent>,
    },
    AudioProcessError {
        task_id: String,
        message_id: String,
        attachment_id: String,
        error: String,
        error_code: Option<String>,
    },
    /// Transcription-only job finished.
    TranscriptionCompleted {
        task_id: String,
        message_id: Option<String>,
        attachment_id: String,
        transcription: TranscriptionRecord,
        processing_time_ms: u64,
    },
    TranscriptionError {
        task_id: String,
        attachment_id: String,
        error: String,
    },
    /// Standalone voice job keyed on `job_id`.
    VoiceTranslationCompleted {
        job_id: String,
        user_id: String,
        result: VoiceJobResult,
    },
    VoiceTranslationFailed {
        job_id: String,
        user_id: String,
        error: String,
    },
}

impl BusEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::TranslationCompleted { .. } => "translationCompleted",
            BusEvent::TranslationError { .. } => "translationError",
            BusEvent::TranscriptionReady { .. } => "transcriptionReady",
            BusEvent::AudioTranslationReady { .. } => "audioTranslationReady",
            BusEvent::AudioTranslationsProgressive { .. } => "audioTranslationsProgressive",
            BusEvent::AudioTranslationsCompleted { .. } => "audioTranslationsCompleted",
            BusEvent::AudioProcessCompleted { .. } => "audioProcessCompleted",
            BusEvent::AudioProcessError { .. } => "audioProcessError",
            BusEvent::TranscriptionCompleted { .. } => "transcriptionCompleted",
            BusEvent::TranscriptionError { .. } => "transcriptionError",
            BusEvent::VoiceTranslationCompleted { .. } => "voiceTranslationCompleted",
            BusEvent::VoiceTranslationFailed { .. } => "voiceTranslationFailed",
        }
    }
}

/// Error string workers use when the translation pool rejects a task.
pub const POOL_FULL_ERROR: &str = "translation pool full";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_payload_binary_passthrough() {
        let payload = AudioPayload::Binary(vec![1, 2, 3, 4]);
        assert!(payload.is_binary());
        assert_eq!(payload.decode().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_audio_payload_base64_fallback() {
        let encoded = general_purpose::STANDARD.encode(b"opus-frame");
        let payload = AudioPayload::Base64(encoded);
        assert!(!payload.is_binary());
        assert_eq!(payload.decode().unwrap(), b"opus-frame");
    }

    #[test]
    fn test_audio_payload_invalid_base64() {
        let payload = AudioPayload::Base64("not valid base64!!!".to_string());
        assert!(payload.decode().is_err());
    }

    #[test]
    fn test_voice_profile_upload_encodes_binary_fields() {
        let profile = VoiceProfile {
            user_id: "u1".to_string(),
            profile_id: "p1".to_string(),
            embedding: vec![9, 8, 7],
            quality_score: 0.9,
            audio_count: 3,
            total_duration_ms: 4500,
            version: 2,
            fingerprint: None,
            voice_characteristics: None,
            chatterbox_conditionals: Some(vec![1, 1, 2, 3]),
            reference_audio_id: None,
            reference_audio_url: None,
        };
        let upload = VoiceProfileUpload::from_profile(&profile);
        assert_eq!(
            general_purpose::STANDARD.decode(&upload.embedding_b64).unwrap(),
            vec![9, 8, 7]
        );
        assert_eq!(
            general_purpose::STANDARD
                .decode(upload.chatterbox_conditionals_b64.as_deref().unwrap())
                .unwrap(),
            vec![1, 1, 2, 3]
        );
        assert_eq!(upload.version, 2);
    }
}
