//! Audio attachment pipeline
//!
//! Voice messages ride the same orchestration model as text: a combined
//! transcribe + translate + synthesize job is dispatched over the bus and
//! completion arrives in two phases. First the transcription, so clients
//! can show text immediately, then one result per target language. A
//! legacy one-shot completion bundling everything is still accepted.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::bus::{
    AudioJobRequest, NewVoiceProfileEvent, TranscriptionRequest, TranslatedAudioEvent,
    VoiceJobResult, VoiceProfileUpload,
};
use crate::consent::ConsentStatus;
use crate::error::OrchestratorError;
use crate::events::{DomainEvent, PHASE_TRANSCRIPTION};
use crate::types::{Attachment, TranscriptionRecord, TranslatedAudioRecord, VoiceProfile};

use super::pending::TaskContext;
use super::service::TranslationOrchestrator;

/// Inputs to [`TranslationOrchestrator::process_audio_attachment`].
#[derive(Debug, Clone)]
pub struct AudioJobParams {
    pub message_id: String,
    pub attachment_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub audio_path: PathBuf,
    pub mime_type: String,
    pub audio_duration_ms: u64,
    /// Transcription the mobile client already produced on-device.
    pub mobile_transcription: Option<TranscriptionRecord>,
    pub generate_voice_clone: bool,
    pub model_type: Option<String>,
    pub user_language: Option<String>,
}

/// How a per-language audio completion terminates its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AudioCompletionKind {
    /// Single-target task; this event is terminal.
    Single,
    /// Multi-target task, more languages still coming.
    Progressive,
    /// Multi-target task, last language.
    Final,
}

/// Attachment metadata without the embedded processing results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub file_name: String,
    pub file_url: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl From<&Attachment> for AttachmentSummary {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            message_id: attachment.message_id.clone(),
            conversation_id: attachment.conversation_id.clone(),
            file_name: attachment.file_name.clone(),
            file_url: attachment.file_url.clone(),
            mime_type: attachment.mime_type.clone(),
            duration_ms: attachment.duration_ms,
        }
    }
}

/// Read-path projection of an attachment and its processing results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentWithTranscription {
    pub attachment: AttachmentSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionRecord>,
    pub translated_audios: Vec<TranslatedAudioRecord>,
}

/// Result of re-dispatching an attachment through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetransmitOutcome {
    pub task_id: String,
    pub attachment: AttachmentSummary,
}

impl TranslationOrchestrator {
    /// Dispatch a voice message through the audio pipeline.
    ///
    /// Returns `None` when the sender has not consented to transcription;
    /// lesser consent gaps narrow the job (no translated audio, no voice
    /// cloning) instead of aborting it.
    pub async fn process_audio_attachment(&self, params: AudioJobParams) -> Result<Option<String>> {
        let consent = if self.config.bypass_voice_consent_check {
            ConsentStatus::allow_all()
        } else {
            self.consent.get_consent_status(&params.sender_id).await?
        };

        if !consent.can_transcribe_audio {
            warn!(
                user_id = %params.sender_id,
                attachment_id = %params.attachment_id,
                "Transcription consent missing; audio job aborted"
            );
            return Ok(None);
        }
        if !consent.can_translate_audio {
            warn!(
                user_id = %params.sender_id,
                "Audio translation consent missing; worker may refuse translation"
            );
        }

        let target_languages = if consent.can_generate_translated_audio {
            let source = params.user_language.as_deref().unwrap_or("auto");
            let resolved = self
                .resolve_targets(&params.conversation_id, None, source)
                .await?;
            if resolved.is_empty() {
                self.config.audio_fallback_languages.clone()
            } else {
                resolved
            }
        } else {
            // Transcription only.
            Vec::new()
        };

        let generate_voice_clone = params.generate_voice_clone && consent.can_use_voice_cloning;
        if params.generate_voice_clone && !generate_voice_clone {
            warn!(user_id = %params.sender_id, "Voice cloning disabled by consent");
        }

        let voice_profile = self
            .store
            .load_voice_profile(&params.sender_id)
            .await?
            .as_ref()
            .map(VoiceProfileUpload::from_profile);

        // The worker gets the raw bytes; URLs are never shipped.
        let audio = tokio::fs::read(&params.audio_path)
            .await
            .with_context(|| format!("reading source audio {}", params.audio_path.display()))?;
        let file_name = params
            .audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| params.attachment_id.clone());

        let request = AudioJobRequest {
            message_id: params.message_id.clone(),
            attachment_id: params.attachment_id.clone(),
            conversation_id: params.conversation_id.clone(),
            sender_id: params.sender_id.clone(),
            audio,
            file_name,
            mime_type: params.mime_type.clone(),
            duration_ms: params.audio_duration_ms,
            target_languages,
            mobile_transcription: params.mobile_transcription.clone(),
            generate_voice_clone,
            model_type: params.model_type.clone(),
            user_language: params.user_language.clone(),
            voice_profile,
        };

        let task_id = match self.bus.request_audio_job(request).await {
            Ok(task_id) => task_id,
            Err(e) => {
                self.stats.inc_errors();
                return Err(e.context("dispatching audio job"));
            }
        };
        self.stats.inc_requests_sent();
        self.pending.insert(
            &task_id,
            TaskContext {
                message_id: Some(params.message_id.clone()),
                attachment_id: Some(params.attachment_id.clone()),
                conversation_id: Some(params.conversation_id.clone()),
                user_id: Some(params.sender_id.clone()),
            },
        );
        info!(
            task_id = %task_id,
            attachment_id = %params.attachment_id,
            "Audio job dispatched"
        );
        Ok(Some(task_id))
    }

    /// Phase 1 of the audio pipeline: persist the transcription and tell
    /// clients text is available while translations are still in flight.
    pub(crate) async fn on_transcription_ready(
        &self,
        task_id: &str,
        message_id: &str,
        attachment_id: &str,
        transcription: TranscriptionRecord,
        processing_time_ms: u64,
    ) -> Result<()> {
        self.store
            .update_attachment_transcription(attachment_id, &transcription)
            .await?;
        debug!(task_id, attachment_id, "Transcription persisted");
        self.emit(DomainEvent::TranscriptionReady {
            task_id: task_id.to_string(),
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
            transcription,
            processing_time_ms,
            phase: PHASE_TRANSCRIPTION.to_string(),
        });
        Ok(())
    }

    /// Phase 2 of the audio pipeline: one translated-audio result for one
    /// language.
    pub(crate) async fn on_audio_translation(
        &self,
        kind: AudioCompletionKind,
        task_id: &str,
        message_id: &str,
        attachment_id: &str,
        language: &str,
        event: TranslatedAudioEvent,
    ) -> Result<()> {
        let record = self
            .persist_translated_audio(attachment_id, language, event)
            .await?;

        if kind != AudioCompletionKind::Progressive {
            self.pending.remove(task_id);
        }
        match kind {
            AudioCompletionKind::Single => self.emit(DomainEvent::AudioTranslationReady {
                task_id: task_id.to_string(),
                message_id: message_id.to_string(),
                attachment_id: attachment_id.to_string(),
                translations: vec![record],
            }),
            AudioCompletionKind::Progressive => {
                self.emit(DomainEvent::AudioTranslationsProgressive {
                    task_id: task_id.to_string(),
                    message_id: message_id.to_string(),
                    attachment_id: attachment_id.to_string(),
                    language: language.to_string(),
                    translation: record,
                })
            }
            AudioCompletionKind::Final => self.emit(DomainEvent::AudioTranslationsCompleted {
                task_id: task_id.to_string(),
                message_id: message_id.to_string(),
                attachment_id: attachment_id.to_string(),
                language: language.to_string(),
                translation: record,
            }),
        }
        Ok(())
    }

    /// Legacy one-shot completion: transcription plus all translations plus
    /// an optional freshly built voice profile, in a single event.
    pub(crate) async fn on_audio_process_completed(
        &self,
        task_id: &str,
        message_id: &str,
        attachment_id: &str,
        transcription: Option<TranscriptionRecord>,
        translations: Vec<TranslatedAudioEvent>,
        voice_profile: Option<NewVoiceProfileEvent>,
    ) -> Result<()> {
        if let Some(transcription) = &transcription {
            self.store
                .update_attachment_transcription(attachment_id, transcription)
                .await?;
        }

        let mut saved = Vec::with_capacity(translations.len());
        for event in translations {
            let language = event.target_language.clone();
            saved.push(
                self.persist_translated_audio(attachment_id, &language, event)
                    .await?,
            );
        }

        if let Some(profile) = voice_profile {
            if let Err(e) = self.save_worker_voice_profile(task_id, message_id, profile).await {
                warn!(task_id, error = %e, "Failed to save worker-built voice profile");
            }
        }

        self.pending.remove(task_id);
        self.emit(DomainEvent::AudioTranslationReady {
            task_id: task_id.to_string(),
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
            translations: saved,
        });
        Ok(())
    }

    /// Standalone voice jobs are keyed on `job_id`. When a pending-task
    /// lookup associates the job with an attachment it takes the attachment
    /// path; otherwise the result is handed straight to the caller.
    pub(crate) async fn on_voice_translation_completed(
        &self,
        job_id: &str,
        user_id: &str,
        result: VoiceJobResult,
    ) -> Result<()> {
        if let Some(TaskContext {
            message_id: Some(message_id),
            attachment_id: Some(attachment_id),
            ..
        }) = self.pending.remove(job_id)
        {
            if let Some(transcription) = &result.transcription {
                self.store
                    .update_attachment_transcription(&attachment_id, transcription)
                    .await?;
            }
            let mut saved = Vec::with_capacity(result.translations.len());
            for event in result.translations {
                let language = event.target_language.clone();
                saved.push(
                    self.persist_translated_audio(&attachment_id, &language, event)
                        .await?,
                );
            }
            self.emit(DomainEvent::AudioTranslationReady {
                task_id: job_id.to_string(),
                message_id,
                attachment_id,
                translations: saved,
            });
            return Ok(());
        }

        // Standalone: no attachment to hang results on. Files are written
        // keyed by the job id so the caller still gets resolvable URLs.
        let mut translations = Vec::with_capacity(result.translations.len());
        for event in result.translations {
            let language = event.target_language.clone();
            translations.push(self.materialize_translated_audio(job_id, &language, event).await?);
        }
        self.emit(DomainEvent::VoiceTranslationJobCompleted {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            transcription: result.transcription,
            translations,
        });
        Ok(())
    }

    /// Decode the payload (binary preferred, base64 fallback), write the
    /// file, and build the record. `file_key` names the file: the
    /// attachment id, or the job id for standalone voice jobs.
    async fn materialize_translated_audio(
        &self,
        file_key: &str,
        language: &str,
        event: TranslatedAudioEvent,
    ) -> Result<TranslatedAudioRecord> {
        let (storage_path, url) = match &event.payload {
            Some(payload) => {
                let bytes = payload.decode()?;
                let (path, url) = self
                    .storage
                    .write_translated_audio(file_key, language, &event.format, &bytes)
                    .await?;
                (path.to_string_lossy().into_owned(), url)
            }
            None => {
                debug!(file_key, language, "Worker delivered text-only translation");
                (String::new(), String::new())
            }
        };

        Ok(TranslatedAudioRecord {
            target_language: language.to_string(),
            translated_text: event.translated_text,
            storage_path,
            url,
            duration_ms: event.duration_ms,
            format: event.format,
            voice_cloned: event.voice_cloned,
            voice_quality: event.voice_quality,
            segments: event.segments,
            tts_model: event.tts_model,
            created_at: Utc::now(),
        })
    }

    async fn persist_translated_audio(
        &self,
        attachment_id: &str,
        language: &str,
        event: TranslatedAudioEvent,
    ) -> Result<TranslatedAudioRecord> {
        let record = self
            .materialize_translated_audio(attachment_id, language, event)
            .await?;
        self.store
            .update_attachment_translations(attachment_id, language, &record)
            .await?;
        Ok(record)
    }

    /// Upsert the sender's voice profile from a worker-built one.
    async fn save_worker_voice_profile(
        &self,
        task_id: &str,
        message_id: &str,
        event: NewVoiceProfileEvent,
    ) -> Result<()> {
        let user_id = match self.pending.get(task_id).and_then(|ctx| ctx.user_id) {
            Some(user_id) => Some(user_id),
            None => self
                .store
                .find_message(message_id)
                .await?
                .and_then(|m| m.sender_id.or(m.anonymous_sender_id)),
        };
        let Some(user_id) = user_id else {
            warn!(task_id, "Voice profile arrived with no resolvable sender; dropped");
            return Ok(());
        };

        let profile = VoiceProfile {
            user_id: user_id.clone(),
            profile_id: event.profile_id,
            embedding: event.embedding.decode()?,
            quality_score: event.quality_score,
            audio_count: event.audio_count,
            total_duration_ms: event.total_duration_ms,
            version: event.version,
            fingerprint: event.fingerprint,
            voice_characteristics: event.voice_characteristics,
            chatterbox_conditionals: event
                .chatterbox_conditionals
                .as_ref()
                .map(|payload| payload.decode())
                .transpose()?,
            reference_audio_id: event.reference_audio_id,
            reference_audio_url: event.reference_audio_url,
        };
        let version = self.store.upsert_voice_profile(&profile).await?;
        info!(user_id = %user_id, version, "Voice profile updated");
        Ok(())
    }

    /// Load an attachment with its transcription and translated audio,
    /// projected into the shape the attachment API serves.
    pub async fn get_attachment_with_transcription(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentWithTranscription> {
        let attachment = self
            .store
            .find_attachment(attachment_id)
            .await?
            .ok_or_else(|| OrchestratorError::AttachmentNotFound(attachment_id.to_string()))?;
        Ok(AttachmentWithTranscription {
            transcription: attachment.transcription.clone(),
            translated_audios: attachment.translations.values().cloned().collect(),
            attachment: AttachmentSummary::from(&attachment),
        })
    }

    /// Re-dispatch a transcription-only job for an existing attachment.
    pub async fn transcribe_attachment(&self, attachment_id: &str) -> Result<RetransmitOutcome> {
        let attachment = self.require_audio_attachment(attachment_id).await?;
        let path = self.storage.resolve_source_path(&attachment.file_url)?;
        let audio = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading source audio {}", path.display()))?;

        let request = TranscriptionRequest {
            message_id: Some(attachment.message_id.clone()),
            attachment_id: attachment.id.clone(),
            conversation_id: attachment.conversation_id.clone(),
            audio,
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
            language_hint: attachment.transcription.as_ref().map(|t| t.language.clone()),
        };
        let task_id = match self.bus.request_transcription(request).await {
            Ok(task_id) => task_id,
            Err(e) => {
                self.stats.inc_errors();
                return Err(e.context("dispatching transcription job"));
            }
        };
        self.stats.inc_requests_sent();
        self.pending.insert(
            &task_id,
            TaskContext {
                message_id: Some(attachment.message_id.clone()),
                attachment_id: Some(attachment.id.clone()),
                conversation_id: Some(attachment.conversation_id.clone()),
                user_id: None,
            },
        );
        Ok(RetransmitOutcome {
            task_id,
            attachment: AttachmentSummary::from(&attachment),
        })
    }

    /// Re-dispatch the full audio pipeline for an existing attachment.
    pub async fn translate_attachment(
        &self,
        attachment_id: &str,
        model_type: Option<String>,
    ) -> Result<RetransmitOutcome> {
        let attachment = self.require_audio_attachment(attachment_id).await?;
        let message = self
            .store
            .find_message(&attachment.message_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownMessage(attachment.message_id.clone()))?;
        let sender_id = message
            .sender_id
            .clone()
            .or(message.anonymous_sender_id.clone())
            .unwrap_or_default();

        let params = AudioJobParams {
            message_id: attachment.message_id.clone(),
            attachment_id: attachment.id.clone(),
            conversation_id: attachment.conversation_id.clone(),
            sender_id: sender_id.clone(),
            audio_path: self.storage.resolve_source_path(&attachment.file_url)?,
            mime_type: attachment.mime_type.clone(),
            audio_duration_ms: attachment.duration_ms.unwrap_or(0),
            mobile_transcription: None,
            generate_voice_clone: false,
            model_type,
            user_language: attachment.transcription.as_ref().map(|t| t.language.clone()),
        };
        let task_id = self.process_audio_attachment(params).await?.ok_or(
            OrchestratorError::ConsentDenied {
                user_id: sender_id,
                capability: "canTranscribeAudio",
            },
        )?;
        Ok(RetransmitOutcome {
            task_id,
            attachment: AttachmentSummary::from(&attachment),
        })
    }

    async fn require_audio_attachment(&self, attachment_id: &str) -> Result<Attachment> {
        let attachment = self
            .store
            .find_attachment(attachment_id)
            .await?
            .ok_or_else(|| OrchestratorError::AttachmentNotFound(attachment_id.to_string()))?;
        if !attachment.is_audio() {
            return Err(OrchestratorError::NotAudio {
                attachment_id: attachment.id.clone(),
                mime_type: attachment.mime_type.clone(),
            }
            .into());
        }
        Ok(attachment)
    }
}
