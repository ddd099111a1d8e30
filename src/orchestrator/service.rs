//! Translation orchestrator core
//!
//! Receives chat messages, persists them, fans translation requests out to
//! the worker pool over the bus, and turns asynchronous completion events
//! into persisted rows plus real-time domain events.
//!
//! The ingest hot path never waits on the worker pool: `handle_new_message`
//! returns as soon as the message is durable and schedules the dispatch on
//! a detached task.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusClient, BusEvent, TranslationRequest, POOL_FULL_ERROR};
use crate::cache::{LanguageCache, TranslationCache};
use crate::config::OrchestratorConfig;
use crate::consent::ConsentService;
use crate::crypto::EncryptionHelper;
use crate::error::OrchestratorError;
use crate::events::DomainEvent;
use crate::storage::AudioStorage;
use crate::store::Store;
use crate::types::{
    select_model_type, ChatMessage, EncryptionMode, IngestOutcome, IngestStatus, NewMessage,
    TranslationRecord, TranslationResult, MODEL_FALLBACK,
};

use super::pending::{PendingTasks, ProcessedTaskSet, TaskContext};
use super::stats::{Stats, StatsSnapshot};

/// Capacity of the domain-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Raw completion notice for synchronous waiters.
#[derive(Debug, Clone)]
pub(crate) enum SyncNotice {
    Completed { result: TranslationResult },
    Failed { message_id: String, error: String },
}

/// The message translation orchestrator.
///
/// Cheap to clone; every clone shares the same caches, counters, and
/// listener. Call [`attach_bus_events`] with the receiver the bus transport
/// feeds, and let the WebSocket layer consume [`subscribe`].
///
/// [`attach_bus_events`]: TranslationOrchestrator::attach_bus_events
/// [`subscribe`]: TranslationOrchestrator::subscribe
#[derive(Clone)]
pub struct TranslationOrchestrator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) consent: Arc<dyn ConsentService>,
    pub(crate) encryption: Arc<EncryptionHelper>,
    pub(crate) translation_cache: Arc<TranslationCache>,
    pub(crate) language_cache: Arc<LanguageCache>,
    pub(crate) pending: Arc<PendingTasks>,
    pub(crate) processed: Arc<ProcessedTaskSet>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) storage: AudioStorage,
    pub(crate) config: OrchestratorConfig,
    events: broadcast::Sender<DomainEvent>,
    sync_notices: broadcast::Sender<SyncNotice>,
    listener: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl TranslationOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn BusClient>,
        consent: Arc<dyn ConsentService>,
        config: OrchestratorConfig,
        uploads_root: impl Into<PathBuf>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sync_notices, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            encryption: Arc::new(EncryptionHelper::new(store.clone())),
            translation_cache: Arc::new(TranslationCache::new(config.translation_cache_capacity)),
            language_cache: Arc::new(LanguageCache::new(
                config.language_cache_capacity,
                config.language_cache_ttl(),
            )),
            pending: Arc::new(PendingTasks::new()),
            processed: Arc::new(ProcessedTaskSet::new(config.processed_task_capacity)),
            stats: Arc::new(Stats::new()),
            storage: AudioStorage::new(uploads_root),
            store,
            bus,
            consent,
            config,
            events,
            sync_notices,
            listener: Arc::new(StdMutex::new(None)),
        }
    }

    /// Subscribe to the emitted domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Counter snapshot for telemetry.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn emit(&self, event: DomainEvent) {
        debug!(event = event.name(), "Emitting domain event");
        let _ = self.events.send(event);
    }

    /// Start consuming bus events from the given channel. A previously
    /// attached listener is aborted first so events are never delivered
    /// twice after a re-initialization.
    pub fn attach_bus_events(&self, mut rx: mpsc::Receiver<BusEvent>) {
        let mut guard = self.listener.lock().expect("listener lock poisoned");
        if let Some(previous) = guard.take() {
            previous.abort();
            debug!("Replaced previous bus listener");
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_bus_event(event).await;
            }
            debug!("Bus event channel closed");
        }));
    }

    /// Stop consuming bus events.
    pub fn detach_bus_events(&self) {
        if let Some(handle) = self.listener.lock().expect("listener lock poisoned").take() {
            handle.abort();
        }
    }

    /// Ingest a user-authored message: persist it (or resolve the existing
    /// row for a retranslation), then schedule the worker dispatch on a
    /// detached task and return immediately.
    pub async fn handle_new_message(&self, msg: NewMessage) -> Result<IngestOutcome> {
        // E2EE content is opaque to the server; keep delivery working but
        // never ask workers to translate it.
        if msg.encryption_mode == EncryptionMode::E2ee {
            return self.handle_e2ee_message(msg).await;
        }

        let retranslation = msg.id.is_some();
        let message = if let Some(id) = &msg.id {
            self.store
                .find_message(id)
                .await?
                .ok_or_else(|| OrchestratorError::UnknownMessage(id.clone()))?
        } else {
            let now = Utc::now();
            self.store
                .create_conversation_if_absent(&msg.conversation_id, msg.conversation_title.as_deref())
                .await?;
            let message = ChatMessage {
                id: Uuid::new_v4().to_string(),
                conversation_id: msg.conversation_id.clone(),
                sender_id: msg.sender_id.clone(),
                anonymous_sender_id: msg.anonymous_sender_id.clone(),
                content: msg.content.clone(),
                original_language: msg.original_language.clone(),
                message_type: msg.message_type.clone(),
                reply_to_id: msg.reply_to_id.clone(),
                encryption_mode: msg.encryption_mode,
                model_type: msg.model_type.clone(),
                created_at: now,
            };
            self.store.insert_message(&message).await?;
            self.store
                .update_conversation_last_message_at(&msg.conversation_id, now)
                .await?;
            self.stats.inc_messages_saved();
            message
        };

        let status = if retranslation {
            IngestStatus::RetranslationQueued
        } else {
            IngestStatus::MessageSaved
        };
        let outcome = IngestOutcome {
            message_id: message.id.clone(),
            status,
            translation_queued: true,
        };

        // Detached: the response must not block on worker dispatch.
        let this = self.clone();
        let explicit_target = msg.target_language.clone();
        let caller_model = msg.model_type.clone();
        tokio::spawn(async move {
            this.resolve_and_dispatch(message, explicit_target, caller_model, retranslation)
                .await;
        });

        Ok(outcome)
    }

    async fn handle_e2ee_message(&self, msg: NewMessage) -> Result<IngestOutcome> {
        if let Some(id) = msg.id {
            debug!(message_id = %id, "E2EE retranslation request skipped");
            return Ok(IngestOutcome {
                message_id: id,
                status: IngestStatus::E2eeSkipped,
                translation_queued: false,
            });
        }

        // Persist so delivery still works even though translation cannot.
        self.store
            .create_conversation_if_absent(&msg.conversation_id, msg.conversation_title.as_deref())
            .await?;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id,
            anonymous_sender_id: msg.anonymous_sender_id,
            content: msg.content,
            original_language: msg.original_language,
            message_type: msg.message_type,
            reply_to_id: msg.reply_to_id,
            encryption_mode: EncryptionMode::E2ee,
            model_type: msg.model_type,
            created_at: Utc::now(),
        };
        self.store.insert_message(&message).await?;
        self.stats.inc_messages_saved();
        info!(message_id = %message.id, "E2EE message saved without translation");
        Ok(IngestOutcome {
            message_id: message.id,
            status: IngestStatus::E2eeSkipped,
            translation_queued: false,
        })
    }

    /// Resolve target languages and send the fanout request. Runs detached
    /// from the ingest response; failures are logged and counted only.
    async fn resolve_and_dispatch(
        &self,
        message: ChatMessage,
        explicit_target: Option<String>,
        caller_model: Option<String>,
        retranslation: bool,
    ) {
        let targets = match self
            .resolve_targets(&message.conversation_id, explicit_target, &message.original_language)
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Target language resolution failed");
                self.stats.inc_errors();
                return;
            }
        };
        if targets.is_empty() {
            debug!(message_id = %message.id, "No target languages to translate into");
            return;
        }

        if retranslation {
            // Clear old rows so the completion upsert replaces cleanly.
            if let Err(e) = self.store.delete_translations(&message.id, &targets).await {
                error!(message_id = %message.id, error = %e, "Failed to clear old translations");
                self.stats.inc_errors();
                return;
            }
        }

        let model_type = select_model_type(
            caller_model.as_deref(),
            message.model_type.as_deref(),
            &message.content,
        );
        let request = TranslationRequest {
            message_id: message.id.clone(),
            text: message.content.clone(),
            source_language: message.original_language.clone(),
            target_languages: targets.clone(),
            conversation_id: message.conversation_id.clone(),
            model_type,
        };

        match self.bus.request_translation(request).await {
            Ok(task_id) => {
                self.stats.inc_requests_sent();
                self.pending.insert(
                    &task_id,
                    TaskContext {
                        message_id: Some(message.id.clone()),
                        attachment_id: None,
                        conversation_id: Some(message.conversation_id.clone()),
                        user_id: message.sender_id.clone(),
                    },
                );
                debug!(
                    message_id = %message.id,
                    task_id = %task_id,
                    targets = ?targets,
                    "Translation request dispatched"
                );
            }
            Err(e) => {
                // TODO: decide whether failed dispatches should be retried;
                // for now they only count toward the error counter.
                error!(message_id = %message.id, error = %e, "Translation dispatch failed");
                self.stats.inc_errors();
            }
        }
    }

    /// Resolve the target-language set for a conversation.
    ///
    /// An explicit target short-circuits; otherwise the conversation's
    /// member languages are read through the TTL cache. Targets equal to
    /// the source language are dropped unless the source is `auto`. The
    /// result is sorted for deterministic fanout.
    pub(crate) async fn resolve_targets(
        &self,
        conversation_id: &str,
        explicit_target: Option<String>,
        source_language: &str,
    ) -> Result<Vec<String>> {
        let candidates: HashSet<String> = match explicit_target {
            Some(target) => HashSet::from([target]),
            None => match self.language_cache.get(conversation_id).await {
                Some(cached) => cached,
                None => {
                    let languages = self.store.conversation_languages(conversation_id).await?;
                    self.language_cache.set(conversation_id, languages.clone()).await;
                    languages
                }
            },
        };

        let mut targets: Vec<String> = candidates
            .into_iter()
            .filter(|target| source_language == "auto" || target != source_language)
            .collect();
        targets.sort();
        Ok(targets)
    }

    /// Single dispatch point for everything arriving on the bus subscribe
    /// side. Also driven directly by tests.
    pub async fn handle_bus_event(&self, event: BusEvent) {
        debug!(event = event.name(), "Bus event received");
        match event {
            BusEvent::TranslationCompleted { task_id, result, metadata } => {
                // Synchronous waiters see the raw completion before any
                // persistence work happens.
                let _ = self.sync_notices.send(SyncNotice::Completed {
                    result: result.clone(),
                });
                if let Err(e) = self.on_translation_completed(&task_id, result, metadata).await {
                    error!(task_id = %task_id, error = %e, "Failed to handle completed translation");
                    self.stats.inc_errors();
                }
            }
            BusEvent::TranslationError { task_id, message_id, conversation_id, error } => {
                let _ = self.sync_notices.send(SyncNotice::Failed {
                    message_id: message_id.clone(),
                    error: error.clone(),
                });
                self.stats.inc_errors();
                if error == POOL_FULL_ERROR {
                    self.stats.inc_pool_full_rejections();
                }
                self.pending.remove(&task_id);
                warn!(
                    task_id = %task_id,
                    message_id = %message_id,
                    conversation_id = %conversation_id,
                    error = %error,
                    "Translation failed"
                );
            }
            BusEvent::TranscriptionReady {
                task_id,
                message_id,
                attachment_id,
                transcription,
                processing_time_ms,
            } => {
                if let Err(e) = self
                    .on_transcription_ready(
                        &task_id,
                        &message_id,
                        &attachment_id,
                        transcription,
                        processing_time_ms,
                    )
                    .await
                {
                    error!(task_id = %task_id, error = %e, "Failed to persist transcription");
                    self.stats.inc_errors();
                }
            }
            BusEvent::AudioTranslationReady {
                task_id,
                message_id,
                attachment_id,
                language,
                translated_audio,
            } => {
                if let Err(e) = self
                    .on_audio_translation(
                        super::audio::AudioCompletionKind::Single,
                        &task_id,
                        &message_id,
                        &attachment_id,
                        &language,
                        translated_audio,
                    )
                    .await
                {
                    error!(task_id = %task_id, language = %language, error = %e, "Failed to persist translated audio");
                    self.stats.inc_errors();
                }
            }
            BusEvent::AudioTranslationsProgressive {
                task_id,
                message_id,
                attachment_id,
                language,
                translated_audio,
            } => {
                if let Err(e) = self
                    .on_audio_translation(
                        super::audio::AudioCompletionKind::Progressive,
                        &task_id,
                        &message_id,
                        &attachment_id,
                        &language,
                        translated_audio,
                    )
                    .await
                {
                    error!(task_id = %task_id, language = %language, error = %e, "Failed to persist translated audio");
                    self.stats.inc_errors();
                }
            }
            BusEvent::AudioTranslationsCompleted {
                task_id,
                message_id,
                attachment_id,
                language,
                translated_audio,
            } => {
                if let Err(e) = self
                    .on_audio_translation(
                        super::audio::AudioCompletionKind::Final,
                        &task_id,
                        &message_id,
                        &attachment_id,
                        &language,
                        translated_audio,
                    )
                    .await
                {
                    error!(task_id = %task_id, language = %language, error = %e, "Failed to persist translated audio");
                    self.stats.inc_errors();
                }
            }
            BusEvent::AudioProcessCompleted {
                task_id,
                message_id,
                attachment_id,
                transcription,
                translations,
                voice_profile,
            } => {
                if let Err(e) = self
                    .on_audio_process_completed(
                        &task_id,
                        &message_id,
                        &attachment_id,
                        transcription,
                        translations,
                        voice_profile,
                    )
                    .await
                {
                    error!(task_id = %task_id, error = %e, "Failed to handle bundled audio completion");
                    self.stats.inc_errors();
                }
            }
            BusEvent::AudioProcessError {
                task_id,
                message_id,
                attachment_id,
                error,
                error_code,
            } => {
                self.stats.inc_errors();
                self.pending.remove(&task_id);
                warn!(task_id = %task_id, attachment_id = %attachment_id, error = %error, "Audio processing failed");
                self.emit(DomainEvent::AudioTranslationError {
                    task_id,
                    message_id,
                    attachment_id,
                    error,
                    error_code,
                });
            }
            BusEvent::TranscriptionCompleted {
                task_id,
                message_id,
                attachment_id,
                transcription,
                processing_time_ms,
            } => {
                let result = self
                    .on_transcription_ready(
                        &task_id,
                        message_id.as_deref().unwrap_or_default(),
                        &attachment_id,
                        transcription,
                        processing_time_ms,
                    )
                    .await;
                // Terminal for transcription-only jobs.
                self.pending.remove(&task_id);
                if let Err(e) = result {
                    error!(task_id = %task_id, error = %e, "Failed to persist transcription");
                    self.stats.inc_errors();
                }
            }
            BusEvent::TranscriptionError { task_id, attachment_id, error } => {
                self.stats.inc_errors();
                self.pending.remove(&task_id);
                warn!(task_id = %task_id, attachment_id = %attachment_id, error = %error, "Transcription failed");
                self.emit(DomainEvent::TranscriptionError {
                    task_id,
                    attachment_id,
                    error,
                });
            }
            BusEvent::VoiceTranslationCompleted { job_id, user_id, result } => {
                if let Err(e) = self.on_voice_translation_completed(&job_id, &user_id, result).await
                {
                    error!(job_id = %job_id, error = %e, "Failed to handle voice job completion");
                    self.stats.inc_errors();
                }
            }
            BusEvent::VoiceTranslationFailed { job_id, user_id, error } => {
                self.stats.inc_errors();
                self.pending.remove(&job_id);
                warn!(job_id = %job_id, user_id = %user_id, error = %error, "Voice job failed");
                self.emit(DomainEvent::VoiceTranslationJobFailed {
                    job_id,
                    user_id,
                    error,
                });
            }
        }
    }

    /// Persist a completed translation, encrypting when the conversation
    /// requires it, and emit `translationReady`. Idempotent per
    /// `(task_id, target_language)`.
    async fn on_translation_completed(
        &self,
        task_id: &str,
        result: TranslationResult,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if !self.processed.insert(task_id, &result.target_language) {
            debug!(
                task_id = %task_id,
                target = %result.target_language,
                "Duplicate completion dropped"
            );
            return Ok(());
        }

        let decision = self
            .encryption
            .should_encrypt_translation(&result.message_id)
            .await?;
        let Some(conversation_id) = decision.conversation_id else {
            // Synthetic ids from the synchronous path land here.
            debug!(message_id = %result.message_id, "Completion for unknown message ignored");
            return Ok(());
        };

        let mut record = TranslationRecord {
            id: Uuid::new_v4().to_string(),
            message_id: result.message_id.clone(),
            target_language: result.target_language.clone(),
            translated_content: result.translated_text.clone(),
            translation_model: result.translator_model.clone(),
            confidence_score: result.confidence_score,
            is_encrypted: false,
            key_id: None,
            iv: None,
            auth_tag: None,
            created_at: Utc::now(),
        };
        if decision.should_encrypt {
            if let Some(sealed) = self
                .encryption
                .encrypt_translation(&result.translated_text, &conversation_id)
                .await?
            {
                record.translated_content = sealed.encrypted_content;
                record.is_encrypted = true;
                record.key_id = Some(sealed.key_id);
                record.iv = Some(sealed.iv);
                record.auth_tag = Some(sealed.auth_tag);
            }
        }

        let translation_id = self.store.upsert_translation(&record).await?;

        // Cache the plaintext; reads never pay for decryption twice.
        let key = TranslationCache::cache_key(
            &result.message_id,
            result.source_language.as_deref(),
            &result.target_language,
        );
        self.translation_cache.set(key, result.clone()).await;

        if let Some(message) = self.store.find_message(&result.message_id).await? {
            if let Some(author) = message.author_id() {
                self.store.increment_user_translations_used(author).await?;
            }
        }

        self.stats.record_translation(result.processing_time_ms);
        self.pending.remove(task_id);

        let target_language = result.target_language.clone();
        self.emit(DomainEvent::TranslationReady {
            task_id: task_id.to_string(),
            result,
            target_language,
            translation_id,
            metadata,
        });
        Ok(())
    }

    /// Dispatch a translation and wait for its completion. Used by the
    /// synchronous REST path.
    ///
    /// Times out after the configured deadline (10 seconds by default) and
    /// returns a result tagged `fallback` with the original text; the
    /// remote task is not cancelled. Dropping the internal subscription on
    /// return detaches the listener either way.
    pub async fn translate_text_directly(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        model_type: Option<&str>,
    ) -> TranslationResult {
        let message_id = format!("direct_{}", Uuid::new_v4());
        let started = Instant::now();
        let mut notices = self.sync_notices.subscribe();

        let request = TranslationRequest {
            message_id: message_id.clone(),
            text: text.to_string(),
            source_language: source_language.to_string(),
            target_languages: vec![target_language.to_string()],
            conversation_id: String::new(),
            model_type: select_model_type(model_type, None, text),
        };
        match self.bus.request_translation(request).await {
            Ok(task_id) => {
                self.stats.inc_requests_sent();
                debug!(task_id = %task_id, message_id = %message_id, "Direct translation dispatched");
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Direct translation dispatch failed");
                self.stats.inc_errors();
                return Self::fallback_result(message_id, source_language, target_language, text, started);
            }
        }

        let deadline = self.config.sync_translate_timeout();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, notices.recv()).await {
                Ok(Ok(SyncNotice::Completed { result }))
                    if result.message_id == message_id
                        && result.target_language == target_language =>
                {
                    return result;
                }
                Ok(Ok(SyncNotice::Failed { message_id: failed_id, error }))
                    if failed_id == message_id =>
                {
                    warn!(message_id = %message_id, error = %error, "Direct translation failed");
                    return Self::fallback_result(
                        message_id,
                        source_language,
                        target_language,
                        text,
                        started,
                    );
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Sync waiter lagged behind completions");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => break,
            }
        }

        warn!(
            message_id = %message_id,
            timeout_secs = self.config.sync_translate_timeout_secs,
            "Direct translation timed out"
        );
        self.stats.inc_errors();
        Self::fallback_result(message_id, source_language, target_language, text, started)
    }

    fn fallback_result(
        message_id: String,
        source_language: &str,
        target_language: &str,
        text: &str,
        started: Instant,
    ) -> TranslationResult {
        TranslationResult {
            message_id,
            source_language: Some(source_language.to_string()),
            target_language: target_language.to_string(),
            translated_text: text.to_string(),
            translator_model: MODEL_FALLBACK.to_string(),
            confidence_score: 0.1,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Read a stored translation as plaintext.
    ///
    /// Encrypted rows are decrypted with the conversation key; when
    /// decryption fails the ciphertext is never returned, only `None`.
    pub async fn get_translation(
        &self,
        message_id: &str,
        target_language: &str,
    ) -> Result<Option<String>> {
        let Some(record) = self.store.find_translation(message_id, target_language).await? else {
            return Ok(None);
        };
        if !record.is_encrypted {
            return Ok(Some(record.translated_content));
        }

        let (Some(key_id), Some(iv), Some(auth_tag)) = (
            record.key_id.as_deref(),
            record.iv.as_deref(),
            record.auth_tag.as_deref(),
        ) else {
            warn!(message_id, target_language, "Encrypted translation is missing key material");
            return Ok(None);
        };
        let Some(message) = self.store.find_message(message_id).await? else {
            return Ok(None);
        };
        match self
            .encryption
            .decrypt_translation(
                &record.translated_content,
                key_id,
                iv,
                auth_tag,
                &message.conversation_id,
            )
            .await
        {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(
                    message_id,
                    target_language,
                    error = %e,
                    "Refusing to return undecryptable translation"
                );
                Ok(None)
            }
        }
    }
}

