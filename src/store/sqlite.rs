//! SQLite-backed store for messages, translations, and voice profiles

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::{
    conversation_identifier, Attachment, ChatMessage, Conversation, ConversationKey,
    EncryptionMode, TranscriptionRecord, TranslatedAudioRecord, TranslationRecord, VoiceProfile,
};

use super::Store;

/// SQLite-backed store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new store at the given path
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("opening database at {}", path.display()))?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                identifier TEXT NOT NULL,
                title TEXT,
                kind TEXT NOT NULL DEFAULT 'group',
                last_message_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT,
                anonymous_sender_id TEXT,
                content TEXT NOT NULL,
                original_language TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                reply_to_id TEXT,
                encryption_mode TEXT NOT NULL DEFAULT 'none',
                model_type TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS translations (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                target_language TEXT NOT NULL,
                translated_content TEXT NOT NULL,
                translation_model TEXT NOT NULL,
                confidence_score REAL NOT NULL DEFAULT 0,
                is_encrypted INTEGER NOT NULL DEFAULT 0,
                key_id TEXT,
                iv TEXT,
                auth_tag TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_url TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                duration_ms INTEGER,
                transcription TEXT,
                translations TEXT
            );

            CREATE TABLE IF NOT EXISTS conversation_keys (
                key_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                purpose TEXT NOT NULL DEFAULT 'conversation',
                key_b64 TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                system_language TEXT,
                regional_language TEXT,
                custom_destination_language TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS anonymous_participants (
                conversation_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                language TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (conversation_id, participant_id)
            );

            CREATE TABLE IF NOT EXISTS user_stats (
                user_id TEXT PRIMARY KEY,
                translations_used INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS voice_profiles (
                user_id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                quality_score REAL NOT NULL DEFAULT 0,
                audio_count INTEGER NOT NULL DEFAULT 0,
                total_duration_ms INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                fingerprint TEXT,
                voice_characteristics TEXT,
                chatterbox_conditionals BLOB,
                reference_audio_id TEXT,
                reference_audio_url TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_translations_message_lang
                ON translations(message_id, target_language);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_attachments_message
                ON attachments(message_id);
            CREATE INDEX IF NOT EXISTS idx_conversation_keys_conversation
                ON conversation_keys(conversation_id, created_at DESC);
        "#,
        )?;

        Ok(())
    }

    fn parse_timestamp(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
        let encryption_mode: String = row.get(8)?;
        let created_at: String = row.get(10)?;
        Ok(ChatMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            anonymous_sender_id: row.get(3)?,
            content: row.get(4)?,
            original_language: row.get(5)?,
            message_type: row.get(6)?,
            reply_to_id: row.get(7)?,
            encryption_mode: EncryptionMode::parse(&encryption_mode)
                .unwrap_or(EncryptionMode::None),
            model_type: row.get(9)?,
            created_at: Self::parse_timestamp(&created_at),
        })
    }

    fn translation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranslationRecord> {
        let created_at: String = row.get(10)?;
        Ok(TranslationRecord {
            id: row.get(0)?,
            message_id: row.get(1)?,
            target_language: row.get(2)?,
            translated_content: row.get(3)?,
            translation_model: row.get(4)?,
            confidence_score: row.get(5)?,
            is_encrypted: row.get::<_, i64>(6)? != 0,
            key_id: row.get(7)?,
            iv: row.get(8)?,
            auth_tag: row.get(9)?,
            created_at: Self::parse_timestamp(&created_at),
        })
    }

    const TRANSLATION_COLUMNS: &'static str = "id, message_id, target_language, \
        translated_content, translation_model, confidence_score, is_encrypted, \
        key_id, iv, auth_tag, created_at";

    const MESSAGE_COLUMNS: &'static str = "id, conversation_id, sender_id, \
        anonymous_sender_id, content, original_language, message_type, reply_to_id, \
        encryption_mode, model_type, created_at";

    /// Register a conversation member. Test/seed helper, not part of the
    /// orchestrator-facing contract.
    pub async fn upsert_member(
        &self,
        conversation_id: &str,
        user_id: &str,
        system_language: Option<&str>,
        regional_language: Option<&str>,
        custom_destination_language: Option<&str>,
        is_active: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO conversation_members
               (conversation_id, user_id, system_language, regional_language,
                custom_destination_language, is_active)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                conversation_id,
                user_id,
                system_language,
                regional_language,
                custom_destination_language,
                is_active as i64,
            ],
        )?;
        Ok(())
    }

    /// Register an anonymous participant. Test/seed helper.
    pub async fn upsert_anonymous_participant(
        &self,
        conversation_id: &str,
        participant_id: &str,
        language: Option<&str>,
        is_active: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO anonymous_participants
               (conversation_id, participant_id, language, is_active)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![conversation_id, participant_id, language, is_active as i64],
        )?;
        Ok(())
    }

    /// Insert an attachment row (the upload handler owns this in the full
    /// platform; here it doubles as the test seed path).
    pub async fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        let conn = self.conn.lock().await;
        let transcription = attachment
            .transcription
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let translations = if attachment.translations.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&attachment.translations)?)
        };
        conn.execute(
            r#"INSERT OR REPLACE INTO attachments
               (id, message_id, conversation_id, file_name, file_url, mime_type,
                duration_ms, transcription, translations)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                attachment.id,
                attachment.message_id,
                attachment.conversation_id,
                attachment.file_name,
                attachment.file_url,
                attachment.mime_type,
                attachment.duration_ms.map(|d| d as i64),
                transcription,
                translations,
            ],
        )?;
        Ok(())
    }

    /// Store a conversation key. Key provisioning is external; this exists
    /// for seeding and tests.
    pub async fn store_conversation_key(&self, key: &ConversationKey) -> Result<()> {
        use base64::{engine::general_purpose, Engine as _};
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO conversation_keys
               (key_id, conversation_id, purpose, key_b64, created_at)
               VALUES (?1, ?2, 'conversation', ?3, ?4)"#,
            params![
                key.key_id,
                key.conversation_id,
                general_purpose::STANDARD.encode(&key.key),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Row counts for the ops CLI.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        for table in [
            "conversations",
            "messages",
            "translations",
            "attachments",
            "voice_profiles",
        ] {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            out.push((table.to_string(), count));
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_conversation_if_absent(
        &self,
        conversation_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let conn = self.conn.lock().await;

        let existing = conn
            .query_row(
                "SELECT id, identifier, title, kind, last_message_at, created_at
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    let last: Option<String> = row.get(4)?;
                    let created: String = row.get(5)?;
                    Ok(Conversation {
                        id: row.get(0)?,
                        identifier: row.get(1)?,
                        title: row.get(2)?,
                        kind: row.get(3)?,
                        last_message_at: last.as_deref().map(Self::parse_timestamp),
                        created_at: Self::parse_timestamp(&created),
                    })
                },
            )
            .optional()?;

        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: conversation_id.to_string(),
            identifier: conversation_identifier(title, now),
            title: title.map(|t| t.to_string()),
            kind: "group".to_string(),
            last_message_at: None,
            created_at: now,
        };
        conn.execute(
            r#"INSERT INTO conversations (id, identifier, title, kind, last_message_at, created_at)
               VALUES (?1, ?2, ?3, ?4, NULL, ?5)"#,
            params![
                conversation.id,
                conversation.identifier,
                conversation.title,
                conversation.kind,
                now.to_rfc3339(),
            ],
        )?;
        Ok(conversation)
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        if message.sender_id.is_some() == message.anonymous_sender_id.is_some() {
            bail!(
                "message {} must have exactly one of sender_id or anonymous_sender_id",
                message.id
            );
        }

        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO messages
               (id, conversation_id, sender_id, anonymous_sender_id, content,
                original_language, message_type, reply_to_id, encryption_mode,
                model_type, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.anonymous_sender_id,
                message.content,
                message.original_language,
                message.message_type,
                message.reply_to_id,
                message.encryption_mode.as_str(),
                message.model_type,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn update_conversation_last_message_at(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), conversation_id],
        )?;
        Ok(())
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM messages WHERE id = ?1",
            Self::MESSAGE_COLUMNS
        ))?;
        let message = stmt
            .query_row(params![message_id], Self::message_from_row)
            .optional()?;
        Ok(message)
    }

    async fn find_attachment(&self, attachment_id: &str) -> Result<Option<Attachment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, message_id, conversation_id, file_name, file_url, mime_type,
                    duration_ms, transcription, translations
             FROM attachments WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![attachment_id], |row| {
                let duration: Option<i64> = row.get(6)?;
                let transcription: Option<String> = row.get(7)?;
                let translations: Option<String> = row.get(8)?;
                Ok((
                    Attachment {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        conversation_id: row.get(2)?,
                        file_name: row.get(3)?,
                        file_url: row.get(4)?,
                        mime_type: row.get(5)?,
                        duration_ms: duration.map(|d| d as u64),
                        transcription: None,
                        translations: BTreeMap::new(),
                    },
                    transcription,
                    translations,
                ))
            })
            .optional()?;

        let Some((mut attachment, transcription, translations)) = row else {
            return Ok(None);
        };
        if let Some(raw) = transcription {
            attachment.transcription = serde_json::from_str(&raw)
                .with_context(|| format!("parsing transcription for attachment {}", attachment_id))?;
        }
        if let Some(raw) = translations {
            attachment.translations = serde_json::from_str(&raw)
                .with_context(|| format!("parsing translations for attachment {}", attachment_id))?;
        }
        Ok(Some(attachment))
    }

    async fn update_attachment_transcription(
        &self,
        attachment_id: &str,
        transcription: &TranscriptionRecord,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE attachments SET transcription = ?1 WHERE id = ?2",
            params![serde_json::to_string(transcription)?, attachment_id],
        )?;
        if updated == 0 {
            bail!("attachment {} not found", attachment_id);
        }
        Ok(())
    }

    async fn update_attachment_translations(
        &self,
        attachment_id: &str,
        language: &str,
        record: &TranslatedAudioRecord,
    ) -> Result<()> {
        // Read-modify-write of the JSON map happens under the connection
        // lock, which serializes concurrent per-language updates.
        let conn = self.conn.lock().await;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT translations FROM attachments WHERE id = ?1",
                params![attachment_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            bail!("attachment {} not found", attachment_id);
        };

        let mut map: BTreeMap<String, TranslatedAudioRecord> = match raw {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("parsing translations for attachment {}", attachment_id))?,
            None => BTreeMap::new(),
        };
        map.insert(language.to_string(), record.clone());

        conn.execute(
            "UPDATE attachments SET translations = ?1 WHERE id = ?2",
            params![serde_json::to_string(&map)?, attachment_id],
        )?;
        Ok(())
    }

    async fn delete_translations(&self, message_id: &str, languages: &[String]) -> Result<usize> {
        if languages.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().await;
        let mut removed = 0;
        let mut stmt = conn.prepare_cached(
            "DELETE FROM translations WHERE message_id = ?1 AND target_language = ?2",
        )?;
        for language in languages {
            removed += stmt.execute(params![message_id, language])?;
        }
        Ok(removed)
    }

    async fn upsert_translation(&self, record: &TranslationRecord) -> Result<String> {
        let conn = self.conn.lock().await;

        // Legacy data may hold several rows for the pair; keep the newest
        // so the upsert below replaces cleanly.
        conn.execute(
            r#"DELETE FROM translations
               WHERE message_id = ?1 AND target_language = ?2
                 AND id NOT IN (
                     SELECT id FROM translations
                     WHERE message_id = ?1 AND target_language = ?2
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1
                 )"#,
            params![record.message_id, record.target_language],
        )?;

        let upserted = conn.execute(
            r#"INSERT INTO translations
               (id, message_id, target_language, translated_content, translation_model,
                confidence_score, is_encrypted, key_id, iv, auth_tag, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
               ON CONFLICT(message_id, target_language) DO UPDATE SET
                   translated_content = excluded.translated_content,
                   translation_model = excluded.translation_model,
                   confidence_score = excluded.confidence_score,
                   is_encrypted = excluded.is_encrypted,
                   key_id = excluded.key_id,
                   iv = excluded.iv,
                   auth_tag = excluded.auth_tag,
                   created_at = excluded.created_at"#,
            params![
                record.id,
                record.message_id,
                record.target_language,
                record.translated_content,
                record.translation_model,
                record.confidence_score,
                record.is_encrypted as i64,
                record.key_id,
                record.iv,
                record.auth_tag,
                record.created_at.to_rfc3339(),
            ],
        );

        if upserted.is_err() {
            // Store without the composite unique index: find-then-update-or-create.
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM translations
                     WHERE message_id = ?1 AND target_language = ?2",
                    params![record.message_id, record.target_language],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    conn.execute(
                        r#"UPDATE translations SET
                               translated_content = ?1, translation_model = ?2,
                               confidence_score = ?3, is_encrypted = ?4,
                               key_id = ?5, iv = ?6, auth_tag = ?7, created_at = ?8
                           WHERE id = ?9"#,
                        params![
                            record.translated_content,
                            record.translation_model,
                            record.confidence_score,
                            record.is_encrypted as i64,
                            record.key_id,
                            record.iv,
                            record.auth_tag,
                            record.created_at.to_rfc3339(),
                            id,
                        ],
                    )?;
                    return Ok(id);
                }
                None => {
                    conn.execute(
                        r#"INSERT INTO translations
                           (id, message_id, target_language, translated_content,
                            translation_model, confidence_score, is_encrypted,
                            key_id, iv, auth_tag, created_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                        params![
                            record.id,
                            record.message_id,
                            record.target_language,
                            record.translated_content,
                            record.translation_model,
                            record.confidence_score,
                            record.is_encrypted as i64,
                            record.key_id,
                            record.iv,
                            record.auth_tag,
                            record.created_at.to_rfc3339(),
                        ],
                    )?;
                    return Ok(record.id.clone());
                }
            }
        }

        let id: String = conn.query_row(
            "SELECT id FROM translations WHERE message_id = ?1 AND target_language = ?2",
            params![record.message_id, record.target_language],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    async fn find_translation(
        &self,
        message_id: &str,
        target_language: &str,
    ) -> Result<Option<TranslationRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM translations WHERE message_id = ?1 AND target_language = ?2",
            Self::TRANSLATION_COLUMNS
        ))?;
        let record = stmt
            .query_row(params![message_id, target_language], Self::translation_from_row)
            .optional()?;
        Ok(record)
    }

    async fn translations_for_message(&self, message_id: &str) -> Result<Vec<TranslationRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM translations WHERE message_id = ?1 ORDER BY target_language",
            Self::TRANSLATION_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![message_id], Self::translation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn increment_user_translations_used(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO user_stats (user_id, translations_used) VALUES (?1, 1)
               ON CONFLICT(user_id) DO UPDATE SET
                   translations_used = translations_used + 1"#,
            params![user_id],
        )?;
        let used: i64 = conn.query_row(
            "SELECT translations_used FROM user_stats WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(used as u64)
    }

    async fn load_voice_profile(&self, user_id: &str) -> Result<Option<VoiceProfile>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, profile_id, embedding, quality_score, audio_count,
                    total_duration_ms, version, fingerprint, voice_characteristics,
                    chatterbox_conditionals, reference_audio_id, reference_audio_url
             FROM voice_profiles WHERE user_id = ?1",
        )?;
        let profile = stmt
            .query_row(params![user_id], |row| {
                let characteristics: Option<String> = row.get(8)?;
                Ok(VoiceProfile {
                    user_id: row.get(0)?,
                    profile_id: row.get(1)?,
                    embedding: row.get(2)?,
                    quality_score: row.get(3)?,
                    audio_count: row.get::<_, i64>(4)? as u32,
                    total_duration_ms: row.get::<_, i64>(5)? as u64,
                    version: row.get::<_, i64>(6)? as u32,
                    fingerprint: row.get(7)?,
                    voice_characteristics: characteristics
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                    chatterbox_conditionals: row.get(9)?,
                    reference_audio_id: row.get(10)?,
                    reference_audio_url: row.get(11)?,
                })
            })
            .optional()?;
        Ok(profile)
    }

    async fn upsert_voice_profile(&self, profile: &VoiceProfile) -> Result<u32> {
        let conn = self.conn.lock().await;

        // Version bump is computed under the connection lock; concurrent
        // uploads from the same user serialize here.
        let existing: Option<i64> = conn
            .query_row(
                "SELECT version FROM voice_profiles WHERE user_id = ?1",
                params![profile.user_id],
                |row| row.get(0),
            )
            .optional()?;
        let version = match existing {
            Some(current) => profile.version.max(current as u32 + 1),
            None => profile.version.max(1),
        };

        conn.execute(
            r#"INSERT OR REPLACE INTO voice_profiles
               (user_id, profile_id, embedding, quality_score, audio_count,
                total_duration_ms, version, fingerprint, voice_characteristics,
                chatterbox_conditionals, reference_audio_id, reference_audio_url,
                updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                profile.user_id,
                profile.profile_id,
                profile.embedding,
                profile.quality_score,
                profile.audio_count as i64,
                profile.total_duration_ms as i64,
                version as i64,
                profile.fingerprint,
                profile
                    .voice_characteristics
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                profile.chatterbox_conditionals,
                profile.reference_audio_id,
                profile.reference_audio_url,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(version)
    }

    async fn load_conversation_encryption_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationKey>> {
        use base64::{engine::general_purpose, Engine as _};
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT key_id, key_b64 FROM conversation_keys
                 WHERE conversation_id = ?1 AND purpose = 'conversation'
                 ORDER BY created_at DESC LIMIT 1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((key_id, key_b64)) = row else {
            return Ok(None);
        };
        let key = general_purpose::STANDARD
            .decode(&key_b64)
            .with_context(|| format!("decoding conversation key {}", key_id))?;
        Ok(Some(ConversationKey {
            key_id,
            conversation_id: conversation_id.to_string(),
            key,
        }))
    }

    async fn conversation_languages(&self, conversation_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut languages = HashSet::new();

        let mut stmt = conn.prepare_cached(
            "SELECT system_language, regional_language, custom_destination_language
             FROM conversation_members
             WHERE conversation_id = ?1 AND is_active = 1",
        )?;
        let member_rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in member_rows {
            let (system, regional, custom) = row?;
            for lang in [system, regional, custom].into_iter().flatten() {
                if !lang.is_empty() {
                    languages.insert(lang);
                }
            }
        }

        let mut stmt = conn.prepare_cached(
            "SELECT language FROM anonymous_participants
             WHERE conversation_id = ?1 AND is_active = 1",
        )?;
        let anon_rows = stmt.query_map(params![conversation_id], |row| {
            row.get::<_, Option<String>>(0)
        })?;
        for row in anon_rows {
            if let Some(lang) = row? {
                if !lang.is_empty() {
                    languages.insert(lang);
                }
            }
        }

        Ok(languages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(id: &str, conversation_id: &str, mode: EncryptionMode) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: Some("user-1".to_string()),
            anonymous_sender_id: None,
            content: "Hello".to_string(),
            original_language: "en".to_string(),
            message_type: "text".to_string(),
            reply_to_id: None,
            encryption_mode: mode,
            model_type: None,
            created_at: Utc::now(),
        }
    }

    fn translation(message_id: &str, lang: &str, content: &str) -> TranslationRecord {
        TranslationRecord {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            target_language: lang.to_string(),
            translated_content: content.to_string(),
            translation_model: "medium".to_string(),
            confidence_score: 0.9,
            is_encrypted: false,
            key_id: None,
            iv: None,
            auth_tag: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conversation_created_once_with_identifier() {
        let store = SqliteStore::in_memory().unwrap();
        let first = store
            .create_conversation_if_absent("c1", Some("Team Chat"))
            .await
            .unwrap();
        assert!(first.identifier.starts_with("mshy_teamchat-"));
        assert_eq!(first.kind, "group");

        let second = store
            .create_conversation_if_absent("c1", Some("Other Title"))
            .await
            .unwrap();
        assert_eq!(second.identifier, first.identifier);
    }

    #[tokio::test]
    async fn test_insert_message_requires_exactly_one_sender() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .create_conversation_if_absent("c1", None)
            .await
            .unwrap();

        let mut both = message("m1", "c1", EncryptionMode::None);
        both.anonymous_sender_id = Some("anon-1".to_string());
        assert!(store.insert_message(&both).await.is_err());

        let mut neither = message("m2", "c1", EncryptionMode::None);
        neither.sender_id = None;
        assert!(store.insert_message(&neither).await.is_err());

        assert!(store.insert_message(&message("m3", "c1", EncryptionMode::None)).await.is_ok());
        let loaded = store.find_message("m3").await.unwrap().unwrap();
        assert_eq!(loaded.content, "Hello");
        assert_eq!(loaded.encryption_mode, EncryptionMode::None);
    }

    #[tokio::test]
    async fn test_upsert_translation_is_unique_per_pair() {
        let store = SqliteStore::in_memory().unwrap();

        let first = translation("m1", "fr", "Bonjour");
        let first_id = store.upsert_translation(&first).await.unwrap();

        let second = translation("m1", "fr", "Salut");
        let second_id = store.upsert_translation(&second).await.unwrap();

        // The original row survives with replaced content.
        assert_eq!(first_id, second_id);
        let rows = store.translations_for_message("m1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].translated_content, "Salut");
    }

    #[tokio::test]
    async fn test_upsert_translation_fallback_without_unique_index() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute_batch("DROP INDEX idx_translations_message_lang;").unwrap();
            // Two legacy duplicates for the same pair.
            for content in ["old-1", "old-2"] {
                conn.execute(
                    r#"INSERT INTO translations
                       (id, message_id, target_language, translated_content,
                        translation_model, confidence_score, is_encrypted, created_at)
                       VALUES (?1, 'm1', 'fr', ?2, 'medium', 0.5, 0, ?3)"#,
                    params![Uuid::new_v4().to_string(), content, Utc::now().to_rfc3339()],
                )
                .unwrap();
            }
        }

        let id = store
            .upsert_translation(&translation("m1", "fr", "Bonjour"))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let rows = store.translations_for_message("m1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].translated_content, "Bonjour");
    }

    #[tokio::test]
    async fn test_delete_translations_by_language() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_translation(&translation("m1", "fr", "Bonjour")).await.unwrap();
        store.upsert_translation(&translation("m1", "de", "Hallo")).await.unwrap();

        let removed = store
            .delete_translations("m1", &["fr".to_string(), "es".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let rows = store.translations_for_message("m1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].target_language, "de");
    }

    #[tokio::test]
    async fn test_voice_profile_version_is_monotonic() {
        let store = SqliteStore::in_memory().unwrap();
        let profile = VoiceProfile {
            user_id: "u1".to_string(),
            profile_id: "p1".to_string(),
            embedding: vec![1, 2, 3],
            quality_score: 0.8,
            audio_count: 1,
            total_duration_ms: 2000,
            version: 1,
            fingerprint: None,
            voice_characteristics: None,
            chatterbox_conditionals: None,
            reference_audio_id: None,
            reference_audio_url: None,
        };

        assert_eq!(store.upsert_voice_profile(&profile).await.unwrap(), 1);
        // Replaying version 1 still moves forward.
        assert_eq!(store.upsert_voice_profile(&profile).await.unwrap(), 2);
        let mut newer = profile.clone();
        newer.version = 9;
        assert_eq!(store.upsert_voice_profile(&newer).await.unwrap(), 9);

        let loaded = store.load_voice_profile("u1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 9);
        assert_eq!(loaded.embedding, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_conversation_languages_union() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_member("c1", "u1", Some("en"), Some("fr"), None, true)
            .await
            .unwrap();
        store
            .upsert_member("c1", "u2", Some("de"), None, Some("pt"), true)
            .await
            .unwrap();
        store
            .upsert_member("c1", "u3", Some("it"), None, None, false)
            .await
            .unwrap();
        store
            .upsert_anonymous_participant("c1", "a1", Some("es"), true)
            .await
            .unwrap();

        let languages = store.conversation_languages("c1").await.unwrap();
        let expected: HashSet<String> =
            ["en", "fr", "de", "pt", "es"].iter().map(|s| s.to_string()).collect();
        assert_eq!(languages, expected);
    }

    #[tokio::test]
    async fn test_attachment_transcription_and_translations_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let attachment = Attachment {
            id: "att1".to_string(),
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            file_name: "voice.ogg".to_string(),
            file_url: "/api/v1/attachments/file/voice/voice.ogg".to_string(),
            mime_type: "audio/ogg".to_string(),
            duration_ms: Some(3200),
            transcription: None,
            translations: BTreeMap::new(),
        };
        store.insert_attachment(&attachment).await.unwrap();

        let transcription = TranscriptionRecord {
            text: "hello there".to_string(),
            language: "en".to_string(),
            confidence: 0.95,
            source: crate::types::TranscriptionSource::Whisper,
            segments: None,
            speaker_count: Some(1),
            primary_speaker_id: None,
            sender_voice_identified: None,
            sender_speaker_id: None,
            speaker_analysis: None,
            duration_ms: 3200,
        };
        store
            .update_attachment_transcription("att1", &transcription)
            .await
            .unwrap();

        let record = TranslatedAudioRecord {
            target_language: "fr".to_string(),
            translated_text: "bonjour".to_string(),
            storage_path: "/tmp/att1_fr.mp3".to_string(),
            url: "/api/v1/attachments/file/translated/att1_fr.mp3".to_string(),
            duration_ms: 3100,
            format: "mp3".to_string(),
            voice_cloned: false,
            voice_quality: None,
            segments: None,
            tts_model: Some("tts-1".to_string()),
            created_at: Utc::now(),
        };
        store
            .update_attachment_translations("att1", "fr", &record)
            .await
            .unwrap();

        let loaded = store.find_attachment("att1").await.unwrap().unwrap();
        assert_eq!(loaded.transcription.as_ref().unwrap().text, "hello there");
        assert_eq!(loaded.translations.len(), 1);
        assert_eq!(loaded.translations["fr"].translated_text, "bonjour");

        // Replacing an existing language keeps the map at one entry.
        store
            .update_attachment_translations("att1", "fr", &record)
            .await
            .unwrap();
        let loaded = store.find_attachment("att1").await.unwrap().unwrap();
        assert_eq!(loaded.translations.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_user_translations_used() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.increment_user_translations_used("u1").await.unwrap(), 1);
        assert_eq!(store.increment_user_translations_used("u1").await.unwrap(), 2);
        assert_eq!(store.increment_user_translations_used("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conversation_key_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store
            .load_conversation_encryption_key("c1")
            .await
            .unwrap()
            .is_none());

        let key = ConversationKey {
            key_id: "k1".to_string(),
            conversation_id: "c1".to_string(),
            key: vec![7u8; 32],
        };
        store.store_conversation_key(&key).await.unwrap();

        let loaded = store.load_conversation_encryption_key("c1").await.unwrap().unwrap();
        assert_eq!(loaded.key_id, "k1");
        assert_eq!(loaded.key, vec![7u8; 32]);
    }
}
