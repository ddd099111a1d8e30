//! Encryption at rest for stored translations
//!
//! Conversations in `server` or `hybrid` mode have a 32-byte symmetric key
//! the server holds. Translations of their messages are encrypted with
//! AES-256-GCM before persistence; ciphertext, IV, and auth tag are stored
//! separately, all base64-encoded. Key material is read through the store
//! and cached per process.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::store::Store;

/// AES-GCM nonce size in bytes (96 bits).
const IV_LEN: usize = 12;
/// AES-GCM authentication tag size in bytes.
const TAG_LEN: usize = 16;

/// Result of encrypting a translation for storage.
#[derive(Debug, Clone)]
pub struct EncryptedTranslation {
    pub encrypted_content: String,
    pub key_id: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Whether a message's translations must be encrypted, and for which
/// conversation.
#[derive(Debug, Clone)]
pub struct EncryptionDecision {
    pub should_encrypt: bool,
    pub conversation_id: Option<String>,
}

/// Fetches conversation key material and encrypts/decrypts stored
/// translations.
pub struct EncryptionHelper {
    store: Arc<dyn Store>,
    /// conversation id -> (key id, key bytes)
    key_cache: Mutex<HashMap<String, (String, [u8; 32])>>,
}

impl EncryptionHelper {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            key_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the conversation key, hitting the store at most once per
    /// conversation per process.
    pub async fn get_conversation_encryption_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<(String, [u8; 32])>> {
        {
            let cache = self.key_cache.lock().await;
            if let Some(entry) = cache.get(conversation_id) {
                return Ok(Some(entry.clone()));
            }
        }

        let Some(stored) = self
            .store
            .load_conversation_encryption_key(conversation_id)
            .await?
        else {
            return Ok(None);
        };

        let key: [u8; 32] = stored
            .key
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("conversation key {} is not 32 bytes", stored.key_id))?;

        let mut cache = self.key_cache.lock().await;
        cache.insert(conversation_id.to_string(), (stored.key_id.clone(), key));
        Ok(Some((stored.key_id, key)))
    }

    /// Encrypt a translation with the conversation key. Returns `None` when
    /// the conversation has no key provisioned.
    pub async fn encrypt_translation(
        &self,
        plaintext: &str,
        conversation_id: &str,
    ) -> Result<Option<EncryptedTranslation>> {
        let Some((key_id, key)) = self.get_conversation_encryption_key(conversation_id).await?
        else {
            warn!(conversation_id, "no conversation key; translation stored unencrypted");
            return Ok(None);
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| anyhow!("AES-GCM encryption failed for conversation {}", conversation_id))?;

        // aes-gcm appends the tag; split it off so the columns stay separate.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        debug!(conversation_id, key_id = %key_id, "Encrypted translation");
        Ok(Some(EncryptedTranslation {
            encrypted_content: general_purpose::STANDARD.encode(ciphertext),
            key_id,
            iv: general_purpose::STANDARD.encode(iv),
            auth_tag: general_purpose::STANDARD.encode(tag),
        }))
    }

    /// Authenticated decryption of a stored translation. Fails on key
    /// mismatch or a tampered tag; callers must treat that as "no
    /// translation" rather than exposing the ciphertext.
    pub async fn decrypt_translation(
        &self,
        ciphertext_b64: &str,
        key_id: &str,
        iv_b64: &str,
        auth_tag_b64: &str,
        conversation_id: &str,
    ) -> Result<String> {
        let Some((stored_key_id, key)) =
            self.get_conversation_encryption_key(conversation_id).await?
        else {
            return Err(OrchestratorError::Decryption(format!(
                "no key for conversation {}",
                conversation_id
            ))
            .into());
        };
        if stored_key_id != key_id {
            return Err(OrchestratorError::Decryption(format!(
                "key {} no longer current for conversation {}",
                key_id, conversation_id
            ))
            .into());
        }

        let ciphertext = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .context("decoding stored ciphertext")?;
        let iv = general_purpose::STANDARD
            .decode(iv_b64)
            .context("decoding stored iv")?;
        let tag = general_purpose::STANDARD
            .decode(auth_tag_b64)
            .context("decoding stored auth tag")?;
        if iv.len() != IV_LEN {
            return Err(OrchestratorError::Decryption("stored iv has wrong length".into()).into());
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| {
                OrchestratorError::Decryption(format!(
                    "auth tag mismatch for conversation {}",
                    conversation_id
                ))
            })?;

        String::from_utf8(plaintext).context("decrypted translation is not valid UTF-8")
    }

    /// Decide whether a message's translations must be encrypted at rest.
    /// True iff the message's encryption mode is `server` or `hybrid`.
    pub async fn should_encrypt_translation(&self, message_id: &str) -> Result<EncryptionDecision> {
        let Some(message) = self.store.find_message(message_id).await? else {
            return Ok(EncryptionDecision {
                should_encrypt: false,
                conversation_id: None,
            });
        };
        Ok(EncryptionDecision {
            should_encrypt: message.encryption_mode.requires_server_encryption(),
            conversation_id: Some(message.conversation_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{ChatMessage, ConversationKey, EncryptionMode};
    use chrono::Utc;

    async fn helper_with_key() -> (EncryptionHelper, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .store_conversation_key(&ConversationKey {
                key_id: "key-1".to_string(),
                conversation_id: "c1".to_string(),
                key: vec![42u8; 32],
            })
            .await
            .unwrap();
        (EncryptionHelper::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let (helper, _store) = helper_with_key().await;

        let sealed = helper
            .encrypt_translation("Bonjour tout le monde", "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sealed.key_id, "key-1");
        assert!(!sealed.iv.is_empty());
        assert!(!sealed.auth_tag.is_empty());
        assert_ne!(sealed.encrypted_content, "Bonjour tout le monde");

        let plain = helper
            .decrypt_translation(
                &sealed.encrypted_content,
                &sealed.key_id,
                &sealed.iv,
                &sealed.auth_tag,
                "c1",
            )
            .await
            .unwrap();
        assert_eq!(plain, "Bonjour tout le monde");
    }

    #[tokio::test]
    async fn test_tampered_tag_fails() {
        let (helper, _store) = helper_with_key().await;

        let sealed = helper.encrypt_translation("secret", "c1").await.unwrap().unwrap();
        let tampered = general_purpose::STANDARD.encode([0u8; 16]);

        let result = helper
            .decrypt_translation(
                &sealed.encrypted_content,
                &sealed.key_id,
                &sealed.iv,
                &tampered,
                "c1",
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fresh_iv_per_encryption() {
        let (helper, _store) = helper_with_key().await;
        let a = helper.encrypt_translation("same text", "c1").await.unwrap().unwrap();
        let b = helper.encrypt_translation("same text", "c1").await.unwrap().unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_content, b.encrypted_content);
    }

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let helper = EncryptionHelper::new(store);
        assert!(helper
            .encrypt_translation("text", "no-key-conversation")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_should_encrypt_follows_message_mode() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let helper = EncryptionHelper::new(store.clone());

        for (id, mode, expected) in [
            ("m-none", EncryptionMode::None, false),
            ("m-server", EncryptionMode::Server, true),
            ("m-hybrid", EncryptionMode::Hybrid, true),
        ] {
            store
                .insert_message(&ChatMessage {
                    id: id.to_string(),
                    conversation_id: "c1".to_string(),
                    sender_id: Some("u1".to_string()),
                    anonymous_sender_id: None,
                    content: "hello".to_string(),
                    original_language: "en".to_string(),
                    message_type: "text".to_string(),
                    reply_to_id: None,
                    encryption_mode: mode,
                    model_type: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
            let decision = helper.should_encrypt_translation(id).await.unwrap();
            assert_eq!(decision.should_encrypt, expected, "mode {:?}", mode);
            assert_eq!(decision.conversation_id.as_deref(), Some("c1"));
        }

        let unknown = helper.should_encrypt_translation("missing").await.unwrap();
        assert!(!unknown.should_encrypt);
        assert!(unknown.conversation_id.is_none());
    }
}
