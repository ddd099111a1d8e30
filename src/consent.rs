//! Voice-data consent gating
//!
//! Audio processing touches biometric data, so every pipeline entry checks
//! the sender's recorded consent before any audio leaves the server. The
//! consent backend is an external collaborator behind [`ConsentService`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capabilities a user has granted for their voice data.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentStatus {
    pub can_transcribe_audio: bool,
    pub can_translate_audio: bool,
    pub can_generate_translated_audio: bool,
    pub can_use_voice_cloning: bool,
    pub has_voice_data_consent: bool,
}

impl ConsentStatus {
    /// Everything granted. Used when the consent check is bypassed.
    pub fn allow_all() -> Self {
        Self {
            can_transcribe_audio: true,
            can_translate_audio: true,
            can_generate_translated_audio: true,
            can_use_voice_cloning: true,
            has_voice_data_consent: true,
        }
    }
}

/// External consent backend.
#[async_trait]
pub trait ConsentService: Send + Sync {
    async fn get_consent_status(&self, user_id: &str) -> Result<ConsentStatus>;
}

/// Consent service that denies everything. Default when no backend is wired
/// up, so a misconfigured deployment fails closed.
#[derive(Debug, Default)]
pub struct DenyAllConsent;

#[async_trait]
impl ConsentService for DenyAllConsent {
    async fn get_consent_status(&self, _user_id: &str) -> Result<ConsentStatus> {
        Ok(ConsentStatus::default())
    }
}
