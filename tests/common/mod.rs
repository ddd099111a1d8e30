//! Shared test rig: scripted bus, static consent, sqlite store, tempdir
//! uploads root.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use lingo_relay::bus::{AudioJobRequest, BusClient, TranscriptionRequest, TranslationRequest};
use lingo_relay::config::OrchestratorConfig;
use lingo_relay::consent::{ConsentService, ConsentStatus};
use lingo_relay::events::DomainEvent;
use lingo_relay::orchestrator::TranslationOrchestrator;
use lingo_relay::store::SqliteStore;

/// Bus double that records every request and hands out sequential task ids.
/// Completion events are fed to the orchestrator by the test itself.
#[derive(Default)]
pub struct MockBus {
    pub translation_requests: Mutex<Vec<TranslationRequest>>,
    pub audio_requests: Mutex<Vec<AudioJobRequest>>,
    pub transcription_requests: Mutex<Vec<TranscriptionRequest>>,
    pub fail_sends: AtomicBool,
    counter: AtomicUsize,
}

impl MockBus {
    fn next_task_id(&self) -> String {
        format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn translation_request_count(&self) -> usize {
        self.translation_requests.lock().unwrap().len()
    }

    pub fn audio_request_count(&self) -> usize {
        self.audio_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl BusClient for MockBus {
    async fn request_translation(&self, request: TranslationRequest) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("bus unavailable");
        }
        let task_id = self.next_task_id();
        self.translation_requests.lock().unwrap().push(request);
        Ok(task_id)
    }

    async fn request_audio_job(&self, request: AudioJobRequest) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("bus unavailable");
        }
        let task_id = self.next_task_id();
        self.audio_requests.lock().unwrap().push(request);
        Ok(task_id)
    }

    async fn request_transcription(&self, request: TranscriptionRequest) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("bus unavailable");
        }
        let task_id = self.next_task_id();
        self.transcription_requests.lock().unwrap().push(request);
        Ok(task_id)
    }
}

/// Consent service returning a fixed status for every user.
pub struct StaticConsent(pub ConsentStatus);

#[async_trait]
impl ConsentService for StaticConsent {
    async fn get_consent_status(&self, _user_id: &str) -> Result<ConsentStatus> {
        Ok(self.0)
    }
}

pub struct TestRig {
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub store: Arc<SqliteStore>,
    pub bus: Arc<MockBus>,
    pub uploads: TempDir,
}

pub async fn rig() -> TestRig {
    rig_with(OrchestratorConfig::default(), ConsentStatus::allow_all()).await
}

pub async fn rig_with(config: OrchestratorConfig, consent: ConsentStatus) -> TestRig {
    let store = Arc::new(SqliteStore::in_memory().expect("in-memory store"));
    let bus = Arc::new(MockBus::default());
    let uploads = TempDir::new().expect("tempdir");
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        store.clone(),
        bus.clone(),
        Arc::new(StaticConsent(consent)),
        config,
        uploads.path(),
    ));
    TestRig {
        orchestrator,
        store,
        bus,
        uploads,
    }
}

/// Poll until `check` passes or two seconds elapse.
pub async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Next domain event, or panic after two seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<DomainEvent>) -> DomainEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for domain event")
        .expect("event channel closed")
}

/// Assert no further event arrives within the given window.
pub async fn assert_no_event(rx: &mut broadcast::Receiver<DomainEvent>, window: Duration) {
    if let Ok(event) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
