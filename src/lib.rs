//! Lingo Relay - Message Translation Orchestrator Library
//!
//! The translation core of a multilingual chat platform:
//! - Message ingest with fanout translation requests to remote workers
//! - Asynchronous, out-of-order completion handling with idempotent upserts
//! - Two-phase audio pipeline (transcription first, per-language audio after)
//! - AES-256-GCM encryption at rest for server/hybrid conversations
//! - Progressive domain events for the real-time fanout layer
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lingo_relay::config::Config;
//! use lingo_relay::orchestrator::TranslationOrchestrator;
//! use lingo_relay::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = Arc::new(SqliteStore::new(&config.database.path).await?);
//!     let orchestrator = Arc::new(TranslationOrchestrator::new(
//!         store,
//!         bus_client,        // your BusClient implementation
//!         consent_service,   // your ConsentService implementation
//!         config.orchestrator,
//!         config.storage.uploads_root,
//!     ));
//!     orchestrator.attach_bus_events(bus_event_rx);
//!     let mut events = orchestrator.subscribe();
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod events;
pub mod bus;
pub mod consent;
pub mod storage;
pub mod cache;
pub mod crypto;
pub mod store; // Must come before orchestrator since it depends on store
pub mod orchestrator;
pub mod cli;

// Re-export commonly used types for convenience
pub use bus::{BusClient, BusEvent};
pub use config::Config;
pub use consent::{ConsentService, ConsentStatus};
pub use error::OrchestratorError;
pub use events::DomainEvent;
pub use orchestrator::{AudioJobParams, StatsSnapshot, TranslationOrchestrator};
pub use store::{SqliteStore, Store};
pub use types::{
    EncryptionMode, IngestOutcome, IngestStatus, NewMessage, TranslationRecord, TranslationResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Message Translation Orchestrator", NAME, VERSION)
}
