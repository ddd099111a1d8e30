//! Process-local caches
//!
//! Two distinct containers:
//! - [`translation::TranslationCache`]: bounded LRU of completed
//!   translations, no expiry.
//! - [`language::LanguageCache`]: small TTL cache of the languages spoken
//!   in a conversation, refreshed from the store on miss.

pub mod language;
pub mod translation;

pub use language::LanguageCache;
pub use translation::{CacheStats, TranslationCache};
