//! iFocal - rate-limited batch translation service
//!
//! This library provides model dispatch across OpenAI-compatible and Gemini
//! channels, a windowed rate limiter with adaptive degradation, batched page
//! translation with caching, and an HTTP API.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod orchestrator;
pub mod processors;
pub mod server;

// Re-export key types for convenience
pub use core::{
    config::{AppConfig, ConfigStore, FileConfigStore, MemoryConfigStore},
    dispatch::{BatchTranslate, Dispatcher},
    engine::Engine,
    errors::{Result, TranslationError},
    models::{ActionRequest, BatchItem, BatchTranslateRequest, Channel, ModelPair, Task},
    rate_limiter::RateLimiter,
};

pub use orchestrator::{Orchestrator, TranslationRun};
pub use processors::markdown::MarkdownProcessor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
