//! Configuration management

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{Channel, Glossary, ModelPair, SizeBucket, Task};

/// Default target language
pub const DEFAULT_TARGET_LANG: &str = "zh-CN";

/// Default cache file
pub const DEFAULT_CACHE_PATH: &str = ".ifocal-cache.json";

/// Default outbound rate: (qps, qpm, max concurrent)
pub const DEFAULT_RATE: RateSettings = RateSettings {
    qps: 2,
    qpm: 120,
    max_concurrent: 1,
};

/// Target languages offered to clients
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("zh-CN", "中文"),
    ("en", "English"),
    ("ja", "日本語"),
    ("ko", "한국어"),
    ("fr", "Français"),
    ("es", "Español"),
    ("de", "Deutsch"),
];

/// Outbound rate ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSettings {
    pub qps: u32,
    pub qpm: u32,
    pub max_concurrent: u32,
}

/// Prompt template overrides; `{{targetLang}}` and `{{text}}` are substituted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplates {
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub summarize: Option<String>,
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default)]
    pub polish: Option<String>,
    #[serde(default)]
    pub chat: Option<String>,
}

impl PromptTemplates {
    pub fn for_task(&self, task: Task) -> Option<&str> {
        match task {
            Task::Translate => self.translate.as_deref(),
            Task::Summarize => self.summarize.as_deref(),
            Task::Rewrite => self.rewrite.as_deref(),
            Task::Polish => self.polish.as_deref(),
            Task::Chat => self.chat.as_deref(),
        }
    }
}

/// Fixed translation for one term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub translation: String,
}

/// Packing limits for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCaps {
    pub max_items: usize,
    pub max_chars: usize,
}

impl BucketCaps {
    pub const fn new(max_items: usize, max_chars: usize) -> Self {
        Self {
            max_items,
            max_chars,
        }
    }
}

/// Orchestrator batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub short: BucketCaps,
    pub medium: BucketCaps,
    pub long: BucketCaps,
    pub strict_short: BucketCaps,
    pub strict_medium: BucketCaps,
    pub strict_long: BucketCaps,
    pub timeout_ms: u64,
    pub strict_timeout_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            short: BucketCaps::new(50, 1500),
            medium: BucketCaps::new(20, 2400),
            long: BucketCaps::new(6, 3600),
            strict_short: BucketCaps::new(20, 600),
            strict_medium: BucketCaps::new(8, 960),
            strict_long: BucketCaps::new(2, 1800),
            timeout_ms: 20_000,
            strict_timeout_ms: 25_000,
        }
    }
}

impl BatchSettings {
    /// Caps for a bucket in the normal or strict pass
    pub fn caps(&self, bucket: SizeBucket, strict: bool) -> BucketCaps {
        match (bucket, strict) {
            (SizeBucket::Short, false) => self.short,
            (SizeBucket::Medium, false) => self.medium,
            (SizeBucket::Long, false) => self.long,
            (SizeBucket::Short, true) => self.strict_short,
            (SizeBucket::Medium, true) => self.strict_medium,
            (SizeBucket::Long, true) => self.strict_long,
        }
    }

    pub fn timeout(&self, strict: bool) -> Duration {
        Duration::from_millis(if strict {
            self.strict_timeout_ms
        } else {
            self.timeout_ms
        })
    }
}

/// Application configuration, as persisted in the config store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub channels: Vec<Channel>,
    pub default_model: Option<ModelPair>,
    pub translate_model: Option<ModelPair>,
    pub active_model: Option<ModelPair>,
    pub translate_target_lang: String,
    pub prompt_templates: PromptTemplates,
    pub glossary_not_translate: Vec<String>,
    pub glossary_terms: Vec<GlossaryTerm>,
    /// Signed so a non-positive value in a file is ignored instead of
    /// failing the whole load
    pub tx_qps: Option<i64>,
    pub tx_qpm: Option<i64>,
    pub tx_max_concurrent: Option<i64>,
    pub tx_strict_json: bool,
    pub tx_disable_cache: bool,
    pub tx_use_gateway: bool,
    pub tx_gateway_url: Option<String>,
    pub cache_path: PathBuf,
    pub batch: BatchSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channels: vec![],
            default_model: None,
            translate_model: None,
            active_model: None,
            translate_target_lang: DEFAULT_TARGET_LANG.to_string(),
            prompt_templates: PromptTemplates::default(),
            glossary_not_translate: vec![],
            glossary_terms: vec![],
            tx_qps: None,
            tx_qpm: None,
            tx_max_concurrent: None,
            tx_strict_json: false,
            tx_disable_cache: false,
            tx_use_gateway: false,
            tx_gateway_url: None,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            batch: BatchSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from an optional file layered with `IFOCAL__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("IFOCAL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!(channels = config.channels.len(), "Configuration loaded");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(TranslationError::config("channel name must not be empty"));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(TranslationError::config(format!(
                    "duplicate channel name: {}",
                    channel.name
                )));
            }
            if !channel.is_usable() {
                warn!(channel = %channel.name, "Channel has no models configured");
            }
        }
        Ok(())
    }

    /// Effective rate settings; missing or non-positive values fall back to defaults
    pub fn rate_settings(&self) -> RateSettings {
        fn positive(value: Option<i64>, default: u32) -> u32 {
            value
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        }
        RateSettings {
            qps: positive(self.tx_qps, DEFAULT_RATE.qps),
            qpm: positive(self.tx_qpm, DEFAULT_RATE.qpm),
            max_concurrent: positive(self.tx_max_concurrent, DEFAULT_RATE.max_concurrent),
        }
    }

    fn is_valid_pair(&self, pair: &ModelPair) -> bool {
        self.channels
            .iter()
            .any(|c| c.name == pair.channel && c.has_model(&pair.model))
    }

    /// Resolve the model to use: explicit request, task default, global
    /// default, active model, then the first channel with a model.
    pub fn pick_model(&self, task: Task, requested: Option<&ModelPair>) -> Option<ModelPair> {
        let task_default = match task {
            Task::Translate => self.translate_model.as_ref(),
            _ => None,
        };

        let chain = [
            requested,
            task_default,
            self.default_model.as_ref(),
            self.active_model.as_ref(),
        ];
        if let Some(pair) = chain
            .into_iter()
            .flatten()
            .find(|pair| self.is_valid_pair(pair))
        {
            return Some(pair.clone());
        }

        self.channels
            .iter()
            .find_map(|c| c.models.first().map(|m| ModelPair::new(c.name.clone(), m.clone())))
    }

    /// Find channel by name
    pub fn find_channel(&self, name: &str) -> Result<&Channel> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TranslationError::config(format!("Channel not found: {}", name)))
    }

    /// All models as `channel:model` strings
    pub fn available_models(&self) -> Vec<String> {
        self.channels
            .iter()
            .flat_map(|c| c.models.iter().map(move |m| format!("{}:{}", c.name, m)))
            .collect()
    }

    pub fn target_lang(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or(self.translate_target_lang.as_str())
            .to_string()
    }

    pub fn glossary(&self) -> Glossary {
        Glossary {
            not_translate: self.glossary_not_translate.clone(),
            terms: self
                .glossary_terms
                .iter()
                .map(|t| (t.term.clone(), t.translation.clone()))
                .collect(),
        }
    }

    /// Gateway URL when the gateway is enabled and configured
    pub fn gateway_url(&self) -> Option<&str> {
        if !self.tx_use_gateway {
            return None;
        }
        self.tx_gateway_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Persisted, observable configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the current configuration
    async fn get(&self) -> Result<AppConfig>;

    /// Receive every configuration change
    fn subscribe(&self) -> watch::Receiver<AppConfig>;
}

/// In-memory configuration store
#[derive(Debug)]
pub struct MemoryConfigStore {
    tx: watch::Sender<AppConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx }
    }

    /// Replace the configuration and notify subscribers
    pub fn set(&self, config: AppConfig) {
        self.tx.send_replace(config);
    }

    /// Edit the configuration in place and notify subscribers
    pub fn update(&self, edit: impl FnOnce(&mut AppConfig)) {
        self.tx.send_modify(edit);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Result<AppConfig> {
        Ok(self.tx.borrow().clone())
    }

    fn subscribe(&self) -> watch::Receiver<AppConfig> {
        self.tx.subscribe()
    }
}

/// Configuration store backed by a file plus environment overrides.
///
/// Every `get` re-reads the file so edits are picked up without restart.
#[derive(Debug)]
pub struct FileConfigStore {
    path: Option<PathBuf>,
    tx: watch::Sender<AppConfig>,
}

impl FileConfigStore {
    /// Open the store, failing if the initial configuration is invalid
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let config = AppConfig::load(path.as_deref())?;
        if let Some(path) = &path {
            info!(path = %path.display(), "Configuration store opened");
        }
        let (tx, _rx) = watch::channel(config);
        Ok(Self { path, tx })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn reload(&self) -> Result<AppConfig> {
        let config = AppConfig::load(self.path.as_deref())?;
        self.tx.send_if_modified(|current| {
            if *current == config {
                false
            } else {
                *current = config.clone();
                true
            }
        });
        Ok(config)
    }

    fn modified_at(&self) -> Option<SystemTime> {
        let path = self.path.as_ref()?;
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// Poll the file's modification time and publish changes
    pub fn spawn_watcher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_seen = self.modified_at();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let modified = self.modified_at();
                if modified == last_seen {
                    continue;
                }
                last_seen = modified;
                match self.reload() {
                    Ok(_) => info!("Configuration file changed, reloaded"),
                    Err(e) => warn!("Ignoring invalid configuration change: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    /// A file that fails to load keeps the last good configuration in force
    async fn get(&self) -> Result<AppConfig> {
        match self.reload() {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Using last valid configuration: {}", e);
                Ok(self.tx.borrow().clone())
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<AppConfig> {
        self.tx.subscribe()
    }
}
