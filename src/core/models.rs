//! Core data models for dispatch and batch translation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::core::errors::TranslationError;

/// Vendor protocol spoken by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorType {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "gemini")]
    Gemini,
}

impl fmt::Display for VendorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VendorType::OpenAi => write!(f, "openai"),
            VendorType::OpenAiCompatible => write!(f, "openai-compatible"),
            VendorType::Gemini => write!(f, "gemini"),
        }
    }
}

/// A configured API endpoint with its key and models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(rename = "type")]
    pub vendor: VendorType,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

impl Channel {
    /// A channel without models cannot serve requests
    pub fn is_usable(&self) -> bool {
        !self.models.is_empty()
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Reference to one model of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPair {
    pub channel: String,
    pub model: String,
}

impl ModelPair {
    pub fn new(channel: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.model)
    }
}

impl FromStr for ModelPair {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(channel), Some(model)) if !channel.is_empty() && !model.is_empty() => {
                Ok(Self::new(channel, model))
            }
            _ => Err(TranslationError::config(format!(
                "expected <channel>:<model>, got '{}'",
                s
            ))),
        }
    }
}

/// Task performed by a single-shot action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Translate,
    Summarize,
    Rewrite,
    Polish,
    Chat,
}

impl Task {
    /// Map a UI feature name onto a task; unknown features become chat.
    pub fn from_feature(feature: &str) -> Self {
        match feature {
            "translate" => Task::Translate,
            "summarize" | "analyze-page" => Task::Summarize,
            "rewrite" => Task::Rewrite,
            "polish" => Task::Polish,
            _ => Task::Chat,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::Translate => "translate",
            Task::Summarize => "summarize",
            Task::Rewrite => "rewrite",
            Task::Polish => "polish",
            Task::Chat => "chat",
        };
        write!(f, "{}", name)
    }
}

/// Length class of a translation item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeBucket {
    Short,
    Medium,
    Long,
}

impl SizeBucket {
    /// Processing order of buckets within a run
    pub const ALL: [SizeBucket; 3] = [SizeBucket::Short, SizeBucket::Medium, SizeBucket::Long];

    /// Classify by character count of the normalized text
    pub fn classify(chars: usize) -> Self {
        if chars <= 30 {
            SizeBucket::Short
        } else if chars <= 120 {
            SizeBucket::Medium
        } else {
            SizeBucket::Long
        }
    }

    pub fn index(self) -> usize {
        match self {
            SizeBucket::Short => 0,
            SizeBucket::Medium => 1,
            SizeBucket::Long => 2,
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeBucket::Short => write!(f, "short"),
            SizeBucket::Medium => write!(f, "medium"),
            SizeBucket::Long => write!(f, "long"),
        }
    }
}

/// One `{id, text}` element of a batch request or response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub text: String,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Output rules sent along with a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPolicy {
    #[serde(default = "default_true")]
    pub json_only: bool,
    #[serde(default = "default_true")]
    pub preserve_placeholders: bool,
    #[serde(default = "default_true")]
    pub preserve_numbers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            json_only: true,
            preserve_placeholders: true,
            preserve_numbers: true,
            strict: None,
        }
    }
}

impl BatchPolicy {
    pub fn strict() -> Self {
        Self {
            strict: Some(true),
            ..Self::default()
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict.unwrap_or(false)
    }
}

/// Per-request limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConstraints {
    pub timeout_ms: u64,
}

/// Terms that must stay untranslated or be translated a fixed way
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Glossary {
    #[serde(default)]
    pub not_translate: Vec<String>,
    #[serde(default)]
    pub terms: BTreeMap<String, String>,
}

impl Glossary {
    pub fn is_empty(&self) -> bool {
        self.not_translate.is_empty() && self.terms.is_empty()
    }
}

/// Batch translate request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTranslateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(default)]
    pub items: Vec<BatchItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<BatchPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<BatchConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glossary: Option<Glossary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BatchTranslateRequest {
    pub fn new(target_lang: impl Into<String>, items: Vec<BatchItem>) -> Self {
        Self {
            target_lang: Some(target_lang.into()),
            items,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.constraints = Some(BatchConstraints { timeout_ms });
        self
    }

    /// Explicit channel/model pair, if both were given
    pub fn requested_pair(&self) -> Option<ModelPair> {
        match (&self.channel, &self.model) {
            (Some(channel), Some(model)) => Some(ModelPair::new(channel.clone(), model.clone())),
            _ => None,
        }
    }
}

/// Successful batch translation
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTranslation {
    pub translations: Vec<BatchItem>,
    pub channel: String,
    pub model: String,
}

/// Batch translate response: `{ok: true, translations}` or `{ok: false, error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTranslateResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translations: Option<Vec<BatchItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BatchTranslateResponse {
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            ok: false,
            translations: None,
            error: Some(error.to_string()),
            channel: None,
            model: None,
        }
    }
}

impl From<BatchTranslation> for BatchTranslateResponse {
    fn from(batch: BatchTranslation) -> Self {
        Self {
            ok: true,
            translations: Some(batch.translations),
            error: None,
            channel: Some(batch.channel),
            model: Some(batch.model),
        }
    }
}

/// Single-shot request (translate selection, summarize, rewrite, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub task: Task,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ActionRequest {
    pub fn new(task: Task, text: impl Into<String>) -> Self {
        Self {
            task,
            text: text.into(),
            target_lang: None,
            channel: None,
            model: None,
        }
    }

    pub fn requested_pair(&self) -> Option<ModelPair> {
        match (&self.channel, &self.model) {
            (Some(channel), Some(model)) => Some(ModelPair::new(channel.clone(), model.clone())),
            _ => None,
        }
    }
}

/// Result of a single-shot action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub result: String,
    pub channel: String,
    pub model: String,
}

/// Connectivity test for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTestRequest {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Read-only view of the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStatus {
    pub qps: u32,
    pub qpm: u32,
    pub max_concurrent: u32,
    pub degraded: bool,
    /// Unix milliseconds; 0 when not degraded
    pub degraded_until: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bucket_boundaries() {
        assert_eq!(SizeBucket::classify(0), SizeBucket::Short);
        assert_eq!(SizeBucket::classify(30), SizeBucket::Short);
        assert_eq!(SizeBucket::classify(31), SizeBucket::Medium);
        assert_eq!(SizeBucket::classify(120), SizeBucket::Medium);
        assert_eq!(SizeBucket::classify(121), SizeBucket::Long);
    }

    #[test]
    fn test_model_pair_parsing() {
        let pair: ModelPair = "work:gpt-4o-mini".parse().unwrap();
        assert_eq!(pair, ModelPair::new("work", "gpt-4o-mini"));
        assert_eq!(pair.to_string(), "work:gpt-4o-mini");
        assert!("work".parse::<ModelPair>().is_err());
        assert!(":model".parse::<ModelPair>().is_err());
    }

    #[test]
    fn test_feature_mapping() {
        assert_eq!(Task::from_feature("translate"), Task::Translate);
        assert_eq!(Task::from_feature("analyze-page"), Task::Summarize);
        assert_eq!(Task::from_feature("rewrite"), Task::Rewrite);
        assert_eq!(Task::from_feature("anything"), Task::Chat);
    }

    #[test]
    fn test_request_wire_format() {
        let raw = r#"{
            "targetLang": "ja",
            "items": [{"id": "a", "text": "Hello"}],
            "policy": {"jsonOnly": true, "preservePlaceholders": true, "preserveNumbers": false},
            "constraints": {"timeoutMs": 5000}
        }"#;
        let request: BatchTranslateRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.target_lang.as_deref(), Some("ja"));
        assert_eq!(request.items, vec![BatchItem::new("a", "Hello")]);
        let policy = request.policy.unwrap();
        assert!(!policy.preserve_numbers);
        assert!(!policy.is_strict());
        assert_eq!(request.constraints.unwrap().timeout_ms, 5000);
    }

    #[test]
    fn test_response_wire_format() {
        let ok = BatchTranslateResponse::from(BatchTranslation {
            translations: vec![BatchItem::new("a", "こんにちは")],
            channel: "work".to_string(),
            model: "m".to_string(),
        });
        assert_json_diff::assert_json_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({
                "ok": true,
                "translations": [{"id": "a", "text": "こんにちは"}],
                "channel": "work",
                "model": "m"
            })
        );

        let failed = BatchTranslateResponse::failure("No available model");
        assert_json_diff::assert_json_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"ok": false, "error": "No available model"})
        );
    }

    #[test]
    fn test_channel_deserialize() {
        let raw = r#"{"name": "g", "type": "gemini", "models": ["gemini-1.5-flash"]}"#;
        let channel: Channel = serde_json::from_str(raw).unwrap();
        assert_eq!(channel.vendor, VendorType::Gemini);
        assert!(channel.api_key.is_none());
        assert!(channel.is_usable());
        assert!(channel.has_model("gemini-1.5-flash"));
    }
}
