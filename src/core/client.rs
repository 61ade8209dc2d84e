//! Vendor HTTP adapters (OpenAI, OpenAI-compatible, Gemini) and the
//! optional translation gateway

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{BatchItem, BatchPolicy, Channel, Glossary, VendorType};
use crate::core::prompt::make_user_message;

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Performs one model call and returns plain text
#[async_trait]
pub trait Vendor: Send + Sync {
    async fn invoke(&self, channel: &Channel, model: &str, prompt: &str) -> Result<String>;
}

/// Batch payload forwarded to a translation gateway
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPayload<'a> {
    pub target_lang: &'a str,
    pub items: &'a [BatchItem],
    pub policy: &'a BatchPolicy,
    pub glossary: &'a Glossary,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    translations: Option<Vec<BatchItem>>,
}

/// Calls a translation gateway's batch endpoint
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn translate_batch(&self, base_url: &str, payload: &GatewayPayload<'_>) -> Result<Vec<BatchItem>>;
}

fn join_base_path(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// reqwest-backed vendor and gateway client
#[derive(Debug, Clone)]
pub struct HttpVendor {
    client: reqwest::Client,
}

impl HttpVendor {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client })
    }

    async fn call_openai(&self, base_url: Option<&str>, api_key: &str, model: &str, prompt: &str) -> Result<String> {
        let url = join_base_path(base_url.unwrap_or(OPENAI_BASE), "/chat/completions");
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": make_user_message(prompt) }],
            "temperature": 0.2
        });

        debug!(%url, model, "Calling OpenAI-style endpoint");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::ApiError {
                vendor: "OpenAI".to_string(),
                status: status.as_u16(),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponseError {
                message: e.to_string(),
            })?;

        json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .filter(|content| !content.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TranslationError::InvalidResponseError {
                message: "OpenAI returned empty response".to_string(),
            })
    }

    async fn call_gemini(&self, base_url: Option<&str>, api_key: &str, model: &str, prompt: &str) -> Result<String> {
        let base = join_base_path(base_url.unwrap_or(GEMINI_BASE), "/models");
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| TranslationError::config(format!("invalid Gemini base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TranslationError::config("Gemini base URL cannot be a base"))?
            .push(&format!("{}:generateContent", model));

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        debug!(model, "Calling Gemini endpoint");
        let response = self
            .client
            .post(url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::ApiError {
                vendor: "Gemini".to_string(),
                status: status.as_u16(),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponseError {
                message: e.to_string(),
            })?;

        let text = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .map(|p| p["text"].as_str().unwrap_or(""))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(TranslationError::InvalidResponseError {
                message: "Gemini returned empty response".to_string(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl Vendor for HttpVendor {
    async fn invoke(&self, channel: &Channel, model: &str, prompt: &str) -> Result<String> {
        let api_key = channel
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| TranslationError::config("Channel is missing API key"))?;
        let base_url = channel.api_url.as_deref().filter(|u| !u.trim().is_empty());

        match channel.vendor {
            VendorType::OpenAi | VendorType::OpenAiCompatible => {
                self.call_openai(base_url, api_key, model, prompt).await
            }
            VendorType::Gemini => self.call_gemini(base_url, api_key, model, prompt).await,
        }
    }
}

#[async_trait]
impl Gateway for HttpVendor {
    async fn translate_batch(&self, base_url: &str, payload: &GatewayPayload<'_>) -> Result<Vec<BatchItem>> {
        let url = join_base_path(base_url, "/translate:batch");
        let response = self.client.post(&url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::ApiError {
                vendor: "Gateway".to_string(),
                status: status.as_u16(),
            });
        }

        let body: GatewayResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponseError {
                message: e.to_string(),
            })?;
        body.translations
            .ok_or_else(|| TranslationError::InvalidResponseError {
                message: "Gateway invalid response".to_string(),
            })
    }
}
