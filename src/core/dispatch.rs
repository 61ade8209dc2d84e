//! Request dispatch: model resolution, prompts and every outbound call
//!
//! All vendor and gateway traffic goes through [`Dispatcher`], which takes a
//! limiter permit per attempt and wraps attempts with the one-shot backoff.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::backoff::{with_timeout, Backoff, BackoffPolicy};
use crate::core::client::{Gateway, GatewayPayload, Vendor};
use crate::core::config::{AppConfig, ConfigStore};
use crate::core::degradation::RateLimiterService;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{
    ActionRequest, ActionResult, BatchTranslateRequest, BatchTranslateResponse, BatchTranslation,
    Channel, ChannelTestRequest, ModelPair, RateStatus, Task,
};
use crate::core::prompt::{build_batch_prompt, extract_json_array, make_prompt};

/// Default per-call timeout for batch requests
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(20_000);

const CONNECTION_TEST_TEXT: &str = "Connection test. Respond with OK.";
const GATEWAY_LABEL: &str = "gateway";

/// Anything that can translate one batch of `{id, text}` items
#[async_trait]
pub trait BatchTranslate: Send + Sync {
    async fn translate_batch(&self, request: BatchTranslateRequest) -> Result<BatchTranslation>;
}

/// Background request handlers
pub struct Dispatcher {
    store: Arc<dyn ConfigStore>,
    vendor: Arc<dyn Vendor>,
    gateway: Arc<dyn Gateway>,
    rate: Arc<RateLimiterService>,
    backoff: Backoff,
}

fn resolve_pair(config: &AppConfig, task: Task, requested: Option<ModelPair>) -> Result<ModelPair> {
    config
        .pick_model(task, requested.as_ref())
        .ok_or_else(|| TranslationError::config("No available model"))
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        vendor: Arc<dyn Vendor>,
        gateway: Arc<dyn Gateway>,
        rate: Arc<RateLimiterService>,
    ) -> Self {
        let backoff = Backoff::new(Arc::clone(&rate));
        Self {
            store,
            vendor,
            gateway,
            rate,
            backoff,
        }
    }

    pub fn with_backoff_policy(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Backoff::with_policy(Arc::clone(&self.rate), policy);
        self
    }

    pub fn rate(&self) -> &Arc<RateLimiterService> {
        &self.rate
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// One vendor call under the limiter and backoff policy.
    /// The timeout bounds each attempt, not the time spent queued.
    async fn invoke_limited(
        &self,
        channel: &Channel,
        model: &str,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let rate = &self.rate;
        let vendor = &self.vendor;
        self.backoff
            .run(
                move || async move {
                    let _permit = rate.acquire().await;
                    with_timeout(vendor.invoke(channel, model, prompt), timeout).await
                },
                None,
            )
            .await
    }

    /// Single-shot translate / summarize / rewrite / polish / chat
    pub async fn perform_action(&self, request: ActionRequest) -> Result<ActionResult> {
        let config = self.store.get().await?;
        let pair = resolve_pair(&config, request.task, request.requested_pair())?;
        let channel = config.find_channel(&pair.channel)?;
        let target_lang = config.target_lang(request.target_lang.as_deref());
        let prompt = make_prompt(request.task, &request.text, &target_lang, &config.prompt_templates);

        debug!(task = %request.task, model = %pair, "Performing action");
        let result = self.invoke_limited(channel, &pair.model, &prompt, None).await?;
        Ok(ActionResult {
            result,
            channel: pair.channel,
            model: pair.model,
        })
    }

    /// Send a fixed prompt to a channel and return the vendor's reply
    pub async fn test_channel(&self, request: ChannelTestRequest) -> Result<String> {
        let config = self.store.get().await?;
        let channel = config
            .channels
            .iter()
            .find(|c| c.name == request.channel)
            .ok_or_else(|| TranslationError::config("Channel not found"))?;
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| channel.models.first().map(String::as_str))
            .ok_or_else(|| TranslationError::config("Channel has no models configured"))?;

        let prompt = make_prompt(
            Task::Summarize,
            CONNECTION_TEST_TEXT,
            &config.translate_target_lang,
            &config.prompt_templates,
        );
        let sample = self.invoke_limited(channel, model, &prompt, None).await?;
        info!(channel = %channel.name, model, "Channel test succeeded");
        Ok(sample)
    }

    /// Translate one batch, preferring the gateway when it is enabled
    pub async fn translate_batch(&self, request: BatchTranslateRequest) -> Result<BatchTranslation> {
        let config = self.store.get().await?;
        let pair = resolve_pair(&config, Task::Translate, request.requested_pair())?;
        let channel = config.find_channel(&pair.channel)?;
        let target_lang = config.target_lang(request.target_lang.as_deref());

        let mut policy = request.policy.clone().unwrap_or_default();
        if policy.strict.is_none() {
            policy.strict = Some(config.tx_strict_json);
        }
        let glossary = request.glossary.clone().unwrap_or_else(|| config.glossary());
        let timeout = request
            .constraints
            .as_ref()
            .map(|c| Duration::from_millis(c.timeout_ms))
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_BATCH_TIMEOUT);

        if request.items.is_empty() {
            return Ok(BatchTranslation {
                translations: vec![],
                channel: pair.channel,
                model: pair.model,
            });
        }

        if let Some(url) = config.gateway_url() {
            let payload = GatewayPayload {
                target_lang: &target_lang,
                items: &request.items,
                policy: &policy,
                glossary: &glossary,
            };
            let rate = &self.rate;
            let gateway = &self.gateway;
            let payload = &payload;
            let attempt = self
                .backoff
                .run(
                    move || async move {
                        let _permit = rate.acquire().await;
                        with_timeout(gateway.translate_batch(url, payload), Some(timeout)).await
                    },
                    None,
                )
                .await;
            match attempt {
                Ok(translations) => {
                    return Ok(BatchTranslation {
                        translations,
                        channel: GATEWAY_LABEL.to_string(),
                        model: GATEWAY_LABEL.to_string(),
                    })
                }
                Err(e) => warn!("Gateway failed, falling back to vendor: {}", e),
            }
        }

        let prompt = build_batch_prompt(&request.items, &target_lang, &policy, Some(&glossary));
        debug!(
            items = request.items.len(),
            strict = policy.is_strict(),
            model = %pair,
            "Dispatching batch"
        );
        let raw = self
            .invoke_limited(channel, &pair.model, &prompt, Some(timeout))
            .await?;

        let translations = extract_json_array(&raw);
        if translations.is_empty() {
            return Err(TranslationError::InvalidResponseError {
                message: "Batch translation: empty or invalid JSON response".to_string(),
            });
        }
        Ok(BatchTranslation {
            translations,
            channel: pair.channel,
            model: pair.model,
        })
    }

    /// Batch handler in wire form: errors become `{ok: false, error}`
    pub async fn handle_translate_batch(&self, request: BatchTranslateRequest) -> BatchTranslateResponse {
        match self.translate_batch(request).await {
            Ok(batch) => batch.into(),
            Err(e) => BatchTranslateResponse::failure(e),
        }
    }

    pub fn rate_status(&self) -> RateStatus {
        self.rate.status()
    }

    /// Every configured `channel:model`
    pub async fn available_models(&self) -> Result<Vec<String>> {
        Ok(self.store.get().await?.available_models())
    }
}

#[async_trait]
impl BatchTranslate for Dispatcher {
    async fn translate_batch(&self, request: BatchTranslateRequest) -> Result<BatchTranslation> {
        Dispatcher::translate_batch(self, request).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("rate", &self.rate).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::config::MemoryConfigStore;
    use crate::core::models::{BatchItem, BatchPolicy, VendorType};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    /// Vendor returning scripted replies and recording prompts
    #[derive(Default)]
    pub(crate) struct ScriptedVendor {
        replies: Mutex<VecDeque<Result<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedVendor {
        pub fn push(&self, reply: Result<String>) {
            self.replies.lock().push_back(reply);
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    #[async_trait]
    impl Vendor for ScriptedVendor {
        async fn invoke(&self, _channel: &Channel, _model: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("[]".to_string()))
        }
    }

    /// Vendor that upper-cases every item of a batch prompt
    #[derive(Default)]
    pub(crate) struct UpperVendor {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Vendor for UpperVendor {
        async fn invoke(&self, _channel: &Channel, _model: &str, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items_json = prompt.split("items:\n").nth(1).unwrap_or("[]");
            let items: Vec<BatchItem> = extract_json_array(items_json)
                .into_iter()
                .map(|item| BatchItem::new(item.id, item.text.to_uppercase()))
                .collect();
            Ok(format!("```json\n{}\n```", serde_json::to_string(&items)?))
        }
    }

    #[derive(Default)]
    struct ScriptedGateway {
        fail: bool,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Gateway for ScriptedGateway {
        async fn translate_batch(&self, _base_url: &str, payload: &GatewayPayload<'_>) -> Result<Vec<BatchItem>> {
            *self.calls.lock() += 1;
            if self.fail {
                return Err(TranslationError::ApiError {
                    vendor: "Gateway".to_string(),
                    status: 404,
                });
            }
            Ok(payload
                .items
                .iter()
                .map(|item| BatchItem::new(item.id.clone(), format!("gw:{}", item.text)))
                .collect())
        }
    }

    pub(crate) fn test_config() -> AppConfig {
        AppConfig {
            channels: vec![Channel {
                name: "work".to_string(),
                vendor: VendorType::OpenAi,
                api_url: None,
                api_key: Some("sk-test".to_string()),
                models: vec!["small".to_string(), "large".to_string()],
            }],
            translate_target_lang: "fr".to_string(),
            tx_qps: Some(10),
            tx_max_concurrent: Some(4),
            ..Default::default()
        }
    }

    fn dispatcher_with(
        config: AppConfig,
        vendor: Arc<ScriptedVendor>,
        gateway: Arc<ScriptedGateway>,
    ) -> Dispatcher {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryConfigStore::new(config.clone()));
        let rate = RateLimiterService::new(config.rate_settings(), Arc::clone(&store));
        Dispatcher::new(store, vendor, gateway, rate)
    }

    #[tokio::test]
    async fn test_translate_batch_parses_reply() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok("```json\n[{\"id\":\"a\",\"text\":\"Bonjour\"}]\n```".to_string()));
        let dispatcher = dispatcher_with(test_config(), vendor.clone(), Arc::default());

        let request = BatchTranslateRequest {
            target_lang: None,
            ..BatchTranslateRequest::new("", vec![BatchItem::new("a", "Hello")])
        };
        let batch = assert_ok!(dispatcher.translate_batch(request).await);
        assert_eq!(batch.translations, vec![BatchItem::new("a", "Bonjour")]);
        assert_eq!(batch.channel, "work");
        assert_eq!(batch.model, "small");

        let prompts = vendor.prompts.lock();
        assert!(prompts[0].contains("to fr."));
        assert!(!prompts[0].contains("code fences"));
    }

    #[tokio::test]
    async fn test_strict_defaults_from_config() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok(r#"[{"id":"a","text":"x"}]"#.to_string()));
        let config = AppConfig {
            tx_strict_json: true,
            ..test_config()
        };
        let dispatcher = dispatcher_with(config, vendor.clone(), Arc::default());

        let request = BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")])
            .with_policy(BatchPolicy::default());
        assert_ok!(dispatcher.translate_batch(request).await);
        assert!(vendor.prompts.lock()[0].contains("code fences"));
    }

    #[tokio::test]
    async fn test_invalid_reply_is_error() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok("Sorry, I can't do that".to_string()));
        let dispatcher = dispatcher_with(test_config(), vendor, Arc::default());

        let response = dispatcher
            .handle_translate_batch(BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")]))
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("empty or invalid JSON"));
    }

    #[tokio::test]
    async fn test_no_model_is_config_error() {
        let vendor = Arc::new(ScriptedVendor::default());
        let dispatcher = dispatcher_with(AppConfig::default(), vendor.clone(), Arc::default());

        let response = dispatcher
            .handle_translate_batch(BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")]))
            .await;
        assert_eq!(response.error.as_deref(), Some("Configuration error: No available model"));
        assert_eq!(vendor.calls(), 0);
    }

    #[tokio::test]
    async fn test_gateway_preferred_then_fallback() {
        let config = AppConfig {
            tx_use_gateway: true,
            tx_gateway_url: Some("https://gw.example.com/".to_string()),
            ..test_config()
        };

        let vendor = Arc::new(ScriptedVendor::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let dispatcher = dispatcher_with(config.clone(), vendor.clone(), gateway.clone());
        let batch = assert_ok!(
            dispatcher
                .translate_batch(BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")]))
                .await
        );
        assert_eq!(batch.channel, "gateway");
        assert_eq!(batch.translations[0].text, "gw:Hi");
        assert_eq!(vendor.calls(), 0);

        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok(r#"[{"id":"a","text":"Hallo"}]"#.to_string()));
        let failing = Arc::new(ScriptedGateway {
            fail: true,
            ..Default::default()
        });
        let dispatcher = dispatcher_with(config, vendor.clone(), failing.clone());
        let batch = assert_ok!(
            dispatcher
                .translate_batch(BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")]))
                .await
        );
        assert_eq!(batch.channel, "work");
        assert_eq!(*failing.calls.lock(), 1);
        assert_eq!(vendor.calls(), 1);
    }

    #[tokio::test]
    async fn test_perform_action_uses_requested_pair() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok("résumé".to_string()));
        let dispatcher = dispatcher_with(test_config(), vendor.clone(), Arc::default());

        let mut request = ActionRequest::new(Task::Summarize, "Long text");
        request.channel = Some("work".to_string());
        request.model = Some("large".to_string());
        let result = assert_ok!(dispatcher.perform_action(request).await);
        assert_eq!(result.result, "résumé");
        assert_eq!(result.model, "large");
        assert!(vendor.prompts.lock()[0].starts_with("Summarize the following content in fr"));
    }

    #[tokio::test]
    async fn test_channel_test_errors() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Ok("OK".to_string()));
        let mut config = test_config();
        config.channels.push(Channel {
            name: "empty".to_string(),
            vendor: VendorType::Gemini,
            api_url: None,
            api_key: Some("k".to_string()),
            models: vec![],
        });
        let dispatcher = dispatcher_with(config, vendor.clone(), Arc::default());

        let missing = dispatcher
            .test_channel(ChannelTestRequest {
                channel: "nope".to_string(),
                model: None,
            })
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("Channel not found"));

        let no_models = dispatcher
            .test_channel(ChannelTestRequest {
                channel: "empty".to_string(),
                model: None,
            })
            .await
            .unwrap_err();
        assert!(no_models.to_string().contains("Channel has no models configured"));

        let sample = assert_ok!(
            dispatcher
                .test_channel(ChannelTestRequest {
                    channel: "work".to_string(),
                    model: None,
                })
                .await
        );
        assert_eq!(sample, "OK");
        assert!(vendor.prompts.lock()[0].contains(CONNECTION_TEST_TEXT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_vendor_degrades_service() {
        let vendor = Arc::new(ScriptedVendor::default());
        vendor.push(Err(TranslationError::ApiError {
            vendor: "OpenAI".to_string(),
            status: 429,
        }));
        vendor.push(Ok(r#"[{"id":"a","text":"Hallo"}]"#.to_string()));
        let dispatcher = dispatcher_with(test_config(), vendor.clone(), Arc::default());

        let batch = assert_ok!(
            dispatcher
                .translate_batch(BatchTranslateRequest::new("de", vec![BatchItem::new("a", "Hi")]))
                .await
        );
        assert_eq!(batch.translations[0].text, "Hallo");
        assert_eq!(vendor.calls(), 2);
        assert_eq!(dispatcher.rate().degrade_events(), 1);
        let status = dispatcher.rate_status();
        assert!(status.degraded);
        assert_eq!(status.qps, 5);
        assert_eq!(status.max_concurrent, 1);
    }
}
