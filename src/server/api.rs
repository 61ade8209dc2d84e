//! HTTP API server implementation

use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::SUPPORTED_LANGUAGES;
use crate::core::engine::Engine;
use crate::core::models::{
    ActionRequest, BatchTranslateRequest, BatchTranslateResponse, ChannelTestRequest, RateStatus,
};

/// Application state
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// Models list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub code: String,
    pub name: String,
}

/// Single-shot action response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelTestResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateStatusResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub status: RateStatus,
}

/// Whole-page translation request: one entry per text node
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTranslateRequest {
    pub target_lang: Option<String>,
    pub texts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageTranslateResponse {
    pub completed: usize,
    pub total: usize,
    pub translations: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl ToString, code: &str, kind: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.to_string(),
                code: Some(code.to_string()),
                r#type: Some(kind.to_string()),
            },
        }),
    )
}

/// Health check handler
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: crate::NAME.to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Get models handler
async fn get_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelsResponse>, ApiError> {
    let config = state.engine.store().get().await.map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e, "config_error", "api_error")
    })?;

    let data = config
        .channels
        .iter()
        .flat_map(|channel| {
            channel.models.iter().map(move |model| ModelInfo {
                id: format!("{}:{}", channel.name, model),
                object: "model".to_string(),
                owned_by: channel.name.clone(),
            })
        })
        .collect();

    Ok(Json(ModelsResponse {
        object: "list".to_string(),
        data,
    }))
}

async fn get_languages() -> Json<Vec<LanguageInfo>> {
    Json(
        SUPPORTED_LANGUAGES
            .iter()
            .map(|(code, name)| LanguageInfo {
                code: code.to_string(),
                name: name.to_string(),
            })
            .collect(),
    )
}

async fn translate_batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchTranslateRequest>,
) -> Json<BatchTranslateResponse> {
    Json(state.engine.dispatcher().handle_translate_batch(payload).await)
}

async fn perform_action(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ActionRequest>,
) -> Json<ActionResponse> {
    let response = match state.engine.dispatcher().perform_action(payload).await {
        Ok(result) => ActionResponse {
            ok: true,
            result: Some(result.result),
            channel: Some(result.channel),
            model: Some(result.model),
            error: None,
        },
        Err(e) => {
            warn!("Action failed: {}", e);
            ActionResponse {
                ok: false,
                result: None,
                channel: None,
                model: None,
                error: Some(e.to_string()),
            }
        }
    };
    Json(response)
}

async fn test_channel(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChannelTestRequest>,
) -> Json<ChannelTestResponse> {
    let response = match state.engine.dispatcher().test_channel(payload).await {
        Ok(sample) => ChannelTestResponse {
            ok: true,
            sample: Some(sample),
            error: None,
        },
        Err(e) => ChannelTestResponse {
            ok: false,
            sample: None,
            error: Some(e.to_string()),
        },
    };
    Json(response)
}

async fn rate_status(State(state): State<Arc<AppState>>) -> Json<RateStatusResponse> {
    Json(RateStatusResponse {
        ok: true,
        status: state.engine.dispatcher().rate_status(),
    })
}

/// Translate every text through the orchestrator; blank entries come back unchanged
async fn translate_page(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PageTranslateRequest>,
) -> Result<Json<PageTranslateResponse>, ApiError> {
    if payload.texts.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "texts cannot be empty",
            "invalid_request",
            "invalid_request_error",
        ));
    }

    let internal = |e: crate::core::errors::TranslationError| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e, "translation_error", "api_error")
    };
    let config = state.engine.store().get().await.map_err(internal)?;
    let target_lang = config.target_lang(payload.target_lang.as_deref());
    let orchestrator = state.engine.orchestrator().await.map_err(internal)?;

    let units: Vec<(usize, &str)> = payload
        .texts
        .iter()
        .enumerate()
        .map(|(owner, text)| (owner, text.as_str()))
        .collect();
    let (run, stats) = orchestrator.translate(&target_lang, units).await;
    info!(
        texts = payload.texts.len(),
        cache_hits = stats.cache_hits,
        batches = stats.batches,
        "Page translated"
    );

    let progress = run.progress();
    let translations = payload
        .texts
        .iter()
        .enumerate()
        .map(|(owner, text)| {
            run.translation_for(owner)
                .map(str::to_string)
                .unwrap_or_else(|| text.clone())
        })
        .collect();

    Ok(Json(PageTranslateResponse {
        completed: progress.completed,
        total: progress.total,
        translations,
    }))
}

/// Build the router for an engine
pub fn router(engine: Engine) -> Router {
    let state = Arc::new(AppState::new(engine));
    Router::new()
        .route("/", get(health_check))
        .route("/v1/models", get(get_models))
        .route("/v1/languages", get(get_languages))
        .route("/v1/translate/batch", post(translate_batch))
        .route("/v1/actions", post(perform_action))
        .route("/v1/channels/test", post(test_channel))
        .route("/v1/rate-status", get(rate_status))
        .route("/v1/page/translate", post(translate_page))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(engine: Engine, host: String, port: u16) -> anyhow::Result<()> {
    let _config_listener = engine.watch_config();
    let app = router(engine);

    // Bind address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;
    use crate::core::client::HttpVendor;
    use crate::core::config::MemoryConfigStore;
    use crate::core::dispatch::tests::{test_config, UpperVendor};
    use crate::core::models::{BatchItem, Task};
    use std::sync::atomic::Ordering;

    async fn state() -> (Arc<AppState>, Arc<UpperVendor>) {
        let store = Arc::new(MemoryConfigStore::new(test_config()));
        let vendor = Arc::new(UpperVendor::default());
        let engine = Engine::with_parts(
            store,
            vendor.clone(),
            Arc::new(HttpVendor::new().unwrap()),
            Arc::new(MemoryCache::new()),
        )
        .await
        .unwrap();
        (Arc::new(AppState::new(engine)), vendor)
    }

    #[tokio::test]
    async fn test_models_and_languages() {
        let (state, _) = state().await;
        let Json(models) = get_models(State(state)).await.unwrap();
        let ids: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["work:small", "work:large"]);

        let Json(languages) = get_languages().await;
        assert!(languages.iter().any(|l| l.code == "zh-CN"));
    }

    #[tokio::test]
    async fn test_batch_endpoint() {
        let (state, _) = state().await;
        let request = BatchTranslateRequest::new("de", vec![BatchItem::new("x", "hi there")]);
        let Json(response) = translate_batch(State(state), Json(request)).await;
        assert!(response.ok);
        assert_eq!(response.translations.unwrap(), vec![BatchItem::new("x", "HI THERE")]);
    }

    #[tokio::test]
    async fn test_action_error_is_reported() {
        let (state, _) = state().await;
        let mut request = ActionRequest::new(Task::Polish, "text");
        request.channel = Some("missing".to_string());
        request.model = Some("small".to_string());

        // An invalid pair falls back to the configured channel.
        let Json(response) = perform_action(State(state.clone()), Json(request)).await;
        assert!(response.ok);
        assert_eq!(response.channel.as_deref(), Some("work"));

        let Json(response) = test_channel(
            State(state),
            Json(ChannelTestRequest {
                channel: "missing".to_string(),
                model: None,
            }),
        )
        .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("Channel not found"));
    }

    #[tokio::test]
    async fn test_rate_status_wire_shape() {
        let (state, _) = state().await;
        let Json(response) = rate_status(State(state)).await;
        assert_json_diff::assert_json_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "ok": true,
                "qps": 10,
                "qpm": 120,
                "maxConcurrent": 4,
                "degraded": false,
                "degradedUntil": 0
            })
        );
    }

    #[tokio::test]
    async fn test_page_translate_dedups() {
        let (state, vendor) = state().await;
        let payload = PageTranslateRequest {
            target_lang: Some("fr".to_string()),
            texts: vec![
                "Sign in".to_string(),
                "   ".to_string(),
                "Sign  in".to_string(),
                "Help".to_string(),
            ],
        };

        let Json(response) = translate_page(State(state), Json(payload)).await.unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.completed, 2);
        assert_eq!(response.translations, vec!["SIGN IN", "   ", "SIGN IN", "HELP"]);
        assert_eq!(vendor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_translate_rejects_empty() {
        let (state, _) = state().await;
        let payload = PageTranslateRequest {
            target_lang: None,
            texts: vec![],
        };
        let (status, _) = translate_page(State(state), Json(payload)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
