//! Process wiring: one config store, one limiter service, one dispatcher

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::cache::{FileCache, TranslationCache};
use crate::core::client::{Gateway, HttpVendor, Vendor};
use crate::core::config::ConfigStore;
use crate::core::degradation::RateLimiterService;
use crate::core::dispatch::Dispatcher;
use crate::core::errors::Result;
use crate::orchestrator::Orchestrator;

/// Shared services of a running process
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ConfigStore>,
    rate: Arc<RateLimiterService>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<dyn TranslationCache>,
}

impl Engine {
    /// Wire the engine with the reqwest vendor client
    pub async fn new(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let http = Arc::new(HttpVendor::new()?);
        Self::with_clients(store, http.clone(), http).await
    }

    pub async fn with_clients(
        store: Arc<dyn ConfigStore>,
        vendor: Arc<dyn Vendor>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self> {
        let config = store.get().await?;
        let cache: Arc<dyn TranslationCache> = Arc::new(FileCache::new(&config.cache_path));
        Self::with_parts(store, vendor, gateway, cache).await
    }

    pub async fn with_parts(
        store: Arc<dyn ConfigStore>,
        vendor: Arc<dyn Vendor>,
        gateway: Arc<dyn Gateway>,
        cache: Arc<dyn TranslationCache>,
    ) -> Result<Self> {
        let rate = RateLimiterService::from_store(Arc::clone(&store)).await?;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            vendor,
            gateway,
            Arc::clone(&rate),
        ));
        let status = rate.status();
        info!(
            qps = status.qps,
            qpm = status.qpm,
            max_concurrent = status.max_concurrent,
            "Engine ready"
        );
        Ok(Self {
            store,
            rate,
            dispatcher,
            cache,
        })
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn rate(&self) -> &Arc<RateLimiterService> {
        &self.rate
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<dyn TranslationCache> {
        &self.cache
    }

    /// Keep the limiter in step with configuration changes
    pub fn watch_config(&self) -> JoinHandle<()> {
        self.rate.watch_config(self.store.subscribe())
    }

    /// Orchestrator built from the current batch and cache settings
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let config = self.store.get().await?;
        let cache = (!config.tx_disable_cache).then(|| Arc::clone(&self.cache));
        Ok(Orchestrator::new(
            self.dispatcher.clone(),
            cache,
            config.batch,
        ))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rate", &self.rate)
            .finish()
    }
}
