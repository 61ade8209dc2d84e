//! Process-wide rate limiter service with adaptive degradation
//!
//! On a 429 the service halves QPS (floor 1) and pins concurrency to 1 for
//! a cool-down window. When the window elapses the base rate is re-read from
//! the config store, so edits made while degraded are not clobbered.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::config::{AppConfig, ConfigStore, RateSettings};
use crate::core::models::RateStatus;
use crate::core::rate_limiter::{RateLimiter, RatePermit};

/// Length of a degradation window
pub const DEGRADE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Default)]
struct DegradeState {
    base: Option<RateSettings>,
    until: Option<(Instant, DateTime<Utc>)>,
    restore: Option<JoinHandle<()>>,
    /// Bumped by every degrade; a restore only applies to its own window
    generation: u64,
}

/// Owns the limiter, its base rate and the degradation timer
pub struct RateLimiterService {
    limiter: RateLimiter,
    store: Arc<dyn ConfigStore>,
    state: Mutex<DegradeState>,
    degrade_events: AtomicU64,
    window: Duration,
}

fn degraded_settings(base: RateSettings) -> RateSettings {
    RateSettings {
        qps: (base.qps / 2).max(1),
        qpm: base.qpm,
        max_concurrent: 1,
    }
}

impl RateLimiterService {
    /// Create the service with an explicit base rate
    pub fn new(base: RateSettings, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Self::with_window(base, store, DEGRADE_WINDOW)
    }

    pub fn with_window(
        base: RateSettings,
        store: Arc<dyn ConfigStore>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            limiter: RateLimiter::new(base),
            store,
            state: Mutex::new(DegradeState {
                base: Some(base),
                ..Default::default()
            }),
            degrade_events: AtomicU64::new(0),
            window,
        })
    }

    /// Create the service from the store's current rate settings
    pub async fn from_store(store: Arc<dyn ConfigStore>) -> crate::core::errors::Result<Arc<Self>> {
        let base = store.get().await?.rate_settings();
        Ok(Self::new(base, store))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Wait for an outbound slot
    pub async fn acquire(&self) -> RatePermit {
        self.limiter.acquire().await
    }

    fn is_degraded_locked(state: &DegradeState) -> bool {
        matches!(state.until, Some((until, _)) if until > Instant::now())
    }

    pub fn is_degraded(&self) -> bool {
        Self::is_degraded_locked(&self.state.lock())
    }

    /// Number of degradation events since start
    pub fn degrade_events(&self) -> u64 {
        self.degrade_events.load(Ordering::SeqCst)
    }

    /// Record a new externally configured base rate.
    ///
    /// While degraded the clamps are re-derived from the new base; the full
    /// rate comes back when the window ends.
    pub fn reconfigure(&self, base: RateSettings) {
        let mut state = self.state.lock();
        state.base = Some(base);
        if Self::is_degraded_locked(&state) {
            self.limiter.apply(degraded_settings(base));
        } else {
            self.limiter.apply(base);
        }
    }

    /// Enter (or extend) the degraded window
    pub fn degrade(self: &Arc<Self>) {
        let window = self.window;
        let until = Instant::now() + window;
        let until_wall = Utc::now()
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(30));

        // Limiter clamps, timer and window change together under the state lock.
        let mut state = self.state.lock();
        let base = state.base.unwrap_or_else(|| self.limiter.settings());
        let reduced = degraded_settings(base);
        self.limiter.set(Some(reduced.qps), None, Some(reduced.max_concurrent));
        self.degrade_events.fetch_add(1, Ordering::SeqCst);

        state.generation += 1;
        let generation = state.generation;
        let service = Arc::clone(self);
        let restore = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            service.restore(generation).await;
        });
        if let Some(previous) = state.restore.replace(restore) {
            previous.abort();
        }
        state.until = Some((until, until_wall));
        drop(state);

        warn!(
            qps = reduced.qps,
            max_concurrent = reduced.max_concurrent,
            window_secs = window.as_secs(),
            "Rate limited by vendor, degrading throughput"
        );
    }

    async fn restore(&self, generation: u64) {
        let reread = match self.store.get().await {
            Ok(config) => Some(config.rate_settings()),
            Err(e) => {
                warn!("Could not re-read rate settings, restoring last known base: {}", e);
                None
            }
        };

        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        let base = reread
            .or(state.base)
            .unwrap_or_else(|| self.limiter.settings());
        state.base = Some(base);
        state.until = None;
        state.restore = None;
        self.limiter.apply(base);
        drop(state);

        info!(
            qps = base.qps,
            qpm = base.qpm,
            max_concurrent = base.max_concurrent,
            "Degradation window elapsed, rate restored"
        );
    }

    /// Current effective limits
    pub fn status(&self) -> RateStatus {
        let state = self.state.lock();
        let base = state.base.unwrap_or_else(|| self.limiter.settings());
        let degraded = Self::is_degraded_locked(&state);
        let effective = if degraded { degraded_settings(base) } else { base };
        RateStatus {
            qps: effective.qps,
            qpm: effective.qpm,
            max_concurrent: effective.max_concurrent,
            degraded,
            degraded_until: match state.until {
                Some((_, wall)) if degraded => wall.timestamp_millis(),
                _ => 0,
            },
        }
    }

    /// Reconfigure on every change published by the config store
    pub fn watch_config(self: &Arc<Self>, mut changes: watch::Receiver<AppConfig>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let rate = changes.borrow_and_update().rate_settings();
                service.reconfigure(rate);
            }
        })
    }
}

impl std::fmt::Debug for RateLimiterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterService")
            .field("limiter", &self.limiter)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MemoryConfigStore;

    fn rate(qps: u32, qpm: u32, max_concurrent: u32) -> RateSettings {
        RateSettings {
            qps,
            qpm,
            max_concurrent,
        }
    }

    fn store_with(rate: RateSettings) -> Arc<MemoryConfigStore> {
        Arc::new(MemoryConfigStore::new(AppConfig {
            tx_qps: Some(i64::from(rate.qps)),
            tx_qpm: Some(i64::from(rate.qpm)),
            tx_max_concurrent: Some(i64::from(rate.max_concurrent)),
            ..Default::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrade_halves_and_restores() {
        let base = rate(6, 120, 4);
        let store = store_with(base);
        let service = RateLimiterService::new(base, store.clone());

        service.degrade();
        assert_eq!(service.limiter().settings(), rate(3, 120, 1));
        let status = service.status();
        assert!(status.degraded);
        assert_eq!(status.qps, 3);
        assert_eq!(status.max_concurrent, 1);
        assert!(status.degraded_until > 0);

        tokio::time::sleep(DEGRADE_WINDOW + Duration::from_millis(10)).await;
        assert!(!service.is_degraded());
        assert_eq!(service.limiter().settings(), base);
        assert_eq!(service.status().degraded_until, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qps_floor_is_one() {
        let base = rate(1, 60, 2);
        let service = RateLimiterService::new(base, store_with(base));
        service.degrade();
        assert_eq!(service.limiter().settings().qps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_degrade_resets_timer_without_stacking() {
        let base = rate(8, 120, 3);
        let service = RateLimiterService::new(base, store_with(base));

        service.degrade();
        tokio::time::sleep(Duration::from_secs(20)).await;
        service.degrade();
        assert_eq!(service.limiter().settings().qps, 4);
        assert_eq!(service.degrade_events(), 2);

        // 35s after the first event the second window is still open.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(service.is_degraded());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!service.is_degraded());
        assert_eq!(service.limiter().settings(), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_restore_leaves_newer_window_alone() {
        let base = rate(8, 120, 3);
        let service = RateLimiterService::new(base, store_with(base));

        service.degrade();
        let first = service.state.lock().generation;
        service.degrade();

        // A restore from the first window that wins the race with the second
        // degrade must not lift the clamps.
        service.restore(first).await;
        assert!(service.is_degraded());
        assert_eq!(service.limiter().settings(), rate(4, 120, 1));
        assert!(service.status().degraded);

        tokio::time::sleep(DEGRADE_WINDOW + Duration::from_millis(10)).await;
        assert!(!service.is_degraded());
        assert_eq!(service.limiter().settings(), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rereads_store() {
        let base = rate(4, 120, 2);
        let store = store_with(base);
        let service = RateLimiterService::new(base, store.clone());

        service.degrade();
        store.update(|c| {
            c.tx_qps = Some(10);
            c.tx_max_concurrent = Some(5);
        });

        tokio::time::sleep(DEGRADE_WINDOW + Duration::from_millis(10)).await;
        assert_eq!(service.limiter().settings(), rate(10, 120, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_config_reconfigures() {
        let base = rate(2, 120, 1);
        let store = store_with(base);
        let service = RateLimiterService::new(base, store.clone());
        let _listener = service.watch_config(store.subscribe());

        store.update(|c| c.tx_qps = Some(9));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.limiter().settings().qps, 9);
        assert_eq!(service.status().qps, 9);

        // While degraded the new base only moves the clamps.
        service.degrade();
        store.update(|c| c.tx_qps = Some(20));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.limiter().settings().qps, 10);
        assert_eq!(service.limiter().settings().max_concurrent, 1);
    }
}
