//! Windowed rate limiter shared by every outbound vendor call
//!
//! A caller may start when the trailing 1s window holds fewer than `qps`
//! starts, the trailing 60s window fewer than `qpm`, and fewer than
//! `max_concurrent` permits are outstanding. Waiters are served in arrival
//! order. A permit frees its concurrency slot when released or dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::config::{RateSettings, DEFAULT_RATE};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub settings: RateSettings,
    pub in_flight: u32,
    pub queued: usize,
}

struct LimiterState {
    settings: RateSettings,
    in_flight: u32,
    last_second: VecDeque<Instant>,
    last_minute: VecDeque<Instant>,
    waiters: VecDeque<oneshot::Sender<RatePermit>>,
    timer: Option<JoinHandle<()>>,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while matches!(self.last_second.front(), Some(t) if now.duration_since(*t) >= SECOND) {
            self.last_second.pop_front();
        }
        while matches!(self.last_minute.front(), Some(t) if now.duration_since(*t) >= MINUTE) {
            self.last_minute.pop_front();
        }
    }

    fn can_start(&self) -> bool {
        self.last_second.len() < self.settings.qps as usize
            && self.last_minute.len() < self.settings.qpm as usize
            && self.in_flight < self.settings.max_concurrent
    }

    /// Time until the earliest blocking window frees a slot. `None` when
    /// only concurrency blocks, since a release will wake the queue.
    fn window_delay(&self, now: Instant) -> Option<Duration> {
        let mut delay: Option<Duration> = None;
        if self.last_second.len() >= self.settings.qps as usize {
            if let Some(first) = self.last_second.front() {
                let wait = (*first + SECOND).saturating_duration_since(now);
                delay = Some(delay.map_or(wait, |d| d.max(wait)));
            }
        }
        if self.last_minute.len() >= self.settings.qpm as usize {
            if let Some(first) = self.last_minute.front() {
                let wait = (*first + MINUTE).saturating_duration_since(now);
                delay = Some(delay.map_or(wait, |d| d.max(wait)));
            }
        }
        delay
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct LimiterInner {
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    /// Grant slots to queued waiters, then arm a timer if a window blocks.
    fn tick(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.prune(now);
        state.waiters.retain(|w| !w.is_closed());

        while state.can_start() {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.last_second.push_back(now);
            state.last_minute.push_back(now);
            state.in_flight += 1;

            if let Err(mut permit) = waiter.send(RatePermit::new(Arc::clone(self))) {
                // Waiter gave up between the retain above and now.
                permit.disarm();
                state.last_second.pop_back();
                state.last_minute.pop_back();
                state.in_flight -= 1;
            }
        }

        if state.waiters.is_empty() {
            state.cancel_timer();
            return;
        }

        state.cancel_timer();
        if let Some(delay) = state.window_delay(now) {
            trace!(delay_ms = delay.as_millis() as u64, queued = state.waiters.len(), "Rate limiter waiting");
            let weak: Weak<Self> = Arc::downgrade(self);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.tick();
                }
            }));
        }
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.tick();
    }
}

/// Concurrency slot held for the duration of one outbound call
#[must_use = "dropping the permit releases the slot immediately"]
pub struct RatePermit {
    limiter: Option<Arc<LimiterInner>>,
}

impl RatePermit {
    fn new(limiter: Arc<LimiterInner>) -> Self {
        Self {
            limiter: Some(limiter),
        }
    }

    fn disarm(&mut self) {
        self.limiter = None;
    }

    /// Release the slot explicitly; equivalent to dropping the permit
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}

impl std::fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatePermit")
            .field("armed", &self.limiter.is_some())
            .finish()
    }
}

/// FIFO limiter over QPS, QPM and in-flight ceilings
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    pub fn new(settings: RateSettings) -> Self {
        let limiter = Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    settings: DEFAULT_RATE,
                    in_flight: 0,
                    last_second: VecDeque::new(),
                    last_minute: VecDeque::new(),
                    waiters: VecDeque::new(),
                    timer: None,
                }),
            }),
        };
        limiter.set(Some(settings.qps), Some(settings.qpm), Some(settings.max_concurrent));
        limiter
    }

    /// Wait until one more call may start
    pub async fn acquire(&self) -> RatePermit {
        let (tx, rx) = oneshot::channel();
        self.inner.state.lock().waiters.push_back(tx);
        self.inner.tick();

        match rx.await {
            Ok(permit) => permit,
            // The sender lives in our queue until granted; a closed channel
            // means the limiter itself is gone, so no slot is accounted.
            Err(_) => RatePermit { limiter: None },
        }
    }

    /// Reconfigure limits. Zero values are ignored. Granted permits are not
    /// revoked; queued waiters are re-evaluated immediately.
    pub fn set(&self, qps: Option<u32>, qpm: Option<u32>, max_concurrent: Option<u32>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(qps) = qps.filter(|v| *v > 0) {
                state.settings.qps = qps;
            }
            if let Some(qpm) = qpm.filter(|v| *v > 0) {
                state.settings.qpm = qpm;
            }
            if let Some(max) = max_concurrent.filter(|v| *v > 0) {
                state.settings.max_concurrent = max;
            }
            debug!(
                qps = state.settings.qps,
                qpm = state.settings.qpm,
                max_concurrent = state.settings.max_concurrent,
                "Rate limiter reconfigured"
            );
        }
        self.inner.tick();
    }

    pub fn apply(&self, settings: RateSettings) {
        self.set(Some(settings.qps), Some(settings.qpm), Some(settings.max_concurrent));
    }

    pub fn settings(&self) -> RateSettings {
        self.inner.state.lock().settings
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.inner.state.lock();
        LimiterSnapshot {
            settings: state.settings,
            in_flight: state.in_flight,
            queued: state.waiters.len(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
