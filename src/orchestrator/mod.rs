//! Batch translation orchestrator
//!
//! A [`TranslationRun`] holds the deduplicated items of one document and
//! their owners. [`Orchestrator::drive`] resolves pending items from the
//! cache, then per bucket (short, medium, long) runs a normal pass followed
//! by a strict pass over whatever failed. Every item ends up done: either
//! validated, repaired, or echoed back as its source text.

pub mod batching;
pub mod consistency;

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::cache::TranslationCache;
use crate::core::config::BatchSettings;
use crate::core::dispatch::BatchTranslate;
use crate::core::errors::Result;
use crate::core::models::{BatchItem, BatchPolicy, BatchTranslateRequest, BatchTranslation, SizeBucket};

use self::batching::{item_id, normalize, pack};
use self::consistency::{repair, validate};

/// Handle of one render target (a text unit in a document)
pub type OwnerId = usize;

/// Progress counter published while a run is driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// One distinct normalized text
#[derive(Debug, Clone)]
pub struct TranslationItem {
    pub id: String,
    pub text: String,
    pub bucket: SizeBucket,
    pub owners: Vec<OwnerId>,
    pub translation: Option<String>,
    chars: usize,
}

impl TranslationItem {
    pub fn is_done(&self) -> bool {
        self.translation.is_some()
    }
}

/// In-memory state of one orchestration run
#[derive(Debug)]
pub struct TranslationRun {
    target_lang: String,
    items: HashMap<String, TranslationItem>,
    by_owner: HashMap<OwnerId, String>,
    strict_queues: [Vec<String>; 3],
    completed: usize,
    progress: watch::Sender<Progress>,
}

impl TranslationRun {
    pub fn new(target_lang: impl Into<String>) -> Self {
        let (progress, _rx) = watch::channel(Progress::default());
        Self {
            target_lang: target_lang.into(),
            items: HashMap::new(),
            by_owner: HashMap::new(),
            strict_queues: Default::default(),
            completed: 0,
            progress,
        }
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    /// Register text units and return the ids of newly created items.
    ///
    /// Units without content are ignored. A unit whose text is already known
    /// joins the existing item as another owner.
    pub fn ingest<'a>(&mut self, units: impl IntoIterator<Item = (OwnerId, &'a str)>) -> Vec<String> {
        let mut created = Vec::new();
        for (owner, raw) in units {
            let text = normalize(raw);
            if text.is_empty() {
                continue;
            }
            let id = item_id(&text, &self.target_lang);
            self.by_owner.insert(owner, id.clone());

            if let Some(item) = self.items.get_mut(&id) {
                if !item.owners.contains(&owner) {
                    item.owners.push(owner);
                }
                continue;
            }

            let chars = text.chars().count();
            self.items.insert(
                id.clone(),
                TranslationItem {
                    id: id.clone(),
                    text,
                    bucket: SizeBucket::classify(chars),
                    owners: vec![owner],
                    translation: None,
                    chars,
                },
            );
            created.push(id);
        }
        self.publish();
        created
    }

    pub fn item(&self, id: &str) -> Option<&TranslationItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &TranslationItem> {
        self.items.values()
    }

    /// Translated text for a render target, once its item is done
    pub fn translation_for(&self, owner: OwnerId) -> Option<&str> {
        let id = self.by_owner.get(&owner)?;
        self.items.get(id)?.translation.as_deref()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed,
            total: self.items.len(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.items.len()
    }

    /// Items waiting for the strict pass of a bucket
    pub fn strict_queue(&self, bucket: SizeBucket) -> &[String] {
        &self.strict_queues[bucket.index()]
    }

    pub fn strict_queue_len(&self) -> usize {
        self.strict_queues.iter().map(Vec::len).sum()
    }

    fn pending(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.items.get(*id).is_some_and(|item| !item.is_done()))
            .cloned()
            .collect()
    }

    fn complete(&mut self, id: &str, translation: String) {
        if let Some(item) = self.items.get_mut(id) {
            if item.translation.is_none() {
                self.completed += 1;
            }
            item.translation = Some(translation);
        }
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(self.progress());
    }
}

/// Counters for one `drive` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub cache_hits: usize,
    pub batches: usize,
    pub strict_batches: usize,
    pub translated: usize,
    pub repaired: usize,
    pub fallbacks: usize,
}

/// Drives runs against a batch translator and an optional cache
pub struct Orchestrator {
    translator: Arc<dyn BatchTranslate>,
    cache: Option<Arc<dyn TranslationCache>>,
    settings: BatchSettings,
}

impl Orchestrator {
    pub fn new(
        translator: Arc<dyn BatchTranslate>,
        cache: Option<Arc<dyn TranslationCache>>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            translator,
            cache,
            settings,
        }
    }

    /// Create a run for `units`, drive it to completion and return it
    pub async fn translate<'a>(
        &self,
        target_lang: &str,
        units: impl IntoIterator<Item = (OwnerId, &'a str)>,
    ) -> (TranslationRun, RunStats) {
        let mut run = TranslationRun::new(target_lang);
        let created = run.ingest(units);
        let stats = self.drive(&mut run, created).await;
        (run, stats)
    }

    /// Ingest units discovered after a content change and drive only the
    /// new items. Owners of already-translated text are served at once.
    pub async fn rescan<'a>(
        &self,
        run: &mut TranslationRun,
        units: impl IntoIterator<Item = (OwnerId, &'a str)>,
    ) -> RunStats {
        let created = run.ingest(units);
        debug!(new_items = created.len(), "Rescan");
        self.drive(run, created).await
    }

    /// Resolve `ids` until every one of them is done
    pub async fn drive(&self, run: &mut TranslationRun, ids: Vec<String>) -> RunStats {
        let mut stats = RunStats::default();
        let mut pending = run.pending(&ids);
        if pending.is_empty() {
            return stats;
        }

        if let Some(cache) = &self.cache {
            let hits = cache.get_many(&pending).await;
            for (id, text) in hits {
                run.complete(&id, text);
                stats.cache_hits += 1;
            }
            pending = run.pending(&pending);
        }

        let mut buckets: [Vec<String>; 3] = Default::default();
        for id in pending {
            if let Some(item) = run.item(&id) {
                buckets[item.bucket.index()].push(id);
            }
        }

        for bucket in SizeBucket::ALL {
            let ids = std::mem::take(&mut buckets[bucket.index()]);
            self.run_pass(run, bucket, ids, false, &mut stats).await;

            let failed = std::mem::take(&mut run.strict_queues[bucket.index()]);
            if !failed.is_empty() {
                info!(bucket = %bucket, items = failed.len(), "Retrying failed items in strict mode");
                self.run_pass(run, bucket, failed, true, &mut stats).await;
            }
        }

        info!(
            completed = run.completed,
            total = run.items.len(),
            cache_hits = stats.cache_hits,
            repaired = stats.repaired,
            fallbacks = stats.fallbacks,
            "Translation run finished"
        );
        stats
    }

    fn request_for(&self, run: &TranslationRun, batch: &[String], strict: bool) -> BatchTranslateRequest {
        let items = batch
            .iter()
            .filter_map(|id| run.item(id))
            .map(|item| BatchItem::new(item.id.clone(), item.text.clone()))
            .collect();
        let policy = if strict {
            BatchPolicy::strict()
        } else {
            BatchPolicy::default()
        };
        BatchTranslateRequest::new(run.target_lang.clone(), items)
            .with_policy(policy)
            .with_timeout_ms(self.settings.timeout(strict).as_millis() as u64)
    }

    async fn run_pass(
        &self,
        run: &mut TranslationRun,
        bucket: SizeBucket,
        ids: Vec<String>,
        strict: bool,
        stats: &mut RunStats,
    ) {
        if ids.is_empty() {
            return;
        }

        let caps = self.settings.caps(bucket, strict);
        let batches = pack(ids, caps, |id| run.item(id).map_or(0, |item| item.chars));
        let requests: Vec<BatchTranslateRequest> = batches
            .iter()
            .map(|batch| self.request_for(run, batch, strict))
            .collect();
        debug!(bucket = %bucket, strict, batches = batches.len(), "Dispatching batches");

        if strict {
            stats.strict_batches += batches.len();
        } else {
            stats.batches += batches.len();
        }

        let results = join_all(
            requests
                .into_iter()
                .map(|request| self.translator.translate_batch(request)),
        )
        .await;

        for (batch, result) in batches.into_iter().zip(results) {
            self.settle(run, bucket, batch, result, strict, stats).await;
        }
    }

    async fn settle(
        &self,
        run: &mut TranslationRun,
        bucket: SizeBucket,
        batch: Vec<String>,
        result: Result<BatchTranslation>,
        strict: bool,
        stats: &mut RunStats,
    ) {
        let returned: HashMap<String, String> = match result {
            Ok(translation) => translation
                .translations
                .into_iter()
                .map(|item| (item.id, item.text))
                .collect(),
            Err(e) => {
                warn!(bucket = %bucket, strict, items = batch.len(), "Batch failed: {}", e);
                HashMap::new()
            }
        };

        for id in batch {
            let source = match run.item(&id) {
                Some(item) => item.text.clone(),
                None => continue,
            };

            match returned.get(&id) {
                Some(text) if validate(&source, text) => {
                    self.remember(&id, text).await;
                    run.complete(&id, text.clone());
                    stats.translated += 1;
                }
                _ if !strict => run.strict_queues[bucket.index()].push(id),
                Some(text) => {
                    debug!(id = %id, "Repairing translation after strict retry");
                    run.complete(&id, repair(&source, text));
                    stats.repaired += 1;
                }
                None => {
                    debug!(id = %id, "No translation after strict retry, keeping source text");
                    run.complete(&id, source);
                    stats.fallbacks += 1;
                }
            }
        }
    }

    async fn remember(&self, id: &str, text: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(id, text).await {
                warn!(id = %id, "Cache write failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cached", &self.cache.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
