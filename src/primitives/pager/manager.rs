use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::meter::{BudgetMeter, HeapMeter, Pressure, ResidentBytes, Watermarks};
use super::monitor::HeapMonitor;
use crate::config::PagingConfig;
use crate::primitives::concurrency::{ReentrantGuard, ReentrantLock};
use crate::types::{ImageId, PageId, PageKey, PagingError, Result};

/// Something that owns resident pages the manager may evict.
///
/// Implementations are called with the manager lock held and must not call
/// back into the manager.
pub trait PageOwner: Send + Sync {
    /// Registry id of the owner.
    fn image_id(&self) -> ImageId;
    /// Removes a resident page, persisting it first if it is dirty.
    fn evict_resident(&self, page: PageId) -> Result<Discarded>;
}

/// What happened to a page removed from memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discarded {
    /// Heap bytes the page occupied.
    pub bytes: u64,
    /// Whether the page was dirty and had to be written back.
    pub written_back: bool,
}

/// Result of a throttling check made before a page allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backpressure {
    /// Usage was below the high watermark; no wait happened.
    Clear,
    /// Usage dropped below the low watermark after `polls` sleeps.
    Relieved {
        /// Sleeps taken before usage dropped.
        polls: u32,
    },
    /// The poll budget ran out and the caller proceeds anyway.
    TimedOut,
}

/// Outcome of one eviction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Batches popped from the queue.
    pub batches: u64,
    /// Pages removed from memory.
    pub evicted: u64,
    /// Evicted pages that were dirty and written back.
    pub written_back: u64,
    /// Queue entries whose image no longer exists.
    pub dead_entries: u64,
    /// Pages whose eviction failed.
    pub failed: u64,
    /// Whether usage ended below the low watermark.
    pub relieved: bool,
}

/// Statistics tracking cache manager activity.
#[derive(Default, Clone, Debug, Serialize)]
pub struct CacheStats {
    /// Page lookups served from memory.
    pub hits: u64,
    /// Page lookups that loaded from a backing file.
    pub misses: u64,
    /// Pages removed from memory by eviction or explicit discard.
    pub evictions: u64,
    /// Evicted pages written back because they were dirty.
    pub dirty_writebacks: u64,
    /// Evicted pages dropped without I/O.
    pub clean_drops: u64,
    /// Queue entries pruned because their image was gone.
    pub dead_entries: u64,
    /// Eviction failures.
    pub eviction_failures: u64,
    /// Low-memory signals handled.
    pub eviction_signals: u64,
    /// Callers that had to wait in `check_pressure`.
    pub backpressure_waits: u64,
    /// Waits that exhausted their poll budget.
    pub backpressure_timeouts: u64,
    /// Pages currently resident across all images.
    pub resident_pages: u64,
    /// Heap bytes held by resident pages.
    pub resident_bytes: u64,
    /// Images currently registered.
    pub registered_images: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} dirty_writebacks={} resident_pages={} resident_bytes={}",
            self.hits,
            self.misses,
            self.evictions,
            self.dirty_writebacks,
            self.resident_pages,
            self.resident_bytes
        )
    }
}

struct ManagerInner {
    registry: HashMap<ImageId, Weak<dyn PageOwner>>,
    // Value is the heap size of the resident page.
    queue: LruCache<PageKey, u64>,
    stats: CacheStats,
}

/// Process-wide page cache shared by every open large image.
///
/// One instance is created at startup and handed to every image as an
/// `Arc<CacheManager>`. It keeps a weak registry of images, a global LRU
/// queue of resident pages, and evicts from the head of that queue when the
/// heap meter reports pressure.
///
/// Every critical section runs under a single reentrant lock; resident page
/// tables of all images are only touched while it is held.
pub struct CacheManager {
    config: PagingConfig,
    lock: ReentrantLock,
    inner: Mutex<ManagerInner>,
    meter: Arc<dyn HeapMeter>,
    resident: Arc<ResidentBytes>,
    next_image: AtomicU64,
}

impl CacheManager {
    /// Creates a manager metered by resident page bytes and starts its
    /// [`HeapMonitor`].
    ///
    /// The monitor delivers the low-memory signals that drive eviction; keep
    /// it alive as long as the manager is in use.
    pub fn start(config: PagingConfig) -> Result<(Arc<Self>, HeapMonitor)> {
        let manager = Self::new(config)?;
        let monitor = HeapMonitor::spawn(&manager)?;
        Ok((manager, monitor))
    }

    /// Creates a manager metered by resident page bytes against
    /// `config.heap_budget_bytes`.
    ///
    /// Nothing evicts pages until a [`HeapMonitor`] is spawned for it or the
    /// caller invokes [`CacheManager::on_low_memory_signal`]; use
    /// [`CacheManager::start`] for both in one step.
    pub fn new(config: PagingConfig) -> Result<Arc<Self>> {
        let resident = Arc::new(ResidentBytes::default());
        let meter = Arc::new(BudgetMeter::new(
            Arc::clone(&resident),
            config.heap_budget_bytes,
        ));
        Self::build(config, meter, resident)
    }

    /// Creates a manager reading heap usage from `meter`.
    pub fn with_meter(config: PagingConfig, meter: Arc<dyn HeapMeter>) -> Result<Arc<Self>> {
        Self::build(config, meter, Arc::new(ResidentBytes::default()))
    }

    /// Creates a manager that accounts resident page bytes in `resident`, for
    /// meters built on top of that counter.
    pub fn with_resident(
        config: PagingConfig,
        resident: Arc<ResidentBytes>,
        meter: Arc<dyn HeapMeter>,
    ) -> Result<Arc<Self>> {
        Self::build(config, meter, resident)
    }

    fn build(
        config: PagingConfig,
        meter: Arc<dyn HeapMeter>,
        resident: Arc<ResidentBytes>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            max = meter.max(),
            low = config.low_watermark,
            high = config.high_watermark,
            batch = config.eviction_batch,
            "pager.manager.start"
        );
        Ok(Arc::new(Self {
            config,
            lock: ReentrantLock::new(),
            inner: Mutex::new(ManagerInner {
                registry: HashMap::new(),
                queue: LruCache::unbounded(),
                stats: CacheStats::default(),
            }),
            meter,
            resident,
            next_image: AtomicU64::new(1),
        }))
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Heap meter consulted for watermarks.
    pub fn meter(&self) -> &Arc<dyn HeapMeter> {
        &self.meter
    }

    /// Acquires one hold on the manager lock.
    ///
    /// Callers may hold it across several pixel accesses to make them atomic
    /// with respect to eviction; the lock is reentrant.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.lock.lock()
    }

    /// Holds the calling thread currently has on the manager lock.
    pub fn lock_holds(&self) -> usize {
        self.lock.hold_count()
    }

    /// Adds an image to the weak registry and returns its id.
    pub fn register_image(&self, owner: Weak<dyn PageOwner>) -> ImageId {
        let id = ImageId(self.next_image.fetch_add(1, AtomicOrdering::Relaxed));
        let _guard = self.lock.lock();
        self.inner.lock().registry.insert(id, owner);
        debug!(image = id.0, "pager.registry.insert");
        id
    }

    /// Drops an image from the registry together with its queue entries.
    ///
    /// Returns the number of queue entries removed.
    pub fn forget_image(&self, image: ImageId) -> usize {
        let _guard = self.lock.lock();
        let mut inner = self.inner.lock();
        inner.registry.remove(&image);
        let keys: Vec<PageKey> = inner
            .queue
            .iter()
            .filter_map(|(key, _)| (key.image == image).then_some(*key))
            .collect();
        for key in &keys {
            if let Some(bytes) = inner.queue.pop(key) {
                self.resident.sub(bytes);
            }
        }
        debug!(image = image.0, entries = keys.len(), "pager.registry.remove");
        keys.len()
    }

    /// Moves a page to the most-recently-used end of the eviction queue.
    ///
    /// Called on every cache hit. A page not yet queued is appended.
    pub fn notify_touch(&self, image: ImageId, page: PageId) {
        let key = PageKey::new(image, page);
        let _guard = self.lock.lock();
        let mut inner = self.inner.lock();
        if inner.queue.contains(&key) {
            inner.queue.promote(&key);
        } else {
            inner.queue.put(key, 0);
        }
    }

    /// Records a cache hit and touches the page.
    pub(crate) fn page_hit(&self, image: ImageId, page: PageId) {
        self.notify_touch(image, page);
        self.inner.lock().stats.hits += 1;
    }

    /// Records a freshly materialized resident page occupying `bytes`.
    pub(crate) fn page_loaded(&self, image: ImageId, page: PageId, bytes: u64) {
        let key = PageKey::new(image, page);
        let _guard = self.lock.lock();
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.queue.put(key, bytes) {
            self.resident.sub(previous);
        }
        self.resident.add(bytes);
        inner.stats.misses += 1;
    }

    /// Records a page its owner removed from memory outside of eviction.
    pub(crate) fn page_discarded(&self, image: ImageId, page: PageId, discarded: Discarded) {
        let key = PageKey::new(image, page);
        let _guard = self.lock.lock();
        let mut inner = self.inner.lock();
        let bytes = inner.queue.pop(&key).unwrap_or(discarded.bytes);
        self.resident.sub(bytes);
        record_discard(&mut inner.stats, discarded);
    }

    /// Current pressure classification.
    pub fn pressure(&self) -> Pressure {
        self.watermarks().classify(self.meter.used())
    }

    /// Byte thresholds for the current meter maximum.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks::from_fractions(
            self.meter.max(),
            self.config.low_watermark,
            self.config.high_watermark,
        )
    }

    /// Throttles a caller that is about to allocate a resident page.
    ///
    /// While usage is above the high watermark the caller sleeps in
    /// `backpressure_interval` steps with the manager lock fully released,
    /// until usage falls below the low watermark or the poll budget runs out.
    pub fn check_pressure(&self) -> Backpressure {
        if self.pressure() != Pressure::Critical {
            return Backpressure::Clear;
        }
        self.inner.lock().stats.backpressure_waits += 1;
        let interval = self.config.backpressure_interval();
        for poll in 1..=self.config.backpressure_polls {
            {
                let _suspended = self.lock.suspend();
                thread::sleep(interval);
            }
            if self.pressure() == Pressure::Normal {
                debug!(polls = poll, "pager.backpressure.relieved");
                return Backpressure::Relieved { polls: poll };
            }
        }
        self.inner.lock().stats.backpressure_timeouts += 1;
        warn!(
            polls = self.config.backpressure_polls,
            used = self.meter.used(),
            max = self.meter.max(),
            "pager.backpressure.timeout"
        );
        Backpressure::TimedOut
    }

    /// Evicts pages from the head of the queue until usage is below the low
    /// watermark.
    ///
    /// Invoked by the heap monitor when usage crosses the high watermark.
    pub fn on_low_memory_signal(&self) -> EvictionReport {
        let _guard = self.lock.lock();
        self.inner.lock().stats.eviction_signals += 1;
        let mut report = EvictionReport::default();
        let mut idle = 0;
        loop {
            if self.pressure() == Pressure::Normal {
                report.relieved = true;
                break;
            }
            let batch = self.pop_batch(self.config.eviction_batch);
            if batch.is_empty() {
                if idle >= self.config.idle_retries {
                    warn!(
                        retries = idle,
                        used = self.meter.used(),
                        "pager.evict.queue_exhausted"
                    );
                    break;
                }
                idle += 1;
                debug!(retry = idle, "pager.evict.queue_empty");
                let _suspended = self.lock.suspend();
                thread::sleep(self.config.idle_backoff());
                continue;
            }
            report.batches += 1;
            for (key, bytes) in batch {
                self.evict_entry(key, bytes, &mut report);
            }
            self.meter.collect();
            debug!(
                evicted = report.evicted,
                used = self.meter.used(),
                "pager.evict.batch"
            );
        }
        report
    }

    /// Evicts up to `max_pages` least-recently-touched pages regardless of
    /// pressure.
    pub fn evict_lru(&self, max_pages: usize) -> EvictionReport {
        let _guard = self.lock.lock();
        let mut report = EvictionReport::default();
        let batch = self.pop_batch(max_pages);
        if !batch.is_empty() {
            report.batches = 1;
        }
        for (key, bytes) in batch {
            self.evict_entry(key, bytes, &mut report);
        }
        report
    }

    /// Queue contents from least to most recently touched.
    pub fn queue_snapshot(&self) -> Vec<PageKey> {
        let _guard = self.lock.lock();
        let inner = self.inner.lock();
        inner.queue.iter().rev().map(|(key, _)| *key).collect()
    }

    /// Returns a snapshot of current statistics.
    pub fn stats(&self) -> CacheStats {
        let _guard = self.lock.lock();
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.resident_pages = inner.queue.len() as u64;
        stats.resident_bytes = self.resident.get();
        stats.registered_images = inner.registry.len() as u64;
        stats
    }

    fn pop_batch(&self, limit: usize) -> Vec<(PageKey, u64)> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::with_capacity(limit.min(inner.queue.len()));
        while batch.len() < limit {
            match inner.queue.pop_lru() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch
    }

    fn evict_entry(&self, key: PageKey, bytes: u64, report: &mut EvictionReport) {
        self.resident.sub(bytes);
        let owner = self
            .inner
            .lock()
            .registry
            .get(&key.image)
            .and_then(Weak::upgrade);
        let Some(owner) = owner else {
            let mut inner = self.inner.lock();
            inner.registry.remove(&key.image);
            inner.stats.dead_entries += 1;
            report.dead_entries += 1;
            return;
        };
        match owner.evict_resident(key.page) {
            Ok(discarded) => {
                record_discard(&mut self.inner.lock().stats, discarded);
                report.evicted += 1;
                if discarded.written_back {
                    report.written_back += 1;
                }
            }
            Err(PagingError::NotResident(_)) => {
                debug!(%key, "pager.evict.stale_entry");
            }
            Err(err) => {
                self.inner.lock().stats.eviction_failures += 1;
                report.failed += 1;
                error!(%key, error = %err, "pager.evict.failed");
            }
        }
    }
}

fn record_discard(stats: &mut CacheStats, discarded: Discarded) {
    stats.evictions += 1;
    if discarded.written_back {
        stats.dirty_writebacks += 1;
    } else {
        stats.clean_drops += 1;
    }
}
