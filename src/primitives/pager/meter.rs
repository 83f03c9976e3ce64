use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of heap-usage readings consulted by the cache manager.
///
/// `used` and `max` share a unit (bytes for every meter in this crate); the
/// manager only ever compares their ratio against the configured watermarks.
pub trait HeapMeter: Send + Sync + 'static {
    /// Current usage.
    fn used(&self) -> u64;
    /// Maximum usage the process may reach.
    fn max(&self) -> u64;
    /// Asks the underlying allocator to reclaim freed memory before the next reading.
    fn collect(&self) {}
}

/// Bytes held by resident pages across every image of one manager.
#[derive(Default, Debug)]
pub struct ResidentBytes {
    bytes: AtomicU64,
}

impl ResidentBytes {
    /// Records `bytes` more resident page memory.
    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Records `bytes` less resident page memory, saturating at zero.
    pub fn sub(&self, bytes: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Current total.
    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}

/// Meter reporting resident page bytes against a fixed budget.
///
/// This is the default meter: the manager knows exactly how much page memory
/// it keeps alive, so the budget plays the role of the maximum heap.
pub struct BudgetMeter {
    resident: Arc<ResidentBytes>,
    budget: u64,
}

impl BudgetMeter {
    /// Creates a meter over `resident` with a `budget` byte ceiling.
    pub fn new(resident: Arc<ResidentBytes>, budget: u64) -> Self {
        Self {
            resident,
            budget: budget.max(1),
        }
    }
}

impl HeapMeter for BudgetMeter {
    fn used(&self) -> u64 {
        self.resident.get()
    }

    fn max(&self) -> u64 {
        self.budget
    }
}

/// Heap pressure relative to the manager's watermarks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pressure {
    /// Usage at or below the low watermark.
    Normal,
    /// Usage above the low watermark but not above the high one.
    Elevated,
    /// Usage above the high watermark.
    Critical,
}

/// Byte thresholds derived from watermark fractions and the meter's maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    /// Usage above which eviction continues.
    pub low: u64,
    /// Usage above which eviction is triggered and callers are throttled.
    pub high: u64,
}

impl Watermarks {
    /// Computes thresholds for a meter whose maximum is `max`.
    pub fn from_fractions(max: u64, low: f64, high: f64) -> Self {
        let scale = |fraction: f64| (max as f64 * fraction) as u64;
        Self {
            low: scale(low),
            high: scale(high),
        }
    }

    /// Classifies a usage reading.
    pub fn classify(&self, used: u64) -> Pressure {
        if used > self.high {
            Pressure::Critical
        } else if used > self.low {
            Pressure::Elevated
        } else {
            Pressure::Normal
        }
    }
}
