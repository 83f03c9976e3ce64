#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use largeimage::primitives::pager::{BudgetMeter, ResidentBytes};
use largeimage::{
    Backpressure, CacheManager, Dims, HeapMeter, HeapMonitor, ImageOptions, IntImage, PageId,
    PagingConfig, Pressure, Result,
};
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

/// Pixels per page; an `i32` page holds 64 heap bytes.
const PAGE_PIXELS: u64 = 16;
const PAGE_BYTES: u64 = 64;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("largeimage=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn config(dir: &TempDir, budget: u64) -> PagingConfig {
    PagingConfig {
        heap_budget_bytes: budget,
        eviction_batch: 2,
        backpressure_polls: 0,
        backpressure_interval_ms: 1,
        idle_backoff_ms: 1,
        idle_retries: 1,
        monitor_interval_ms: 1,
        temp_dir: Some(dir.path().to_path_buf()),
        ..PagingConfig::default()
    }
}

fn options() -> ImageOptions {
    ImageOptions::default().with_page_pixels(PAGE_PIXELS)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Budget meter that records a reading every time the manager collects.
struct RecordingMeter {
    inner: BudgetMeter,
    samples: Mutex<Vec<u64>>,
}

impl HeapMeter for RecordingMeter {
    fn used(&self) -> u64 {
        self.inner.used()
    }

    fn max(&self) -> u64 {
        self.inner.max()
    }

    fn collect(&self) {
        self.samples.lock().push(self.inner.used());
    }
}

/// Meter whose reading the test sets directly.
struct DialMeter {
    used: AtomicU64,
}

impl HeapMeter for DialMeter {
    fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn max(&self) -> u64 {
        1_000
    }
}

#[test]
fn open_image_without_resident_pages_is_untouched() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    // 1000-byte budget: low = 900, high = 950.
    let manager = CacheManager::new(config(&dir, 1_000))?;
    let a = IntImage::create(&manager, Dims::xy(16, 16), options())?;
    let b = IntImage::create(&manager, Dims::xy(16, 16), options())?;
    let c = IntImage::create(&manager, Dims::xy(16, 16), options())?;

    for page in 0..8 {
        a.set_index(page * PAGE_PIXELS, page as i32 + 1)?;
        if page < 7 {
            b.set_index(page * PAGE_PIXELS, -(page as i32) - 1)?;
        }
    }
    assert_eq!(manager.stats().resident_bytes, 15 * PAGE_BYTES);
    assert_eq!(manager.pressure(), Pressure::Critical);

    let report = manager.on_low_memory_signal();
    assert_eq!(report.batches, 1);
    assert_eq!(report.evicted, 2);
    assert_eq!(report.written_back, 2);
    assert!(report.relieved);
    assert!(!a.is_resident(PageId(0)));
    assert!(!b.is_resident(PageId(0)));
    assert!(a.is_resident(PageId(1)));
    assert_eq!(manager.pressure(), Pressure::Normal);

    assert_eq!(c.resident_pages(), 0);
    assert_eq!(c.stats().discards, 0);
    assert_eq!(manager.stats().registered_images, 3);
    assert_eq!(c.get_index(0)?, 0);
    assert_eq!(a.get_index(0)?, 1);
    assert_eq!(b.get_index(0)?, -1);
    Ok(())
}

#[test]
fn resident_bytes_strictly_decrease_per_batch() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let resident = Arc::new(ResidentBytes::default());
    let meter = Arc::new(RecordingMeter {
        inner: BudgetMeter::new(Arc::clone(&resident), 1_000),
        samples: Mutex::new(Vec::new()),
    });
    let manager = CacheManager::with_resident(config(&dir, 1_000), resident, meter.clone())?;
    let image = IntImage::create(&manager, Dims::xy(32, 16), options())?;

    // Backpressure gives up immediately, so the image overfills the budget.
    for page in 0..image.page_count() {
        image.set_index(page * PAGE_PIXELS, page as i32)?;
    }
    assert_eq!(manager.stats().resident_bytes, 32 * PAGE_BYTES);
    assert!(manager.stats().backpressure_timeouts > 0);

    let report = manager.on_low_memory_signal();
    let samples = meter.samples.lock().clone();
    assert_eq!(samples.len() as u64, report.batches);
    assert!(samples.windows(2).all(|w| w[1] < w[0]), "{samples:?}");
    assert!(*samples.last().unwrap() <= manager.watermarks().low);
    assert!(samples[..samples.len() - 1]
        .iter()
        .all(|&used| used > manager.watermarks().low));

    // Oldest pages went first.
    let evicted = report.evicted;
    for page in 0..image.page_count() {
        assert_eq!(image.is_resident(PageId(page)), page >= evicted);
    }
    for page in 0..image.page_count() {
        assert_eq!(image.get_index(page * PAGE_PIXELS)?, page as i32);
    }
    Ok(())
}

#[test]
fn backpressure_releases_lock_and_resumes_when_relieved() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let meter = Arc::new(DialMeter {
        used: AtomicU64::new(990),
    });
    let config = PagingConfig {
        backpressure_polls: 1_000,
        backpressure_interval_ms: 2,
        ..config(&dir, 0)
    };
    let manager = CacheManager::with_meter(config, meter.clone())?;

    let helper = {
        let manager = Arc::clone(&manager);
        let meter = Arc::clone(&meter);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            // Only possible while the waiting thread has released every hold.
            let _guard = manager.lock();
            meter.used.store(100, Ordering::SeqCst);
        })
    };

    let _outer = manager.lock();
    let _inner = manager.lock();
    let outcome = manager.check_pressure();
    assert!(matches!(outcome, Backpressure::Relieved { polls } if polls >= 1));
    assert_eq!(manager.lock_holds(), 2);
    helper.join().expect("helper thread");

    let stats = manager.stats();
    assert_eq!(stats.backpressure_waits, 1);
    assert_eq!(stats.backpressure_timeouts, 0);
    Ok(())
}

#[test]
fn pixel_access_waits_out_pressure_before_loading() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let meter = Arc::new(DialMeter {
        used: AtomicU64::new(990),
    });
    let config = PagingConfig {
        backpressure_polls: 1_000,
        backpressure_interval_ms: 2,
        ..config(&dir, 0)
    };
    let manager = CacheManager::with_meter(config, meter.clone())?;
    let image = IntImage::create(&manager, Dims::xy(8, 8), options())?;

    let helper = {
        let meter = Arc::clone(&meter);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            meter.used.store(0, Ordering::SeqCst);
        })
    };
    image.set_index(3, 12)?;
    helper.join().expect("helper thread");

    assert_eq!(manager.stats().backpressure_waits, 1);
    // Hits never throttle.
    meter.used.store(990, Ordering::SeqCst);
    assert_eq!(image.get_index(3)?, 12);
    assert_eq!(manager.stats().backpressure_waits, 1);
    Ok(())
}

#[test]
fn monitor_keeps_usage_under_budget_while_writing() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = PagingConfig {
        backpressure_polls: 2_000,
        ..config(&dir, 1_000)
    };
    let manager = CacheManager::new(config)?;
    let monitor = HeapMonitor::spawn(&manager)?;
    let image = IntImage::create(&manager, Dims::xy(64, 16), options())?;

    for index in 0..1_024 {
        image.set_index(index, index as i32 * 3)?;
    }
    assert!(wait_for(|| manager.pressure() != Pressure::Critical));
    for index in 0..1_024 {
        assert_eq!(image.get_index(index)?, index as i32 * 3);
    }
    monitor.shutdown();

    let stats = manager.stats();
    assert!(stats.eviction_signals >= 1);
    assert!(stats.dirty_writebacks >= 1);
    assert_eq!(stats.eviction_failures, 0);
    assert!(image.stats().stores >= stats.dirty_writebacks);
    Ok(())
}

#[test]
fn started_manager_evicts_on_its_own() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = PagingConfig {
        backpressure_polls: 2_000,
        ..config(&dir, 2_048)
    };
    let (manager, monitor) = CacheManager::start(config)?;
    let image = IntImage::create(&manager, Dims::xy(64, 16), options())?;

    for index in 0..1_024 {
        image.set_index(index, index as i32 - 5)?;
    }
    let stats = manager.stats();
    assert!(stats.eviction_signals >= 1);
    assert!(stats.evictions > 0);
    assert_eq!(stats.backpressure_timeouts, 0);
    assert!(stats.resident_bytes <= 2_048);
    for index in 0..1_024 {
        assert_eq!(image.get_index(index)?, index as i32 - 5);
    }
    monitor.shutdown();
    Ok(())
}

#[test]
fn empty_queue_under_pressure_returns_after_retries() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let meter = Arc::new(DialMeter {
        used: AtomicU64::new(999),
    });
    let manager = CacheManager::with_meter(config(&dir, 0), meter)?;
    let report = manager.on_low_memory_signal();
    assert_eq!(report.evicted, 0);
    assert_eq!(report.batches, 0);
    assert!(!report.relieved);
    assert_eq!(manager.stats().eviction_signals, 1);
    Ok(())
}
