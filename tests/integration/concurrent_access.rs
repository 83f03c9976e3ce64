#![allow(missing_docs)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use largeimage::primitives::io::{FileIo, StdFileIo};
use largeimage::primitives::pager::{BudgetMeter, ResidentBytes};
use largeimage::{
    CacheManager, Dims, HeapMeter, HeapMonitor, ImageOptions, IntImage, PageId, PagingConfig,
    PagingError, Result,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::{tempdir, tempfile};

const THREADS: u64 = 4;
const OPS_PER_THREAD: usize = 1_000;
const SEED: u64 = 0x1a7e_1a6e;
/// Room for 32 pages of 16 `i32` pixels; one page is under 5% of it, so a
/// load admitted at the high watermark still fits.
const BUDGET: u64 = 2_048;

fn small_config(dir: &tempfile::TempDir) -> PagingConfig {
    PagingConfig {
        heap_budget_bytes: BUDGET,
        eviction_batch: 4,
        backpressure_polls: 2_000,
        backpressure_interval_ms: 1,
        idle_backoff_ms: 1,
        idle_retries: 2,
        monitor_interval_ms: 1,
        temp_dir: Some(dir.path().to_path_buf()),
        ..PagingConfig::default()
    }
}

fn small_cache(dir: &tempfile::TempDir) -> Arc<CacheManager> {
    CacheManager::new(small_config(dir)).expect("manager")
}

/// Budget meter remembering the highest usage it reported.
struct PeakMeter {
    inner: BudgetMeter,
    peak: AtomicU64,
}

impl HeapMeter for PeakMeter {
    fn used(&self) -> u64 {
        let used = self.inner.used();
        self.peak.fetch_max(used, Ordering::SeqCst);
        used
    }

    fn max(&self) -> u64 {
        self.inner.max()
    }
}

/// Writes disjoint random pixels from every thread, reading back its own
/// earlier writes, and returns what each pixel should hold.
fn disjoint_workload(
    image: &Arc<IntImage>,
    pixels: u64,
    ops: usize,
) -> Result<HashMap<u64, i32>> {
    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let image = Arc::clone(image);
            thread::spawn(move || -> Result<HashMap<u64, i32>> {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED + worker);
                let mut written = HashMap::new();
                for _ in 0..ops {
                    let index = rng.gen_range(0..pixels / THREADS) * THREADS + worker;
                    if rng.gen_bool(0.6) {
                        let value: i32 = rng.gen();
                        image.set_index(index, value)?;
                        written.insert(index, value);
                    } else {
                        let expected = written.get(&index).copied().unwrap_or(0);
                        assert_eq!(image.get_index(index)?, expected);
                    }
                }
                Ok(written)
            })
        })
        .collect();

    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().expect("worker panicked")?);
    }
    Ok(expected)
}

#[test]
fn threads_writing_disjoint_pixels_see_their_own_values() -> Result<()> {
    let dir = tempdir()?;
    let (manager, monitor) = CacheManager::start(small_config(&dir))?;
    let image = IntImage::create(
        &manager,
        Dims::xy(64, 64),
        ImageOptions::default().with_page_pixels(16),
    )?;

    let expected = disjoint_workload(&image, 64 * 64, OPS_PER_THREAD)?;
    monitor.shutdown();

    for (index, value) in expected {
        assert_eq!(image.get_index(index)?, value);
    }
    let stats = manager.stats();
    assert!(stats.evictions > 0);
    assert_eq!(stats.eviction_failures, 0);
    assert_eq!(stats.backpressure_timeouts, 0);
    assert!(!image.is_failed());
    Ok(())
}

#[test]
fn monitor_keeps_concurrent_writers_within_budget() -> Result<()> {
    let dir = tempdir()?;
    let resident = Arc::new(ResidentBytes::default());
    let meter = Arc::new(PeakMeter {
        inner: BudgetMeter::new(Arc::clone(&resident), BUDGET),
        peak: AtomicU64::new(0),
    });
    let manager = CacheManager::with_resident(small_config(&dir), resident, meter.clone())?;
    let monitor = HeapMonitor::spawn(&manager)?;
    let image = IntImage::create(
        &manager,
        Dims::xy(64, 64),
        ImageOptions::default().with_page_pixels(16),
    )?;

    disjoint_workload(&image, 64 * 64, 400)?;
    let stats = manager.stats();
    monitor.shutdown();

    // Signals keep coming for every crossing, so no caller runs out its
    // backpressure budget and usage never outgrows the heap.
    assert!(stats.eviction_signals > 1);
    assert_eq!(stats.backpressure_timeouts, 0);
    assert!(stats.resident_bytes <= BUDGET, "{stats}");
    assert!(meter.peak.load(Ordering::SeqCst) <= BUDGET);
    Ok(())
}

#[test]
fn holding_the_manager_lock_makes_read_modify_write_atomic() -> Result<()> {
    let dir = tempdir()?;
    let manager = small_cache(&dir);
    let image = IntImage::create(
        &manager,
        Dims::xy(16, 16),
        ImageOptions::default().with_page_pixels(16),
    )?;
    let done = Arc::new(AtomicBool::new(false));

    // Evictions interleave between increments but never inside one.
    let evictor = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                manager.evict_lru(1);
                thread::yield_now();
            }
        })
    };
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let image = Arc::clone(&image);
            thread::spawn(move || -> Result<()> {
                for _ in 0..250 {
                    let _guard = image.manager().lock();
                    let current = image.get_index(0)?;
                    image.set_index(0, current + 1)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    done.store(true, Ordering::SeqCst);
    evictor.join().expect("evictor panicked");

    assert_eq!(image.get_index(0)?, (THREADS * 250) as i32);
    assert_eq!(manager.lock_holds(), 0);
    Ok(())
}

/// File I/O that fails on demand.
struct FlakyIo {
    inner: StdFileIo,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyIo {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdFileIo::new(tempfile().expect("tempfile")),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }
}

impl FileIo for FlakyIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure").into());
        }
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure").into());
        }
        self.inner.write_at(off, src)
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }

    fn sync_data(&self) -> Result<()> {
        self.inner.sync_data()
    }
}

fn flaky_image(manager: &Arc<CacheManager>, io: &Arc<FlakyIo>) -> Result<Arc<IntImage>> {
    let io: Arc<dyn FileIo> = io.clone();
    IntImage::create_with_io(
        manager,
        Dims::xy(8, 8),
        ImageOptions::default().with_page_pixels(8),
        io,
    )
}

#[test]
fn failed_write_back_poisons_the_image() -> Result<()> {
    let dir = tempdir()?;
    let manager = small_cache(&dir);
    let io = FlakyIo::new();
    let image = flaky_image(&manager, &io)?;
    image.set_index(0, 5)?;

    io.fail_writes.store(true, Ordering::SeqCst);
    let report = manager.evict_lru(1);
    assert_eq!(report.failed, 1);
    assert_eq!(manager.stats().eviction_failures, 1);
    assert!(image.is_failed());
    assert!(matches!(image.get_index(0), Err(PagingError::ImageFailed(_))));
    assert!(matches!(image.flush(), Err(PagingError::ImageFailed(_))));
    Ok(())
}

#[test]
fn failed_load_is_returned_then_image_refuses_access() -> Result<()> {
    let dir = tempdir()?;
    let manager = small_cache(&dir);
    let io = FlakyIo::new();
    let image = flaky_image(&manager, &io)?;

    io.fail_reads.store(true, Ordering::SeqCst);
    assert!(matches!(image.get_index(9), Err(PagingError::Io(_))));
    io.fail_reads.store(false, Ordering::SeqCst);
    assert!(matches!(image.get_index(9), Err(PagingError::ImageFailed(_))));
    assert!(!image.is_resident(PageId(1)));
    Ok(())
}

#[test]
fn corrupt_slot_is_detected_on_load() -> Result<()> {
    let dir = tempdir()?;
    let manager = small_cache(&dir);
    let io = FlakyIo::new();
    let image = flaky_image(&manager, &io)?;

    let slot = image.slot_len() as u64;
    io.inner.write_at(2 * slot, b"JUNK")?;
    assert!(matches!(
        image.get_index(17),
        Err(PagingError::Corruption("page magic mismatch"))
    ));
    assert!(image.is_failed());
    Ok(())
}

#[test]
fn flush_failure_poisons_but_clean_image_flushes() -> Result<()> {
    let dir = tempdir()?;
    let manager = small_cache(&dir);
    let io = FlakyIo::new();
    let image = flaky_image(&manager, &io)?;
    image.set_index(1, 1)?;
    assert_eq!(image.flush()?, 1);

    image.set_index(2, 2)?;
    io.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(image.flush(), Err(PagingError::Io(_))));
    assert!(image.is_failed());
    Ok(())
}
