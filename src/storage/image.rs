//! Paged images: pixel accessors over a resident page table and a backing file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use super::backing::BackingFile;
use super::element::Element;
use super::layout::{
    page_pixels_for_budget, page_pixels_for_heap, Addressable, Coord, Dims, PageLayout,
};
use super::page::Page;
use crate::primitives::io::FileIo;
use crate::primitives::pager::{CacheManager, Discarded, PageOwner};
use crate::types::{ImageId, PageId, PagingError, Result};

const STATE_OPEN: u8 = 0;
const STATE_FAILED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Per-image sizing overrides.
#[derive(Clone, Debug, Default)]
pub struct ImageOptions {
    /// Exact pixels per page; must be a power of two.
    pub page_pixels: Option<u64>,
    /// Heap bytes per page; overrides the manager's `page_bytes`.
    pub page_bytes: Option<u64>,
    /// Directory for the backing file; overrides the manager's `temp_dir`.
    pub temp_dir: Option<PathBuf>,
}

impl ImageOptions {
    /// Uses exactly `pixels` pixels per page.
    pub fn with_page_pixels(mut self, pixels: u64) -> Self {
        self.page_pixels = Some(pixels);
        self
    }

    /// Sizes pages to at most `bytes` heap bytes each.
    pub fn with_page_bytes(mut self, bytes: u64) -> Self {
        self.page_bytes = Some(bytes);
        self
    }

    /// Places the backing file in `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

/// Per-image I/O counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImageStats {
    /// Pages read from the backing file (placeholders included).
    pub loads: u64,
    /// Dirty pages written to the backing file.
    pub stores: u64,
    /// Pages removed from memory.
    pub discards: u64,
    /// Pages currently resident.
    pub resident_pages: u64,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    stores: AtomicU64,
    discards: AtomicU64,
}

/// An image too large for memory, split into pages of `T` pixels.
///
/// Pages materialize on first access and stay in the resident table until the
/// shared [`CacheManager`] evicts them; dirty pages are written to a private
/// temporary file on eviction. Every access runs under the manager lock.
///
/// A backing-file I/O or corruption error is returned to the caller and
/// poisons the image: later accesses fail with [`PagingError::ImageFailed`].
pub struct LargeImage<T: Element> {
    id: ImageId,
    layout: PageLayout,
    slot_len: usize,
    backing: Mutex<Option<BackingFile>>,
    pages: Mutex<HashMap<PageId, Page<T>>>,
    state: AtomicU8,
    counters: Counters,
    manager: Arc<CacheManager>,
}

/// Image of `u8` pixels.
pub type ByteImage = LargeImage<u8>;
/// Image of `bool` pixels.
pub type BoolImage = LargeImage<bool>;
/// Image of `i32` pixels.
pub type IntImage = LargeImage<i32>;
/// Image of `f64` pixels.
pub type DoubleImage = LargeImage<f64>;

impl<T: Element> LargeImage<T> {
    /// Creates an image backed by a new temporary file and registers it with
    /// `manager`.
    pub fn create(manager: &Arc<CacheManager>, dims: Dims, options: ImageOptions) -> Result<Arc<Self>> {
        let layout = Self::plan(manager, dims, &options)?;
        let slot_len = Self::measure_slot(&layout)?;
        let dir = options
            .temp_dir
            .as_deref()
            .or(manager.config().temp_dir.as_deref());
        let backing = BackingFile::create_temp(dir, slot_len, layout.page_count())?;
        Ok(Self::register(manager, layout, slot_len, backing))
    }

    /// Creates an image over caller-supplied file I/O.
    pub fn create_with_io(
        manager: &Arc<CacheManager>,
        dims: Dims,
        options: ImageOptions,
        io: Arc<dyn FileIo>,
    ) -> Result<Arc<Self>> {
        let layout = Self::plan(manager, dims, &options)?;
        let slot_len = Self::measure_slot(&layout)?;
        let backing = BackingFile::with_io(io, slot_len, layout.page_count())?;
        Ok(Self::register(manager, layout, slot_len, backing))
    }

    fn plan(manager: &CacheManager, dims: Dims, options: &ImageOptions) -> Result<PageLayout> {
        let pixel_bytes = T::heap_bytes(1);
        let page_size = match options.page_pixels {
            Some(pixels) => pixels,
            None => {
                let derived = match options.page_bytes.or(manager.config().page_bytes) {
                    Some(bytes) => page_pixels_for_budget(bytes, pixel_bytes),
                    None => page_pixels_for_heap(
                        manager.meter().max(),
                        manager.config().target_resident_pages,
                        pixel_bytes,
                    ),
                };
                let total = dims
                    .total_pixels()
                    .ok_or(PagingError::Invalid("pixel count overflows u64"))?;
                derived.min(total.checked_next_power_of_two().unwrap_or(1 << 63))
            }
        };
        PageLayout::new(dims, page_size)
    }

    fn measure_slot(layout: &PageLayout) -> Result<usize> {
        let sample = Page::<T>::new(ImageId(0), PageId(0), layout.page_size() as usize);
        Ok(sample.encode_to_vec()?.len())
    }

    fn register(
        manager: &Arc<CacheManager>,
        layout: PageLayout,
        slot_len: usize,
        backing: BackingFile,
    ) -> Arc<Self> {
        let image = Arc::new_cyclic(|weak: &Weak<Self>| {
            let owner: Weak<dyn PageOwner> = weak.clone();
            Self {
                id: manager.register_image(owner),
                layout,
                slot_len,
                backing: Mutex::new(Some(backing)),
                pages: Mutex::new(HashMap::new()),
                state: AtomicU8::new(STATE_OPEN),
                counters: Counters::default(),
                manager: Arc::clone(manager),
            }
        });
        let kind = T::KIND;
        info!(
            image = image.id.0,
            %kind,
            page_size = layout.page_size(),
            page_count = layout.page_count(),
            slot_len,
            "storage.image.create"
        );
        image
    }

    /// Registry id.
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Pixels per page.
    pub fn page_size(&self) -> u64 {
        self.layout.page_size()
    }

    /// Number of pages.
    pub fn page_count(&self) -> u64 {
        self.layout.page_count()
    }

    /// Encoded bytes per page slot.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Manager the image is registered with.
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Path of the temporary backing file, if file-backed and open.
    pub fn backing_path(&self) -> Option<PathBuf> {
        self.backing
            .lock()
            .as_ref()
            .and_then(BackingFile::path)
            .map(Path::to_path_buf)
    }

    /// Whether a fatal backing-file error poisoned the image.
    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FAILED
    }

    /// Whether [`LargeImage::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Whether `page` is currently in memory.
    pub fn is_resident(&self, page: PageId) -> bool {
        let _guard = self.manager.lock();
        self.pages.lock().contains_key(&page)
    }

    /// Number of pages currently in memory.
    pub fn resident_pages(&self) -> usize {
        let _guard = self.manager.lock();
        self.pages.lock().len()
    }

    /// I/O counters.
    pub fn stats(&self) -> ImageStats {
        ImageStats {
            loads: self.counters.loads.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            discards: self.counters.discards.load(Ordering::Relaxed),
            resident_pages: self.resident_pages() as u64,
        }
    }

    /// Value at a linear index.
    pub fn get_index(&self, index: u64) -> Result<T> {
        let (page, offset) = self.layout.locate(index)?;
        self.with_page(page, |p| p.get(offset))
    }

    /// Stores `value` at a linear index.
    pub fn set_index(&self, index: u64, value: T) -> Result<()> {
        let (page, offset) = self.layout.locate(index)?;
        self.with_page(page, |p| p.set(offset, value))
    }

    /// Value at `c`.
    pub fn get(&self, c: Coord) -> Result<T> {
        self.get_index(self.index_of(c)?)
    }

    /// Stores `value` at `c`.
    pub fn set(&self, c: Coord, value: T) -> Result<()> {
        self.set_index(self.index_of(c)?, value)
    }

    /// Value at `(x, y)`.
    pub fn get_xy(&self, x: u64, y: u64) -> Result<T> {
        self.get(Coord::xy(x, y))
    }

    /// Stores `value` at `(x, y)`.
    pub fn set_xy(&self, x: u64, y: u64, value: T) -> Result<()> {
        self.set(Coord::xy(x, y), value)
    }

    /// Value at `(x, y, b)`.
    pub fn get_xyb(&self, x: u64, y: u64, b: u64) -> Result<T> {
        self.get(Coord::xyb(x, y, b))
    }

    /// Stores `value` at `(x, y, b)`.
    pub fn set_xyb(&self, x: u64, y: u64, b: u64, value: T) -> Result<()> {
        self.set(Coord::xyb(x, y, b), value)
    }

    /// Value at `(x, y, z)`.
    pub fn get_xyz(&self, x: u64, y: u64, z: u64) -> Result<T> {
        self.get(Coord::xyz(x, y, z))
    }

    /// Stores `value` at `(x, y, z)`.
    pub fn set_xyz(&self, x: u64, y: u64, z: u64, value: T) -> Result<()> {
        self.set(Coord::xyz(x, y, z), value)
    }

    /// Value at `(x, y, z, b)`.
    pub fn get_xyzb(&self, x: u64, y: u64, z: u64, b: u64) -> Result<T> {
        self.get(Coord::xyzb(x, y, z, b))
    }

    /// Stores `value` at `(x, y, z, b)`.
    pub fn set_xyzb(&self, x: u64, y: u64, z: u64, b: u64, value: T) -> Result<()> {
        self.set(Coord::xyzb(x, y, z, b), value)
    }

    /// Value at `(x, y, z, t)`.
    pub fn get_xyzt(&self, x: u64, y: u64, z: u64, t: u64) -> Result<T> {
        self.get(Coord::xyzt(x, y, z, t))
    }

    /// Stores `value` at `(x, y, z, t)`.
    pub fn set_xyzt(&self, x: u64, y: u64, z: u64, t: u64, value: T) -> Result<()> {
        self.set(Coord::xyzt(x, y, z, t), value)
    }

    /// Value at `(x, y, z, t, b)`.
    pub fn get_xyztb(&self, x: u64, y: u64, z: u64, t: u64, b: u64) -> Result<T> {
        self.get(Coord::xyztb(x, y, z, t, b))
    }

    /// Stores `value` at `(x, y, z, t, b)`.
    pub fn set_xyztb(&self, x: u64, y: u64, z: u64, t: u64, b: u64, value: T) -> Result<()> {
        self.set(Coord::xyztb(x, y, z, t, b), value)
    }

    /// Deep copy of `page`, loading it if needed.
    pub fn read_page(&self, page: PageId) -> Result<Page<T>> {
        self.with_page(page, |p| p.clone())
    }

    /// Minimum over the whole image, or over one band.
    pub fn reduce_min(&self, band: Option<u64>) -> Result<Option<T>> {
        self.reduce(band, T::lesser, Page::reduce_min, Page::reduce_band_min)
    }

    /// Maximum over the whole image, or over one band.
    pub fn reduce_max(&self, band: Option<u64>) -> Result<Option<T>> {
        self.reduce(band, T::greater, Page::reduce_max, Page::reduce_band_max)
    }

    fn reduce(
        &self,
        band: Option<u64>,
        combine: fn(T, T) -> T,
        whole: fn(&Page<T>) -> Option<T>,
        banded: fn(&Page<T>, u64, u64) -> Option<T>,
    ) -> Result<Option<T>> {
        let bands = self.layout.dims().b;
        if let Some(band) = band {
            if band >= bands {
                return Err(PagingError::OutOfBounds {
                    axis: "b",
                    value: band,
                    extent: bands,
                });
            }
        }
        let mut acc: Option<T> = None;
        for page in 0..self.layout.page_count() {
            let part = self.with_page(PageId(page), |p| match band {
                Some(band) => banded(p, band, bands),
                None => whole(p),
            })?;
            acc = match (acc, part) {
                (Some(a), Some(b)) => Some(combine(a, b)),
                (a, b) => a.or(b),
            };
        }
        Ok(acc)
    }

    /// Removes `page` from memory, writing it back first if it is dirty.
    pub fn discard_page(&self, page: PageId) -> Result<()> {
        let _guard = self.manager.lock();
        self.ensure_usable()?;
        self.layout.check_page(page)?;
        let discarded = self.discard_resident(page)?;
        self.manager.page_discarded(self.id, page, discarded);
        Ok(())
    }

    /// Writes every dirty resident page back and syncs the backing file.
    ///
    /// Returns the number of pages written.
    pub fn flush(&self) -> Result<usize> {
        let _guard = self.manager.lock();
        self.ensure_usable()?;
        let mut pages = self.pages.lock();
        let mut written = 0;
        for page in pages.values_mut().filter(|p| p.is_dirty()) {
            self.store(page).map_err(|err| self.fail(err))?;
            page.mark_clean();
            written += 1;
        }
        drop(pages);
        self.with_backing(BackingFile::sync)
            .map_err(|err| self.fail(err))?;
        debug!(image = self.id.0, written, "storage.image.flush");
        Ok(written)
    }

    /// Drops resident pages, unregisters the image and deletes the backing
    /// file. Later accesses fail with [`PagingError::Closed`].
    pub fn close(&self) -> Result<()> {
        let _guard = self.manager.lock();
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(());
        }
        let dropped = {
            let mut pages = self.pages.lock();
            let n = pages.len();
            pages.clear();
            n
        };
        self.manager.forget_image(self.id);
        if let Some(backing) = self.backing.lock().take() {
            backing.close()?;
        }
        info!(image = self.id.0, dropped, "storage.image.close");
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_FAILED => Err(PagingError::ImageFailed(self.id)),
            STATE_CLOSED => Err(PagingError::Closed(self.id)),
            _ => Ok(()),
        }
    }

    fn fail(&self, err: PagingError) -> PagingError {
        if err.is_fatal_io()
            && self
                .state
                .compare_exchange(STATE_OPEN, STATE_FAILED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            error!(image = self.id.0, error = %err, "storage.image.failed");
        }
        err
    }

    /// Runs `f` on resident `page`, materializing it first on a miss.
    fn with_page<R>(&self, page: PageId, f: impl FnOnce(&mut Page<T>) -> R) -> Result<R> {
        let _guard = self.manager.lock();
        self.ensure_usable()?;
        self.layout.check_page(page)?;
        if let Some(resident) = self.pages.lock().get_mut(&page) {
            let out = f(resident);
            self.manager.page_hit(self.id, page);
            return Ok(out);
        }

        // Throttling releases the manager lock; recheck everything afterwards.
        self.manager.check_pressure();
        self.ensure_usable()?;
        let mut pages = self.pages.lock();
        if let Some(resident) = pages.get_mut(&page) {
            let out = f(resident);
            drop(pages);
            self.manager.page_hit(self.id, page);
            return Ok(out);
        }
        let mut loaded = self.load(page).map_err(|err| self.fail(err))?;
        let bytes = loaded.heap_bytes();
        let out = f(&mut loaded);
        pages.insert(page, loaded);
        drop(pages);
        self.manager.page_loaded(self.id, page, bytes);
        Ok(out)
    }

    fn with_backing<R>(&self, f: impl FnOnce(&BackingFile) -> Result<R>) -> Result<R> {
        let backing = self.backing.lock();
        match backing.as_ref() {
            Some(backing) => f(backing),
            None => Err(PagingError::Closed(self.id)),
        }
    }

    fn load(&self, page: PageId) -> Result<Page<T>> {
        let mut slot = vec![0u8; self.slot_len];
        self.with_backing(|backing| backing.read_slot(page, &mut slot))?;
        let capacity = self.layout.page_size() as usize;
        let loaded = match Page::decode(self.id, page, capacity, &slot)? {
            Some(stored) => stored,
            None => Page::new(self.id, page, capacity),
        };
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        debug!(image = self.id.0, page = page.0, "storage.page.load");
        Ok(loaded.with_geometry(self.layout.band_offset(page), self.layout.valid_length(page)))
    }

    fn store(&self, page: &Page<T>) -> Result<()> {
        let encoded = page.encode_to_vec()?;
        self.with_backing(|backing| backing.write_slot(page.id(), &encoded))?;
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        debug!(image = self.id.0, page = page.id().0, "storage.page.store");
        Ok(())
    }

    /// Removes a resident page, storing it first if dirty. Caller holds the
    /// manager lock.
    fn discard_resident(&self, page: PageId) -> Result<Discarded> {
        let mut pages = self.pages.lock();
        let resident = pages.remove(&page).ok_or(PagingError::NotResident(page))?;
        let written_back = resident.is_dirty();
        if written_back {
            self.store(&resident).map_err(|err| self.fail(err))?;
        }
        self.counters.discards.fetch_add(1, Ordering::Relaxed);
        debug!(
            image = self.id.0,
            page = page.0,
            written_back,
            "storage.page.discard"
        );
        Ok(Discarded {
            bytes: resident.heap_bytes(),
            written_back,
        })
    }
}

impl<T: Element> Addressable for LargeImage<T> {
    fn layout(&self) -> &PageLayout {
        &self.layout
    }
}

impl<T: Element> PageOwner for LargeImage<T> {
    fn image_id(&self) -> ImageId {
        self.id
    }

    fn evict_resident(&self, page: PageId) -> Result<Discarded> {
        self.discard_resident(page)
    }
}

impl<T: Element> Drop for LargeImage<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            self.manager.forget_image(self.id);
            debug!(image = self.id.0, "storage.image.drop");
        }
    }
}
