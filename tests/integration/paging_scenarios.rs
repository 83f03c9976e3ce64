#![allow(missing_docs)]

use std::sync::Arc;

use largeimage::storage::{BoolImage, ByteImage, DoubleImage, IntImage};
use largeimage::{Addressable, CacheManager, Coord, Dims, ImageOptions, PageId, PagingConfig, PagingError, Result};
use tempfile::{tempdir, TempDir};

fn setup() -> (TempDir, Arc<CacheManager>) {
    let dir = tempdir().expect("tempdir");
    let config = PagingConfig {
        heap_budget_bytes: 1 << 20,
        temp_dir: Some(dir.path().to_path_buf()),
        ..PagingConfig::default()
    };
    (dir, CacheManager::new(config).expect("manager"))
}

fn pages_of(pixels: u64) -> ImageOptions {
    ImageOptions::default().with_page_pixels(pixels)
}

#[test]
fn value_survives_eviction_and_reload() -> Result<()> {
    let (_dir, manager) = setup();
    let image = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    assert_eq!(image.page_count(), 4);

    image.set_index(5, 7)?;
    assert_eq!(image.layout().locate(5)?, (PageId(1), 1));
    assert_eq!(image.locate(Coord::xy(1, 1))?, (PageId(1), 1));

    let report = manager.evict_lru(1);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.written_back, 1);
    assert!(!image.is_resident(PageId(1)));

    assert_eq!(image.get_index(5)?, 7);
    assert!(image.is_resident(PageId(1)));
    let stats = image.stats();
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.loads, 2);
    Ok(())
}

#[test]
fn page_id_equal_to_page_count_is_out_of_range() -> Result<()> {
    let (_dir, manager) = setup();
    let image = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    let err = image.read_page(PageId(image.page_count())).unwrap_err();
    assert!(matches!(
        err,
        PagingError::PageOutOfRange {
            page: PageId(4),
            count: 4
        }
    ));
    assert!(matches!(
        image.discard_page(PageId(4)),
        Err(PagingError::PageOutOfRange { .. })
    ));
    assert!(!image.is_failed());
    Ok(())
}

#[test]
fn clean_pages_are_dropped_without_io() -> Result<()> {
    let (_dir, manager) = setup();
    let image = ByteImage::create(&manager, Dims::xy(8, 8), pages_of(16))?;
    image.set_xy(3, 2, 200)?;
    manager.evict_lru(usize::MAX);
    assert_eq!(image.stats().stores, 1);

    // Reloaded and only read: the next eviction must not write.
    assert_eq!(image.get_xy(3, 2)?, 200);
    let report = manager.evict_lru(usize::MAX);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.written_back, 0);
    assert_eq!(image.stats().stores, 1);
    assert_eq!(image.get_xy(3, 2)?, 200);

    let cache = manager.stats();
    assert_eq!(cache.dirty_writebacks, 1);
    assert_eq!(cache.clean_drops, 1);
    Ok(())
}

#[test]
fn touch_a_b_a_then_evict_one_takes_b() -> Result<()> {
    let (_dir, manager) = setup();
    let image = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    image.get_index(0)?;
    image.get_index(4)?;
    image.get_index(1)?;

    manager.evict_lru(1);
    assert!(image.is_resident(PageId(0)));
    assert!(!image.is_resident(PageId(1)));
    Ok(())
}

#[test]
fn lru_order_spans_images() -> Result<()> {
    let (_dir, manager) = setup();
    let a = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    let b = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    a.get_index(0)?;
    b.get_index(0)?;
    a.get_index(4)?;
    b.get_index(0)?;

    manager.evict_lru(2);
    assert!(!a.is_resident(PageId(0)));
    assert!(!a.is_resident(PageId(1)));
    assert!(b.is_resident(PageId(0)));
    Ok(())
}

#[test]
fn coordinate_accessors_share_one_index_space() -> Result<()> {
    let (_dir, manager) = setup();
    let dims = Dims::new(3, 3, 2, 2, 2);
    let image = DoubleImage::create(&manager, dims, pages_of(8))?;

    image.set_xyzb(1, 2, 1, 1, 4.5)?;
    assert_eq!(image.get_xyztb(1, 2, 1, 0, 1)?, 4.5);
    image.set_xyzt(2, 0, 1, 1, -1.0)?;
    assert_eq!(image.get_xyztb(2, 0, 1, 1, 0)?, -1.0);
    image.set_xyb(0, 1, 1, 2.0)?;
    assert_eq!(image.get_index(dims.linear_index(Coord::xyb(0, 1, 1)))?, 2.0);
    image.set_xyz(1, 1, 1, 8.0)?;
    assert_eq!(image.get_xyzb(1, 1, 1, 0)?, 8.0);
    image.set_xyztb(2, 2, 1, 1, 1, 9.0)?;
    assert_eq!(image.get_index(dims.total_pixels().unwrap() - 1)?, 9.0);
    assert_eq!(image.get_xy(0, 0)?, 0.0);

    assert!(matches!(
        image.get_xyz(0, 0, 2),
        Err(PagingError::OutOfBounds { axis: "z", .. })
    ));
    assert!(matches!(
        image.get_index(72),
        Err(PagingError::OutOfBounds { axis: "index", .. })
    ));
    Ok(())
}

#[test]
fn final_page_reports_valid_length() -> Result<()> {
    let (_dir, manager) = setup();
    let image = IntImage::create(&manager, Dims::xy(5, 3), pages_of(4))?;
    image.set_index(14, 3)?;
    manager.evict_lru(usize::MAX);

    let last = image.read_page(PageId(3))?;
    assert_eq!(last.valid_length(), Some(3));
    assert_eq!(last.len(), 3);
    assert_eq!(last.values(), &[0, 0, 3]);
    assert_eq!(image.read_page(PageId(2))?.valid_length(), None);
    Ok(())
}

#[test]
fn band_offset_is_recomputed_on_load() -> Result<()> {
    let (_dir, manager) = setup();
    let image = ByteImage::create(&manager, Dims::new(4, 4, 1, 1, 3), pages_of(8))?;
    image.set_xyb(1, 1, 2, 5)?;
    manager.evict_lru(usize::MAX);
    let page = image.read_page(PageId(2))?;
    assert_eq!(page.band_offset(), Some(1));
    assert_eq!(image.read_page(PageId(0))?.band_offset(), Some(0));
    Ok(())
}

#[test]
fn byte_and_bool_pages_report_emptiness() -> Result<()> {
    let (_dir, manager) = setup();
    let bits = BoolImage::create(&manager, Dims::xy(8, 2), pages_of(8))?;
    bits.set_xy(7, 1, true)?;
    assert!(bits.read_page(PageId(0))?.is_empty());
    assert!(!bits.read_page(PageId(1))?.is_empty());

    let bytes = ByteImage::create(&manager, Dims::xy(8, 2), pages_of(8))?;
    bytes.set_xy(0, 0, 1)?;
    assert!(!bytes.read_page(PageId(0))?.is_empty());
    assert!(bytes.read_page(PageId(1))?.is_empty());
    Ok(())
}

#[test]
fn read_page_returns_independent_copy() -> Result<()> {
    let (_dir, manager) = setup();
    let image = IntImage::create(&manager, Dims::xy(4, 4), pages_of(4))?;
    image.set_index(2, 11)?;
    let mut copy = image.read_page(PageId(0))?;
    copy.set(2, 99);
    assert_eq!(image.get_index(2)?, 11);
    Ok(())
}
