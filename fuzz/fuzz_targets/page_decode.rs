#![no_main]

use largeimage::storage::page::PAGE_HDR_LEN;
use largeimage::storage::{Page, PageHeader};
use largeimage::{ImageId, PageId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let capacity = usize::from(data[0] % 64);
    let page = PageId(u64::from(data[1]));
    let slot = &data[2..];

    let _ = PageHeader::decode(slot);
    let _ = Page::<u8>::decode(ImageId(1), page, capacity, slot);
    let _ = Page::<bool>::decode(ImageId(1), page, capacity, slot);
    let _ = Page::<i32>::decode(ImageId(1), page, capacity, slot);
    if let Ok(Some(decoded)) = Page::<f64>::decode(ImageId(1), page, capacity, slot) {
        let reencoded = decoded.encode_to_vec().expect("decoded page re-encodes");
        assert_eq!(
            &reencoded[PAGE_HDR_LEN..],
            &slot[PAGE_HDR_LEN..reencoded.len()]
        );
    }
});
