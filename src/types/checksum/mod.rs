#![forbid(unsafe_code)]
//! Page checksums.

/// CRC32 over a page id and its encoded body, stored in every page header.
pub fn page_crc32(page_no: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}
