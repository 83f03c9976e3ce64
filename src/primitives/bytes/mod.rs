#![forbid(unsafe_code)]
//! Fixed-width little-endian codecs used by the page format.

pub mod le {
    //! Little-endian readers and writers over byte slices.

    fn array<const N: usize>(src: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&src[..N]);
        out
    }

    /// Writes a u16 at the start of `dst`.
    pub fn put_u16(dst: &mut [u8], v: u16) {
        dst[..2].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u16 from the start of `src`.
    pub fn get_u16(src: &[u8]) -> u16 {
        u16::from_le_bytes(array(src))
    }

    /// Writes a u32 at the start of `dst`.
    pub fn put_u32(dst: &mut [u8], v: u32) {
        dst[..4].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 from the start of `src`.
    pub fn get_u32(src: &[u8]) -> u32 {
        u32::from_le_bytes(array(src))
    }

    /// Writes a u64 at the start of `dst`.
    pub fn put_u64(dst: &mut [u8], v: u64) {
        dst[..8].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u64 from the start of `src`.
    pub fn get_u64(src: &[u8]) -> u64 {
        u64::from_le_bytes(array(src))
    }

    /// Writes an i32 at the start of `dst`.
    pub fn put_i32(dst: &mut [u8], v: i32) {
        dst[..4].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads an i32 from the start of `src`.
    pub fn get_i32(src: &[u8]) -> i32 {
        i32::from_le_bytes(array(src))
    }

    /// Writes an f64 bit pattern at the start of `dst`.
    pub fn put_f64(dst: &mut [u8], v: f64) {
        put_u64(dst, v.to_bits());
    }

    /// Reads an f64 bit pattern from the start of `src`.
    pub fn get_f64(src: &[u8]) -> f64 {
        f64::from_bits(get_u64(src))
    }
}

/// Encodes `values` into `dst` using `width` bytes per element.
///
/// `dst` must hold exactly `values.len() * width` bytes.
pub fn encode_slice<T: Copy>(dst: &mut [u8], values: &[T], width: usize, put: fn(&mut [u8], T)) {
    debug_assert_eq!(dst.len(), values.len() * width);
    for (chunk, value) in dst.chunks_exact_mut(width).zip(values) {
        put(chunk, *value);
    }
}

/// Decodes `dst.len()` elements of `width` bytes each from `src`.
pub fn decode_slice<T: Copy>(dst: &mut [T], src: &[u8], width: usize, get: fn(&[u8]) -> T) {
    debug_assert_eq!(src.len(), dst.len() * width);
    for (slot, chunk) in dst.iter_mut().zip(src.chunks_exact(width)) {
        *slot = get(chunk);
    }
}
