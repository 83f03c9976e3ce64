use core::convert::TryFrom;
use std::fmt;

use crate::primitives::bytes::le;
use crate::types::{PagingError, Result};

/// Element type tag stored in every page header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageKind {
    /// Placeholder written when a backing file is created.
    Empty = 0,
    /// `u8` pixels.
    Byte = 1,
    /// `bool` pixels.
    Bool = 2,
    /// `i32` pixels.
    Int = 3,
    /// `f64` pixels.
    Double = 4,
}

impl PageKind {
    /// Header byte of this kind.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = PagingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Empty),
            1 => Ok(PageKind::Byte),
            2 => Ok(PageKind::Bool),
            3 => Ok(PageKind::Int),
            4 => Ok(PageKind::Double),
            _ => Err(PagingError::Corruption("unknown page kind")),
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageKind::Empty => "empty",
            PageKind::Byte => "byte",
            PageKind::Bool => "bool",
            PageKind::Int => "int",
            PageKind::Double => "double",
        };
        f.write_str(name)
    }
}

/// Pixel element stored in pages.
///
/// The four implementations (`u8`, `bool`, `i32`, `f64`) differ only in how
/// they are laid out on disk and how min/max combine; everything else about
/// paging is shared.
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    /// Header tag for pages of this element.
    const KIND: PageKind;
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Writes `value` at the start of `dst`.
    fn put(dst: &mut [u8], value: Self);
    /// Reads a value from the start of `src`.
    fn get(src: &[u8]) -> Self;

    /// Smaller of two values; `self` wins ties and unordered pairs.
    fn lesser(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }

    /// Larger of two values; `self` wins ties and unordered pairs.
    fn greater(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }

    /// Heap bytes occupied by `len` elements.
    fn heap_bytes(len: usize) -> u64 {
        (len * std::mem::size_of::<Self>()) as u64
    }
}

impl Element for u8 {
    const KIND: PageKind = PageKind::Byte;
    const WIDTH: usize = 1;

    fn put(dst: &mut [u8], value: Self) {
        dst[0] = value;
    }

    fn get(src: &[u8]) -> Self {
        src[0]
    }
}

impl Element for bool {
    const KIND: PageKind = PageKind::Bool;
    const WIDTH: usize = 1;

    fn put(dst: &mut [u8], value: Self) {
        dst[0] = u8::from(value);
    }

    fn get(src: &[u8]) -> Self {
        src[0] != 0
    }
}

impl Element for i32 {
    const KIND: PageKind = PageKind::Int;
    const WIDTH: usize = 4;

    fn put(dst: &mut [u8], value: Self) {
        le::put_i32(dst, value);
    }

    fn get(src: &[u8]) -> Self {
        le::get_i32(src)
    }
}

impl Element for f64 {
    const KIND: PageKind = PageKind::Double;
    const WIDTH: usize = 8;

    fn put(dst: &mut [u8], value: Self) {
        le::put_f64(dst, value);
    }

    fn get(src: &[u8]) -> Self {
        le::get_f64(src)
    }
}
