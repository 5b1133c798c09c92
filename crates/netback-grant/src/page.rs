//! Page-sized memory shared with a (possibly hostile) guest.
//!
//! The contents are stored as atomic words so that the backend and a guest may touch the same
//! page concurrently without either side observing undefined behaviour. Byte accesses are
//! emulated with masked read-modify-write on the containing word.

use std::fmt;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU32;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU32;

use std::sync::atomic::Ordering;

use crate::PAGE_SIZE;

const WORDS: usize = PAGE_SIZE / 4;

pub struct Page {
    words: Box<[AtomicU32]>,
}

impl Page {
    /// Allocate a zero-filled page.
    pub fn new() -> Self {
        let words = (0..WORDS).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Allocate a page whose leading bytes are `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than a page.
    pub fn from_bytes(data: &[u8]) -> Self {
        let page = Self::new();
        page.write(0, data);
        page
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        check_range(offset, buf.len());
        let mut pos = offset;
        for out in buf.iter_mut() {
            let word = self.words[pos / 4].load(Ordering::Relaxed);
            *out = (word >> ((pos % 4) * 8)) as u8;
            pos += 1;
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        check_range(offset, data.len());
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let shift = pos % 4;
            if shift == 0 && rest.len() >= 4 {
                let value = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                self.words[pos / 4].store(value, Ordering::Relaxed);
                pos += 4;
                rest = &rest[4..];
                continue;
            }

            let n = (4 - shift).min(rest.len());
            let mut mask = 0u32;
            let mut bits = 0u32;
            for (i, &byte) in rest[..n].iter().enumerate() {
                let sh = ((shift + i) * 8) as u32;
                mask |= 0xFF << sh;
                bits |= u32::from(byte) << sh;
            }
            let _ = self.words[pos / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                Some((w & !mask) | bits)
            });
            pos += n;
            rest = &rest[n..];
        }
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    pub fn fill(&self, byte: u8) {
        let value = u32::from_ne_bytes([byte; 4]);
        for word in self.words.iter() {
            word.store(value, Ordering::Relaxed);
        }
    }

    /// Copy `len` bytes from `src` at `src_offset` into this page at `offset`.
    pub fn copy_from(&self, offset: usize, src: &Page, src_offset: usize, len: usize) {
        let tmp = src.to_vec(src_offset, len);
        self.write(offset, &tmp);
    }

    /// Load an aligned little-endian `u32` with acquire ordering (ring cursors).
    pub fn load_u32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    /// Store an aligned `u32` with release ordering (ring cursors).
    pub fn store_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release);
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % 4 == 0 && offset < PAGE_SIZE,
            "unaligned or out-of-range word offset {offset}"
        );
        &self.words[offset / 4]
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}

fn check_range(offset: usize, len: usize) {
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= PAGE_SIZE),
        "page access out of range: offset={offset} len={len}"
    );
}
