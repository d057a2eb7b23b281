//! Copy-on-write byte buffer.
//!
//! [`SharedBytes`] is a cheap-to-clone handle over an immutable byte run.
//! Clones share one allocation until a handle is written through one of
//! the mutable accessors, at which point that handle detaches to a
//! private copy first. Readers holding other handles never observe the
//! write.
//!
//! The handle is `Send + Sync` because the storage is an [`Arc`], but it
//! provides no cross-thread synchronisation of its own: mutation always
//! needs `&mut self`.

use core::fmt::{self, Write};
use std::borrow::Cow;
use std::sync::Arc;

/// Value returned by [`SharedBytes::get`] for out-of-range indices.
pub const OUT_OF_RANGE: u8 = 0;

#[derive(Clone, Default)]
pub struct SharedBytes {
    data: Arc<Vec<u8>>,
}

impl SharedBytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Arc::new(bytes.to_vec()),
        }
    }

    /// Buffer of `len` zero bytes, ready to be written in place.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: Arc::new(vec![0; len]),
        }
    }

    /// Builds a buffer from `format_args!` output. Fails only when a
    /// `Display` impl in `args` does.
    pub fn formatted(args: fmt::Arguments<'_>) -> Result<Self, fmt::Error> {
        let mut buf = Self::new();
        buf.format(args)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Content as UTF-8, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.data).ok()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Bounds-checked read. Returns [`OUT_OF_RANGE`] instead of failing.
    pub fn get(&self, index: usize) -> u8 {
        self.data.get(index).copied().unwrap_or(OUT_OF_RANGE)
    }

    /// Mutable access to one byte. Detaches from shared storage first;
    /// an out-of-range index returns `None` and leaves the storage shared.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut u8> {
        if index >= self.data.len() {
            return None;
        }
        self.make_unique().get_mut(index)
    }

    /// Mutable view of the whole run, detaching first.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.make_unique().as_mut_slice()
    }

    /// Shortens the run to `len` bytes, detaching first. No-op if it is
    /// already that short.
    pub fn truncate(&mut self, len: usize) {
        if len < self.data.len() {
            self.make_unique().truncate(len);
        }
    }

    /// Number of handles currently sharing this storage.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Replaces the content with formatted text.
    ///
    /// The required size is measured first; after detaching, the existing
    /// allocation is reused when it is large enough, otherwise a new one
    /// of exactly the required size is made. A `Display` error is
    /// returned; one raised while measuring leaves the content untouched.
    pub fn format(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        let mut counter = ByteCounter(0);
        counter.write_fmt(args)?;
        let needed = counter.0;

        let storage = self.make_unique();
        if storage.capacity() >= needed {
            storage.clear();
        } else {
            *storage = Vec::with_capacity(needed);
        }
        VecWriter(storage).write_fmt(args)
    }

    fn make_unique(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.data)
    }
}

struct ByteCounter(usize);

impl Write for ByteCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

struct VecWriter<'a>(&'a mut Vec<u8>);

impl Write for VecWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl PartialEq for SharedBytes {
    fn eq(&self, other: &Self) -> bool {
        self.shares_storage_with(other) || self.data.as_slice() == other.data.as_slice()
    }
}

impl Eq for SharedBytes {}

impl PartialEq<[u8]> for SharedBytes {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl PartialEq<&str> for SharedBytes {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl fmt::Display for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<&str> for SharedBytes {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<&[u8]> for SharedBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(bytes),
        }
    }
}
