//! Zero-copy byte buffers.
//!
//! `ByteBuffer` is a growable byte region with independent reader and writer
//! cursors over absolute indices:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | discardable bytes |  readable bytes  |  writable bytes  |
//! | (prepend region)  |                  |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    capacity
//! ```
//!
//! Bytes in front of the reader index double as the *prepend region*: a buffer
//! created with [`ByteBuffer::with_prepend`] reserves room there so an encoder
//! can attach a header to an existing payload without moving it.
//!
//! Storage is either uniquely owned (`BytesMut`) or shared (`Bytes`, atomically
//! ref-counted). [`ByteBuffer::slice`] freezes the storage and hands out a
//! fixed-size view; a later write to any holder of shared storage first copies
//! the bytes it needs, so views are snapshots and never observe mutation.

mod composite;

pub use composite::CompositeBuffer;

use crate::error::{KeelsonError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};

/// Largest capacity a growable buffer may reach.
pub const DEFAULT_MAX_CAPACITY: usize = usize::MAX >> 1;

/// Smallest allocation made when an empty buffer first grows.
const MIN_GROWTH: usize = 64;

/// Byte order used by the multi-byte accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

#[derive(Clone)]
enum Storage {
    Unique(BytesMut),
    Shared(Bytes),
}

impl Storage {
    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Unique(b) => b,
            Self::Shared(b) => b,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Copy-on-write: detach from shared storage before mutating.
    fn unique(&mut self) -> &mut BytesMut {
        if let Self::Shared(shared) = self {
            let owned = BytesMut::from(&shared[..]);
            *self = Self::Unique(owned);
        }
        match self {
            Self::Unique(b) => b,
            Self::Shared(_) => unreachable!("storage was just made unique"),
        }
    }

    /// Freeze into shared storage so views can alias it.
    fn shared(&mut self) -> &Bytes {
        if let Self::Unique(owned) = self {
            let frozen = std::mem::take(owned).freeze();
            *self = Self::Shared(frozen);
        }
        match self {
            Self::Shared(b) => b,
            Self::Unique(_) => unreachable!("storage was just frozen"),
        }
    }
}

/// A growable byte region with independent read/write cursors.
#[derive(Clone)]
pub struct ByteBuffer {
    storage: Storage,
    reader: usize,
    writer: usize,
    marked_reader: usize,
    max_capacity: usize,
    order: ByteOrder,
}

macro_rules! int_accessors {
    ($($ty:ty => $get:ident, $set:ident, $read:ident, $write:ident, $prepend:ident;)*) => {
        $(
            #[doc = concat!("Get a `", stringify!($ty), "` at an absolute index without moving cursors.")]
            pub fn $get(&self, index: usize) -> Result<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                let mut raw = [0u8; N];
                self.get_bytes(index, &mut raw)?;
                Ok(match self.order {
                    ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                    ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                })
            }

            #[doc = concat!("Set a `", stringify!($ty), "` at an absolute index without moving cursors.")]
            pub fn $set(&mut self, index: usize, value: $ty) -> Result<()> {
                let raw = match self.order {
                    ByteOrder::BigEndian => value.to_be_bytes(),
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                };
                self.set_bytes(index, &raw)
            }

            #[doc = concat!("Read a `", stringify!($ty), "` at the reader index and advance it.")]
            pub fn $read(&mut self) -> Result<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                self.check_readable(N)?;
                let value = Self::$get(self, self.reader)?;
                self.reader += N;
                Ok(value)
            }

            #[doc = concat!("Write a `", stringify!($ty), "` at the writer index, growing if needed.")]
            pub fn $write(&mut self, value: $ty) -> Result<()> {
                const N: usize = std::mem::size_of::<$ty>();
                self.ensure_writable(N)?;
                self.$set(self.writer, value)?;
                self.writer += N;
                Ok(())
            }

            #[doc = concat!("Write a `", stringify!($ty), "` into the prepend region, just before the reader index.")]
            pub fn $prepend(&mut self, value: $ty) -> Result<()> {
                const N: usize = std::mem::size_of::<$ty>();
                self.check_prepend(N)?;
                self.$set(self.reader - N, value)?;
                self.reader -= N;
                Ok(())
            }
        )*
    };
}

impl ByteBuffer {
    /// An empty buffer that allocates on first write.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_prepend(capacity, 0)
    }

    /// Allocate `capacity` writable bytes behind `prepend` reserved bytes.
    ///
    /// The fresh buffer has `reader_index == writer_index == prepend` and a
    /// total capacity of `capacity + prepend`.
    #[must_use]
    pub fn with_prepend(capacity: usize, prepend: usize) -> Self {
        let total = capacity + prepend;
        let mut storage = BytesMut::with_capacity(total);
        storage.resize(total, 0);
        Self {
            storage: Storage::Unique(storage),
            reader: prepend,
            writer: prepend,
            marked_reader: prepend,
            max_capacity: DEFAULT_MAX_CAPACITY,
            order: ByteOrder::BigEndian,
        }
    }

    /// Wrap external storage without copying; every byte is readable.
    #[must_use]
    pub fn wrap(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::Shared(bytes),
            reader: 0,
            writer: len,
            marked_reader: 0,
            max_capacity: DEFAULT_MAX_CAPACITY,
            order: ByteOrder::BigEndian,
        }
    }

    /// Copy `data` into a new, exactly sized buffer.
    #[must_use]
    pub fn copied_from(data: &[u8]) -> Self {
        let len = data.len();
        Self {
            storage: Storage::Unique(BytesMut::from(data)),
            reader: 0,
            writer: len,
            marked_reader: 0,
            max_capacity: DEFAULT_MAX_CAPACITY,
            order: ByteOrder::BigEndian,
        }
    }

    /// Change the byte order used by the multi-byte accessors.
    #[must_use]
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Cap how far the buffer may grow.
    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity.max(self.capacity());
        self
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    #[must_use]
    pub const fn reader_index(&self) -> usize {
        self.reader
    }

    #[inline]
    #[must_use]
    pub const fn writer_index(&self) -> usize {
        self.writer
    }

    /// Total storage length, including the prepend region.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline]
    #[must_use]
    pub const fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.writer > self.reader
    }

    #[inline]
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer
    }

    /// Bytes available in front of the reader index for prepending.
    #[inline]
    #[must_use]
    pub const fn prepend_space(&self) -> usize {
        self.reader
    }

    /// True when another holder may alias this buffer's storage.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    pub fn set_reader_index(&mut self, index: usize) -> Result<()> {
        if index > self.writer {
            return Err(KeelsonError::out_of_bounds(index, 0, self.writer));
        }
        self.reader = index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, index: usize) -> Result<()> {
        if index < self.reader || index > self.capacity() {
            return Err(KeelsonError::out_of_bounds(index, 0, self.capacity()));
        }
        self.writer = index;
        Ok(())
    }

    pub fn mark_reader_index(&mut self) {
        self.marked_reader = self.reader;
    }

    pub fn reset_reader_index(&mut self) -> Result<()> {
        self.set_reader_index(self.marked_reader)
    }

    /// Reset both cursors to zero; capacity is kept.
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
        self.marked_reader = 0;
    }

    /// Resize the storage.
    ///
    /// Shrinking below the writer index would drop bytes the buffer still
    /// holds and fails with `InvalidCapacity` instead of truncating.
    pub fn set_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.writer {
            return Err(KeelsonError::InvalidCapacity {
                requested: new_capacity,
                writer_index: self.writer,
            });
        }
        if new_capacity > self.max_capacity {
            return Err(KeelsonError::CapacityExceeded {
                requested: new_capacity,
                max: self.max_capacity,
            });
        }
        match &mut self.storage {
            Storage::Unique(owned) => owned.resize(new_capacity, 0),
            Storage::Shared(shared) => {
                let keep = new_capacity.min(shared.len());
                let mut owned = BytesMut::with_capacity(new_capacity);
                owned.extend_from_slice(&shared[..keep]);
                owned.resize(new_capacity, 0);
                self.storage = Storage::Unique(owned);
            }
        }
        Ok(())
    }

    /// Make room for `additional` bytes past the writer index.
    ///
    /// Growth copies the existing storage, so every index (and the unread
    /// region) stays where it was.
    pub fn ensure_writable(&mut self, additional: usize) -> Result<()> {
        if additional <= self.writable_bytes() {
            return Ok(());
        }
        let required = self
            .writer
            .checked_add(additional)
            .ok_or(KeelsonError::CapacityExceeded {
                requested: usize::MAX,
                max: self.max_capacity,
            })?;
        if required > self.max_capacity {
            return Err(KeelsonError::CapacityExceeded {
                requested: required,
                max: self.max_capacity,
            });
        }
        let doubled = self.capacity().saturating_mul(2).max(MIN_GROWTH);
        let target = required.max(doubled).min(self.max_capacity);
        self.set_capacity(target)
    }

    #[inline]
    fn check_index(&self, index: usize, length: usize) -> Result<()> {
        match index.checked_add(length) {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(KeelsonError::out_of_bounds(index, length, self.capacity())),
        }
    }

    #[inline]
    fn check_readable(&self, length: usize) -> Result<()> {
        if length > self.readable_bytes() {
            return Err(KeelsonError::out_of_bounds(self.reader, length, self.writer));
        }
        Ok(())
    }

    #[inline]
    fn check_prepend(&self, length: usize) -> Result<()> {
        if length > self.reader {
            return Err(KeelsonError::InsufficientPrependSpace {
                needed: length,
                available: self.reader,
            });
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at an absolute index.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_index(index, dst.len())?;
        dst.copy_from_slice(&self.storage.as_slice()[index..index + dst.len()]);
        Ok(())
    }

    /// Overwrite bytes starting at an absolute index.
    pub fn set_bytes(&mut self, index: usize, src: &[u8]) -> Result<()> {
        self.check_index(index, src.len())?;
        self.storage.unique()[index..index + src.len()].copy_from_slice(src);
        Ok(())
    }

    int_accessors! {
        u8 => get_u8, set_u8, read_u8, write_u8, prepend_u8;
        i8 => get_i8, set_i8, read_i8, write_i8, prepend_i8;
        u16 => get_u16, set_u16, read_u16, write_u16, prepend_u16;
        i16 => get_i16, set_i16, read_i16, write_i16, prepend_i16;
        u32 => get_u32, set_u32, read_u32, write_u32, prepend_u32;
        i32 => get_i32, set_i32, read_i32, write_i32, prepend_i32;
        u64 => get_u64, set_u64, read_u64, write_u64, prepend_u64;
        i64 => get_i64, set_i64, read_i64, write_i64, prepend_i64;
    }

    /// Copy readable bytes into `dst`, advancing the reader index.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_readable(dst.len())?;
        self.get_bytes(self.reader, dst)?;
        self.reader += dst.len();
        Ok(())
    }

    /// Read `length` bytes into a new, independent buffer.
    pub fn read_bytes(&mut self, length: usize) -> Result<Self> {
        self.check_readable(length)?;
        let out = Self::copied_from(&self.storage.as_slice()[self.reader..self.reader + length]);
        self.reader += length;
        Ok(out)
    }

    /// Read `length` bytes as a zero-copy view sharing this buffer's storage.
    pub fn read_slice(&mut self, length: usize) -> Result<Self> {
        self.check_readable(length)?;
        let out = self.slice(self.reader, length)?;
        self.reader += length;
        Ok(out)
    }

    pub fn skip(&mut self, length: usize) -> Result<()> {
        self.check_readable(length)?;
        self.reader += length;
        Ok(())
    }

    pub fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        self.set_bytes(self.writer, src)?;
        self.writer += src.len();
        Ok(())
    }

    /// Move every readable byte of `src` into this buffer.
    pub fn write_buffer(&mut self, src: &mut Self) -> Result<()> {
        let n = src.readable_bytes();
        self.write_slice(src.readable_slice())?;
        src.reader += n;
        Ok(())
    }

    /// Attach `src` in front of the readable bytes, inside the prepend region.
    ///
    /// Fails with `InsufficientPrependSpace` when the reserve is too small;
    /// the caller then has to build a new buffer holding header and payload.
    pub fn prepend_slice(&mut self, src: &[u8]) -> Result<()> {
        self.check_prepend(src.len())?;
        let start = self.reader - src.len();
        self.set_bytes(start, src)?;
        self.reader = start;
        Ok(())
    }

    /// A fixed-size view over `[index, index + length)` with its own cursors.
    ///
    /// The view shares storage with this buffer. Writing through either one
    /// copies first, so the view is a snapshot of the bytes at slice time.
    pub fn slice(&mut self, index: usize, length: usize) -> Result<Self> {
        self.check_index(index, length)?;
        let view = self.storage.shared().slice(index..index + length);
        Ok(Self {
            storage: Storage::Shared(view),
            reader: 0,
            writer: length,
            marked_reader: 0,
            max_capacity: length,
            order: self.order,
        })
    }

    /// Borrow the readable bytes.
    #[inline]
    #[must_use]
    pub fn readable_slice(&self) -> &[u8] {
        &self.storage.as_slice()[self.reader..self.writer]
    }

    /// Convert the readable bytes into `Bytes`, zero-copy.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        let (reader, writer) = (self.reader, self.writer);
        self.storage.shared().slice(reader..writer)
    }

    /// Drop the bytes in front of the reader index, moving the readable
    /// region to the start of the storage.
    ///
    /// Shared storage is replaced by a private copy of the readable bytes
    /// only, which is how a cumulation buffer sheds frames it handed out.
    pub fn discard_read_bytes(&mut self) {
        if self.reader == 0 {
            return;
        }
        let readable = self.readable_bytes();
        match &mut self.storage {
            Storage::Unique(owned) => {
                owned.copy_within(self.reader..self.writer, 0);
            }
            Storage::Shared(shared) => {
                let capacity = shared.len();
                let mut owned = BytesMut::with_capacity(capacity);
                owned.extend_from_slice(&shared[self.reader..self.writer]);
                owned.resize(capacity, 0);
                self.storage = Storage::Unique(owned);
            }
        }
        self.marked_reader = self.marked_reader.saturating_sub(self.reader);
        self.reader = 0;
        self.writer = readable;
    }

    /// Absolute index of the first `byte` in the readable region.
    #[must_use]
    pub fn index_of(&self, byte: u8) -> Option<usize> {
        self.readable_slice()
            .iter()
            .position(|&b| b == byte)
            .map(|pos| pos + self.reader)
    }

    /// Absolute index of the first occurrence of `needle` in the readable region.
    #[must_use]
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(self.reader);
        }
        self.readable_slice()
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| pos + self.reader)
    }

    /// Lowercase hex of the readable bytes (two characters per byte).
    #[must_use]
    pub fn hex_dump(&self) -> String {
        hex::encode(self.readable_slice())
    }

    /// Multi-line dump with offsets and an ASCII column, for diagnostics.
    #[must_use]
    pub fn pretty_hex_dump(&self) -> String {
        let data = self.readable_slice();
        let mut out = String::with_capacity(data.len() * 4 + 64);
        for (row, chunk) in data.chunks(16).enumerate() {
            let _ = write!(out, "{:08x}  ", row * 16);
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, "{b:02x} ");
                    }
                    None => out.push_str("   "),
                }
                if i == 7 {
                    out.push(' ');
                }
            }
            out.push_str(" |");
            for &b in chunk {
                out.push(if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                });
            }
            out.push_str("|\n");
        }
        out
    }

    /// Content hash over the readable bytes, four bytes at a time.
    ///
    /// Words are read big-endian regardless of the buffer's byte order, so two
    /// buffers with equal content hash equally.
    #[must_use]
    pub fn hash_code(&self) -> i32 {
        let data = self.readable_slice();
        let mut words = data.chunks_exact(4);
        let mut hash: i32 = 1;
        for word in &mut words {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(word);
            hash = hash.wrapping_mul(31).wrapping_add(i32::from_be_bytes(raw));
        }
        for &b in words.remainder() {
            hash = hash.wrapping_mul(31).wrapping_add(i32::from(b as i8));
        }
        hash
    }

    /// Lexicographic comparison of the readable bytes, eight bytes at a time.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        compare_words(self.readable_slice(), other.readable_slice())
    }
}

#[inline]
fn word(chunk: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(chunk);
    u64::from_be_bytes(raw)
}

fn equal_words(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left = a.chunks_exact(8);
    let mut right = b.chunks_exact(8);
    for (x, y) in (&mut left).zip(&mut right) {
        if word(x) != word(y) {
            return false;
        }
    }
    left.remainder() == right.remainder()
}

fn compare_words(a: &[u8], b: &[u8]) -> Ordering {
    let mut left = a.chunks_exact(8);
    let mut right = b.chunks_exact(8);
    for (x, y) in (&mut left).zip(&mut right) {
        match word(x).cmp(&word(y)) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    // One side ran out of whole words; finish byte-wise on what is left.
    let consumed = a.len().min(b.len()) / 8 * 8;
    a[consumed..].cmp(&b[consumed..])
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        equal_words(self.readable_slice(), other.readable_slice())
    }
}

impl Eq for ByteBuffer {}

impl PartialOrd for ByteBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteBuffer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for ByteBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_code());
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ByteBuffer(ridx: {}, widx: {}, cap: {}",
            self.reader,
            self.writer,
            self.capacity()
        )?;
        if self.max_capacity != DEFAULT_MAX_CAPACITY {
            write!(f, "/{}", self.max_capacity)?;
        }
        f.write_str(")")
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::wrap(bytes)
    }
}

impl From<BytesMut> for ByteBuffer {
    fn from(bytes: BytesMut) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::Unique(bytes),
            reader: 0,
            writer: len,
            marked_reader: 0,
            max_capacity: DEFAULT_MAX_CAPACITY,
            order: ByteOrder::BigEndian,
        }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(vec: Vec<u8>) -> Self {
        Self::wrap(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for ByteBuffer {
    fn from(data: &'static [u8]) -> Self {
        Self::wrap(Bytes::from_static(data))
    }
}

impl Buf for ByteBuffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.readable_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.readable_bytes(),
            "cannot advance past the writer index"
        );
        self.reader += cnt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_reserves_prepend_region() {
        for (capacity, prepend) in [(0, 0), (16, 0), (0, 8), (64, 16), (1, 1024)] {
            let buf = ByteBuffer::with_prepend(capacity, prepend);
            assert_eq!(buf.reader_index(), prepend);
            assert_eq!(buf.writer_index(), prepend);
            assert_eq!(buf.capacity(), capacity + prepend);
            assert_eq!(buf.prepend_space(), prepend);
        }
    }

    #[test]
    fn integer_round_trip_at_same_offset() {
        let mut buf = ByteBuffer::with_capacity(32);
        buf.set_u8(0, 0xAB).unwrap();
        buf.set_u16(1, 0xBEEF).unwrap();
        buf.set_u32(3, 0xDEAD_BEEF).unwrap();
        buf.set_u64(7, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(buf.get_u8(0).unwrap(), 0xAB);
        assert_eq!(buf.get_u16(1).unwrap(), 0xBEEF);
        assert_eq!(buf.get_u32(3).unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.get_u64(7).unwrap(), 0x0102_0304_0506_0708);
        // big-endian on the wire
        assert_eq!(buf.get_u8(1).unwrap(), 0xBE);
    }

    #[test]
    fn read_write_cursors() {
        let mut buf = ByteBuffer::new();
        buf.write_i16(-2).unwrap();
        buf.write_i64(i64::MIN).unwrap();
        buf.write_slice(b"tail").unwrap();
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(buf.read_i16().unwrap(), -2);
        assert_eq!(buf.read_i64().unwrap(), i64::MIN);
        assert_eq!(buf.read_bytes(4).unwrap().readable_slice(), b"tail");
        assert!(!buf.is_readable());
    }

    #[test]
    fn little_endian_accessors() {
        let mut buf = ByteBuffer::with_capacity(4).with_order(ByteOrder::LittleEndian);
        buf.write_u32(0x0A0B_0C0D).unwrap();
        assert_eq!(buf.readable_slice(), &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(buf.read_u32().unwrap(), 0x0A0B_0C0D);
    }

    #[test]
    fn out_of_range_access_is_an_error() {
        let mut buf = ByteBuffer::with_capacity(4);
        assert!(matches!(
            buf.get_u64(0),
            Err(KeelsonError::IndexOutOfBounds { index: 0, length: 8, capacity: 4 })
        ));
        assert!(buf.set_u32(1, 7).is_err());
        assert!(buf.get_u8(usize::MAX).is_err());
        assert!(buf.read_u8().is_err());
        assert!(buf.set_reader_index(1).is_err());
    }

    #[test]
    fn growth_preserves_unread_bytes() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write_slice(b"abcd").unwrap();
        assert_eq!(buf.read_u8().unwrap(), b'a');
        buf.write_slice(b"efghijkl").unwrap();
        assert!(buf.capacity() >= 12);
        assert_eq!(buf.readable_slice(), b"bcdefghijkl");
        assert_eq!(buf.reader_index(), 1);
    }

    #[test]
    fn shrinking_below_writer_is_rejected() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.write_slice(b"0123456789").unwrap();
        assert!(matches!(
            buf.set_capacity(4),
            Err(KeelsonError::InvalidCapacity { requested: 4, writer_index: 10 })
        ));
        buf.set_capacity(10).unwrap();
        assert_eq!(buf.capacity(), 10);
        assert_eq!(buf.readable_slice(), b"0123456789");
    }

    #[test]
    fn max_capacity_bounds_growth() {
        let mut buf = ByteBuffer::with_capacity(2).with_max_capacity(4);
        buf.write_u32(1).unwrap();
        assert!(matches!(
            buf.write_u8(1),
            Err(KeelsonError::CapacityExceeded { requested: 5, max: 4 })
        ));
    }

    #[test]
    fn prepend_header_without_copy() {
        let mut buf = ByteBuffer::with_prepend(16, 4);
        buf.write_slice(b"payload").unwrap();
        buf.prepend_u32(7).unwrap();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.read_u32().unwrap(), 7);
        assert_eq!(buf.readable_slice(), b"payload");
    }

    #[test]
    fn prepend_needs_reserved_space() {
        let mut buf = ByteBuffer::with_prepend(8, 2);
        buf.write_slice(b"x").unwrap();
        assert!(matches!(
            buf.prepend_u32(1),
            Err(KeelsonError::InsufficientPrependSpace { needed: 4, available: 2 })
        ));
        buf.prepend_u16(0x0102).unwrap();
        assert_eq!(buf.readable_slice(), &[1, 2, b'x']);
    }

    #[test]
    fn slice_is_a_fixed_size_snapshot() {
        let mut parent = ByteBuffer::copied_from(b"hello world");
        let mut view = parent.slice(6, 5).unwrap();
        assert!(parent.is_shared());
        assert_eq!(view.readable_slice(), b"world");

        // parent mutation after slicing does not leak into the view
        parent.set_u8(6, b'W').unwrap();
        assert_eq!(view.readable_slice(), b"world");
        assert_eq!(parent.get_u8(6).unwrap(), b'W');

        // views cannot grow
        assert!(view.write_u8(b'!').is_err());
        assert_eq!(view.read_u8().unwrap(), b'w');
    }

    #[test]
    fn read_slice_shares_storage() {
        let mut buf = ByteBuffer::copied_from(b"\x00\x03abcrest");
        let len = buf.read_u16().unwrap() as usize;
        let frame = buf.read_slice(len).unwrap();
        assert_eq!(frame.readable_slice(), b"abc");
        assert_eq!(buf.readable_slice(), b"rest");
        assert!(frame.is_shared());
    }

    #[test]
    fn discard_read_bytes_compacts() {
        let mut buf = ByteBuffer::copied_from(b"abcdef");
        buf.skip(4).unwrap();
        let _view = buf.slice(0, 2).unwrap();
        buf.discard_read_bytes();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 2);
        assert_eq!(buf.readable_slice(), b"ef");
        assert!(!buf.is_shared());
    }

    #[test]
    fn mark_and_reset() {
        let mut buf = ByteBuffer::copied_from(b"abc");
        buf.mark_reader_index();
        buf.skip(2).unwrap();
        buf.reset_reader_index().unwrap();
        assert_eq!(buf.read_u8().unwrap(), b'a');
    }

    #[test]
    fn equality_and_ordering() {
        let a = ByteBuffer::copied_from(b"0123456789abcdef-x");
        let b = ByteBuffer::copied_from(b"0123456789abcdef-y");
        let short = ByteBuffer::copied_from(b"0123456789abcdef");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(short.compare(&a), Ordering::Less);
        assert_eq!(a.compare(&short), Ordering::Greater);
        assert_eq!(a.compare(&a), Ordering::Equal);
    }

    #[test]
    fn comparison_ignores_byte_order() {
        let mut be = ByteBuffer::with_capacity(4);
        be.write_u32(0x0102_0304).unwrap();
        let le = ByteBuffer::copied_from(&[1, 2, 3, 4]).with_order(ByteOrder::LittleEndian);
        assert_eq!(be, le);
        assert_eq!(be.hash_code(), le.hash_code());
    }

    #[test]
    fn equality_only_looks_at_readable_bytes() {
        let mut a = ByteBuffer::copied_from(b"xxpayload");
        a.skip(2).unwrap();
        let b = ByteBuffer::wrap(Bytes::from_static(b"payload"));
        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());
    }

    #[test]
    fn hex_dump_is_two_chars_per_readable_byte() {
        let mut buf = ByteBuffer::copied_from(&[0x00, 0x7f, 0xff, 0x10]);
        buf.skip(1).unwrap();
        assert_eq!(buf.hex_dump(), "7fff10");
        assert_eq!(buf.hex_dump().len(), 2 * buf.readable_bytes());
        assert!(buf.pretty_hex_dump().starts_with("00000000  7f ff 10"));
    }

    #[test]
    fn find_and_index_of() {
        let mut buf = ByteBuffer::copied_from(b"GET / HTTP/1.1\r\nHost");
        buf.skip(4).unwrap();
        assert_eq!(buf.index_of(b' '), Some(5));
        assert_eq!(buf.find(b"\r\n"), Some(14));
        assert_eq!(buf.find(b"\n\n"), None);
    }

    #[test]
    fn reads_through_a_mutable_borrow_advance_the_cursor() {
        fn header(buf: &mut ByteBuffer) -> Result<(u8, u16, u32)> {
            Ok((buf.read_u8()?, buf.read_u16()?, buf.read_u32()?))
        }

        let mut buf = ByteBuffer::copied_from(&[7, 0x01, 0x02, 0, 0, 0, 9, 0xFF]);
        assert_eq!(header(&mut buf).unwrap(), (7, 0x0102, 9));
        assert_eq!(buf.reader_index(), 7);
        assert_eq!((&mut buf).read_i8().unwrap(), -1);
    }

    #[test]
    fn buf_trait_integration() {
        let mut buf = ByteBuffer::copied_from(&[0, 0, 0, 42, 9]);
        assert_eq!(Buf::get_u32(&mut buf), 42);
        assert_eq!(buf.remaining(), 1);
        assert_eq!(buf.read_u8().unwrap(), 9);
    }

    #[test]
    fn freeze_returns_readable_region() {
        let mut buf = ByteBuffer::with_prepend(8, 4);
        buf.write_slice(b"data").unwrap();
        assert_eq!(buf.freeze(), Bytes::from_static(b"data"));
    }
}
